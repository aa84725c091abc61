//! Keyword filters and updates, and their compilation to native `$`-operator
//! documents.

pub mod expr;
pub mod transform;

pub use expr::{Combinator, Conditions, Q};
pub use transform::{compile, compile_update};
