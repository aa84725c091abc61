pub mod error;
pub mod value;

pub use error::{OdmError, Result};
pub use value::{CompiledQuery, CompiledUpdate, DocRef, RawDocument, RefTarget, Value};
