//! Document type definitions: field descriptors, the type registry and
//! path resolution over them.

pub mod doc_type;
pub mod field;
pub mod registry;
pub mod resolve;

pub use doc_type::{DocumentType, DocumentTypeBuilder};
pub use field::{FieldDefault, FieldDescriptor, FieldKind, ScalarType, Validator};
pub use registry::Registry;
pub use resolve::{PathElement, resolve, split_dotted, split_keyword, storage_path, terminal_field};
