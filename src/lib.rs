// ============================================================================
// docmap Library
// ============================================================================

pub mod config;
pub mod core;
pub mod delta;
pub mod dereference;
pub mod document;
pub mod driver;
pub mod mapper;
pub mod query;
pub mod schema;

// Re-export main types for convenience
pub use config::MapperConfig;
pub use core::{CompiledQuery, CompiledUpdate, DocRef, OdmError, RawDocument, RefTarget, Result, Value};
pub use delta::{Delta, DeltaMode, clear_changed_fields, compute_delta, effective_changed_paths};
pub use dereference::{resolve_documents, resolve_references};
pub use document::{ChangeSet, Document, Observed, ObservedDict, ObservedList, observe};
pub use driver::{Driver, FindOptions, MemoryDriver, SortDirection, UpdateOptions, UpdateResult};
pub use mapper::{Mapper, QuerySet};
pub use query::{Combinator, Conditions, Q, compile, compile_update};
pub use schema::{DocumentType, FieldDescriptor, FieldKind, Registry, ScalarType};
