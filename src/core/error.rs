use thiserror::Error;

#[derive(Error, Debug)]
pub enum OdmError {
    #[error("Lookup error: {0}")]
    Lookup(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Validation error on field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Document type '{0}' is not registered")]
    NotRegistered(String),

    #[error("Document type '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("{0} matching query does not exist")]
    DoesNotExist(String),

    #[error("{0} items returned, instead of 1")]
    MultipleObjectsReturned(usize),

    #[error("Operation error: {0}")]
    Operation(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl OdmError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OdmError>;

impl From<serde_json::Error> for OdmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for OdmError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
