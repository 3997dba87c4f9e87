//! Error types for the ORM.
//!
//! Driver failures are caught at the connection boundary and re-signaled as
//! either a connection failure or a query failure; nothing above the
//! connection catches them.

use thiserror::Error;

/// Result type alias for ORM operations.
pub type OrmResult<T> = Result<T, OrmError>;

/// Error type for ORM operations.
#[derive(Debug, Clone, Error)]
pub enum OrmError {
    /// Opening or maintaining the database handle failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Preparing or executing a statement failed.
    #[error("query error: {0}")]
    Query(String),

    /// A condition or relation was built from unusable input.
    #[error("invalid condition: {0}")]
    Condition(String),

    /// Connection or schema configuration is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No row matched a lookup that required one.
    #[error("record not found in `{0}`")]
    NotFound(String),
}

impl From<sqlx::Error> for OrmError {
    fn from(error: sqlx::Error) -> Self {
        OrmError::Query(error.to_string())
    }
}
