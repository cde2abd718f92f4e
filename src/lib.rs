//! # Rowkit - Object persistence over SQLite
//!
//! Live, mutable objects backed by rows in a relational table, with SQL
//! hidden from callers.
//!
//! Rowkit provides:
//! - A data store that owns a single SQLite handle and vends objects by
//!   table name and row id
//! - A persistent object type with lazy loading, dirty tracking and a
//!   create/save/delete lifecycle
//! - A per-table identity cache so at most one live object represents a row
//! - An ordered, versioned schema migration engine
//! - Placeholder descriptors for persistent objects embedded in archived
//!   containers

pub mod value;
pub mod naming;
pub mod gateway;
pub mod cache;
pub mod query;
pub mod object;
pub mod migration;
pub mod store;
pub mod placeholder;

// Re-exports for convenient access
pub use value::{Value, ValueType};
pub use gateway::Gateway;
pub use query::Query;
pub use object::{DbObject, ObjectClass, ObjectId, OBJECT_ID_INVALID, OBJECT_ID_NOT_YET_ASSIGNED};
pub use store::DataStore;
pub use placeholder::Placeholder;

/// Result type alias for Rowkit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Rowkit operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Engine error: {0}")]
    Engine(#[from] rusqlite::Error),

    #[error("Migration '{name}' (index {index}) failed: {cause}")]
    Migration {
        index: usize,
        name: String,
        #[source]
        cause: Box<Error>,
    },

    #[error("No row with id {id} in table '{table}'")]
    NotFound { table: String, id: i64 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Column '{column}' holds {actual}, not coercible to {requested}")]
    TypeMismatch {
        column: String,
        requested: &'static str,
        actual: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Invalid-state error with a formatted message
    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }
}
