//! Common error types for the bibrec workspace

use thiserror::Error;

/// Common result type for bibrec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the migrator and its collaborators
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored JSON could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the backing store itself is unreachable or gone, as opposed to
    /// a statement failing for one record.
    pub fn is_resource_failure(&self) -> bool {
        match self {
            Error::Database(err) => is_resource_sqlx_error(err),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// True for SQLite lock contention (`database is locked` / `SQLITE_BUSY`).
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::Database(err) => err.to_string().contains("database is locked"),
            _ => false,
        }
    }

    /// True when a UNIQUE constraint rejected the write.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }
}

fn is_resource_sqlx_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_)
    )
}
