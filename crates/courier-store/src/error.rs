use courier_shared::ValidationError;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (creating the database directory, deleting blobs).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// The request was rejected before any row was written.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A message referenced a content hash with no stored file.
    #[error("Unknown attachment: {0}")]
    UnknownAttachment(String),

    /// `ref_count` disagrees with the number of live references.
    #[error("Reference count mismatch for {hash}: ref_count={ref_count}, live references={live}")]
    Integrity {
        hash: String,
        ref_count: i64,
        live: i64,
    },

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
