//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The SQL engine reported an error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store could not be read with the supplied key.
    #[error("store could not be opened with the supplied key: {0}")]
    KeyRejected(String),

    /// The linked SQLite library cannot encrypt the store.
    #[error("SQLite was linked without SQLCipher; refusing to open an unencrypted store")]
    EncryptionUnavailable,

    /// The storage is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A statement was issued outside a unit of work.
    #[error("no unit of work in progress")]
    NoTransaction,

    /// A failure injected by a test backend.
    #[error("injected failure: {0}")]
    Injected(&'static str),
}
