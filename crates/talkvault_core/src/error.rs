//! Error types for TalkVault core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Why a password-protected blob could not be decrypted.
///
/// The three kinds are kept apart so a caller can tell a wrong password from
/// corrupt data from a missing key strengthener.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecryptionError {
    /// The blob is malformed: too short, unknown format or unsupported cost.
    #[error("invalid ciphertext")]
    InvalidCiphertext,

    /// Authenticated decryption failed: wrong password or tampered blob.
    #[error("invalid password")]
    InvalidPassword,

    /// The blob needs a key strengthener that is absent or not initialised.
    #[error("key strengthener unavailable")]
    KeyStrengthenerError,
}

/// Errors that can occur in TalkVault core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Backend I/O or statement failure.
    #[error("database error: {0}")]
    Db(#[from] talkvault_storage::StorageError),

    /// An internal invariant was violated.
    #[error("database state error: {message}")]
    DbState {
        /// Description of the violated invariant.
        message: String,
    },

    /// The stored schema is older than the code and no migration path exists.
    #[error("data too old: stored schema {stored}, code schema {target}")]
    DataTooOld {
        /// Schema version reached before the migration chain ran out.
        stored: i32,
        /// Schema version compiled into the code.
        target: i32,
    },

    /// The stored schema is newer than the code.
    #[error("data too new: stored schema {stored}, code schema {target}")]
    DataTooNew {
        /// Schema version found in the store.
        stored: i32,
        /// Schema version compiled into the code.
        target: i32,
    },

    /// The database has been closed.
    #[error("database is closed")]
    DbClosed,

    /// A password-protected blob could not be decrypted.
    #[error("decryption failed: {0}")]
    Decryption(#[from] DecryptionError),

    /// Encryption failed.
    #[error("encryption failed: {message}")]
    Encryption {
        /// Description of the failure.
        message: String,
    },

    /// A registered service failed to start or stop.
    #[error("service {service} failed: {message}")]
    Service {
        /// Name of the failing service.
        service: String,
        /// Description of the failure.
        message: String,
    },

    /// The API was used incorrectly.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of the misuse.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Creates a database state error.
    pub fn db_state(message: impl Into<String>) -> Self {
        Self::DbState {
            message: message.into(),
        }
    }

    /// Creates an encryption error.
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }

    /// Creates a service error.
    pub fn service(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_kinds_are_distinct() {
        let wrapped: CoreError = DecryptionError::InvalidPassword.into();
        assert!(matches!(
            wrapped,
            CoreError::Decryption(DecryptionError::InvalidPassword)
        ));
        assert_ne!(
            DecryptionError::InvalidCiphertext,
            DecryptionError::KeyStrengthenerError
        );
    }

    #[test]
    fn messages_carry_versions() {
        let err = CoreError::DataTooNew {
            stored: 5,
            target: 3,
        };
        assert_eq!(err.to_string(), "data too new: stored schema 5, code schema 3");
    }
}
