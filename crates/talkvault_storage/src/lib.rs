//! # TalkVault Storage
//!
//! Storage backend traits and implementations for TalkVault.
//!
//! This crate is the lowest layer of the store. A [`Backend`] knows where a
//! store lives and opens [`Connection`]s to it; a connection runs one unit of
//! work at a time and exposes the settings table the layers above use for
//! their bookkeeping.
//!
//! ## Design Principles
//!
//! - Backends know nothing about schema versions, pooling or locking
//! - Connections are `Send` so a pool can hand them between threads
//! - Callers needing engine-specific access downcast through `as_any_mut`
//!
//! ## Available Backends
//!
//! - [`SqliteBackend`] - Persistent store in one SQLite file, keyed with `PRAGMA key`
//! - [`InMemoryBackend`] - For testing, with fault injection
//!
//! ## Example
//!
//! ```rust
//! use talkvault_storage::{Backend, InMemoryBackend};
//!
//! let backend = InMemoryBackend::new();
//! let mut conn = backend.connect(&[0u8; 32]).unwrap();
//! conn.begin().unwrap();
//! conn.insert_setting("app", "theme", "dark").unwrap();
//! conn.commit().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod memory;
mod sqlite;

pub use backend::{Backend, Connection, STORE_KEY_LEN};
pub use error::{StorageError, StorageResult};
pub use memory::{FailPoint, InMemoryBackend, InMemoryConnection};
pub use sqlite::{SqliteBackend, SqliteConnection, DB_FILE_NAME};
