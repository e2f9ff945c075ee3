//! Backend and connection trait definitions.

use crate::error::StorageResult;
use std::any::Any;
use std::collections::BTreeMap;

/// Length of the key handed to a backend when opening connections.
pub const STORE_KEY_LEN: usize = 32;

/// A storage engine that hands out connections to one store.
///
/// A backend knows where its store lives and how to open sessions against
/// it. It does not pool connections or track schema versions; that is the
/// job of the layer above.
///
/// # Invariants
///
/// - `connect` returns a connection with no unit of work in progress
/// - `compact` is only called while no connection is open
/// - Backends must be `Send + Sync` so a pool can share them across threads
pub trait Backend: Send + Sync {
    /// Returns true if the storage location already holds a store.
    ///
    /// # Errors
    ///
    /// Returns an error if the location cannot be inspected.
    fn is_initialized(&self) -> StorageResult<bool>;

    /// Opens a new connection using the given key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or the key does not
    /// unlock it.
    fn connect(&self, key: &[u8; STORE_KEY_LEN]) -> StorageResult<Box<dyn Connection>>;

    /// Rewrites the store to reclaim space.
    ///
    /// Called offline, after every pooled connection has been closed.
    ///
    /// # Errors
    ///
    /// Returns an error if compaction fails.
    fn compact(&self, key: &[u8; STORE_KEY_LEN]) -> StorageResult<()>;

    /// Short name used in log output.
    fn name(&self) -> &'static str;
}

/// One session against a store.
///
/// A connection runs at most one unit of work at a time: `begin` starts it,
/// `commit` or `rollback` ends it. All reads and writes in between belong to
/// that unit of work.
pub trait Connection: Send {
    /// Starts a unit of work.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine refuses to start a transaction.
    fn begin(&mut self) -> StorageResult<()>;

    /// Makes the current unit of work durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails; the unit of work is then still
    /// open and must be rolled back.
    fn commit(&mut self) -> StorageResult<()>;

    /// Discards the current unit of work.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollback fails. The connection should not be
    /// reused after that.
    fn rollback(&mut self) -> StorageResult<()>;

    /// Executes one or more DDL or DML statements.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    fn execute_batch(&mut self, sql: &str) -> StorageResult<()>;

    /// Reads every setting stored under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be read.
    fn get_settings(&mut self, namespace: &str) -> StorageResult<BTreeMap<String, String>>;

    /// Updates an existing setting and returns the number of rows changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    fn update_setting(&mut self, namespace: &str, key: &str, value: &str) -> StorageResult<usize>;

    /// Inserts a new setting and returns the number of rows inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    fn insert_setting(&mut self, namespace: &str, key: &str, value: &str) -> StorageResult<usize>;

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails to close cleanly.
    fn close(self: Box<Self>) -> StorageResult<()>;

    /// Access to the concrete connection type.
    fn as_any(&self) -> &dyn Any;

    /// Mutable access to the concrete connection type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
