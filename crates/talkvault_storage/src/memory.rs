//! In-memory storage backend for testing.

use crate::backend::{Backend, Connection, STORE_KEY_LEN};
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type SettingsTable = BTreeMap<String, BTreeMap<String, String>>;

/// Operations whose next invocations can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// `Backend::connect`
    Connect,
    /// `Connection::begin`
    Begin,
    /// `Connection::commit`
    Commit,
    /// `Connection::rollback`
    Rollback,
    /// `Connection::execute_batch`
    Execute,
    /// `Backend::compact`
    Compact,
}

impl FailPoint {
    const COUNT: usize = 6;

    fn index(self) -> usize {
        self as usize
    }

    fn label(self) -> &'static str {
        match self {
            FailPoint::Connect => "connect",
            FailPoint::Begin => "begin",
            FailPoint::Commit => "commit",
            FailPoint::Rollback => "rollback",
            FailPoint::Execute => "execute",
            FailPoint::Compact => "compact",
        }
    }
}

#[derive(Debug, Default)]
struct Committed {
    settings: SettingsTable,
    statements: Vec<String>,
}

#[derive(Debug, Default)]
struct Shared {
    committed: Mutex<Committed>,
    initialized: Mutex<Option<[u8; STORE_KEY_LEN]>>,
    failures: [AtomicUsize; FailPoint::COUNT],
    live: AtomicUsize,
    opened: AtomicUsize,
    compactions: AtomicUsize,
}

impl Shared {
    fn check(&self, point: FailPoint) -> StorageResult<()> {
        let slot = &self.failures[point.index()];
        let armed = slot
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            Err(StorageError::Injected(point.label()))
        } else {
            Ok(())
        }
    }
}

/// An in-memory storage backend.
///
/// Committed settings and executed statements live in memory shared by every
/// clone of the backend, so a store "survives" closing all connections and
/// opening new ones. This backend is suitable for:
/// - Unit tests of the pool, migrations and transactions
/// - Fault injection (see [`InMemoryBackend::fail_next`])
///
/// Statements passed to `execute_batch` are recorded but not interpreted.
///
/// # Example
///
/// ```rust
/// use talkvault_storage::{Backend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// let mut conn = backend.connect(&[1u8; 32]).unwrap();
/// conn.begin().unwrap();
/// conn.insert_setting("db", "schemaVersion", "3").unwrap();
/// conn.commit().unwrap();
/// assert_eq!(backend.setting("db", "schemaVersion").as_deref(), Some("3"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` calls of `point` fail.
    pub fn fail_next(&self, point: FailPoint, times: usize) {
        self.shared.failures[point.index()].store(times, Ordering::SeqCst);
    }

    /// Number of connections currently open.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Number of connections opened since creation.
    #[must_use]
    pub fn opened_connections(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Number of completed compactions.
    #[must_use]
    pub fn compactions(&self) -> usize {
        self.shared.compactions.load(Ordering::SeqCst)
    }

    /// Returns a committed setting.
    #[must_use]
    pub fn setting(&self, namespace: &str, key: &str) -> Option<String> {
        self.shared
            .committed
            .lock()
            .settings
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned()
    }

    /// Overwrites a committed setting directly, bypassing any connection.
    ///
    /// Useful for seeding a store at an older schema version.
    pub fn put_setting(&self, namespace: &str, key: &str, value: &str) {
        self.shared
            .committed
            .lock()
            .settings
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// Returns every committed statement in execution order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.shared.committed.lock().statements.clone()
    }

    /// Marks the store as already holding data, as if created earlier with `key`.
    pub fn mark_initialized(&self, key: &[u8; STORE_KEY_LEN]) {
        *self.shared.initialized.lock() = Some(*key);
    }
}

impl Backend for InMemoryBackend {
    fn is_initialized(&self) -> StorageResult<bool> {
        Ok(self.shared.initialized.lock().is_some())
    }

    fn connect(&self, key: &[u8; STORE_KEY_LEN]) -> StorageResult<Box<dyn Connection>> {
        self.shared.check(FailPoint::Connect)?;
        {
            let mut initialized = self.shared.initialized.lock();
            match initialized.as_ref() {
                Some(existing) if existing != key => {
                    return Err(StorageError::KeyRejected("key mismatch".to_string()));
                }
                Some(_) => {}
                None => *initialized = Some(*key),
            }
        }
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            pending: None,
        }))
    }

    fn compact(&self, key: &[u8; STORE_KEY_LEN]) -> StorageResult<()> {
        self.shared.check(FailPoint::Compact)?;
        if self.shared.initialized.lock().as_ref() != Some(key) {
            return Err(StorageError::KeyRejected("key mismatch".to_string()));
        }
        self.shared.compactions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Debug)]
struct Pending {
    settings: SettingsTable,
    statements: Vec<String>,
}

/// A connection to an [`InMemoryBackend`].
///
/// `begin` snapshots the committed settings; `commit` publishes the snapshot
/// back. Concurrent writers are not merged: the last commit wins.
#[derive(Debug)]
pub struct InMemoryConnection {
    shared: Arc<Shared>,
    pending: Option<Pending>,
}

impl InMemoryConnection {
    fn pending(&mut self) -> StorageResult<&mut Pending> {
        self.pending.as_mut().ok_or(StorageError::NoTransaction)
    }

    /// Returns true while a unit of work is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.pending.is_some()
    }
}

impl Connection for InMemoryConnection {
    fn begin(&mut self) -> StorageResult<()> {
        self.shared.check(FailPoint::Begin)?;
        let settings = self.shared.committed.lock().settings.clone();
        self.pending = Some(Pending {
            settings,
            statements: Vec::new(),
        });
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        self.shared.check(FailPoint::Commit)?;
        let pending = self.pending.take().ok_or(StorageError::NoTransaction)?;
        let mut committed = self.shared.committed.lock();
        committed.settings = pending.settings;
        committed.statements.extend(pending.statements);
        Ok(())
    }

    fn rollback(&mut self) -> StorageResult<()> {
        self.shared.check(FailPoint::Rollback)?;
        self.pending = None;
        Ok(())
    }

    fn execute_batch(&mut self, sql: &str) -> StorageResult<()> {
        self.shared.check(FailPoint::Execute)?;
        self.pending()?.statements.push(sql.to_string());
        Ok(())
    }

    fn get_settings(&mut self, namespace: &str) -> StorageResult<BTreeMap<String, String>> {
        Ok(self
            .pending()?
            .settings
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    fn update_setting(&mut self, namespace: &str, key: &str, value: &str) -> StorageResult<usize> {
        let slot = self
            .pending()?
            .settings
            .get_mut(namespace)
            .and_then(|ns| ns.get_mut(key));
        match slot {
            Some(existing) => {
                *existing = value.to_string();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn insert_setting(&mut self, namespace: &str, key: &str, value: &str) -> StorageResult<usize> {
        let ns = self
            .pending()?
            .settings
            .entry(namespace.to_string())
            .or_default();
        if ns.contains_key(key) {
            return Err(StorageError::Corrupted(format!(
                "duplicate setting {namespace}/{key}"
            )));
        }
        ns.insert(key.to_string(), value.to_string());
        Ok(1)
    }

    fn close(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; STORE_KEY_LEN] = [9; STORE_KEY_LEN];

    #[test]
    fn memory_new_is_not_initialized() {
        let backend = InMemoryBackend::new();
        assert!(!backend.is_initialized().unwrap());
        assert_eq!(backend.live_connections(), 0);
    }

    #[test]
    fn memory_connect_initializes_and_counts() {
        let backend = InMemoryBackend::new();
        let conn = backend.connect(&KEY).unwrap();
        assert!(backend.is_initialized().unwrap());
        assert_eq!(backend.live_connections(), 1);
        conn.close().unwrap();
        assert_eq!(backend.live_connections(), 0);
        assert_eq!(backend.opened_connections(), 1);
    }

    #[test]
    fn memory_wrong_key_is_rejected() {
        let backend = InMemoryBackend::new();
        drop(backend.connect(&KEY).unwrap());
        let result = backend.connect(&[0u8; STORE_KEY_LEN]);
        assert!(matches!(result, Err(StorageError::KeyRejected(_))));
    }

    #[test]
    fn memory_commit_publishes_settings_and_statements() {
        let backend = InMemoryBackend::new();
        let mut conn = backend.connect(&KEY).unwrap();
        conn.begin().unwrap();
        conn.execute_batch("CREATE TABLE settings").unwrap();
        conn.insert_setting("db", "k", "1").unwrap();
        assert_eq!(backend.setting("db", "k"), None);
        conn.commit().unwrap();

        assert_eq!(backend.setting("db", "k").as_deref(), Some("1"));
        assert_eq!(backend.statements(), vec!["CREATE TABLE settings".to_string()]);
    }

    #[test]
    fn memory_rollback_discards_pending() {
        let backend = InMemoryBackend::new();
        let mut conn = backend.connect(&KEY).unwrap();
        conn.begin().unwrap();
        conn.insert_setting("db", "k", "1").unwrap();
        conn.rollback().unwrap();
        assert_eq!(backend.setting("db", "k"), None);
        assert!(backend.statements().is_empty());
    }

    #[test]
    fn memory_update_reports_affected_rows() {
        let backend = InMemoryBackend::new();
        backend.put_setting("db", "k", "old");
        let mut conn = backend.connect(&KEY).unwrap();
        conn.begin().unwrap();
        assert_eq!(conn.update_setting("db", "k", "new").unwrap(), 1);
        assert_eq!(conn.update_setting("db", "missing", "x").unwrap(), 0);
        conn.commit().unwrap();
        assert_eq!(backend.setting("db", "k").as_deref(), Some("new"));
    }

    #[test]
    fn memory_statement_outside_unit_of_work_fails() {
        let backend = InMemoryBackend::new();
        let mut conn = backend.connect(&KEY).unwrap();
        assert!(matches!(
            conn.get_settings("db"),
            Err(StorageError::NoTransaction)
        ));
    }

    #[test]
    fn memory_fail_next_fires_once() {
        let backend = InMemoryBackend::new();
        backend.fail_next(FailPoint::Connect, 1);
        assert!(matches!(
            backend.connect(&KEY),
            Err(StorageError::Injected("connect"))
        ));
        assert!(backend.connect(&KEY).is_ok());
    }

    #[test]
    fn memory_compact_counts() {
        let backend = InMemoryBackend::new();
        backend.mark_initialized(&KEY);
        backend.compact(&KEY).unwrap();
        assert_eq!(backend.compactions(), 1);
    }
}
