//! Test fixtures and store helpers.
//!
//! Wires a [`Database`], [`TransactionCoordinator`] and [`EventBus`] over a
//! backend so tests only deal with the parts they exercise.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use talkvault_core::clock::ManualClock;
use talkvault_core::crypto::SecretKey;
use talkvault_core::event::{EventBus, EventRef};
use talkvault_core::executor::{Executor, SerialExecutor};
use talkvault_core::migration::{MigrationChain, MigrationListener};
use talkvault_core::{CoreResult, Database, TransactionCoordinator};
use talkvault_storage::{InMemoryBackend, SqliteBackend};
use tempfile::TempDir;

/// Key used by [`TestStore::open`].
#[must_use]
pub fn test_key() -> SecretKey {
    SecretKey::from_array([0x42; 32])
}

/// How long [`TestStore::next_event`] waits.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Installs a `tracing` subscriber honouring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A store with its coordinator, event bus and a subscription to it.
pub struct TestStore {
    /// The in-memory backend, if the store uses one.
    pub memory: Option<InMemoryBackend>,
    /// The clock driving compaction.
    pub clock: Arc<ManualClock>,
    /// The coordinator over the store.
    pub coordinator: Arc<TransactionCoordinator>,
    /// The event bus the coordinator broadcasts on.
    pub bus: Arc<EventBus>,
    /// The executor running after-commit tasks.
    pub tasks: Arc<SerialExecutor>,
    /// Receives every event broadcast after the store was built.
    pub events: Receiver<EventRef>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates a store over a fresh [`InMemoryBackend`].
    pub fn memory() -> Self {
        Self::with_memory_backend(InMemoryBackend::new(), MigrationChain::standard())
    }

    /// Creates a store over `backend` with the given migration chain.
    ///
    /// Pass a clone of an existing backend to reopen its contents.
    pub fn with_memory_backend(backend: InMemoryBackend, chain: MigrationChain) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let db = Database::new(Arc::new(backend.clone()), clock.clone()).with_chain(chain);
        Self::build(db, clock, Some(backend), None)
    }

    /// Creates a store over SQLite in a temporary directory.
    pub fn sqlite() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let clock = Arc::new(ManualClock::new(0));
        let db = Database::new(Arc::new(SqliteBackend::new(temp_dir.path())), clock.clone());
        Self::build(db, clock, None, Some(temp_dir))
    }

    /// Creates a store over SQLite in `dir`, which outlives the store.
    ///
    /// Use this to reopen a store written by an earlier `TestStore`.
    pub fn sqlite_in(dir: &std::path::Path) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let db = Database::new(Arc::new(SqliteBackend::new(dir)), clock.clone());
        Self::build(db, clock, None, None)
    }

    fn build(
        db: Database,
        clock: Arc<ManualClock>,
        memory: Option<InMemoryBackend>,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let bus = Arc::new(EventBus::new(Arc::new(
            SerialExecutor::new("test-events").expect("Failed to start event executor"),
        )));
        let tasks =
            Arc::new(SerialExecutor::new("test-tasks").expect("Failed to start task executor"));
        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::new(db),
            bus.clone(),
            tasks.clone(),
        ));
        let events = bus.subscribe();
        Self {
            memory,
            clock,
            coordinator,
            bus,
            tasks,
            events,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the directory holding the SQLite file, if any.
    pub fn dir(&self) -> Option<&std::path::Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }

    /// Opens the store with [`test_key`].
    ///
    /// # Errors
    ///
    /// Returns whatever [`TransactionCoordinator::open`] returns.
    pub fn open(&self) -> CoreResult<bool> {
        self.coordinator.open(&test_key(), None)
    }

    /// Opens the store with [`test_key`], reporting to `listener`.
    ///
    /// # Errors
    ///
    /// Returns whatever [`TransactionCoordinator::open`] returns.
    pub fn open_with_listener(&self, listener: &dyn MigrationListener) -> CoreResult<bool> {
        self.coordinator.open(&test_key(), Some(listener))
    }

    /// Waits for the next event.
    ///
    /// # Panics
    ///
    /// Panics if no event arrives within [`EVENT_TIMEOUT`].
    pub fn next_event(&self) -> EventRef {
        self.events
            .recv_timeout(EVENT_TIMEOUT)
            .expect("Timed out waiting for an event")
    }

    /// Returns true if no event arrives within `wait`.
    pub fn no_event_within(&self, wait: Duration) -> bool {
        matches!(
            self.events.recv_timeout(wait),
            Err(RecvTimeoutError::Timeout)
        )
    }
}

impl Drop for TestStore {
    fn drop(&mut self) {
        let _ = self.coordinator.close();
        self.tasks.shutdown();
        self.tasks.join();
    }
}

/// Runs a test with a freshly opened in-memory store.
pub fn with_open_store<F, R>(f: F) -> R
where
    F: FnOnce(&TestStore) -> R,
{
    let store = TestStore::memory();
    store.open().expect("Failed to open test store");
    f(&store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use talkvault_core::settings::{Settings, SettingsUpdatedEvent};

    #[test]
    fn memory_store_opens_fresh() {
        init_test_logging();
        let store = TestStore::memory();
        assert!(!store.open().unwrap());
        assert_eq!(
            store.memory.as_ref().unwrap().setting("db", "schemaVersion"),
            Some(talkvault_core::migration::CODE_SCHEMA_VERSION.to_string())
        );
    }

    #[test]
    fn next_event_sees_committed_merge() {
        with_open_store(|store| {
            let mut s = Settings::new();
            s.put("k", "v");
            store
                .coordinator
                .transaction(false, |txn| txn.merge_settings(&s, "ns"))
                .unwrap();
            let event = store.next_event();
            let update = event.downcast_ref::<SettingsUpdatedEvent>().unwrap();
            assert_eq!(update.namespace, "ns");
        });
    }
}
