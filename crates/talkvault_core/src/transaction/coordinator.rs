//! Transaction coordinator.

use crate::crypto::SecretKey;
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::event::EventBus;
use crate::executor::Executor;
use crate::migration::MigrationListener;
use crate::settings::Settings;
use crate::transaction::state::{
    lock_held_by_current_thread, CommitAction, HeldLock, LockGuard, Transaction,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

static NEXT_COORDINATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Serializes access to the database and dispatches commit actions.
///
/// The coordinator provides:
/// - Many concurrent readers or one writer, via a fair reader/writer lock
/// - Rejection of nested transactions on the same thread
/// - Deferred events and tasks that run only after commit
///
/// ## Lock Discipline
///
/// `start_transaction` acquires the lock and `end_transaction` releases it,
/// after the unit of work has been committed or rolled back and every
/// commit action has been handed off. The lock is fair: a waiting writer
/// holds back readers that arrive after it.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use talkvault_core::clock::SystemClock;
/// use talkvault_core::crypto::SecretKey;
/// use talkvault_core::event::EventBus;
/// use talkvault_core::executor::SerialExecutor;
/// use talkvault_core::settings::Settings;
/// use talkvault_core::{CoreError, Database, TransactionCoordinator};
/// use talkvault_storage::InMemoryBackend;
///
/// let db = Arc::new(Database::new(Arc::new(InMemoryBackend::new()), Arc::new(SystemClock)));
/// let executor = Arc::new(SerialExecutor::new("db-tasks").unwrap());
/// let bus = Arc::new(EventBus::new(Arc::new(SerialExecutor::new("events").unwrap())));
/// let coordinator = TransactionCoordinator::new(db, bus, executor);
/// coordinator.open(&SecretKey::generate(), None).unwrap();
///
/// coordinator
///     .transaction(false, |txn| {
///         let mut s = Settings::new();
///         s.put_bool("notifications", true);
///         txn.merge_settings(&s, "ui")
///     })
///     .unwrap();
///
/// let enabled = coordinator
///     .transaction_with_result(true, |txn| {
///         Ok::<_, CoreError>(txn.get_settings("ui")?.get_bool("notifications", false))
///     })
///     .unwrap();
/// assert!(enabled);
/// ```
pub struct TransactionCoordinator {
    id: u64,
    db: Arc<Database>,
    lock: Arc<RwLock<()>>,
    bus: Arc<EventBus>,
    executor: Arc<dyn Executor>,
    closed: AtomicBool,
}

impl TransactionCoordinator {
    /// Creates a coordinator over `db`.
    ///
    /// Events attached to transactions go to `bus`; tasks go to `executor`.
    #[must_use]
    pub fn new(db: Arc<Database>, bus: Arc<EventBus>, executor: Arc<dyn Executor>) -> Self {
        Self {
            id: NEXT_COORDINATOR_ID.fetch_add(1, Ordering::Relaxed),
            db,
            lock: Arc::new(RwLock::new(())),
            bus,
            executor,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the database.
    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Returns the event bus.
    #[must_use]
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Opens the database. Returns true if an existing store was reopened.
    ///
    /// # Errors
    ///
    /// See [`Database::open`].
    pub fn open(
        &self,
        key: &SecretKey,
        listener: Option<&dyn MigrationListener>,
    ) -> CoreResult<bool> {
        self.closed.store(false, Ordering::SeqCst);
        self.db.open(key, listener)
    }

    /// Closes the database. Calling this more than once is harmless.
    ///
    /// Blocks until every transaction in progress has ended.
    ///
    /// # Errors
    ///
    /// Returns the first error reported while closing a connection.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing transaction coordinator");
        self.db.close()
    }

    /// Returns true after [`close`](Self::close).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Starts a transaction, blocking until the lock is available.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidOperation`] if this thread already has a
    ///   transaction open on this coordinator
    /// - [`CoreError::DbClosed`] after [`close`](Self::close)
    /// - a database error if the unit of work cannot be started; the lock
    ///   is released before returning
    pub fn start_transaction(&self, read_only: bool) -> CoreResult<Transaction> {
        if lock_held_by_current_thread(self.id) {
            return Err(CoreError::invalid_operation(
                "nested transaction on the same thread",
            ));
        }
        if self.is_closed() {
            return Err(CoreError::DbClosed);
        }

        let guard = if read_only {
            LockGuard::Read(self.lock.read_arc())
        } else {
            LockGuard::Write(self.lock.write_arc())
        };
        let held = HeldLock::new(self.id, guard);

        let conn = self.db.start_transaction()?;
        debug!(read_only, "transaction started");
        Ok(Transaction::new(conn, Arc::clone(&self.db), read_only, held))
    }

    /// Commits `txn`. Its actions run when it is ended.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `txn` has already
    /// committed, or a database error if the commit fails. A failed commit
    /// leaves `txn` uncommitted; ending it runs no actions.
    pub fn commit_transaction(&self, txn: &mut Transaction) -> CoreResult<()> {
        if txn.is_committed() {
            return Err(CoreError::invalid_operation("transaction already committed"));
        }
        let conn = txn.take_connection().ok_or_else(|| {
            CoreError::invalid_operation("transaction has no open unit of work")
        })?;
        self.db.commit_transaction(conn)?;
        txn.mark_committed();
        Ok(())
    }

    /// Ends `txn`, releasing the lock.
    ///
    /// A committed transaction's actions are dispatched in attachment order
    /// before the lock is released. Anything else is rolled back.
    pub fn end_transaction(&self, mut txn: Transaction) {
        if txn.is_committed() {
            for action in txn.take_actions() {
                match action {
                    CommitAction::Event(event) => self.bus.broadcast(event),
                    CommitAction::Task(task) => self.executor.execute(task),
                }
            }
        } else if let Some(conn) = txn.take_connection() {
            debug!("transaction aborted");
            self.db.abort_transaction(conn);
        } else {
            warn!("transaction ended after a failed commit");
        }
        drop(txn);
    }

    /// Runs `work` in a transaction, committing if it succeeds.
    ///
    /// # Errors
    ///
    /// Returns the error from `work`, or from starting or committing the
    /// transaction. The transaction is rolled back on any error.
    pub fn transaction<F, E>(&self, read_only: bool, work: F) -> Result<(), E>
    where
        F: FnOnce(&mut Transaction) -> Result<(), E>,
        E: From<CoreError>,
    {
        self.transaction_with_result(read_only, work)
    }

    /// Runs `work` in a transaction and returns its result.
    ///
    /// # Errors
    ///
    /// As for [`transaction`](Self::transaction).
    pub fn transaction_with_result<F, R, E>(&self, read_only: bool, work: F) -> Result<R, E>
    where
        F: FnOnce(&mut Transaction) -> Result<R, E>,
        E: From<CoreError>,
    {
        let mut txn = self.start_transaction(read_only)?;
        let result = match work(&mut txn) {
            Ok(value) => match self.commit_transaction(&mut txn) {
                Ok(()) => Ok(value),
                Err(e) => Err(E::from(e)),
            },
            Err(e) => Err(e),
        };
        self.end_transaction(txn);
        result
    }

    /// Reads every setting under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns a database error if the settings cannot be read.
    pub fn get_settings(&self, txn: &mut Transaction, namespace: &str) -> CoreResult<Settings> {
        txn.get_settings(namespace)
    }

    /// Merges `settings` into `namespace`. See [`Transaction::merge_settings`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] on a read-only transaction, or
    /// a database error.
    pub fn merge_settings(
        &self,
        txn: &mut Transaction,
        settings: &Settings,
        namespace: &str,
    ) -> CoreResult<()> {
        txn.merge_settings(settings, namespace)
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("id", &self.id)
            .field("db", &self.db)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event::EventRef;
    use crate::executor::SerialExecutor;
    use crate::settings::SettingsUpdatedEvent;
    use std::sync::mpsc::{self, Receiver};
    use std::thread;
    use std::time::Duration;
    use talkvault_storage::{FailPoint, InMemoryBackend, InMemoryConnection};

    #[derive(Debug, PartialEq)]
    struct Added(u32);

    struct Fixture {
        coordinator: Arc<TransactionCoordinator>,
        backend: InMemoryBackend,
        events: Receiver<EventRef>,
    }

    fn fixture() -> Fixture {
        let backend = InMemoryBackend::new();
        let db = Arc::new(Database::new(
            Arc::new(backend.clone()),
            Arc::new(ManualClock::new(0)),
        ));
        let bus = Arc::new(EventBus::new(Arc::new(
            SerialExecutor::new("test-events").unwrap(),
        )));
        let events = bus.subscribe();
        let executor = Arc::new(SerialExecutor::new("test-tasks").unwrap());
        let coordinator = Arc::new(TransactionCoordinator::new(db, bus, executor));
        coordinator.open(&SecretKey::from_array([5; 32]), None).unwrap();
        Fixture {
            coordinator,
            backend,
            events,
        }
    }

    fn next_event(rx: &Receiver<EventRef>) -> Option<EventRef> {
        rx.recv_timeout(Duration::from_millis(500)).ok()
    }

    #[test]
    fn committed_events_are_delivered_in_order() {
        let f = fixture();
        let mut txn = f.coordinator.start_transaction(false).unwrap();
        txn.attach_event(Added(1));
        txn.attach_event(Added(2));
        f.coordinator.commit_transaction(&mut txn).unwrap();
        f.coordinator.end_transaction(txn);

        for expected in [1, 2] {
            let event = next_event(&f.events).unwrap();
            assert_eq!(event.downcast_ref::<Added>(), Some(&Added(expected)));
        }
        assert!(next_event(&f.events).is_none());
    }

    #[test]
    fn aborted_events_are_never_delivered() {
        let f = fixture();
        let mut txn = f.coordinator.start_transaction(false).unwrap();
        txn.attach_event(Added(1));
        f.coordinator.end_transaction(txn);
        assert!(next_event(&f.events).is_none());
        assert_eq!(f.coordinator.database().pool().idle_connections(), 1);
    }

    #[test]
    fn tasks_run_after_commit() {
        let f = fixture();
        let (tx, rx) = mpsc::channel();
        f.coordinator
            .transaction(false, |txn| {
                txn.attach_task(move || tx.send("ran").unwrap());
                Ok::<_, CoreError>(())
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "ran");
    }

    #[test]
    fn double_commit_is_rejected() {
        let f = fixture();
        let mut txn = f.coordinator.start_transaction(false).unwrap();
        f.coordinator.commit_transaction(&mut txn).unwrap();
        let err = f.coordinator.commit_transaction(&mut txn).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
        f.coordinator.end_transaction(txn);
    }

    #[test]
    fn failed_commit_runs_no_actions() {
        let f = fixture();
        let mut txn = f.coordinator.start_transaction(false).unwrap();
        txn.attach_event(Added(9));
        f.backend.fail_next(FailPoint::Commit, 1);
        assert!(f.coordinator.commit_transaction(&mut txn).is_err());
        assert!(!txn.is_committed());
        f.coordinator.end_transaction(txn);
        assert!(next_event(&f.events).is_none());

        // The lock was released.
        let txn = f.coordinator.start_transaction(false).unwrap();
        f.coordinator.end_transaction(txn);
    }

    #[test]
    fn nested_transaction_is_rejected() {
        let f = fixture();
        for outer_read_only in [true, false] {
            let outer = f.coordinator.start_transaction(outer_read_only).unwrap();
            for inner_read_only in [true, false] {
                let err = f.coordinator.start_transaction(inner_read_only).unwrap_err();
                assert!(matches!(err, CoreError::InvalidOperation { .. }));
            }
            f.coordinator.end_transaction(outer);
        }
    }

    #[test]
    fn separate_coordinators_do_not_conflict() {
        let a = fixture();
        let b = fixture();
        let outer = a.coordinator.start_transaction(false).unwrap();
        let inner = b.coordinator.start_transaction(false).unwrap();
        b.coordinator.end_transaction(inner);
        a.coordinator.end_transaction(outer);
    }

    #[test]
    fn failed_start_releases_lock() {
        let f = fixture();
        f.coordinator.database().pool().close_all().unwrap();
        f.coordinator.database().pool().reopen();
        f.backend.fail_next(FailPoint::Connect, 1);
        assert!(f.coordinator.start_transaction(false).is_err());
        let txn = f.coordinator.start_transaction(false).unwrap();
        f.coordinator.end_transaction(txn);
    }

    #[test]
    fn dropped_transaction_aborts_and_releases() {
        let f = fixture();
        {
            let mut txn = f.coordinator.start_transaction(false).unwrap();
            let mut s = Settings::new();
            s.put("k", "v");
            txn.merge_settings(&s, "ns").unwrap();
        }
        assert_eq!(f.backend.setting("ns", "k"), None);
        let txn = f.coordinator.start_transaction(false).unwrap();
        f.coordinator.end_transaction(txn);
    }

    #[test]
    fn work_error_aborts() {
        let f = fixture();
        let result: Result<(), CoreError> = f.coordinator.transaction(false, |txn| {
            let mut s = Settings::new();
            s.put("k", "v");
            txn.merge_settings(&s, "ns")?;
            Err(CoreError::invalid_operation("boom"))
        });
        assert!(result.is_err());
        assert_eq!(f.backend.setting("ns", "k"), None);
        assert!(next_event(&f.events).is_none());
    }

    #[test]
    fn merge_settings_emits_event_only_on_change() {
        let f = fixture();
        let mut s = Settings::new();
        s.put_int("volume", 3);
        for _ in 0..2 {
            f.coordinator
                .transaction(false, |txn| f.coordinator.merge_settings(txn, &s, "audio"))
                .unwrap();
        }
        let event = next_event(&f.events).unwrap();
        let update = event.downcast_ref::<SettingsUpdatedEvent>().unwrap();
        assert_eq!(update.namespace, "audio");
        assert_eq!(update.settings.get_int("volume", 0), 3);
        assert!(next_event(&f.events).is_none());
    }

    #[test]
    fn merge_settings_on_read_only_is_rejected() {
        let f = fixture();
        let result = f.coordinator.transaction(true, |txn| {
            txn.merge_settings(&Settings::new(), "ns")
        });
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn unbox_checks_connection_type() {
        let f = fixture();
        let mut txn = f.coordinator.start_transaction(true).unwrap();
        assert!(txn.unbox::<InMemoryConnection>().unwrap().in_transaction());
        assert!(matches!(
            txn.unbox::<talkvault_storage::SqliteConnection>(),
            Err(CoreError::InvalidOperation { .. })
        ));
        f.coordinator.end_transaction(txn);
    }

    #[test]
    fn writer_excludes_readers() {
        let f = fixture();
        let writer = f.coordinator.start_transaction(false).unwrap();
        let (tx, rx) = mpsc::channel();
        let reader = {
            let coordinator = Arc::clone(&f.coordinator);
            thread::spawn(move || {
                let txn = coordinator.start_transaction(true).unwrap();
                tx.send(()).unwrap();
                coordinator.end_transaction(txn);
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        f.coordinator.end_transaction(writer);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn close_is_idempotent_and_blocks_new_transactions() {
        let f = fixture();
        f.coordinator.close().unwrap();
        f.coordinator.close().unwrap();
        assert!(matches!(
            f.coordinator.start_transaction(true),
            Err(CoreError::DbClosed)
        ));
    }
}
