//! Transaction state.

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::event::{Event, EventRef};
use crate::executor::Task;
use crate::settings::{read_settings, write_settings, Settings, SettingsUpdatedEvent};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use talkvault_storage::Connection;

/// Work deferred until the owning transaction commits.
pub enum CommitAction {
    /// Broadcast on the event bus.
    Event(EventRef),
    /// Submitted to the background executor.
    Task(Task),
}

impl fmt::Debug for CommitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitAction::Event(event) => f.debug_tuple("Event").field(event).finish(),
            CommitAction::Task(_) => f.write_str("Task(..)"),
        }
    }
}

thread_local! {
    /// Coordinators whose lock the current thread holds.
    static HELD_LOCKS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn lock_held_by_current_thread(coordinator: u64) -> bool {
    HELD_LOCKS.with(|held| held.borrow().contains(&coordinator))
}

// Held only for its Drop.
#[allow(dead_code)]
pub(crate) enum LockGuard {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// A coordinator lock registered against the current thread.
pub(crate) struct HeldLock {
    coordinator: u64,
    _guard: LockGuard,
    /// Thread-local bookkeeping requires release on the acquiring thread.
    _not_send: PhantomData<*const ()>,
}

impl HeldLock {
    pub(crate) fn new(coordinator: u64, guard: LockGuard) -> Self {
        HELD_LOCKS.with(|held| held.borrow_mut().push(coordinator));
        Self {
            coordinator,
            _guard: guard,
            _not_send: PhantomData,
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        HELD_LOCKS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&id| id == self.coordinator) {
                held.swap_remove(pos);
            }
        });
    }
}

/// A unit of work, holding the coordinator's lock until it ends.
///
/// Obtained from [`TransactionCoordinator::start_transaction`] and handed
/// back to [`TransactionCoordinator::end_transaction`]. Actions attached
/// while the transaction is open run only if it commits.
///
/// A transaction dropped without being ended is rolled back and its lock
/// released. Transactions cannot leave the thread that started them.
///
/// [`TransactionCoordinator::start_transaction`]: super::TransactionCoordinator::start_transaction
/// [`TransactionCoordinator::end_transaction`]: super::TransactionCoordinator::end_transaction
pub struct Transaction {
    connection: Option<Box<dyn Connection>>,
    db: Arc<Database>,
    read_only: bool,
    committed: bool,
    actions: Vec<CommitAction>,
    /// Dropped after `connection` has been returned to the pool.
    lock: Option<HeldLock>,
}

impl Transaction {
    pub(crate) fn new(
        connection: Box<dyn Connection>,
        db: Arc<Database>,
        read_only: bool,
        lock: HeldLock,
    ) -> Self {
        Self {
            connection: Some(connection),
            db,
            read_only,
            committed: false,
            actions: Vec::new(),
            lock: Some(lock),
        }
    }

    /// Returns true for a read-only transaction.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns true once the transaction has committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Queues `event` for broadcast after commit.
    pub fn attach_event<E: Event>(&mut self, event: E) {
        self.actions.push(CommitAction::Event(Arc::new(event)));
    }

    /// Queues `task` for the background executor after commit.
    pub fn attach_task<F>(&mut self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.actions.push(CommitAction::Task(Box::new(task)));
    }

    /// Actions attached so far, in attachment order.
    #[must_use]
    pub fn actions(&self) -> &[CommitAction] {
        &self.actions
    }

    /// The backend connection carrying this unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] after the transaction has
    /// committed or failed to commit.
    pub fn connection(&mut self) -> CoreResult<&mut dyn Connection> {
        match self.connection.as_mut() {
            Some(conn) => Ok(conn.as_mut()),
            None => Err(CoreError::invalid_operation(
                "transaction has no open unit of work",
            )),
        }
    }

    /// The backend connection as its concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the connection is not a
    /// `C` or the unit of work has ended.
    pub fn unbox<C: Connection + 'static>(&mut self) -> CoreResult<&mut C> {
        self.connection()?
            .as_any_mut()
            .downcast_mut::<C>()
            .ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "connection is not a {}",
                    std::any::type_name::<C>()
                ))
            })
    }

    /// Reads every setting under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns a database error if the settings cannot be read.
    pub fn get_settings(&mut self, namespace: &str) -> CoreResult<Settings> {
        read_settings(self.connection()?, namespace)
    }

    /// Merges `settings` into `namespace`.
    ///
    /// A [`SettingsUpdatedEvent`] carrying the merged map is attached when
    /// anything changed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] on a read-only transaction, or
    /// a database error.
    pub fn merge_settings(&mut self, settings: &Settings, namespace: &str) -> CoreResult<()> {
        if self.read_only {
            return Err(CoreError::invalid_operation(
                "cannot merge settings in a read-only transaction",
            ));
        }
        let old = self.get_settings(namespace)?;
        let mut merged = old.clone();
        merged.merge(settings);
        if merged == old {
            return Ok(());
        }
        write_settings(self.connection()?, settings, namespace)?;
        self.attach_event(SettingsUpdatedEvent {
            namespace: namespace.to_string(),
            settings: merged,
        });
        Ok(())
    }

    pub(crate) fn take_connection(&mut self) -> Option<Box<dyn Connection>> {
        self.connection.take()
    }

    pub(crate) fn mark_committed(&mut self) {
        self.committed = true;
    }

    pub(crate) fn take_actions(&mut self) -> Vec<CommitAction> {
        std::mem::take(&mut self.actions)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.db.abort_transaction(conn);
        }
        self.lock.take();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("read_only", &self.read_only)
            .field("committed", &self.committed)
            .field("open", &self.connection.is_some())
            .field("actions", &self.actions.len())
            .finish()
    }
}
