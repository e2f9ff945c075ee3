//! Connection pool.
//!
//! Connections are reused LIFO. The pool tracks how many connections are
//! open in total, idle or borrowed, so that [`ConnectionPool::close_all`] can
//! wait until every borrowed connection has come back before returning.

use crate::crypto::SecretKey;
use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use talkvault_storage::{Backend, Connection, StorageError};
use tracing::{debug, warn};

/// How long `close_all` waits between progress warnings.
const DRAIN_WARN_INTERVAL: Duration = Duration::from_secs(5);

struct PoolState {
    idle: Vec<Box<dyn Connection>>,
    open: usize,
    closed: bool,
}

/// A pool of backend connections, each carrying one unit of work while
/// borrowed.
pub struct ConnectionPool {
    backend: Arc<dyn Backend>,
    key: Mutex<Option<SecretKey>>,
    state: Mutex<PoolState>,
    changed: Condvar,
}

impl ConnectionPool {
    /// Creates an empty pool over `backend`. No connection can be opened
    /// until a key is set.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            key: Mutex::new(None),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Returns the backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Sets the key used for new connections.
    pub fn set_key(&self, key: SecretKey) {
        *self.key.lock() = Some(key);
    }

    /// Clears the closed flag so connections can be opened again.
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    /// Returns true after [`close_all`](Self::close_all) until [`reopen`](Self::reopen).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of open connections, idle or borrowed.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.state.lock().open
    }

    /// Number of idle connections.
    #[must_use]
    pub fn idle_connections(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Borrows a connection and starts a unit of work on it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DbClosed`] if the pool is closed or has no key,
    /// or a database error if a connection cannot be opened or started.
    pub fn start_transaction(&self) -> CoreResult<Box<dyn Connection>> {
        let pooled = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(CoreError::DbClosed);
            }
            state.idle.pop()
        };

        let mut conn = match pooled {
            Some(conn) => conn,
            None => {
                let key = self.key.lock().clone().ok_or(CoreError::DbClosed)?;
                let conn = self.backend.connect(key.as_bytes())?;
                let mut state = self.state.lock();
                if state.closed {
                    drop(state);
                    if let Err(e) = conn.close() {
                        warn!(error = %e, "error closing connection opened during shutdown");
                    }
                    return Err(CoreError::DbClosed);
                }
                state.open += 1;
                debug!(open = state.open, backend = self.backend.name(), "opened connection");
                conn
            }
        };

        if let Err(e) = conn.begin() {
            self.discard(conn);
            return Err(e.into());
        }
        Ok(conn)
    }

    /// Rolls back the unit of work and returns the connection to the pool.
    ///
    /// A connection whose rollback fails is closed instead of pooled.
    pub fn abort_transaction(&self, mut conn: Box<dyn Connection>) {
        match conn.rollback() {
            Ok(()) => self.release(conn),
            Err(e) => {
                warn!(error = %e, "rollback failed, discarding connection");
                self.discard(conn);
            }
        }
    }

    /// Commits the unit of work and returns the connection to the pool.
    ///
    /// # Errors
    ///
    /// Returns a database error if the commit fails. The connection has
    /// then been rolled back and pooled, or discarded if that failed too.
    pub fn commit_transaction(&self, mut conn: Box<dyn Connection>) -> CoreResult<()> {
        match conn.commit() {
            Ok(()) => {
                self.release(conn);
                Ok(())
            }
            Err(e) => {
                self.abort_transaction(conn);
                Err(e.into())
            }
        }
    }

    /// Closes every connection.
    ///
    /// Marks the pool closed, closes idle connections, then blocks until
    /// every borrowed connection has been returned and closed as well. No
    /// connection is left open when this returns.
    ///
    /// # Errors
    ///
    /// Returns the first error reported while closing a connection. Closing
    /// continues past errors.
    pub fn close_all(&self) -> CoreResult<()> {
        let mut first_error: Option<StorageError> = None;
        let mut state = self.state.lock();
        state.closed = true;
        close_idle(&mut state, &mut first_error);

        while state.open > 0 {
            if self.changed.wait_for(&mut state, DRAIN_WARN_INTERVAL).timed_out() {
                warn!(outstanding = state.open, "waiting for borrowed connections");
            }
            close_idle(&mut state, &mut first_error);
        }
        drop(state);
        debug!("all connections closed");

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Compacts the store. Call only while the pool is closed and drained.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DbClosed`] without a key, or the backend's error.
    pub fn compact(&self) -> CoreResult<()> {
        let key = self.key.lock().clone().ok_or(CoreError::DbClosed)?;
        self.backend.compact(key.as_bytes())?;
        Ok(())
    }

    fn release(&self, conn: Box<dyn Connection>) {
        self.state.lock().idle.push(conn);
        self.changed.notify_all();
    }

    fn discard(&self, conn: Box<dyn Connection>) {
        if let Err(e) = conn.close() {
            warn!(error = %e, "error closing discarded connection");
        }
        let mut state = self.state.lock();
        state.open = state.open.saturating_sub(1);
        drop(state);
        self.changed.notify_all();
    }
}

fn close_idle(state: &mut PoolState, first_error: &mut Option<StorageError>) {
    let idle = std::mem::take(&mut state.idle);
    state.open = state.open.saturating_sub(idle.len());
    for conn in idle {
        if let Err(e) = conn.close() {
            warn!(error = %e, "error closing connection");
            first_error.get_or_insert(e);
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionPool")
            .field("backend", &self.backend.name())
            .field("open", &state.open)
            .field("idle", &state.idle.len())
            .field("closed", &state.closed)
            .finish()
    }
}
