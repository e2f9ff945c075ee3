//! Database open, migration and compaction.

use crate::clock::Clock;
use crate::config::{Config, MAX_COMPACTION_INTERVAL};
use crate::crypto::SecretKey;
use crate::error::{CoreError, CoreResult};
use crate::migration::{MigrationChain, MigrationListener, SchemaVersion};
use crate::pool::ConnectionPool;
use crate::schema::create_tables;
use crate::settings::{
    read_settings, write_settings, Settings, DB_SETTINGS_NAMESPACE, LAST_COMPACTED_KEY,
    SCHEMA_VERSION_KEY,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use talkvault_storage::{Backend, Connection, SqliteBackend};
use tracing::{debug, info};

/// The database handle below the transaction coordinator.
///
/// `Database` owns the connection pool and knows how to bring a store into
/// a usable state:
/// - Creates every table on first open
/// - Migrates older stores to the code's schema version
/// - Compacts the store after a migration or when compaction is overdue
///
/// It does no locking of its own. Callers serialize access through the
/// [`TransactionCoordinator`](crate::transaction::TransactionCoordinator).
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use talkvault_core::clock::SystemClock;
/// use talkvault_core::crypto::SecretKey;
/// use talkvault_core::Database;
/// use talkvault_storage::InMemoryBackend;
///
/// let db = Database::new(Arc::new(InMemoryBackend::new()), Arc::new(SystemClock));
/// let reopened = db.open(&SecretKey::generate(), None).unwrap();
/// assert!(!reopened);
/// db.close().unwrap();
/// ```
pub struct Database {
    pool: ConnectionPool,
    chain: MigrationChain,
    clock: Arc<dyn Clock>,
    compaction_interval: Duration,
}

impl Database {
    /// Creates a database over `backend` using the standard migration chain.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: ConnectionPool::new(backend),
            chain: MigrationChain::standard(),
            clock,
            compaction_interval: MAX_COMPACTION_INTERVAL,
        }
    }

    /// Creates a SQLite-backed database in `config.database_dir`.
    #[must_use]
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Self {
        let backend =
            SqliteBackend::new(&config.database_dir).with_busy_timeout(config.busy_timeout);
        Self::new(Arc::new(backend), clock).with_compaction_interval(config.compaction_interval)
    }

    /// Replaces the migration chain.
    #[must_use]
    pub fn with_chain(mut self, chain: MigrationChain) -> Self {
        self.chain = chain;
        self
    }

    /// Sets how long may pass between compactions.
    #[must_use]
    pub fn with_compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Returns the connection pool.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Returns the migration chain.
    #[must_use]
    pub fn chain(&self) -> &MigrationChain {
        &self.chain
    }

    /// Schema version this database creates and migrates to.
    #[must_use]
    pub fn target_version(&self) -> SchemaVersion {
        self.chain.target_version()
    }

    /// Opens the store with `key`.
    ///
    /// A store that already holds data is migrated to the target version if
    /// needed; an empty one gets the full schema. Either way the work runs
    /// in a single unit of work. Compaction follows if a migration ran or
    /// the last one is older than the compaction interval.
    ///
    /// Returns true if an existing store was reopened.
    ///
    /// # Errors
    ///
    /// - [`CoreError::DbState`] if an existing store has no schema version
    /// - [`CoreError::DataTooOld`] / [`CoreError::DataTooNew`] on a version
    ///   the chain cannot bring to the target
    /// - [`CoreError::Db`] if the backend fails or rejects the key
    pub fn open(
        &self,
        key: &SecretKey,
        listener: Option<&dyn MigrationListener>,
    ) -> CoreResult<bool> {
        self.pool.set_key(key.clone());
        self.pool.reopen();

        let reopen = self.pool.backend().is_initialized()?;
        let mut conn = self.pool.start_transaction()?;
        let compact = match self.prepare(conn.as_mut(), reopen, listener) {
            Ok(compact) => compact,
            Err(e) => {
                self.pool.abort_transaction(conn);
                return Err(e);
            }
        };
        self.pool.commit_transaction(conn)?;
        info!(reopen, backend = self.pool.backend().name(), "database opened");

        if compact {
            if let Some(l) = listener {
                l.on_database_compaction();
            }
            self.compact()?;
        }
        Ok(reopen)
    }

    fn prepare(
        &self,
        conn: &mut dyn Connection,
        reopen: bool,
        listener: Option<&dyn MigrationListener>,
    ) -> CoreResult<bool> {
        if !reopen {
            create_tables(conn)?;
            let mut s = Settings::new();
            s.put_int(SCHEMA_VERSION_KEY, self.chain.target_version());
            s.put_long(LAST_COMPACTED_KEY, self.clock.current_time_millis());
            write_settings(conn, &s, DB_SETTINGS_NAMESPACE)?;
            return Ok(false);
        }

        let settings = read_settings(conn, DB_SETTINGS_NAMESPACE)?;
        let stored = settings.get_int(SCHEMA_VERSION_KEY, -1);
        info!(stored, target = self.chain.target_version(), "stored schema version");
        if stored == -1 {
            return Err(CoreError::db_state("existing store has no schema version"));
        }
        let migrated = self.chain.apply(conn, stored, listener)?;
        Ok(migrated || self.is_compaction_due(&settings))
    }

    fn is_compaction_due(&self, settings: &Settings) -> bool {
        let last = settings.get_long(LAST_COMPACTED_KEY, 0);
        let elapsed = self.clock.current_time_millis().saturating_sub(last);
        info!(elapsed_ms = elapsed, "time since last compaction");
        let interval = i64::try_from(self.compaction_interval.as_millis()).unwrap_or(i64::MAX);
        elapsed > interval
    }

    fn compact(&self) -> CoreResult<()> {
        let started = Instant::now();
        self.pool.close_all()?;
        self.pool.compact()?;
        info!(elapsed = ?started.elapsed(), "database compacted");

        self.pool.reopen();
        let mut conn = self.pool.start_transaction()?;
        let mut s = Settings::new();
        s.put_long(LAST_COMPACTED_KEY, self.clock.current_time_millis());
        if let Err(e) = write_settings(conn.as_mut(), &s, DB_SETTINGS_NAMESPACE) {
            self.pool.abort_transaction(conn);
            return Err(e);
        }
        self.pool.commit_transaction(conn)
    }

    /// Closes every connection, waiting for borrowed ones to come back.
    ///
    /// # Errors
    ///
    /// Returns the first error reported while closing a connection.
    pub fn close(&self) -> CoreResult<()> {
        debug!("closing database");
        self.pool.close_all()
    }

    /// Starts a unit of work on a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DbClosed`] after [`close`](Self::close).
    pub fn start_transaction(&self) -> CoreResult<Box<dyn Connection>> {
        self.pool.start_transaction()
    }

    /// Commits a unit of work.
    ///
    /// # Errors
    ///
    /// Returns a database error if the commit fails.
    pub fn commit_transaction(&self, conn: Box<dyn Connection>) -> CoreResult<()> {
        self.pool.commit_transaction(conn)
    }

    /// Rolls back a unit of work.
    pub fn abort_transaction(&self, conn: Box<dyn Connection>) {
        self.pool.abort_transaction(conn);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("pool", &self.pool)
            .field("target_version", &self.chain.target_version())
            .field("compaction_interval", &self.compaction_interval)
            .finish()
    }
}
