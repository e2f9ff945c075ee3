//! Startup and shutdown ordering.
//!
//! Startup opens the store, runs every open-database hook in one write
//! transaction, then starts services in registration order. Shutdown stops
//! services, shuts down registered executors and closes the store. Each
//! state change is broadcast as a [`LifecycleEvent`].

use crate::crypto::SecretKey;
use crate::error::{CoreError, CoreResult};
use crate::event::EventBus;
use crate::executor::Executor;
use crate::migration::MigrationListener;
use crate::transaction::{Transaction, TransactionCoordinator};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where the manager is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Created, or opening the store.
    Starting,
    /// Applying schema migrations.
    MigratingDatabase,
    /// Compacting the store.
    CompactingDatabase,
    /// The store is open; services are starting.
    StartingServices,
    /// Every service has started.
    Running,
    /// Shutting down. There is no way back.
    Stopping,
}

/// Broadcast on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleEvent(pub LifecycleState);

/// Outcome of [`LifecycleManager::start_services`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartResult {
    /// Everything started.
    Success,
    /// Another start or stop is in progress, or startup already happened.
    AlreadyRunning,
    /// The store's schema is too old to migrate.
    DataTooOldError,
    /// The store's schema is newer than this code.
    DataTooNewError,
    /// The store could not be opened.
    DbError,
    /// A service failed to start.
    ServiceError,
}

impl From<&CoreError> for StartResult {
    fn from(e: &CoreError) -> Self {
        match e {
            CoreError::DataTooOld { .. } => StartResult::DataTooOldError,
            CoreError::DataTooNew { .. } => StartResult::DataTooNewError,
            CoreError::Service { .. } => StartResult::ServiceError,
            _ => StartResult::DbError,
        }
    }
}

/// A long-running component started after the store opens.
pub trait Service: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Starts the service.
    ///
    /// # Errors
    ///
    /// An error aborts startup.
    fn start_service(&self) -> CoreResult<()>;

    /// Stops the service.
    ///
    /// # Errors
    ///
    /// An error is logged; shutdown continues.
    fn stop_service(&self) -> CoreResult<()>;
}

/// Runs once per startup, inside the write transaction that follows opening
/// the store.
pub trait OpenDatabaseHook: Send + Sync {
    /// Called with the startup transaction.
    ///
    /// # Errors
    ///
    /// An error rolls back the transaction and aborts startup.
    fn on_database_opened(&self, txn: &mut Transaction) -> CoreResult<()>;

    /// Called once the startup transaction has committed.
    fn on_database_open_committed(&self) {}
}

/// A one-shot gate. Waiters block until it is released.
#[derive(Debug, Default)]
struct Latch {
    released: Mutex<bool>,
    changed: Condvar,
}

impl Latch {
    fn release(&self) {
        *self.released.lock() = true;
        self.changed.notify_all();
    }

    fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.changed.wait(&mut released);
        }
    }

    fn is_released(&self) -> bool {
        *self.released.lock()
    }
}

/// Orders startup and shutdown of the store and the services built on it.
pub struct LifecycleManager {
    coordinator: Arc<TransactionCoordinator>,
    bus: Arc<EventBus>,
    services: RwLock<Vec<Arc<dyn Service>>>,
    hooks: RwLock<Vec<Arc<dyn OpenDatabaseHook>>>,
    executors: RwLock<Vec<Arc<dyn Executor>>>,
    /// Admits one start or stop at a time.
    admission: Mutex<()>,
    state: RwLock<LifecycleState>,
    database_ready: Latch,
    startup: Latch,
    shutdown: Latch,
}

impl LifecycleManager {
    /// Creates a manager driving `coordinator`. Events go to the
    /// coordinator's event bus.
    #[must_use]
    pub fn new(coordinator: Arc<TransactionCoordinator>) -> Self {
        let bus = Arc::clone(coordinator.event_bus());
        Self {
            coordinator,
            bus,
            services: RwLock::new(Vec::new()),
            hooks: RwLock::new(Vec::new()),
            executors: RwLock::new(Vec::new()),
            admission: Mutex::new(()),
            state: RwLock::new(LifecycleState::Starting),
            database_ready: Latch::default(),
            startup: Latch::default(),
            shutdown: Latch::default(),
        }
    }

    /// Adds a service. Services start in registration order.
    pub fn register_service(&self, service: Arc<dyn Service>) {
        info!(service = service.name(), "registering service");
        self.services.write().push(service);
    }

    /// Adds an open-database hook. Hooks run in registration order.
    pub fn register_open_database_hook(&self, hook: Arc<dyn OpenDatabaseHook>) {
        debug!("registering open database hook");
        self.hooks.write().push(hook);
    }

    /// Adds an executor to shut down when services stop.
    pub fn register_for_shutdown(&self, executor: Arc<dyn Executor>) {
        debug!("registering executor for shutdown");
        self.executors.write().push(executor);
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Opens the store with `key` and starts every service.
    ///
    /// If a service fails to start, the services already started are
    /// stopped in reverse order and [`StartResult::ServiceError`] is
    /// returned. The store stays open for [`stop_services`](Self::stop_services).
    pub fn start_services(&self, key: &SecretKey) -> StartResult {
        let Some(_admission) = self.admission.try_lock() else {
            info!("already starting or stopping");
            return StartResult::AlreadyRunning;
        };
        if self.startup.is_released() || self.state() == LifecycleState::Stopping {
            info!("already started");
            return StartResult::AlreadyRunning;
        }
        match self.try_start(key) {
            Ok(()) => StartResult::Success,
            Err(e) => {
                warn!(error = %e, "startup failed");
                StartResult::from(&e)
            }
        }
    }

    fn try_start(&self, key: &SecretKey) -> CoreResult<()> {
        let started = Instant::now();
        let reopened = self
            .coordinator
            .open(key, Some(self as &dyn MigrationListener))?;
        info!(reopened, elapsed = ?started.elapsed(), "database opened");

        let hooks = self.hooks.read().clone();
        self.coordinator.transaction(false, |txn| {
            for hook in &hooks {
                hook.on_database_opened(txn)?;
            }
            Ok::<(), CoreError>(())
        })?;
        for hook in &hooks {
            hook.on_database_open_committed();
        }

        self.set_state(LifecycleState::StartingServices);
        self.database_ready.release();

        let services = self.services.read().clone();
        for (i, service) in services.iter().enumerate() {
            let started = Instant::now();
            if let Err(e) = service.start_service() {
                let e = match e {
                    CoreError::Service { .. } => e,
                    other => CoreError::service(service.name(), other.to_string()),
                };
                for earlier in services[..i].iter().rev() {
                    if let Err(stop) = earlier.stop_service() {
                        warn!(service = earlier.name(), error = %stop, "failed to stop service");
                    }
                }
                return Err(e);
            }
            debug!(service = service.name(), elapsed = ?started.elapsed(), "service started");
        }

        self.set_state(LifecycleState::Running);
        self.startup.release();
        Ok(())
    }

    /// Stops every service, shuts down registered executors and closes the
    /// store. Waits for a start in progress to finish first.
    pub fn stop_services(&self) {
        let _admission = self.admission.lock();
        info!("stopping services");
        self.set_state(LifecycleState::Stopping);

        for service in self.services.read().iter() {
            let started = Instant::now();
            match service.stop_service() {
                Ok(()) => debug!(
                    service = service.name(),
                    elapsed = ?started.elapsed(),
                    "service stopped"
                ),
                Err(e) => warn!(service = service.name(), error = %e, "failed to stop service"),
            }
        }
        for executor in self.executors.read().iter() {
            executor.shutdown();
        }

        let started = Instant::now();
        match self.coordinator.close() {
            Ok(()) => info!(elapsed = ?started.elapsed(), "database closed"),
            Err(e) => warn!(error = %e, "error closing database"),
        }
        self.shutdown.release();
    }

    /// Blocks until the store has been opened and the hooks have run.
    pub fn wait_for_database(&self) {
        self.database_ready.wait();
    }

    /// Blocks until every service has started.
    pub fn wait_for_startup(&self) {
        self.startup.wait();
    }

    /// Blocks until shutdown has finished.
    pub fn wait_for_shutdown(&self) {
        self.shutdown.wait();
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.write() = state;
        info!(?state, "lifecycle state changed");
        self.bus.broadcast(Arc::new(LifecycleEvent(state)));
    }
}

impl MigrationListener for LifecycleManager {
    fn on_database_migration(&self) {
        self.set_state(LifecycleState::MigratingDatabase);
    }

    fn on_database_compaction(&self) {
        self.set_state(LifecycleState::CompactingDatabase);
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("state", &self.state())
            .field("services", &self.services.read().len())
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::database::Database;
    use crate::event::EventRef;
    use crate::executor::SerialExecutor;
    use crate::identity::IdentityManager;
    use crate::settings::Settings;
    use std::sync::mpsc::{self, Receiver};
    use std::thread;
    use std::time::Duration;
    use talkvault_storage::InMemoryBackend;

    const KEY: [u8; 32] = [6; 32];

    struct RecordingService {
        name: &'static str,
        fail_start: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Service for RecordingService {
        fn name(&self) -> &str {
            self.name
        }

        fn start_service(&self) -> CoreResult<()> {
            if self.fail_start {
                return Err(CoreError::invalid_operation("refused"));
            }
            self.log.lock().push(format!("start {}", self.name));
            Ok(())
        }

        fn stop_service(&self) -> CoreResult<()> {
            self.log.lock().push(format!("stop {}", self.name));
            Ok(())
        }
    }

    struct SettingsHook;

    impl OpenDatabaseHook for SettingsHook {
        fn on_database_opened(&self, txn: &mut Transaction) -> CoreResult<()> {
            let mut s = Settings::new();
            s.put_bool("opened", true);
            txn.merge_settings(&s, "hook")
        }
    }

    struct Fixture {
        manager: Arc<LifecycleManager>,
        backend: InMemoryBackend,
        events: Receiver<EventRef>,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn fixture(backend: InMemoryBackend) -> Fixture {
        let db = Arc::new(Database::new(
            Arc::new(backend.clone()),
            Arc::new(ManualClock::new(0)),
        ));
        let bus = Arc::new(EventBus::new(Arc::new(
            SerialExecutor::new("lifecycle-events").unwrap(),
        )));
        let events = bus.subscribe();
        let executor = Arc::new(SerialExecutor::new("lifecycle-tasks").unwrap());
        let coordinator = Arc::new(TransactionCoordinator::new(db, bus, executor));
        Fixture {
            manager: Arc::new(LifecycleManager::new(coordinator)),
            backend,
            events,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    impl Fixture {
        fn service(&self, name: &'static str, fail_start: bool) {
            self.manager.register_service(Arc::new(RecordingService {
                name,
                fail_start,
                log: Arc::clone(&self.log),
            }));
        }

        fn states(&self) -> Vec<LifecycleState> {
            let mut states = Vec::new();
            while let Ok(event) = self.events.recv_timeout(Duration::from_millis(300)) {
                if let Some(LifecycleEvent(state)) = event.downcast_ref::<LifecycleEvent>() {
                    states.push(*state);
                }
            }
            states
        }
    }

    #[test]
    fn fresh_start_runs_hooks_and_services() {
        let f = fixture(InMemoryBackend::new());
        f.service("a", false);
        f.service("b", false);
        f.manager.register_open_database_hook(Arc::new(SettingsHook));

        assert_eq!(
            f.manager.start_services(&SecretKey::from_array(KEY)),
            StartResult::Success
        );
        f.manager.wait_for_database();
        f.manager.wait_for_startup();
        assert_eq!(f.manager.state(), LifecycleState::Running);
        assert_eq!(*f.log.lock(), vec!["start a", "start b"]);
        assert_eq!(f.backend.setting("hook", "opened").as_deref(), Some("true"));
        assert_eq!(
            f.states(),
            vec![LifecycleState::StartingServices, LifecycleState::Running]
        );
    }

    #[test]
    fn migration_states_are_broadcast() {
        let backend = InMemoryBackend::new();
        backend.mark_initialized(&KEY);
        backend.put_setting("db", "schemaVersion", "7");
        let f = fixture(backend);

        assert_eq!(
            f.manager.start_services(&SecretKey::from_array(KEY)),
            StartResult::Success
        );
        assert_eq!(
            f.states(),
            vec![
                LifecycleState::MigratingDatabase,
                LifecycleState::MigratingDatabase,
                LifecycleState::CompactingDatabase,
                LifecycleState::StartingServices,
                LifecycleState::Running,
            ]
        );
    }

    #[test]
    fn second_start_is_already_running() {
        let f = fixture(InMemoryBackend::new());
        let key = SecretKey::from_array(KEY);
        assert_eq!(f.manager.start_services(&key), StartResult::Success);
        assert_eq!(f.manager.start_services(&key), StartResult::AlreadyRunning);
    }

    #[test]
    fn schema_errors_map_to_results() {
        let backend = InMemoryBackend::new();
        backend.mark_initialized(&KEY);
        backend.put_setting("db", "schemaVersion", "99");
        let f = fixture(backend);
        assert_eq!(
            f.manager.start_services(&SecretKey::from_array(KEY)),
            StartResult::DataTooNewError
        );

        let backend = InMemoryBackend::new();
        backend.mark_initialized(&KEY);
        backend.put_setting("db", "schemaVersion", "0");
        let f = fixture(backend);
        assert_eq!(
            f.manager.start_services(&SecretKey::from_array(KEY)),
            StartResult::DataTooOldError
        );

        let backend = InMemoryBackend::new();
        backend.mark_initialized(&KEY);
        let f = fixture(backend);
        assert_eq!(
            f.manager.start_services(&SecretKey::from_array(KEY)),
            StartResult::DbError
        );
    }

    #[test]
    fn identity_is_stored_by_the_retry_after_a_failed_hook() {
        struct FlakyHook(std::sync::atomic::AtomicBool);

        impl OpenDatabaseHook for FlakyHook {
            fn on_database_opened(&self, _txn: &mut Transaction) -> CoreResult<()> {
                if self.0.swap(false, std::sync::atomic::Ordering::SeqCst) {
                    return Err(CoreError::db_state("not ready"));
                }
                Ok(())
            }
        }

        let f = fixture(InMemoryBackend::new());
        let identities = Arc::new(IdentityManager::new(Arc::new(ManualClock::new(5))));
        let identity = identities.create_identity("dana");
        identities.register_identity(identity.clone());
        f.manager.register_open_database_hook(identities.clone());
        f.manager
            .register_open_database_hook(Arc::new(FlakyHook(true.into())));

        let key = SecretKey::from_array(KEY);
        assert_eq!(f.manager.start_services(&key), StartResult::DbError);
        assert!(f.backend.setting("identity", "id").is_none());

        assert_eq!(f.manager.start_services(&key), StartResult::Success);
        assert_eq!(
            f.backend.setting("identity", "id").as_deref(),
            Some(identity.id())
        );
        f.manager.stop_services();
    }

    #[test]
    fn failed_service_stops_earlier_ones_in_reverse() {
        let f = fixture(InMemoryBackend::new());
        f.service("a", false);
        f.service("b", false);
        f.service("c", true);

        assert_eq!(
            f.manager.start_services(&SecretKey::from_array(KEY)),
            StartResult::ServiceError
        );
        assert_eq!(
            *f.log.lock(),
            vec!["start a", "start b", "stop b", "stop a"]
        );
        assert_eq!(f.manager.state(), LifecycleState::StartingServices);
    }

    #[test]
    fn stop_shuts_everything_down() {
        let f = fixture(InMemoryBackend::new());
        f.service("a", false);
        let executor = Arc::new(SerialExecutor::new("lifecycle-worker").unwrap());
        f.manager.register_for_shutdown(executor.clone());

        let key = SecretKey::from_array(KEY);
        assert_eq!(f.manager.start_services(&key), StartResult::Success);
        f.manager.stop_services();
        f.manager.wait_for_shutdown();

        assert_eq!(*f.log.lock(), vec!["start a", "stop a"]);
        assert!(executor.is_shut_down());
        assert_eq!(f.backend.live_connections(), 0);
        assert_eq!(f.manager.state(), LifecycleState::Stopping);
        assert_eq!(f.manager.start_services(&key), StartResult::AlreadyRunning);
    }

    #[test]
    fn concurrent_start_is_refused() {
        struct GateHook {
            entered: Mutex<mpsc::Sender<()>>,
            go: Mutex<Receiver<()>>,
        }

        impl OpenDatabaseHook for GateHook {
            fn on_database_opened(&self, _txn: &mut Transaction) -> CoreResult<()> {
                self.entered.lock().send(()).unwrap();
                self.go.lock().recv().unwrap();
                Ok(())
            }
        }

        let f = fixture(InMemoryBackend::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel();
        f.manager.register_open_database_hook(Arc::new(GateHook {
            entered: Mutex::new(entered_tx),
            go: Mutex::new(go_rx),
        }));

        let starter = {
            let manager = Arc::clone(&f.manager);
            thread::spawn(move || manager.start_services(&SecretKey::from_array(KEY)))
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            f.manager.start_services(&SecretKey::from_array(KEY)),
            StartResult::AlreadyRunning
        );
        go_tx.send(()).unwrap();
        assert_eq!(starter.join().unwrap(), StartResult::Success);
    }
}
