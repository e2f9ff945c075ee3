//! The local user's identity.

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::OpenDatabaseHook;
use crate::settings::Settings;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Settings namespace holding the identity.
pub const IDENTITY_NAMESPACE: &str = "identity";

const ID_KEY: &str = "id";
const NAME_KEY: &str = "name";
const CREATED_AT_KEY: &str = "createdAt";

/// Who the local user is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    id: String,
    name: String,
    created_at: i64,
}

impl Identity {
    /// Creates an identity.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at,
        }
    }

    /// Returns the identity's unique ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation time in epoch millis.
    #[must_use]
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    fn to_settings(&self) -> Settings {
        let mut s = Settings::new();
        s.put(ID_KEY, self.id.as_str());
        s.put(NAME_KEY, self.name.as_str());
        s.put_long(CREATED_AT_KEY, self.created_at);
        s
    }

    fn from_settings(s: &Settings) -> Option<Self> {
        Some(Self {
            id: s.get(ID_KEY)?.to_string(),
            name: s.get(NAME_KEY)?.to_string(),
            created_at: s.get_long(CREATED_AT_KEY, 0),
        })
    }
}

#[derive(Debug, Default)]
struct IdentityState {
    cached: Option<Identity>,
    /// Registered at account creation and not yet committed to the store.
    should_store: bool,
}

/// Creates, stores and caches the local identity.
///
/// A freshly created identity is registered before the store exists and
/// written by [`on_database_opened`](OpenDatabaseHook::on_database_opened)
/// on every open until a startup transaction carrying it commits. Later
/// opens load it instead.
pub struct IdentityManager {
    clock: Arc<dyn Clock>,
    state: Mutex<IdentityState>,
}

impl IdentityManager {
    /// Creates a manager with nothing cached.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(IdentityState::default()),
        }
    }

    /// Creates a new identity with a random ID.
    #[must_use]
    pub fn create_identity(&self, name: &str) -> Identity {
        Identity::new(
            Uuid::new_v4().to_string(),
            name,
            self.clock.current_time_millis(),
        )
    }

    /// Caches `identity` and marks it to be stored when the store opens.
    pub fn register_identity(&self, identity: Identity) {
        let mut state = self.state.lock();
        state.cached = Some(identity);
        state.should_store = true;
        info!("identity registered");
    }

    /// Returns the cached identity, if registered or loaded.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        self.state.lock().cached.clone()
    }
}

impl OpenDatabaseHook for IdentityManager {
    fn on_database_opened(&self, txn: &mut Transaction) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.should_store {
            if let Some(identity) = state.cached.as_ref() {
                txn.merge_settings(&identity.to_settings(), IDENTITY_NAMESPACE)?;
                info!("identity stored");
            }
            return Ok(());
        }
        if state.cached.is_none() {
            let stored = txn.get_settings(IDENTITY_NAMESPACE)?;
            let identity = Identity::from_settings(&stored)
                .ok_or_else(|| CoreError::db_state("store has no identity"))?;
            state.cached = Some(identity);
            info!("identity loaded");
        }
        Ok(())
    }

    fn on_database_open_committed(&self) {
        self.state.lock().should_store = false;
    }
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("state", &*self.state.lock())
            .finish()
    }
}
