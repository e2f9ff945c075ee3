//! Account creation, sign-in and key custody.
//!
//! An account is the pair of a sealed master key in the key directory and
//! the store in the database directory. The master key is generated once,
//! sealed under the user's password and only held in memory after a
//! successful sign-in.

mod key_files;

pub use key_files::{KeyFiles, StoreStep, BACKUP_FILE, KEY_FILE};

use crate::config::Config;
use crate::crypto::{KeyProtector, KeyStrengthener, SecretKey};
use crate::error::{CoreError, CoreResult, DecryptionError};
use crate::identity::IdentityManager;
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Manages the user's account and the master key that opens the store.
pub struct AccountManager {
    key_files: KeyFiles,
    database_dir: PathBuf,
    protector: KeyProtector,
    strengthener: Option<Arc<dyn KeyStrengthener>>,
    identities: Arc<IdentityManager>,
    /// Serializes state changes; holds the key after sign-in.
    database_key: Mutex<Option<SecretKey>>,
}

impl AccountManager {
    /// Creates a manager for the directories named in `config`.
    #[must_use]
    pub fn new(
        config: &Config,
        strengthener: Option<Arc<dyn KeyStrengthener>>,
        identities: Arc<IdentityManager>,
    ) -> Self {
        Self {
            key_files: KeyFiles::new(&config.key_dir),
            database_dir: config.database_dir.clone(),
            protector: KeyProtector::new(config.kdf),
            strengthener,
            identities,
            database_key: Mutex::new(None),
        }
    }

    /// Returns the key files.
    #[must_use]
    pub fn key_files(&self) -> &KeyFiles {
        &self.key_files
    }

    /// Returns true once the master key is held in memory.
    #[must_use]
    pub fn has_database_key(&self) -> bool {
        self.database_key.lock().is_some()
    }

    /// Returns the master key, if signed in.
    #[must_use]
    pub fn database_key(&self) -> Option<SecretKey> {
        self.database_key.lock().clone()
    }

    /// Returns true if a sealed key is stored and the database directory
    /// exists.
    #[must_use]
    pub fn account_exists(&self) -> bool {
        let _state = self.database_key.lock();
        self.key_files.load().is_some() && self.database_dir.is_dir()
    }

    /// Creates an account: a new identity and a new master key sealed under
    /// `password`.
    ///
    /// The identity is registered for storage when the store first opens.
    /// Returns false if the sealed key could not be stored.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if a key is already held, or
    /// an error if sealing fails.
    pub fn create_account(&self, name: &str, password: &str) -> CoreResult<bool> {
        let mut state = self.database_key.lock();
        if state.is_some() {
            return Err(CoreError::invalid_operation("already have a database key"));
        }
        let identity = self.identities.create_identity(name);
        self.identities.register_identity(identity);

        let key = SecretKey::generate();
        if !self.seal_and_store(&key, password)? {
            return Ok(false);
        }
        *state = Some(key);
        info!("account created");
        Ok(true)
    }

    /// Unseals the master key with `password` and keeps it in memory.
    ///
    /// A key sealed without a strengthener is resealed with one if a
    /// strengthener has since become available.
    ///
    /// # Errors
    ///
    /// - [`DecryptionError::InvalidCiphertext`] if no usable key is stored
    /// - [`DecryptionError::InvalidPassword`] for a wrong password
    /// - [`DecryptionError::KeyStrengthenerError`] if the key needs a
    ///   strengthener that is not available
    pub fn sign_in(&self, password: &str) -> Result<SecretKey, DecryptionError> {
        let mut state = self.database_key.lock();
        let key = self.load_and_unseal(password)?;
        *state = Some(key.clone());
        info!("signed in");
        Ok(key)
    }

    /// Reseals the master key under `new_password`.
    ///
    /// Returns false if the resealed key could not be stored.
    ///
    /// # Errors
    ///
    /// Fails as [`sign_in`](Self::sign_in) does for `old_password`.
    pub fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> Result<bool, DecryptionError> {
        let _state = self.database_key.lock();
        let key = self.load_and_unseal(old_password)?;
        match self.seal_and_store(&key, new_password) {
            Ok(stored) => Ok(stored),
            Err(e) => {
                warn!(error = %e, "failed to reseal database key");
                Ok(false)
            }
        }
    }

    /// Erases the key and database directories and forgets the key.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory exists but cannot be removed.
    pub fn delete_account(&self) -> CoreResult<()> {
        let mut state = self.database_key.lock();
        info!("deleting account");
        remove_dir(self.key_files.dir())?;
        remove_dir(&self.database_dir)?;
        *state = None;
        Ok(())
    }

    fn usable_strengthener(&self) -> Option<&dyn KeyStrengthener> {
        self.strengthener
            .as_deref()
            .filter(|s| s.is_initialised())
    }

    fn seal_and_store(&self, key: &SecretKey, password: &str) -> CoreResult<bool> {
        let blob =
            self.protector
                .encrypt_with_password(key.as_bytes(), password, self.usable_strengthener())?;
        Ok(self.key_files.store(&hex::encode(blob)))
    }

    fn load_and_unseal(&self, password: &str) -> Result<SecretKey, DecryptionError> {
        let Some(stored) = self.key_files.load() else {
            warn!("no stored database key");
            return Err(DecryptionError::InvalidCiphertext);
        };
        let blob = hex::decode(stored).map_err(|_| DecryptionError::InvalidCiphertext)?;
        let plain = self.protector.decrypt_with_password(
            &blob,
            password,
            self.strengthener.as_deref(),
        )?;
        let key =
            SecretKey::from_bytes(&plain).map_err(|_| DecryptionError::InvalidCiphertext)?;

        if self.usable_strengthener().is_some()
            && !KeyProtector::is_encrypted_with_strengthened_key(&blob)
        {
            info!("resealing database key with strengthened key");
            match self.seal_and_store(&key, password) {
                Ok(true) => {}
                Ok(false) => warn!("failed to store resealed database key"),
                Err(e) => warn!(error = %e, "failed to reseal database key"),
            }
        }
        Ok(key)
    }
}

fn remove_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl std::fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountManager")
            .field("key_dir", &self.key_files.dir())
            .field("database_dir", &self.database_dir)
            .field("signed_in", &self.has_database_key())
            .finish()
    }
}
