//! Crash recovery testing for TalkVault.
//!
//! Simulates a crash at each step of storing the sealed key and verifies
//! that a later load still yields a usable key, and that a crash while a
//! write transaction commits leaves nothing behind.
//!
//! ## Test Strategy
//!
//! 1. **Crash while storing the key** - the old or the new value survives
//! 2. **Crash while changing the password** - either password still signs in
//! 3. **Failed commit** - no settings written, no events delivered
//!
//! ## Usage
//!
//! ```rust
//! use talkvault_testkit::crash::KeyFileCrashHarness;
//!
//! let mut harness = KeyFileCrashHarness::with_temp_dir().unwrap();
//! assert!(harness.run_all().iter().all(|r| r.passed));
//! ```

use crate::fixtures::TestStore;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use talkvault_core::account::{KeyFiles, StoreStep};
use talkvault_core::clock::ManualClock;
use talkvault_core::config::KdfConfig;
use talkvault_core::crypto::KeyProtector;
use talkvault_core::identity::IdentityManager;
use talkvault_core::settings::Settings;
use talkvault_core::{AccountManager, Config, CoreError};
use talkvault_storage::FailPoint;
use tempfile::TempDir;
use tracing::warn;

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// The step the crash was simulated at, if any.
    pub step: Option<StoreStep>,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, step: Option<StoreStep>) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            step,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, step: Option<StoreStep>, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            step,
            error: Some(error.to_string()),
        }
    }
}

/// A store hook that fails at `step`, leaving the files as a crash would.
pub fn crash_at(step: StoreStep) -> impl FnMut(StoreStep) -> io::Result<()> {
    move |s| {
        if s == step {
            Err(io::Error::new(io::ErrorKind::Other, "simulated crash"))
        } else {
            Ok(())
        }
    }
}

/// Harness for crash recovery of the sealed key files.
pub struct KeyFileCrashHarness {
    /// Root directory the scenarios run under.
    root: PathBuf,
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
    _temp_dir: Option<TempDir>,
}

impl KeyFileCrashHarness {
    /// Creates a harness rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            results: Vec::new(),
            _temp_dir: None,
        }
    }

    /// Creates a harness in a temporary directory removed on drop.
    pub fn with_temp_dir() -> io::Result<Self> {
        let temp_dir = TempDir::new()?;
        let mut harness = Self::new(temp_dir.path());
        harness._temp_dir = Some(temp_dir);
        Ok(harness)
    }

    fn scenario_dir(&self, name: &str, step: StoreStep) -> io::Result<PathBuf> {
        let dir = self.root.join(format!("{name}-{step:?}"));
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Crashes while replacing a stored value and checks that the old or
    /// new value loads, and that the next store succeeds.
    pub fn test_crash_during_store(&mut self, step: StoreStep) -> CrashRecoveryResult {
        const DESCRIPTION: &str = "Stored key survives a crash mid-store";
        let result = (|| -> Result<CrashRecoveryResult, io::Error> {
            let files = KeyFiles::new(&self.scenario_dir("store", step)?);
            if !files.store("aaaa") {
                return Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    Some(step),
                    "initial store failed",
                ));
            }
            if files.store_with_hook("bbbb", &mut crash_at(step)) {
                return Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    Some(step),
                    "crash was not simulated",
                ));
            }
            let loaded = files.load();
            if !matches!(loaded.as_deref(), Some("aaaa" | "bbbb")) {
                return Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    Some(step),
                    &format!("loaded {loaded:?} after crash"),
                ));
            }
            if !files.store("cccc") || files.load().as_deref() != Some("cccc") {
                return Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    Some(step),
                    "store after crash did not recover",
                ));
            }
            Ok(CrashRecoveryResult::pass(DESCRIPTION, Some(step)))
        })();

        let result = result.unwrap_or_else(|e| {
            CrashRecoveryResult::fail(DESCRIPTION, Some(step), &e.to_string())
        });
        self.results.push(result.clone());
        result
    }

    /// Crashes while resealing the master key under a new password and
    /// checks that sign-in with one of the two passwords yields the
    /// original key.
    pub fn test_crash_during_password_change(&mut self, step: StoreStep) -> CrashRecoveryResult {
        const DESCRIPTION: &str = "Master key survives a crash mid password change";
        let result = (|| -> Result<CrashRecoveryResult, CoreError> {
            let dir = self.scenario_dir("password", step)?;
            let config = Config::for_data_dir(&dir).kdf(KdfConfig::fixed(KdfConfig::FLOOR_COST));
            let accounts = account_manager(&config);
            if !accounts.create_account("crash", "old-password")? {
                return Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    Some(step),
                    "account not created",
                ));
            }
            let Some(key) = accounts.database_key() else {
                return Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    Some(step),
                    "no key after create",
                ));
            };

            let resealed = KeyProtector::new(config.kdf).encrypt_with_password(
                key.as_bytes(),
                "new-password",
                None,
            )?;
            accounts
                .key_files()
                .store_with_hook(&hex::encode(resealed), &mut crash_at(step));

            let restarted = account_manager(&config);
            let recovered = restarted
                .sign_in("old-password")
                .or_else(|_| restarted.sign_in("new-password"));
            match recovered {
                Ok(k) if k == key => Ok(CrashRecoveryResult::pass(DESCRIPTION, Some(step))),
                Ok(_) => Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    Some(step),
                    "different key recovered",
                )),
                Err(e) => Ok(CrashRecoveryResult::fail(DESCRIPTION, Some(step), &e.to_string())),
            }
        })();

        let result = result.unwrap_or_else(|e| {
            CrashRecoveryResult::fail(DESCRIPTION, Some(step), &e.to_string())
        });
        self.results.push(result.clone());
        result
    }

    /// Fails the commit of a settings write and checks that nothing was
    /// written and no event was delivered.
    pub fn test_failed_commit_discards_writes(&mut self) -> CrashRecoveryResult {
        const DESCRIPTION: &str = "Failed commit discards writes and events";
        let result = (|| -> Result<CrashRecoveryResult, CoreError> {
            let store = TestStore::memory();
            store.open()?;
            let Some(backend) = store.memory.as_ref() else {
                return Ok(CrashRecoveryResult::fail(DESCRIPTION, None, "no in-memory backend"));
            };
            backend.fail_next(FailPoint::Commit, 1);

            let mut s = Settings::new();
            s.put("k", "v");
            let outcome = store
                .coordinator
                .transaction(false, |txn| txn.merge_settings(&s, "crash"));
            if outcome.is_ok() {
                return Ok(CrashRecoveryResult::fail(DESCRIPTION, None, "commit did not fail"));
            }
            if backend.setting("crash", "k").is_some() {
                return Ok(CrashRecoveryResult::fail(DESCRIPTION, None, "write survived"));
            }
            if !store.no_event_within(Duration::from_millis(100)) {
                return Ok(CrashRecoveryResult::fail(DESCRIPTION, None, "event delivered"));
            }
            Ok(CrashRecoveryResult::pass(DESCRIPTION, None))
        })();

        let result = result.unwrap_or_else(|e| {
            CrashRecoveryResult::fail(DESCRIPTION, None, &e.to_string())
        });
        self.results.push(result.clone());
        result
    }

    /// Runs every scenario at every step.
    pub fn run_all(&mut self) -> Vec<CrashRecoveryResult> {
        for step in StoreStep::ALL {
            self.test_crash_during_store(step);
            self.test_crash_during_password_change(step);
        }
        self.test_failed_commit_discards_writes();
        for result in self.results.iter().filter(|r| !r.passed) {
            warn!(
                description = %result.description,
                step = ?result.step,
                error = result.error.as_deref().unwrap_or(""),
                "crash scenario failed"
            );
        }
        self.results.clone()
    }
}

fn account_manager(config: &Config) -> AccountManager {
    let identities = Arc::new(IdentityManager::new(Arc::new(ManualClock::new(0))));
    AccountManager::new(config, None, identities)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_store_step_recovers() {
        let mut harness = KeyFileCrashHarness::with_temp_dir().unwrap();
        for step in StoreStep::ALL {
            let result = harness.test_crash_during_store(step);
            assert!(result.passed, "{result:?}");
        }
    }

    #[test]
    fn password_change_crash_keeps_the_key() {
        let mut harness = KeyFileCrashHarness::with_temp_dir().unwrap();
        for step in StoreStep::ALL {
            let result = harness.test_crash_during_password_change(step);
            assert!(result.passed, "{result:?}");
        }
    }

    #[test]
    fn failed_commit_is_discarded() {
        let mut harness = KeyFileCrashHarness::with_temp_dir().unwrap();
        let result = harness.test_failed_commit_discards_writes();
        assert!(result.passed, "{result:?}");
    }
}
