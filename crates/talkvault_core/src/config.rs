//! Store configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest time allowed between two compactions.
pub const MAX_COMPACTION_INTERVAL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Tuning for the password key derivation.
///
/// The cost is the Argon2id memory size in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfConfig {
    /// Wall-clock time one derivation should take on this device.
    pub target: Duration,
    /// Smallest cost ever chosen or accepted.
    pub min_cost: u32,
    /// Largest cost ever chosen or accepted.
    pub max_cost: u32,
}

impl KdfConfig {
    /// Smallest memory cost Argon2 accepts with one lane.
    pub const FLOOR_COST: u32 = 8;
    /// Largest memory cost accepted when decrypting (1 GiB).
    pub const CEILING_COST: u32 = 1 << 20;

    /// A configuration that always chooses `cost`, skipping calibration.
    #[must_use]
    pub const fn fixed(cost: u32) -> Self {
        Self {
            target: Duration::ZERO,
            min_cost: cost,
            max_cost: cost,
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            target: Duration::from_secs(1),
            min_cost: 1 << 12,  // 4 MiB
            max_cost: 1 << 18,  // 256 MiB
        }
    }
}

/// Configuration for an account and its store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the store.
    pub database_dir: PathBuf,

    /// Directory holding the encrypted master key files.
    pub key_dir: PathBuf,

    /// Compaction is due once this much time has passed since the last one.
    pub compaction_interval: Duration,

    /// How long a connection waits on a locked store.
    pub busy_timeout: Duration,

    /// Password key derivation tuning.
    pub kdf: KdfConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::for_data_dir(Path::new("talkvault"))
    }
}

impl Config {
    /// Creates a configuration keeping the store in `<data_dir>/db` and the
    /// key files in `<data_dir>/key`.
    #[must_use]
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self {
            database_dir: data_dir.join("db"),
            key_dir: data_dir.join("key"),
            compaction_interval: MAX_COMPACTION_INTERVAL,
            busy_timeout: Duration::from_secs(5),
            kdf: KdfConfig::default(),
        }
    }

    /// Sets the store directory.
    #[must_use]
    pub fn database_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.database_dir = dir.into();
        self
    }

    /// Sets the key file directory.
    #[must_use]
    pub fn key_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.key_dir = dir.into();
        self
    }

    /// Sets the compaction interval.
    #[must_use]
    pub const fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Sets the busy timeout.
    #[must_use]
    pub const fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets the key derivation tuning.
    #[must_use]
    pub const fn kdf(mut self, kdf: KdfConfig) -> Self {
        self.kdf = kdf;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.compaction_interval, MAX_COMPACTION_INTERVAL);
        assert_eq!(config.database_dir, Path::new("talkvault").join("db"));
        assert_eq!(config.key_dir, Path::new("talkvault").join("key"));
        assert!(config.kdf.min_cost <= config.kdf.max_cost);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::for_data_dir(Path::new("/data"))
            .key_dir("/keys")
            .compaction_interval(Duration::from_secs(60))
            .kdf(KdfConfig::fixed(64));

        assert_eq!(config.key_dir, PathBuf::from("/keys"));
        assert_eq!(config.database_dir, PathBuf::from("/data/db"));
        assert_eq!(config.compaction_interval, Duration::from_secs(60));
        assert_eq!(config.kdf.min_cost, 64);
        assert_eq!(config.kdf.max_cost, 64);
    }

    #[test]
    fn thirty_day_interval() {
        assert_eq!(MAX_COMPACTION_INTERVAL.as_millis(), 30 * 24 * 60 * 60 * 1000);
    }
}
