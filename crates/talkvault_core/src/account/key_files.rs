//! Crash-safe storage of the encrypted master key.
//!
//! The key directory layout:
//!
//! ```text
//! <key_dir>/
//! ├─ db.key       # Hex-encoded encrypted master key
//! ├─ db.key.bak   # Second copy, also used as the staging file
//! └─ LOCK         # Advisory lock held while a store is in progress
//! ```
//!
//! A store never leaves the directory without at least one file holding a
//! complete value, old or new.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Primary key file name.
pub const KEY_FILE: &str = "db.key";
/// Backup key file name.
pub const BACKUP_FILE: &str = "db.key.bak";
const LOCK_FILE: &str = "LOCK";

/// Points in the store protocol at which a callback is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreStep {
    /// Before the new value is written to the backup file.
    BeforeBackupWrite,
    /// After the new value is in the backup file.
    AfterBackupWrite,
    /// After the old primary file is deleted.
    AfterPrimaryDelete,
    /// After the backup file is renamed to primary.
    AfterRename,
}

impl StoreStep {
    /// Every step in protocol order.
    pub const ALL: [StoreStep; 4] = [
        StoreStep::BeforeBackupWrite,
        StoreStep::AfterBackupWrite,
        StoreStep::AfterPrimaryDelete,
        StoreStep::AfterRename,
    ];
}

/// The primary/backup key file pair in one directory.
#[derive(Debug, Clone)]
pub struct KeyFiles {
    dir: PathBuf,
}

impl KeyFiles {
    /// Creates a handle for the key files in `dir`.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Returns the key directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the primary file.
    #[must_use]
    pub fn primary_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    /// Path of the backup file.
    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(BACKUP_FILE)
    }

    /// Loads the stored hex value.
    ///
    /// Reads the primary file, falling back to the backup if the primary is
    /// missing, empty, not hex or unreadable.
    #[must_use]
    pub fn load(&self) -> Option<String> {
        if let Some(hex) = read_hex(&self.primary_path()) {
            return Some(hex);
        }
        let backup = read_hex(&self.backup_path());
        if backup.is_some() {
            info!("primary key file unusable, using backup");
        }
        backup
    }

    /// Durably stores `hex`, replacing any previous value.
    ///
    /// Returns false if the value could not be stored.
    pub fn store(&self, hex: &str) -> bool {
        self.store_with_hook(hex, &mut |_| Ok(()))
    }

    /// Stores `hex`, invoking `hook` at each [`StoreStep`].
    ///
    /// An error returned by the hook stops the store at that step, leaving
    /// the files exactly as a crash at that point would.
    pub fn store_with_hook(
        &self,
        hex: &str,
        hook: &mut dyn FnMut(StoreStep) -> io::Result<()>,
    ) -> bool {
        match self.try_store(hex, hook) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to store encrypted key");
                false
            }
        }
    }

    fn try_store(
        &self,
        hex: &str,
        hook: &mut dyn FnMut(StoreStep) -> io::Result<()>,
    ) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let _lock = self.lock()?;

        let primary = self.primary_path();
        let backup = self.backup_path();

        // Finish an earlier store interrupted between delete and rename.
        if !primary.exists() && backup.exists() {
            fs::rename(&backup, &primary)?;
            self.sync_directory()?;
        }

        hook(StoreStep::BeforeBackupWrite)?;
        write_hex(&backup, hex)?;
        hook(StoreStep::AfterBackupWrite)?;

        match fs::remove_file(&primary) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        hook(StoreStep::AfterPrimaryDelete)?;

        fs::rename(&backup, &primary)?;
        self.sync_directory()?;
        hook(StoreStep::AfterRename)?;

        write_hex(&backup, hex)
    }

    fn lock(&self) -> io::Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(LOCK_FILE))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> io::Result<()> {
        File::open(&self.dir)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> io::Result<()> {
        Ok(())
    }
}

fn read_hex(path: &Path) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    let line = contents.lines().next()?.trim();
    if line.is_empty() || hex::decode(line).is_err() {
        return None;
    }
    Some(line.to_string())
}

fn write_hex(path: &Path, hex: &str) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(hex.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn crash_at(step: StoreStep) -> impl FnMut(StoreStep) -> io::Result<()> {
        move |s| {
            if s == step {
                Err(io::Error::new(io::ErrorKind::Other, "simulated crash"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn load_without_files_is_none() {
        let dir = tempdir().unwrap();
        assert_eq!(KeyFiles::new(dir.path()).load(), None);
    }

    #[test]
    fn store_writes_both_files() {
        let dir = tempdir().unwrap();
        let files = KeyFiles::new(&dir.path().join("key"));
        assert!(files.store("abcd"));
        assert_eq!(files.load().as_deref(), Some("abcd"));
        assert_eq!(read_hex(&files.primary_path()).as_deref(), Some("abcd"));
        assert_eq!(read_hex(&files.backup_path()).as_deref(), Some("abcd"));
    }

    #[test]
    fn load_falls_back_to_backup() {
        let dir = tempdir().unwrap();
        let files = KeyFiles::new(dir.path());
        assert!(files.store("0011"));
        fs::write(files.primary_path(), "not hex at all").unwrap();
        assert_eq!(files.load().as_deref(), Some("0011"));
        fs::remove_file(files.primary_path()).unwrap();
        assert_eq!(files.load().as_deref(), Some("0011"));
    }

    #[test]
    fn crash_at_any_step_keeps_a_committed_value() {
        for step in StoreStep::ALL {
            let dir = tempdir().unwrap();
            let files = KeyFiles::new(dir.path());
            assert!(files.store("aaaa"));

            assert!(!files.store_with_hook("bbbb", &mut crash_at(step)));
            let loaded = files.load();
            assert!(
                loaded.as_deref() == Some("aaaa") || loaded.as_deref() == Some("bbbb"),
                "step {step:?} left {loaded:?}"
            );

            // The next store recovers whatever state the crash left.
            assert!(files.store("cccc"));
            assert_eq!(files.load().as_deref(), Some("cccc"));
        }
    }

    #[test]
    fn interrupted_store_is_completed_on_next_store() {
        let dir = tempdir().unwrap();
        let files = KeyFiles::new(dir.path());
        assert!(files.store("aaaa"));
        assert!(!files.store_with_hook("bbbb", &mut crash_at(StoreStep::AfterPrimaryDelete)));
        assert!(!files.primary_path().exists());
        assert_eq!(files.load().as_deref(), Some("bbbb"));

        assert!(files.store("cccc"));
        assert!(files.primary_path().exists());
        assert!(files.backup_path().exists());
    }
}
