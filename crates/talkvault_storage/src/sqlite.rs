//! SQLite storage backend.

use crate::backend::{Backend, Connection, STORE_KEY_LEN};
use crate::error::{StorageError, StorageResult};
use rusqlite::{params, OpenFlags, OptionalExtension};
use std::any::Any;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// File name of the store inside the database directory.
pub const DB_FILE_NAME: &str = "talkvault.db";

/// A backend storing everything in one SQLite file.
///
/// Every connection is keyed with `PRAGMA key` and the file is encrypted
/// with that key by SQLCipher, linked through the default `sqlcipher`
/// feature. Opening fails with [`StorageError::EncryptionUnavailable`] when
/// plain SQLite is linked instead, unless the `insecure-plaintext` feature
/// is enabled.
///
/// # Example
///
/// ```no_run
/// use talkvault_storage::{Backend, SqliteBackend};
/// use std::path::Path;
///
/// let backend = SqliteBackend::new(Path::new("data/db"));
/// let mut conn = backend.connect(&[7u8; 32]).unwrap();
/// conn.begin().unwrap();
/// conn.execute_batch("CREATE TABLE t (x INT)").unwrap();
/// conn.commit().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    dir: PathBuf,
    busy_timeout: Duration,
}

impl SqliteBackend {
    /// Creates a backend rooted at `dir`. Nothing is created on disk until
    /// the first connection is opened.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Sets how long a connection waits on a locked file before failing.
    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Returns the database directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the SQLite file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.dir.join(DB_FILE_NAME)
    }

    fn open_raw(&self, key: &[u8; STORE_KEY_LEN]) -> StorageResult<rusqlite::Connection> {
        fs::create_dir_all(&self.dir)?;
        let conn = rusqlite::Connection::open_with_flags(
            self.db_path(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let pragma = Zeroizing::new(format!("PRAGMA key = \"x'{}'\";", hex::encode(key)));
        conn.execute_batch(&pragma)?;

        // Plain SQLite ignores `PRAGMA key` and has no cipher_version.
        let cipher: Option<String> = conn
            .query_row("PRAGMA cipher_version", [], |row| row.get(0))
            .optional()?;
        if cipher.as_deref().map_or(true, str::is_empty) {
            if !cfg!(feature = "insecure-plaintext") {
                return Err(StorageError::EncryptionUnavailable);
            }
            warn!(
                path = %self.db_path().display(),
                "SQLCipher not linked, store is unencrypted"
            );
        }

        // The first read fails if the key does not unlock the file.
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|e| StorageError::KeyRejected(e.to_string()))?;

        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }
}

impl Backend for SqliteBackend {
    fn is_initialized(&self) -> StorageResult<bool> {
        match fs::read_dir(&self.dir) {
            Ok(mut entries) => Ok(entries.next().is_some()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn connect(&self, key: &[u8; STORE_KEY_LEN]) -> StorageResult<Box<dyn Connection>> {
        let conn = self.open_raw(key)?;
        debug!(path = %self.db_path().display(), "opened SQLite connection");
        Ok(Box::new(SqliteConnection {
            conn,
            in_transaction: false,
        }))
    }

    fn compact(&self, key: &[u8; STORE_KEY_LEN]) -> StorageResult<()> {
        let conn = self.open_raw(key)?;
        conn.execute_batch("VACUUM")?;
        conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// A connection to a [`SqliteBackend`] store.
///
/// Collaborators that need raw SQL reach the underlying
/// [`rusqlite::Connection`] through [`SqliteConnection::sqlite`].
#[derive(Debug)]
pub struct SqliteConnection {
    conn: rusqlite::Connection,
    in_transaction: bool,
}

impl SqliteConnection {
    /// Returns the underlying rusqlite connection.
    pub fn sqlite(&mut self) -> &mut rusqlite::Connection {
        &mut self.conn
    }

    /// Returns true while a unit of work is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

impl Connection for SqliteConnection {
    fn begin(&mut self) -> StorageResult<()> {
        self.conn.execute_batch("BEGIN DEFERRED")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> StorageResult<()> {
        self.conn.execute_batch("ROLLBACK")?;
        self.in_transaction = false;
        Ok(())
    }

    fn execute_batch(&mut self, sql: &str) -> StorageResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn get_settings(&mut self, namespace: &str) -> StorageResult<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT settingKey, value FROM settings WHERE namespace = ?1")?;
        let rows = stmt.query_map(params![namespace], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut settings = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            settings.insert(key, value);
        }
        Ok(settings)
    }

    fn update_setting(&mut self, namespace: &str, key: &str, value: &str) -> StorageResult<usize> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE settings SET value = ?1 WHERE namespace = ?2 AND settingKey = ?3",
        )?;
        Ok(stmt.execute(params![value, namespace, key])?)
    }

    fn insert_setting(&mut self, namespace: &str, key: &str, value: &str) -> StorageResult<usize> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO settings (namespace, settingKey, value) VALUES (?1, ?2, ?3)",
        )?;
        Ok(stmt.execute(params![namespace, key, value])?)
    }

    fn close(self: Box<Self>) -> StorageResult<()> {
        self.conn.close().map_err(|(_, e)| StorageError::Sqlite(e))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY: [u8; STORE_KEY_LEN] = [0x42; STORE_KEY_LEN];
    const SETTINGS_DDL: &str = "CREATE TABLE settings (namespace TEXT NOT NULL, \
        settingKey TEXT NOT NULL, value TEXT NOT NULL, PRIMARY KEY (namespace, settingKey))";

    #[test]
    fn fresh_directory_is_not_initialized() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(&dir.path().join("db"));
        assert!(!backend.is_initialized().unwrap());
    }

    #[test]
    fn connecting_creates_the_store() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(&dir.path().join("db"));
        let conn = backend.connect(&KEY).unwrap();
        conn.close().unwrap();
        assert!(backend.is_initialized().unwrap());
        assert!(backend.db_path().exists());
    }

    #[test]
    fn settings_round_trip_through_commit() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());

        let mut conn = backend.connect(&KEY).unwrap();
        conn.begin().unwrap();
        conn.execute_batch(SETTINGS_DDL).unwrap();
        assert_eq!(conn.update_setting("db", "schemaVersion", "3").unwrap(), 0);
        assert_eq!(conn.insert_setting("db", "schemaVersion", "3").unwrap(), 1);
        conn.commit().unwrap();
        conn.close().unwrap();

        let mut conn = backend.connect(&KEY).unwrap();
        conn.begin().unwrap();
        let settings = conn.get_settings("db").unwrap();
        assert_eq!(settings.get("schemaVersion").map(String::as_str), Some("3"));
        assert!(conn.get_settings("other").unwrap().is_empty());
        conn.rollback().unwrap();
    }

    #[test]
    fn rollback_discards_writes() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());

        let mut conn = backend.connect(&KEY).unwrap();
        conn.begin().unwrap();
        conn.execute_batch(SETTINGS_DDL).unwrap();
        conn.commit().unwrap();

        conn.begin().unwrap();
        conn.insert_setting("ns", "k", "v").unwrap();
        conn.rollback().unwrap();

        conn.begin().unwrap();
        assert!(conn.get_settings("ns").unwrap().is_empty());
        conn.commit().unwrap();
    }

    #[test]
    fn compact_runs_on_closed_store() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());
        let mut conn = backend.connect(&KEY).unwrap();
        conn.begin().unwrap();
        conn.execute_batch(SETTINGS_DDL).unwrap();
        conn.commit().unwrap();
        conn.close().unwrap();

        backend.compact(&KEY).unwrap();
    }

    #[cfg(not(feature = "insecure-plaintext"))]
    #[test]
    fn store_file_holds_no_plaintext() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());
        let mut conn = backend.connect(&KEY).unwrap();
        conn.begin().unwrap();
        conn.execute_batch(SETTINGS_DDL).unwrap();
        conn.insert_setting("db", "schemaVersion", "9").unwrap();
        conn.commit().unwrap();
        conn.close().unwrap();

        let bytes = fs::read(backend.db_path()).unwrap();
        assert!(!bytes.is_empty());
        assert!(!bytes.starts_with(b"SQLite format 3"));
        for needle in [&b"schemaVersion"[..], b"settingKey", b"CREATE TABLE"] {
            assert!(
                !bytes.windows(needle.len()).any(|w| w == needle),
                "found {} in the store file",
                String::from_utf8_lossy(needle)
            );
        }
    }

    #[cfg(not(feature = "insecure-plaintext"))]
    #[test]
    fn wrong_key_is_rejected() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());
        let mut conn = backend.connect(&KEY).unwrap();
        conn.begin().unwrap();
        conn.execute_batch(SETTINGS_DDL).unwrap();
        conn.commit().unwrap();
        conn.close().unwrap();

        let wrong = [0x24; STORE_KEY_LEN];
        assert!(matches!(
            backend.connect(&wrong),
            Err(StorageError::KeyRejected(_))
        ));
        assert!(matches!(
            backend.compact(&wrong),
            Err(StorageError::KeyRejected(_))
        ));
        backend.connect(&KEY).unwrap().close().unwrap();
    }

    #[test]
    fn connection_downcasts_to_sqlite() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());
        let mut conn = backend.connect(&KEY).unwrap();
        let sqlite = conn
            .as_any_mut()
            .downcast_mut::<SqliteConnection>()
            .expect("sqlite connection");
        assert!(!sqlite.in_transaction());
        sqlite.sqlite().execute_batch("SELECT 1").unwrap();
    }
}
