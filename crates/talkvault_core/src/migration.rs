//! Schema versioning and migration.
//!
//! The store records its schema version in the settings table. At every open
//! the stored version is compared with [`CODE_SCHEMA_VERSION`] and, if older,
//! brought forward by applying registered migrations one step at a time.
//!
//! ## Design Philosophy
//!
//! Migrations are:
//! - **Forward-only**: There is no downgrade path
//! - **Stepwise**: Each migration moves exactly one `start → end` edge
//! - **Transactional**: The whole chain runs inside the opening unit of work
//!
//! ## Usage
//!
//! ```rust
//! use talkvault_core::migration::{Migration, MigrationChain, SchemaVersion};
//! use talkvault_core::CoreResult;
//! use talkvault_storage::Connection;
//!
//! struct AddDrafts;
//! impl Migration for AddDrafts {
//!     fn start_version(&self) -> SchemaVersion { 9 }
//!     fn end_version(&self) -> SchemaVersion { 10 }
//!     fn name(&self) -> &str { "add_drafts" }
//!     fn migrate(&self, conn: &mut dyn Connection) -> CoreResult<()> {
//!         conn.execute_batch("CREATE TABLE drafts (groupId TEXT NOT NULL, text TEXT)")?;
//!         Ok(())
//!     }
//! }
//!
//! let mut chain = MigrationChain::standard();
//! chain.set_target_version(10);
//! chain.register(Box::new(AddDrafts)).unwrap();
//! assert!(chain.has_path_from(1));
//! ```

use crate::error::{CoreError, CoreResult};
use crate::schema::{
    Migration1To2, Migration2To3, Migration3To4, Migration4To5, Migration5To6, Migration6To7,
    Migration7To8, Migration8To9,
};
use crate::settings::{write_settings, Settings, DB_SETTINGS_NAMESPACE, SCHEMA_VERSION_KEY};
use talkvault_storage::Connection;
use tracing::info;

/// A schema version number.
pub type SchemaVersion = i32;

/// Schema version this code reads and writes.
pub const CODE_SCHEMA_VERSION: SchemaVersion = 9;

/// One step of schema evolution.
pub trait Migration: Send + Sync {
    /// Version the store must be at for this migration to apply.
    fn start_version(&self) -> SchemaVersion;

    /// Version the store is at after this migration.
    fn end_version(&self) -> SchemaVersion;

    /// Returns the name of this migration.
    fn name(&self) -> &str;

    /// Transforms the stored data.
    ///
    /// Runs inside the opening unit of work; an error aborts the open.
    fn migrate(&self, conn: &mut dyn Connection) -> CoreResult<()>;
}

/// Advisory callbacks fired while a store is opened.
pub trait MigrationListener: Send + Sync {
    /// A migration is about to run.
    fn on_database_migration(&self);

    /// Compaction is about to run.
    fn on_database_compaction(&self);
}

/// Information about a registered migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Start version.
    pub start_version: SchemaVersion,
    /// End version.
    pub end_version: SchemaVersion,
    /// Migration name.
    pub name: String,
}

/// An ordered set of migrations leading to a target version.
pub struct MigrationChain {
    target: SchemaVersion,
    /// Sorted by start version; start versions are unique.
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationChain {
    /// Creates an empty chain targeting `target`.
    #[must_use]
    pub fn new(target: SchemaVersion) -> Self {
        Self {
            target,
            migrations: Vec::new(),
        }
    }

    /// The chain shipped with this code, targeting [`CODE_SCHEMA_VERSION`].
    #[must_use]
    pub fn standard() -> Self {
        Self {
            target: CODE_SCHEMA_VERSION,
            migrations: vec![
                Box::new(Migration1To2),
                Box::new(Migration2To3),
                Box::new(Migration3To4),
                Box::new(Migration4To5),
                Box::new(Migration5To6),
                Box::new(Migration6To7),
                Box::new(Migration7To8),
                Box::new(Migration8To9),
            ],
        }
    }

    /// Returns the target version.
    #[must_use]
    pub fn target_version(&self) -> SchemaVersion {
        self.target
    }

    /// Changes the target version.
    pub fn set_target_version(&mut self, target: SchemaVersion) {
        self.target = target;
    }

    /// Registers a migration.
    ///
    /// # Errors
    ///
    /// Returns an error if the migration does not move forward or another
    /// migration already starts at the same version.
    pub fn register(&mut self, migration: Box<dyn Migration>) -> CoreResult<()> {
        let start = migration.start_version();
        if migration.end_version() <= start {
            return Err(CoreError::invalid_operation(format!(
                "migration {} does not move forward",
                migration.name()
            )));
        }
        match self
            .migrations
            .binary_search_by_key(&start, |m| m.start_version())
        {
            Ok(_) => Err(CoreError::invalid_operation(format!(
                "a migration from version {start} is already registered"
            ))),
            Err(pos) => {
                self.migrations.insert(pos, migration);
                Ok(())
            }
        }
    }

    /// Returns the registered migrations in order.
    #[must_use]
    pub fn list(&self) -> Vec<MigrationInfo> {
        self.migrations
            .iter()
            .map(|m| MigrationInfo {
                start_version: m.start_version(),
                end_version: m.end_version(),
                name: m.name().to_string(),
            })
            .collect()
    }

    /// Returns true if the chain leads from `version` to the target.
    #[must_use]
    pub fn has_path_from(&self, version: SchemaVersion) -> bool {
        self.walk(version) == self.target
    }

    fn walk(&self, mut version: SchemaVersion) -> SchemaVersion {
        for m in &self.migrations {
            if m.start_version() == version {
                version = m.end_version();
            }
        }
        version
    }

    /// Brings the store from `stored` to the target version.
    ///
    /// Returns true if any migration was applied.
    ///
    /// # Errors
    ///
    /// - [`CoreError::DataTooNew`] if `stored` is above the target
    /// - [`CoreError::DataTooOld`] if the chain does not reach the target
    /// - any error raised by a migration
    pub(crate) fn apply(
        &self,
        conn: &mut dyn Connection,
        stored: SchemaVersion,
        listener: Option<&dyn MigrationListener>,
    ) -> CoreResult<bool> {
        if stored == self.target {
            return Ok(false);
        }
        if stored > self.target {
            return Err(CoreError::DataTooNew {
                stored,
                target: self.target,
            });
        }

        let mut version = stored;
        for m in &self.migrations {
            if m.start_version() != version {
                continue;
            }
            info!(
                from = m.start_version(),
                to = m.end_version(),
                name = m.name(),
                "migrating schema"
            );
            if let Some(l) = listener {
                l.on_database_migration();
            }
            m.migrate(conn)?;
            store_schema_version(conn, m.end_version())?;
            version = m.end_version();
        }

        if version != self.target {
            return Err(CoreError::DataTooOld {
                stored: version,
                target: self.target,
            });
        }
        Ok(true)
    }
}

impl Default for MigrationChain {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for MigrationChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationChain")
            .field("target", &self.target)
            .field("migrations", &self.list())
            .finish()
    }
}

pub(crate) fn store_schema_version(
    conn: &mut dyn Connection,
    version: SchemaVersion,
) -> CoreResult<()> {
    let mut s = Settings::new();
    s.put_int(SCHEMA_VERSION_KEY, version);
    write_settings(conn, &s, DB_SETTINGS_NAMESPACE)
}
