//! # TalkVault Core
//!
//! Encrypted transactional store for the TalkVault messenger.
//!
//! This crate provides:
//! - Password protection of the store's master key ([`crypto`])
//! - Crash-safe custody of the sealed key and account management ([`account`])
//! - Connection pooling, schema creation, migration and compaction ([`Database`])
//! - Reader/writer transactions with deferred events and tasks ([`transaction`])
//! - Ordered startup and shutdown of the services built on the store ([`lifecycle`])
//!
//! ## Layering
//!
//! ```text
//! LifecycleManager
//!   └─ TransactionCoordinator ── EventBus, Executor
//!        └─ Database ── MigrationChain, Clock
//!             └─ ConnectionPool
//!                  └─ talkvault_storage::Backend
//! AccountManager ── KeyFiles, KeyProtector
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use talkvault_core::clock::SystemClock;
//! use talkvault_core::crypto::SecretKey;
//! use talkvault_core::event::EventBus;
//! use talkvault_core::executor::SerialExecutor;
//! use talkvault_core::lifecycle::{LifecycleManager, StartResult};
//! use talkvault_core::{Database, TransactionCoordinator};
//! use talkvault_storage::InMemoryBackend;
//!
//! let db = Arc::new(Database::new(Arc::new(InMemoryBackend::new()), Arc::new(SystemClock)));
//! let bus = Arc::new(EventBus::new(Arc::new(SerialExecutor::new("events").unwrap())));
//! let tasks = Arc::new(SerialExecutor::new("db-tasks").unwrap());
//! let coordinator = Arc::new(TransactionCoordinator::new(db, bus, tasks.clone()));
//!
//! let lifecycle = LifecycleManager::new(coordinator);
//! lifecycle.register_for_shutdown(tasks);
//! assert_eq!(lifecycle.start_services(&SecretKey::generate()), StartResult::Success);
//! lifecycle.stop_services();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod account;
pub mod clock;
pub mod config;
pub mod crypto;
mod database;
mod error;
pub mod event;
pub mod executor;
pub mod identity;
pub mod lifecycle;
pub mod migration;
mod pool;
pub mod schema;
pub mod settings;
pub mod transaction;

pub use account::AccountManager;
pub use config::Config;
pub use database::Database;
pub use error::{CoreError, CoreResult, DecryptionError};
pub use pool::ConnectionPool;
pub use transaction::{Transaction, TransactionCoordinator};
