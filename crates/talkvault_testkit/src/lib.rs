//! # TalkVault Testkit
//!
//! Test utilities for TalkVault.
//!
//! This crate provides:
//! - Stores wired to an in-memory or SQLite backend ([`fixtures`])
//! - Property-based test generators using proptest ([`generators`])
//! - A crash harness for the sealed key files ([`crash`])
//! - Concurrency stress runs for the transaction coordinator ([`stress`])
//!
//! ## Usage
//!
//! ```rust
//! use talkvault_testkit::prelude::*;
//!
//! let store = TestStore::memory();
//! store.open().unwrap();
//! store
//!     .coordinator
//!     .transaction(false, |txn| txn.merge_settings(&Settings::new(), "test"))
//!     .unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use talkvault_core::settings::Settings;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
