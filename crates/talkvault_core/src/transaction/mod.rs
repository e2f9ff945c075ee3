//! Transactions over the encrypted store.
//!
//! A transaction is one backend unit of work plus the coordinator lock it
//! runs under:
//! - **Isolation**: Writers are exclusive; readers share the lock
//! - **Atomicity**: A transaction that does not commit is rolled back
//! - **Deferred effects**: Events and tasks attached to a transaction run
//!   only after it commits

mod coordinator;
mod state;

pub use coordinator::TransactionCoordinator;
pub use state::{CommitAction, Transaction};
