//! Persistence contract for the commons core.
//!
//! Engines hold `Arc<dyn CommonsStorage>` and never touch a backend
//! directly. The in-memory implementation doubles as the test double and
//! the behavioral reference for real backends.

#![deny(unsafe_code)]

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStorage;
pub use traits::{
    AccountStore, CatalogProvider, ClaimStore, CommonsStorage, KarmaStore, LedgerStore, PollStore,
    PreferenceStore, RosterProvider, ValueStore,
};
