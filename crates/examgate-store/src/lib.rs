//! examgate-store — Keyed persistence for candidates and accounts.
//!
//! Two collections, both keyed by email: `candidates` and `users`. The
//! SQLite backend is the durable one; [`MemoryStore`] is a drop-in double
//! for tests. Handles are constructed explicitly and closed explicitly;
//! there is no process-wide database handle.

pub mod candidates;
pub mod memory;
pub mod sqlite;
pub mod users;

pub use candidates::{CandidateStore, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use users::{authenticate, Role, UserAccount, UserStore};
