//! In-memory reference store.
//!
//! - [`MemoryStore`]: committed tables behind an atomically swapped snapshot
//! - [`MemorySession`]: per-request staging, applied in one commit
//! - [`MemoryHandler`]: collection handler with generated integer keys,
//!   row-version bumping and optimistic concurrency checks

mod query;
mod session;
mod store;

pub use query::{compare_values, run_query};
pub use session::{MemoryHandler, MemorySession, MemorySessionFactory};
pub use store::{MemoryStore, StagedChange, StoreSnapshot, Table};
