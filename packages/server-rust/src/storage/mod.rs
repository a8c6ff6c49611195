//! Storage backends for data services.
//!
//! A backend implements [`SessionFactory`](crate::service::SessionFactory)
//! and hands out per-request sessions. [`memory`] is the reference backend
//! used by tests and the demo server.

pub mod memory;

pub use memory::{MemorySession, MemorySessionFactory, MemoryStore};
