//! In-memory policy store backend for OctoPolicy.
//!
//! This crate provides an in-process implementation of the `PolicyStorage`
//! trait from `octopolicy-storage`. Each map is guarded by its own
//! reader/writer lock and change events travel through a bounded channel
//! drained by `watch_changes`.
//!
//! # Example
//!
//! ```ignore
//! use octopolicy_db_memory::InMemoryStorage;
//! use octopolicy_storage::PolicyStorage;
//!
//! let storage = InMemoryStorage::new();
//! storage.save_policy(Policy::new(id, "return { allow: true };")).await?;
//! ```

pub mod storage;

pub use octopolicy_storage::{PolicyStorage, StorageError};
pub use storage::{InMemoryStorage, MemoryOptions};

/// Creates a new shared in-memory store.
pub fn create_storage() -> octopolicy_storage::DynStorage {
    std::sync::Arc::new(InMemoryStorage::new())
}
