//! # octopolicy-storage
//!
//! Storage abstraction layer for OctoPolicy.
//!
//! This crate defines the [`PolicyStorage`] contract every backend implements,
//! the [`PolicySubscriber`] change-propagation target and the
//! [`ChangeDispatcher`] that backends use to fan events out. It does not
//! contain any backend implementations.
//!
//! ## Example
//!
//! ```ignore
//! use octopolicy_storage::{PolicyStorage, StorageError};
//!
//! async fn lock(storage: &dyn PolicyStorage, id: &PolicyId) -> Result<(), StorageError> {
//!     let policy = storage.get_policy(id).await?;
//!     if !policy.locked {
//!         storage.set_lock(id, true).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod dispatch;
mod error;
mod traits;

pub use dispatch::ChangeDispatcher;
pub use error::StorageError;
pub use traits::{CLAIM_POSTPONE, PolicyStorage, PolicySubscriber, SubscriberError};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shared storage trait object.
pub type DynStorage = std::sync::Arc<dyn PolicyStorage>;
