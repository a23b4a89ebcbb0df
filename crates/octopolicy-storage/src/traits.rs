//! The policy store contract implemented by every backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use octopolicy_core::{
    ImportConfig, Policy, PolicyChangeEvent, PolicyFilter, PolicyId, Subscriber,
};
use serde_json::Value;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;

/// How far a claim pushes an item's due time forward.
///
/// A claimant that crashes mid-item makes the item eligible again once this
/// period has elapsed.
pub const CLAIM_POSTPONE: Duration = Duration::from_secs(5 * 60);

/// Error returned by a [`PolicySubscriber`].
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("Subscriber failed: {0}")]
    Execution(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SubscriberError {
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }
}

/// Target of change propagation.
///
/// Every registered subscriber is invoked once per detected policy mutation.
/// Errors are logged by the watch loop and never stop it.
#[async_trait]
pub trait PolicySubscriber: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn policy_data_change(&self, event: &PolicyChangeEvent) -> Result<(), SubscriberError>;
}

/// Persistence contract for policies, subscribers, import configs and the
/// generic key/value storage used by capability functions.
///
/// Implementations must be thread-safe (`Send + Sync`).
#[async_trait]
pub trait PolicyStorage: Send + Sync {
    // ==================== Policies ====================

    /// Returns `StorageError::NotFound` when no policy has this identity.
    async fn get_policy(&self, id: &PolicyId) -> Result<Policy, StorageError>;

    /// Insert or replace the policy with the same identity.
    ///
    /// `last_update` is set to the current time. Emits a change event.
    async fn save_policy(&self, policy: Policy) -> Result<Policy, StorageError>;

    /// Like [`PolicyStorage::save_policy`], but `last_update` is stored as
    /// given. Used for imported bundles.
    async fn import_policy(&self, policy: Policy) -> Result<Policy, StorageError>;

    /// Set the lock flag. Emits a change event.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the policy does not exist.
    async fn set_lock(&self, id: &PolicyId, locked: bool) -> Result<(), StorageError>;

    async fn list_policies(&self, filter: PolicyFilter) -> Result<Vec<Policy>, StorageError>;

    /// Atomically select policies whose next refresh time is in `(never, now]`
    /// and push each one's next refresh time to `now + CLAIM_POSTPONE`.
    ///
    /// Returned policies carry their pre-claim refresh time.
    async fn claim_due_refresh_policies(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<Policy>, StorageError>;

    /// Record the outcome of a refresh attempt.
    ///
    /// `data` replaces the static data when present. `next` of `None` removes
    /// the policy from future claims. Emits a change event when data changed.
    async fn update_after_refresh(
        &self,
        id: &PolicyId,
        data: Option<String>,
        next: Option<OffsetDateTime>,
    ) -> Result<(), StorageError>;

    // ==================== Auto-import ====================

    /// Atomically select import configs due at `now` and advance each one's
    /// `next_import` by its interval.
    async fn claim_due_import_configs(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<ImportConfig>, StorageError>;

    /// Insert or replace the config for the same source URL.
    async fn save_import_config(&self, config: ImportConfig)
    -> Result<ImportConfig, StorageError>;

    async fn list_import_configs(&self) -> Result<Vec<ImportConfig>, StorageError>;

    // ==================== Subscribers ====================

    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` for a duplicate identity.
    async fn add_subscriber(&self, subscriber: Subscriber) -> Result<Subscriber, StorageError>;

    async fn get_subscribers(&self, policy: &PolicyId) -> Result<Vec<Subscriber>, StorageError>;

    // ==================== Key/value storage ====================

    async fn get_data(&self, key: &str) -> Result<Option<Value>, StorageError>;

    async fn set_data(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    async fn delete_data(&self, key: &str) -> Result<(), StorageError>;

    // ==================== Change propagation ====================

    /// Add fan-out targets for [`PolicyStorage::watch_changes`]. Not persisted.
    fn register_subscribers(&self, subscribers: Vec<Arc<dyn PolicySubscriber>>);

    /// Deliver detected policy mutations to the registered subscribers until
    /// `shutdown` is cancelled or the store is closed.
    async fn watch_changes(&self, shutdown: CancellationToken) -> Result<(), StorageError>;

    /// Release backend resources. Pending `watch_changes` calls return.
    async fn close(&self);

    /// Returns the name of this storage backend for logging/debugging.
    fn backend_name(&self) -> &'static str;
}
