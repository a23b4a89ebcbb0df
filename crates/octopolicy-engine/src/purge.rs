use std::sync::Arc;

use async_trait::async_trait;
use octopolicy_core::PolicyChangeEvent;
use octopolicy_storage::{PolicySubscriber, SubscriberError};
use tracing::debug;

use crate::cache::QueryCache;

/// Change subscriber that drops every prepared query.
///
/// Purging everything keeps the cache coherent without comparing sources
/// across backends.
pub struct QueryCachePurger {
    cache: Arc<QueryCache>,
}

impl QueryCachePurger {
    pub fn new(cache: Arc<QueryCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl PolicySubscriber for QueryCachePurger {
    fn name(&self) -> &str {
        "query-cache-purger"
    }

    async fn policy_data_change(&self, event: &PolicyChangeEvent) -> Result<(), SubscriberError> {
        let purged = self.cache.purge();
        debug!(
            repository = %event.policy.repository,
            group = %event.policy.group,
            name = %event.policy.name,
            version = %event.policy.version,
            purged,
            "Purged prepared query cache"
        );
        Ok(())
    }
}
