//! Publishing change events on a Redis channel for other instances.

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime, redis::AsyncCommands};
use octopolicy_core::PolicyChangeEvent;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::NotificationError;
use crate::transport::NotificationTransport;

pub const DEFAULT_CHANNEL: &str = "octopolicy:policy-changes";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub channel: String,
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            pool_size: 4,
        }
    }
}

pub struct RedisPublisher {
    pool: Pool,
    channel: String,
}

impl RedisPublisher {
    /// Builds the pool lazily; no connection is made until the first publish.
    pub fn new(config: &RedisConfig) -> Result<Self, NotificationError> {
        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        if let Some(ref mut pool) = redis_config.pool {
            pool.max_size = config.pool_size;
        }
        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| NotificationError::InvalidConfig(e.to_string()))?;
        Ok(Self::from_pool(pool, config.channel.clone()))
    }

    pub fn from_pool(pool: Pool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl NotificationTransport for RedisPublisher {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn send(&self, event: &PolicyChangeEvent) -> Result<(), NotificationError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| NotificationError::Pool(e.to_string()))?;

        let message = serde_json::to_string(event)?;
        let _: () = conn
            .publish(&self.channel, &message)
            .await
            .map_err(|e| NotificationError::Publish(e.to_string()))?;

        debug!(policy = %event.policy, channel = %self.channel, "Published change event to Redis");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_is_created_without_connecting() {
        let publisher = RedisPublisher::new(&RedisConfig::default()).unwrap();
        assert_eq!(publisher.channel(), DEFAULT_CHANNEL);
        assert_eq!(publisher.name(), "redis");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let config = RedisConfig {
            url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(
            RedisPublisher::new(&config),
            Err(NotificationError::InvalidConfig(_))
        ));
    }
}
