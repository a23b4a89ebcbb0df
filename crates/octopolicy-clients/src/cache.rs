//! Evaluation result cache.
//!
//! Entries are addressed by `(key, namespace, scope)` and may carry a TTL in
//! seconds. [`CacheClient`] talks to the remote cache service;
//! [`MemoryCache`] is an in-process stand-in for single-node deployments.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ClientError;
use crate::http::{ServiceClient, ServiceConfig, check};

const HEADER_KEY: &str = "x-cache-key";
const HEADER_NAMESPACE: &str = "x-cache-namespace";
const HEADER_SCOPE: &str = "x-cache-scope";
const HEADER_TTL: &str = "x-cache-ttl";

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn set(
        &self,
        key: &str,
        namespace: &str,
        scope: &str,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<(), ClientError>;

    /// Returns `ClientError::NotFound` for a missing or expired entry.
    async fn get(&self, key: &str, namespace: &str, scope: &str) -> Result<Vec<u8>, ClientError>;
}

/// Remote cache service client.
#[derive(Debug, Clone)]
pub struct CacheClient {
    service: ServiceClient,
}

impl CacheClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, ClientError> {
        Ok(Self {
            service: ServiceClient::new(config)?,
        })
    }
}

#[async_trait]
impl ResultCache for CacheClient {
    async fn set(
        &self,
        key: &str,
        namespace: &str,
        scope: &str,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<(), ClientError> {
        let mut request = self
            .service
            .http()
            .post(self.service.url("v1/cache")?)
            .header(HEADER_KEY, key)
            .header(HEADER_NAMESPACE, namespace)
            .header(HEADER_SCOPE, scope)
            .header("Content-Type", "application/json")
            .body(value);
        if let Some(ttl) = ttl_seconds {
            request = request.header(HEADER_TTL, ttl.to_string());
        }
        check(request.send().await?).await?;
        debug!(key = %key, namespace = %namespace, scope = %scope, "Stored cache entry");
        Ok(())
    }

    async fn get(&self, key: &str, namespace: &str, scope: &str) -> Result<Vec<u8>, ClientError> {
        let response = self
            .service
            .http()
            .get(self.service.url("v1/cache")?)
            .header(HEADER_KEY, key)
            .header(HEADER_NAMESPACE, namespace)
            .header(HEADER_SCOPE, scope)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn composite_key(key: &str, namespace: &str, scope: &str) -> String {
    format!("{key},{namespace},{scope}")
}

/// In-process cache with per-entry expiry.
///
/// Expired entries are dropped when read and by [`MemoryCache::run_sweeper`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
}

impl MemoryCache {
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, expires)| expires.is_none_or(|at| at > now));
        before - entries.len()
    }

    /// Purge expired entries every `every` until `shutdown` is cancelled.
    pub async fn run_sweeper(&self, every: Duration, shutdown: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = self.purge_expired();
                    if purged > 0 {
                        debug!(purged, remaining = self.len(), "Swept expired cache entries");
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn set(
        &self,
        key: &str,
        namespace: &str,
        scope: &str,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    ) -> Result<(), ClientError> {
        // A TTL past the clock's range never expires.
        let expires = ttl_seconds
            .and_then(|ttl| Instant::now().checked_add(Duration::from_secs(ttl)));
        self.entries
            .lock()
            .insert(composite_key(key, namespace, scope), (value, expires));
        Ok(())
    }

    async fn get(&self, key: &str, namespace: &str, scope: &str) -> Result<Vec<u8>, ClientError> {
        let composite = composite_key(key, namespace, scope);
        let mut entries = self.entries.lock();
        match entries.get(&composite) {
            Some((_, Some(expires))) if *expires <= Instant::now() => {
                entries.remove(&composite);
                Err(ClientError::NotFound)
            }
            Some((value, _)) => Ok(value.clone()),
            None => Err(ClientError::NotFound),
        }
    }
}
