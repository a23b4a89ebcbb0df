//! JWK set fetching and caching for bundle verification.
//!
//! Key sets are cached per URL for a fixed TTL. Independently of the TTL, a
//! URL is fetched over the network at most once per `min_refetch_interval`,
//! so a stream of imports pointing at a failing or rotating endpoint cannot
//! turn into a request storm.
//!
//! Fetches run outside the cache lock, so a slow endpoint only holds up
//! callers waiting on the same URL. Response bodies are capped at
//! `max_response_size` bytes.
//!
//! Any URL is accepted. Bundles name their own key URL in `metadata.json`
//! and there is no host allow-list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::JwksError;
use crate::jwk::JwkSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwksCacheConfig {
    /// How long a fetched set is served without refetching.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,

    /// Minimum time between two network fetches of the same URL.
    #[serde(with = "duration_secs")]
    pub min_refetch_interval: Duration,

    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Largest accepted JWKS body in bytes.
    pub max_response_size: usize,
}

impl Default for JwksCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            min_refetch_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            max_response_size: 1024 * 1024,
        }
    }
}

impl JwksCacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_min_refetch_interval(mut self, interval: Duration) -> Self {
        self.min_refetch_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_response_size(mut self, size: usize) -> Self {
        self.max_response_size = size;
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

struct CachedJwks {
    jwks: Option<JwkSet>,
    fetched_at: Option<Instant>,
    last_attempt: Instant,
}

pub struct JwksCache {
    http_client: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, CachedJwks>>>,
    /// One gate per URL; held across that URL's fetch.
    fetches: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    config: JwksCacheConfig,
}

impl JwksCache {
    pub fn new(config: JwksCacheConfig) -> Result<Self, JwksError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| JwksError::Network(e.to_string()))?;
        Ok(Self {
            http_client,
            cache: Arc::new(RwLock::new(HashMap::new())),
            fetches: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Key set published at `url`, from cache when fresh.
    ///
    /// A stale entry is still served while the URL is inside its refetch
    /// interval. A URL whose last fetch failed inside the interval returns
    /// `JwksError::RateLimited`.
    pub async fn get(&self, url: &str) -> Result<JwkSet, JwksError> {
        if let Some(cached) = self.cached(url, self.cache.read().await.get(url)) {
            return cached;
        }

        let gate = self
            .fetches
            .lock()
            .await
            .entry(url.to_string())
            .or_default()
            .clone();
        let _fetching = gate.lock().await;
        // Another caller may have fetched while we waited for the gate.
        if let Some(cached) = self.cached(url, self.cache.read().await.get(url)) {
            return cached;
        }

        let result = self.fetch(url).await;
        let now = Instant::now();
        let mut cache = self.cache.write().await;
        let entry = cache.entry(url.to_string()).or_insert(CachedJwks {
            jwks: None,
            fetched_at: None,
            last_attempt: now,
        });
        entry.last_attempt = now;
        let jwks = result?;
        entry.jwks = Some(jwks.clone());
        entry.fetched_at = Some(now);
        Ok(jwks)
    }

    /// Answer from `entry` without a network fetch, if allowed.
    fn cached(
        &self,
        url: &str,
        entry: Option<&CachedJwks>,
    ) -> Option<Result<JwkSet, JwksError>> {
        let entry = entry?;
        let now = Instant::now();
        if let (Some(jwks), Some(fetched_at)) = (&entry.jwks, entry.fetched_at)
            && now.duration_since(fetched_at) < self.config.ttl
        {
            return Some(Ok(jwks.clone()));
        }
        if now.duration_since(entry.last_attempt) < self.config.min_refetch_interval {
            return Some(match &entry.jwks {
                Some(jwks) => Ok(jwks.clone()),
                None => Err(JwksError::RateLimited(url.to_string())),
            });
        }
        None
    }

    async fn fetch(&self, url: &str) -> Result<JwkSet, JwksError> {
        debug!(url = %url, "Fetching JWKS");
        let response = self
            .http_client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Failed to fetch JWKS");
                JwksError::Network(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(JwksError::Http(response.status().as_u16()));
        }

        let max_size = self.config.max_response_size;
        if let Some(len) = response.content_length()
            && len > max_size as u64
        {
            return Err(JwksError::ResponseTooLarge { max_size });
        }

        let mut response = response;
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| JwksError::Network(e.to_string()))?
        {
            if body.len() + chunk.len() > max_size {
                return Err(JwksError::ResponseTooLarge { max_size });
            }
            body.extend_from_slice(&chunk);
        }

        let jwks: JwkSet = serde_json::from_slice(&body).map_err(|e| {
            warn!(url = %url, error = %e, "Failed to parse JWKS");
            JwksError::Parse(e.to_string())
        })?;
        debug!(url = %url, keys = jwks.keys.len(), "Cached JWKS");
        Ok(jwks)
    }

    /// Drop the cached set for `url`.
    pub async fn invalidate(&self, url: &str) {
        self.cache.write().await.remove(url);
    }
}
