//! Shared HTTP plumbing for collaborator clients.

use std::time::Duration;

use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ClientError;

/// Base URL and timeout for one collaborating service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl ServiceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// A reqwest client bound to one service base URL.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    http: Client,
    base_url: Url,
}

impl ServiceClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, ClientError> {
        let mut raw = config.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw)
            .map_err(|e| ClientError::InvalidConfig(format!("invalid base url {raw}: {e}")))?;
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;
        Ok(Self { http, base_url })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Resolve `path` (without a leading slash) against the base URL.
    pub fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::InvalidConfig(format!("invalid path {path}: {e}")))
    }
}

/// Map a non-success response to [`ClientError`].
pub async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ClientError::status(status.as_u16(), message))
}

/// Check the response and decode its JSON body.
pub async fn json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let response = check(response).await?;
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join_keeps_base_path() {
        let client = ServiceClient::new(&ServiceConfig::new("http://cache:8080/api")).unwrap();
        assert_eq!(
            client.url("/v1/cache").unwrap().as_str(),
            "http://cache:8080/api/v1/cache"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            ServiceClient::new(&ServiceConfig::new("not a url")),
            Err(ClientError::InvalidConfig(_))
        ));
    }
}
