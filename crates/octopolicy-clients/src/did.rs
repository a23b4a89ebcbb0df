use async_trait::async_trait;
use serde_json::Value;

use crate::error::ClientError;
use crate::http::{ServiceClient, ServiceConfig, json};

/// Resolves decentralized identifiers to their DID documents.
#[async_trait]
pub trait DidResolver: Send + Sync {
    async fn resolve(&self, did: &str) -> Result<Value, ClientError>;
}

/// Universal-resolver style client: `GET {base}/1.0/identifiers/{did}`.
#[derive(Debug, Clone)]
pub struct DidResolverClient {
    service: ServiceClient,
}

impl DidResolverClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, ClientError> {
        Ok(Self {
            service: ServiceClient::new(config)?,
        })
    }
}

#[async_trait]
impl DidResolver for DidResolverClient {
    async fn resolve(&self, did: &str) -> Result<Value, ClientError> {
        if did.is_empty() {
            return Err(ClientError::InvalidConfig("did must not be empty".into()));
        }
        let url = self.service.url(&format!("1.0/identifiers/{did}"))?;
        let response = self
            .service
            .http()
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await?;
        json(response).await
    }
}
