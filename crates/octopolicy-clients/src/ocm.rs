//! Proof exchange (organizational credential manager) client.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ClientError;
use crate::http::{ServiceClient, ServiceConfig, json};

#[async_trait]
pub trait ProofExchange: Send + Sync {
    /// Start a login proof request for the given credential types.
    async fn get_login_proof_invitation(
        &self,
        credential_types: &[String],
    ) -> Result<Value, ClientError>;

    /// Fetch the presentation submitted for a proof request.
    async fn get_login_proof_result(&self, id: &str) -> Result<Value, ClientError>;
}

#[derive(Debug, Clone)]
pub struct OcmClient {
    service: ServiceClient,
}

impl OcmClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, ClientError> {
        Ok(Self {
            service: ServiceClient::new(config)?,
        })
    }
}

#[async_trait]
impl ProofExchange for OcmClient {
    async fn get_login_proof_invitation(
        &self,
        credential_types: &[String],
    ) -> Result<Value, ClientError> {
        if credential_types.is_empty() {
            return Err(ClientError::InvalidConfig(
                "at least one credential type is required".into(),
            ));
        }
        let mut url = self.service.url("v1/login/proof/invitation")?;
        {
            let mut query = url.query_pairs_mut();
            for ty in credential_types {
                query.append_pair("type", ty);
            }
        }
        json(self.service.http().get(url).send().await?).await
    }

    async fn get_login_proof_result(&self, id: &str) -> Result<Value, ClientError> {
        let url = self.service.url(&format!("v1/login/proof/result/{id}"))?;
        json(self.service.http().get(url).send().await?).await
    }
}
