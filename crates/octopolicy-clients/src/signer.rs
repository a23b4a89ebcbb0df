//! Signer service: detached signatures, public keys and credential proofs.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientError;
use crate::http::{ServiceClient, ServiceConfig, json};

#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign `data` with the key `namespace/key`.
    async fn sign(&self, namespace: &str, key: &str, data: &[u8]) -> Result<Vec<u8>, ClientError>;

    /// Public key as a JWK-bearing verification method document.
    async fn get_key(&self, namespace: &str, key: &str) -> Result<Value, ClientError>;

    /// All public keys of a namespace.
    async fn get_all_keys(&self, namespace: &str) -> Result<Value, ClientError>;

    /// Attach a proof to a credential or presentation.
    async fn create_proof(&self, credential: Value) -> Result<Value, ClientError>;

    /// Verify the proof of a credential or presentation.
    async fn verify_proof(&self, credential: Value) -> Result<Value, ClientError>;
}

#[derive(Serialize)]
struct SignRequest<'a> {
    namespace: &'a str,
    key: &'a str,
    data: String,
}

#[derive(Deserialize)]
struct SignResponse {
    signature: String,
}

#[derive(Debug, Clone)]
pub struct SignerClient {
    service: ServiceClient,
}

impl SignerClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, ClientError> {
        Ok(Self {
            service: ServiceClient::new(config)?,
        })
    }
}

#[async_trait]
impl Signer for SignerClient {
    async fn sign(&self, namespace: &str, key: &str, data: &[u8]) -> Result<Vec<u8>, ClientError> {
        let request = SignRequest {
            namespace,
            key,
            data: STANDARD.encode(data),
        };
        let response = self
            .service
            .http()
            .post(self.service.url("v1/sign")?)
            .json(&request)
            .send()
            .await?;
        let body: SignResponse = json(response).await?;
        STANDARD
            .decode(body.signature.as_bytes())
            .map_err(|e| ClientError::Decode(format!("signature is not base64: {e}")))
    }

    async fn get_key(&self, namespace: &str, key: &str) -> Result<Value, ClientError> {
        let url = self
            .service
            .url(&format!("v1/verification-methods/{namespace}/{key}"))?;
        json(self.service.http().get(url).send().await?).await
    }

    async fn get_all_keys(&self, namespace: &str) -> Result<Value, ClientError> {
        let url = self
            .service
            .url(&format!("v1/verification-methods/{namespace}"))?;
        json(self.service.http().get(url).send().await?).await
    }

    async fn create_proof(&self, credential: Value) -> Result<Value, ClientError> {
        let response = self
            .service
            .http()
            .post(self.service.url("v1/credential/proof")?)
            .json(&credential)
            .send()
            .await?;
        json(response).await
    }

    async fn verify_proof(&self, credential: Value) -> Result<Value, ClientError> {
        let response = self
            .service
            .http()
            .post(self.service.url("v1/credential/verify")?)
            .json(&credential)
            .send()
            .await?;
        json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_sign_encodes_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sign"))
            .and(body_json(serde_json::json!({
                "namespace": "transit",
                "key": "bundles",
                "data": STANDARD.encode(b"digest"),
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"signature": STANDARD.encode(b"sig")})),
            )
            .mount(&server)
            .await;

        let client = SignerClient::new(&ServiceConfig::new(server.uri())).unwrap();
        let sig = client.sign("transit", "bundles", b"digest").await.unwrap();
        assert_eq!(sig, b"sig");
    }

    #[tokio::test]
    async fn test_get_key_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/verification-methods/transit/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = SignerClient::new(&ServiceConfig::new(server.uri())).unwrap();
        assert!(client.get_key("transit", "missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_verify_proof_passes_body_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/credential/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"valid": true})))
            .mount(&server)
            .await;

        let client = SignerClient::new(&ServiceConfig::new(server.uri())).unwrap();
        let result = client
            .verify_proof(serde_json::json!({"proof": {}}))
            .await
            .unwrap();
        assert_eq!(result["valid"], true);
    }
}
