//! Export and import of signed policy bundles.

use std::sync::Arc;

use octopolicy_clients::Signer;
use octopolicy_core::{Policy, PolicyId};
use octopolicy_storage::DynStorage;
use tracing::{info, warn};

use crate::archive::{BundleMetadata, PolicyBundle, UnpackLimits, pack_signed, unpack_signed};
use crate::error::BundleError;
use crate::verify::{BundleVerifier, bundle_digest};

/// A signed bundle ready for download.
#[derive(Debug, Clone)]
pub struct ExportedBundle {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ExportedBundle {
    pub const CONTENT_TYPE: &'static str = "application/x-tar";

    pub fn content_length(&self) -> usize {
        self.bytes.len()
    }

    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.file_name)
    }
}

pub struct BundleService {
    storage: DynStorage,
    signer: Arc<dyn Signer>,
    verifier: BundleVerifier,
    limits: UnpackLimits,
}

impl BundleService {
    pub fn new(storage: DynStorage, signer: Arc<dyn Signer>, verifier: BundleVerifier) -> Self {
        Self {
            storage,
            signer,
            verifier,
            limits: UnpackLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: UnpackLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Package `id` and sign it with the key named in its export config.
    pub async fn export(&self, id: &PolicyId) -> Result<ExportedBundle, BundleError> {
        let policy = self.storage.get_policy(id).await?;
        let bundle = PolicyBundle::from_policy(&policy)?;
        let export = policy
            .export_config
            .as_ref()
            .ok_or(BundleError::MissingExportConfig)?;

        let archive = bundle.pack()?;
        let signature = self
            .signer
            .sign(&export.namespace, &export.key, &bundle_digest(&archive))
            .await
            .map_err(BundleError::Signer)?;

        let bytes = pack_signed(&archive, &signature)?;
        info!(policy = %id, size = bytes.len(), "Exported policy bundle");
        Ok(ExportedBundle {
            file_name: format!("{}.tar", id.file_stem()),
            bytes,
        })
    }

    /// Verify a signed bundle and store the policy it carries.
    ///
    /// Only `metadata.json` is inflated before the signature verifies, and
    /// nothing is written unless it does. The stored `last_update` is the
    /// one recorded in the bundle.
    pub async fn import(&self, bytes: &[u8]) -> Result<Policy, BundleError> {
        let (archive, signature) = unpack_signed(bytes)?;
        let metadata = BundleMetadata::peek(&archive, self.limits)?;
        let id = metadata.policy_id();

        if let Err(e) = self
            .verifier
            .verify(&archive, &signature, &metadata.public_key_url)
            .await
        {
            warn!(policy = %id, error = %e, "Rejected policy bundle");
            return Err(e);
        }

        let bundle = PolicyBundle::unpack_with(&archive, self.limits)?;
        let policy = self.storage.import_policy(bundle.into_policy()).await?;
        info!(policy = %id, "Imported policy bundle");
        Ok(policy)
    }
}
