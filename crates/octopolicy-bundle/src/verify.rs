use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::BundleError;
use crate::jwks::JwksCache;

/// SHA-256 digest of the inner archive, the payload handed to the signer.
pub fn bundle_digest(bundle: &[u8]) -> Vec<u8> {
    Sha256::digest(bundle).to_vec()
}

/// Verifies detached bundle signatures against the key set named in the
/// bundle's metadata.
pub struct BundleVerifier {
    jwks: JwksCache,
}

impl BundleVerifier {
    pub fn new(jwks: JwksCache) -> Self {
        Self { jwks }
    }

    /// The key set at `public_key_url` must hold exactly one key.
    pub async fn verify(
        &self,
        bundle: &[u8],
        signature: &[u8],
        public_key_url: &str,
    ) -> Result<(), BundleError> {
        let set = self.jwks.get(public_key_url).await?;
        let [jwk] = set.keys.as_slice() else {
            return Err(BundleError::KeyCount(set.keys.len()));
        };

        let key = jwk.public_key()?;
        key.verify_digest(&bundle_digest(bundle), signature)?;
        debug!(url = %public_key_url, key = key.kind(), "Bundle signature verified");
        Ok(())
    }
}
