//! JSON Web Keys and signature verification over bundle digests.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::Verifier;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use rsa::{BigUint, Pss, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::BundleError;

/// A public JWK (RFC 7517). Only the members needed for verification are
/// kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// Public key decoded from a [`Jwk`].
#[derive(Debug, Clone)]
pub enum PublicKey {
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
    Ed25519(ed25519_dalek::VerifyingKey),
    Rsa(RsaPublicKey),
}

impl Jwk {
    pub fn public_key(&self) -> Result<PublicKey, BundleError> {
        match self.kty.as_str() {
            "EC" => self.ec_key(),
            "OKP" => self.okp_key(),
            "RSA" => self.rsa_key(),
            other => Err(BundleError::UnsupportedKeyType(other.to_string())),
        }
    }

    fn ec_key(&self) -> Result<PublicKey, BundleError> {
        let x = member(&self.x, "x")?;
        let y = member(&self.y, "y")?;
        match self.crv.as_deref() {
            Some("P-256") => {
                let point = p256::EncodedPoint::from_affine_coordinates(
                    coordinate::<32>(&x, "x")?.as_slice().into(),
                    coordinate::<32>(&y, "y")?.as_slice().into(),
                    false,
                );
                p256::ecdsa::VerifyingKey::from_encoded_point(&point)
                    .map(PublicKey::P256)
                    .map_err(|e| BundleError::InvalidKey(e.to_string()))
            }
            Some("P-384") => {
                let point = p384::EncodedPoint::from_affine_coordinates(
                    coordinate::<48>(&x, "x")?.as_slice().into(),
                    coordinate::<48>(&y, "y")?.as_slice().into(),
                    false,
                );
                p384::ecdsa::VerifyingKey::from_encoded_point(&point)
                    .map(PublicKey::P384)
                    .map_err(|e| BundleError::InvalidKey(e.to_string()))
            }
            other => Err(BundleError::UnsupportedKeyType(format!(
                "EC curve {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    fn okp_key(&self) -> Result<PublicKey, BundleError> {
        if self.crv.as_deref() != Some("Ed25519") {
            return Err(BundleError::UnsupportedKeyType(format!(
                "OKP curve {}",
                self.crv.as_deref().unwrap_or("<none>")
            )));
        }
        let x = member(&self.x, "x")?;
        let bytes = coordinate::<32>(&x, "x")?;
        ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map(PublicKey::Ed25519)
            .map_err(|e| BundleError::InvalidKey(e.to_string()))
    }

    fn rsa_key(&self) -> Result<PublicKey, BundleError> {
        let n = member(&self.n, "n")?;
        let e = member(&self.e, "e")?;
        RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
            .map(PublicKey::Rsa)
            .map_err(|e| BundleError::InvalidKey(e.to_string()))
    }
}

impl PublicKey {
    /// Verify `signature` over the SHA-256 `digest` of the signed bytes.
    ///
    /// EC keys take a DER signature over the digest as prehash, RSA keys a
    /// PSS signature over the digest, and Ed25519 keys a signature over the
    /// digest bytes as the message.
    pub fn verify_digest(&self, digest: &[u8], signature: &[u8]) -> Result<(), BundleError> {
        let failed = |e: &dyn std::fmt::Display| BundleError::verification(e.to_string());
        match self {
            Self::P256(key) => {
                let signature =
                    p256::ecdsa::Signature::from_der(signature).map_err(|e| failed(&e))?;
                key.verify_prehash(digest, &signature).map_err(|e| failed(&e))
            }
            Self::P384(key) => {
                let signature =
                    p384::ecdsa::Signature::from_der(signature).map_err(|e| failed(&e))?;
                key.verify_prehash(digest, &signature).map_err(|e| failed(&e))
            }
            Self::Ed25519(key) => {
                let signature =
                    ed25519_dalek::Signature::from_slice(signature).map_err(|e| failed(&e))?;
                key.verify(digest, &signature).map_err(|e| failed(&e))
            }
            Self::Rsa(key) => key
                .verify(Pss::new::<Sha256>(), digest, signature)
                .map_err(|e| failed(&e)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::P256(_) => "EC P-256",
            Self::P384(_) => "EC P-384",
            Self::Ed25519(_) => "OKP Ed25519",
            Self::Rsa(_) => "RSA",
        }
    }
}

fn member(value: &Option<String>, name: &str) -> Result<Vec<u8>, BundleError> {
    let encoded = value
        .as_deref()
        .ok_or_else(|| BundleError::InvalidKey(format!("missing member {name}")))?;
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| BundleError::InvalidKey(format!("member {name} is not base64url: {e}")))
}

fn coordinate<const N: usize>(bytes: &[u8], name: &str) -> Result<[u8; N], BundleError> {
    <[u8; N]>::try_from(bytes).map_err(|_| {
        BundleError::InvalidKey(format!(
            "member {name} must be {N} bytes, got {}",
            bytes.len()
        ))
    })
}
