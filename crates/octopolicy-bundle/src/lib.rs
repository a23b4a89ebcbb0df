//! # octopolicy-bundle
//!
//! Signed, portable policy bundles.
//!
//! Export packs a policy into a gzip tar, has the signer sign the SHA-256
//! digest of those bytes and wraps archive plus signature into a plain tar.
//! Import reverses this, fetching the verification key from the
//! `publicKeyURL` in the bundle metadata, and stores the policy only when
//! the signature verifies. EC (P-256, P-384), OKP (Ed25519) and RSA (PSS)
//! keys are supported.

pub mod archive;
pub mod error;
pub mod jwk;
pub mod jwks;
pub mod service;
pub mod verify;

pub use archive::{BundleMetadata, PolicyBundle, UnpackLimits, pack_signed, unpack_signed};
pub use error::{BundleError, JwksError};
pub use jwk::{Jwk, JwkSet, PublicKey};
pub use jwks::{JwksCache, JwksCacheConfig};
pub use service::{BundleService, ExportedBundle};
pub use verify::{BundleVerifier, bundle_digest};
