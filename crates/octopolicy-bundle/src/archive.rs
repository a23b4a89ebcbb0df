//! Bundle archive layout.
//!
//! ```text
//! <file>.tar                     plain tar, exactly two entries
//! ├── bundle.tar.gz              inner archive (signed bytes)
//! │   ├── metadata.json          always first
//! │   ├── policy.js
//! │   ├── data.json              only when the policy has static data
//! │   └── data-config.json       only when the policy has a refresh config
//! └── bundle.sig                 detached signature over sha256(bundle.tar.gz)
//! ```
//!
//! Inflating the inner archive is capped by [`UnpackLimits`]. Import reads
//! only `metadata.json` before the signature is checked.

use std::io::{Cursor, Read};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use octopolicy_core::{ExportConfig, Policy, PolicyId};
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder, Entry, Header};
use time::OffsetDateTime;

use crate::error::BundleError;

pub const BUNDLE_FILE: &str = "bundle.tar.gz";
pub const SIGNATURE_FILE: &str = "bundle.sig";
pub const METADATA_FILE: &str = "metadata.json";
pub const POLICY_FILE: &str = "policy.js";
pub const DATA_FILE: &str = "data.json";
pub const DATA_CONFIG_FILE: &str = "data-config.json";

/// `metadata.json` contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub repository: String,
    pub group: String,
    pub name: String,
    pub version: String,
    pub locked: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    #[serde(rename = "publicKeyURL")]
    pub public_key_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_config: Option<ExportConfig>,
}

impl BundleMetadata {
    pub fn policy_id(&self) -> PolicyId {
        PolicyId::new(&self.repository, &self.group, &self.name, &self.version)
    }

    /// Read only the leading `metadata.json` of an inner archive.
    pub fn peek(bytes: &[u8], limits: UnpackLimits) -> Result<Self, BundleError> {
        let mut archive = Archive::new(GzDecoder::new(bytes));
        let entry = archive
            .entries()?
            .next()
            .ok_or_else(|| BundleError::format("bundle is empty"))??;
        let path = entry.path()?.to_string_lossy().into_owned();
        let content = read_entry(entry, &path, limits.max_entry_size)?;
        Self::parse(&path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, BundleError> {
        if path != METADATA_FILE {
            return Err(BundleError::format(format!(
                "first entry must be {METADATA_FILE}, found {path}"
            )));
        }
        let metadata: Self = serde_json::from_str(content)?;
        if metadata.public_key_url.trim().is_empty() {
            return Err(BundleError::format("metadata has no publicKeyURL"));
        }
        Ok(metadata)
    }
}

/// Caps on inflated entry sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnpackLimits {
    pub max_entry_size: u64,
    pub max_total_size: u64,
}

impl Default for UnpackLimits {
    fn default() -> Self {
        Self {
            max_entry_size: 8 * 1024 * 1024,
            max_total_size: 16 * 1024 * 1024,
        }
    }
}

/// Unpacked contents of the inner archive.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyBundle {
    pub metadata: BundleMetadata,
    pub source: String,
    pub data: Option<String>,
    pub data_config: Option<String>,
}

impl PolicyBundle {
    /// # Errors
    ///
    /// Returns `BundleError::MissingExportConfig` when the policy cannot be
    /// exported.
    pub fn from_policy(policy: &Policy) -> Result<Self, BundleError> {
        let export = policy
            .export_config
            .as_ref()
            .ok_or(BundleError::MissingExportConfig)?;
        Ok(Self {
            metadata: BundleMetadata {
                repository: policy.id.repository.clone(),
                group: policy.id.group.clone(),
                name: policy.id.name.clone(),
                version: policy.id.version.clone(),
                locked: policy.locked,
                last_update: policy.last_update,
                public_key_url: export.public_key_url.clone(),
                output_schema: policy.output_schema.clone(),
                export_config: Some(export.clone()),
            },
            source: policy.source.clone(),
            data: non_empty(policy.data.as_deref()),
            data_config: non_empty(policy.data_config.as_deref()),
        })
    }

    /// Policy record to store on import.
    ///
    /// A data config carried by the bundle schedules an immediate refresh.
    pub fn into_policy(self) -> Policy {
        let mut policy = Policy::new(self.metadata.policy_id(), self.source).locked(self.metadata.locked);
        policy.last_update = self.metadata.last_update;
        policy.output_schema = self.metadata.output_schema;
        policy.export_config = self.metadata.export_config;
        policy.data = self.data;
        if let Some(config) = self.data_config {
            policy.next_data_refresh_time = Some(OffsetDateTime::now_utc());
            policy.data_config = Some(config);
        }
        policy
    }

    /// Build the gzip-compressed inner archive.
    pub fn pack(&self) -> Result<Vec<u8>, BundleError> {
        let metadata = serde_json::to_vec_pretty(&self.metadata)?;
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = Builder::new(encoder);

        append(&mut builder, METADATA_FILE, &metadata)?;
        append(&mut builder, POLICY_FILE, self.source.as_bytes())?;
        if let Some(data) = &self.data {
            append(&mut builder, DATA_FILE, data.as_bytes())?;
        }
        if let Some(config) = &self.data_config {
            append(&mut builder, DATA_CONFIG_FILE, config.as_bytes())?;
        }

        let encoder = builder.into_inner()?;
        Ok(encoder.finish()?)
    }

    /// Parse the inner archive with default limits.
    pub fn unpack(bytes: &[u8]) -> Result<Self, BundleError> {
        Self::unpack_with(bytes, UnpackLimits::default())
    }

    /// Parse the inner archive. `metadata.json` must be the first entry.
    ///
    /// # Errors
    ///
    /// Returns `BundleError::Format` when an entry or the sum of entries
    /// inflates past `limits`.
    pub fn unpack_with(bytes: &[u8], limits: UnpackLimits) -> Result<Self, BundleError> {
        let mut archive = Archive::new(GzDecoder::new(bytes));
        let mut metadata: Option<BundleMetadata> = None;
        let mut source: Option<String> = None;
        let mut data = None;
        let mut data_config = None;
        let mut total = 0u64;

        for (index, entry) in archive.entries()?.enumerate() {
            let entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            let remaining = limits.max_total_size.saturating_sub(total);
            if entry.size() > remaining {
                return Err(BundleError::format(format!(
                    "bundle exceeds {} bytes unpacked",
                    limits.max_total_size
                )));
            }
            let content = read_entry(entry, &path, limits.max_entry_size.min(remaining))?;
            total += content.len() as u64;

            if index == 0 {
                metadata = Some(BundleMetadata::parse(&path, &content)?);
                continue;
            }

            match path.as_str() {
                POLICY_FILE => source = Some(content),
                DATA_FILE => data = Some(content),
                DATA_CONFIG_FILE => data_config = Some(content),
                other => {
                    return Err(BundleError::format(format!("unexpected entry {other}")));
                }
            }
        }

        let metadata = metadata.ok_or_else(|| BundleError::format("bundle is empty"))?;
        let source = source.ok_or_else(|| BundleError::format(format!("missing {POLICY_FILE}")))?;
        Ok(Self {
            metadata,
            source,
            data,
            data_config,
        })
    }
}

/// Read one entry as UTF-8, inflating at most `limit` bytes.
fn read_entry<'a, R: Read + 'a>(
    entry: Entry<'a, R>,
    path: &str,
    limit: u64,
) -> Result<String, BundleError> {
    let too_large = || BundleError::format(format!("{path} exceeds {limit} bytes"));
    if entry.size() > limit {
        return Err(too_large());
    }
    let mut content = Vec::new();
    entry.take(limit + 1).read_to_end(&mut content)?;
    if content.len() as u64 > limit {
        return Err(too_large());
    }
    String::from_utf8(content).map_err(|_| BundleError::format(format!("{path} is not UTF-8")))
}

/// Build the outer container from the inner archive and its signature.
pub fn pack_signed(bundle: &[u8], signature: &[u8]) -> Result<Vec<u8>, BundleError> {
    let mut builder = Builder::new(Vec::new());
    append(&mut builder, BUNDLE_FILE, bundle)?;
    append(&mut builder, SIGNATURE_FILE, signature)?;
    Ok(builder.into_inner()?)
}

/// Split the outer container into the inner archive and its signature.
///
/// Exactly two entries are accepted, named and ordered as written by
/// [`pack_signed`].
pub fn unpack_signed(bytes: &[u8]) -> Result<(Vec<u8>, Vec<u8>), BundleError> {
    let mut archive = Archive::new(Cursor::new(bytes));
    let mut parts: Vec<Vec<u8>> = Vec::with_capacity(2);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let expected = match parts.len() {
            0 => BUNDLE_FILE,
            1 => SIGNATURE_FILE,
            _ => {
                return Err(BundleError::format(
                    "bundle container must hold exactly two entries",
                ));
            }
        };
        if path != expected {
            return Err(BundleError::format(format!(
                "expected entry {expected}, found {path}"
            )));
        }
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        parts.push(content);
    }

    match <[Vec<u8>; 2]>::try_from(parts) {
        Ok([bundle, signature]) => Ok((bundle, signature)),
        Err(parts) => Err(BundleError::format(format!(
            "bundle container must hold exactly two entries, found {}",
            parts.len()
        ))),
    }
}

fn append<W: std::io::Write>(
    builder: &mut Builder<W>,
    name: &str,
    content: &[u8],
) -> Result<(), BundleError> {
    let mut header = Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, name, content)?;
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
}
