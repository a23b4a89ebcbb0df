//! Policy identity and the stored policy record.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Globally unique identity of a policy: `(repository, group, name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId {
    pub repository: String,
    pub group: String,
    pub name: String,
    pub version: String,
}

impl PolicyId {
    pub fn new(
        repository: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            group: group.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// Stable module name handed to the evaluation runtime.
    ///
    /// Characters outside `[A-Za-z0-9_]` are replaced with `_` so the name is
    /// usable as an identifier in every segment.
    pub fn module_name(&self) -> String {
        let segments = [&self.repository, &self.group, &self.name, &self.version];
        let mut out = String::from("policies");
        for segment in segments {
            out.push('.');
            out.extend(segment.chars().map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' {
                    c
                } else {
                    '_'
                }
            }));
        }
        out
    }

    /// File-name friendly form, used for exported bundles.
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.repository, self.group, self.name, self.version
        )
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.repository, self.group, self.name, self.version
        )
    }
}

/// Signing and publication settings for exporting a policy as a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    /// Signer key namespace.
    pub namespace: String,
    /// Signer key name.
    pub key: String,
    /// Where importers fetch the JWK set used to verify the bundle signature.
    #[serde(rename = "publicKeyURL")]
    pub public_key_url: String,
}

/// A stored policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(flatten)]
    pub id: PolicyId,
    /// Policy source text handed to the evaluation runtime.
    pub source: String,
    /// Static data document (raw JSON text).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Data refresh configuration (raw JSON text, see [`crate::DataConfig`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_config: Option<ExportConfig>,
    pub locked: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    /// `None` means no refresh is scheduled.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_data_refresh_time: Option<OffsetDateTime>,
}

impl Policy {
    /// Create an unlocked policy with no data and no scheduled refresh.
    pub fn new(id: PolicyId, source: impl Into<String>) -> Self {
        Self {
            id,
            source: source.into(),
            data: None,
            data_config: None,
            output_schema: None,
            export_config: None,
            locked: false,
            last_update: OffsetDateTime::now_utc(),
            next_data_refresh_time: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_data_config(mut self, config: impl Into<String>) -> Self {
        self.data_config = Some(config.into());
        self
    }

    pub fn with_output_schema(mut self, schema: impl Into<String>) -> Self {
        self.output_schema = Some(schema.into());
        self
    }

    pub fn with_export_config(mut self, config: ExportConfig) -> Self {
        self.export_config = Some(config);
        self
    }

    pub fn with_next_refresh(mut self, at: OffsetDateTime) -> Self {
        self.next_data_refresh_time = Some(at);
        self
    }

    pub fn locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    /// Whether the policy is due for a data refresh at `now`.
    pub fn refresh_due(&self, now: OffsetDateTime) -> bool {
        matches!(self.next_data_refresh_time, Some(at) if at <= now)
    }
}

/// Filter for listing policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFilter {
    /// Only policies with this lock state, or all when `None`.
    pub locked: Option<bool>,
}

impl PolicyFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn locked(locked: bool) -> Self {
        Self {
            locked: Some(locked),
        }
    }

    pub fn matches(&self, policy: &Policy) -> bool {
        self.locked.is_none_or(|l| l == policy.locked)
    }
}
