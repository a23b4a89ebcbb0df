use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Periodic bundle auto-import registration, identified by its source URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportConfig {
    #[serde(rename = "policyURL")]
    pub source_url: String,
    #[serde(with = "crate::duration")]
    pub interval: Duration,
    #[serde(with = "time::serde::rfc3339")]
    pub next_import: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ImportConfig {
    /// New config whose first import is due immediately.
    pub fn new(source_url: impl Into<String>, interval: Duration) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            source_url: source_url.into(),
            interval,
            next_import: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn import_due(&self, now: OffsetDateTime) -> bool {
        self.next_import <= now
    }
}
