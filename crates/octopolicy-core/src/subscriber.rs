use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::policy::PolicyId;

/// External party notified when a policy changes.
///
/// Identity is the policy identity plus the webhook URL and subscriber name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    #[serde(flatten)]
    pub policy: PolicyId,
    #[serde(rename = "webhookURL")]
    pub webhook_url: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscriber {
    pub fn new(policy: PolicyId, webhook_url: impl Into<String>, name: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            policy,
            webhook_url: webhook_url.into(),
            name: name.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `other` has the same identity as `self`.
    pub fn same_identity(&self, other: &Subscriber) -> bool {
        self.policy == other.policy
            && self.webhook_url == other.webhook_url
            && self.name == other.name
    }
}
