//! Policy change events carried from the store to subscribers and outbound
//! notification transports.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::policy::PolicyId;

/// What kind of mutation produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Policy was inserted or updated (sync, bundle import)
    Updated,
    /// Lock state changed
    Lock,
    /// Static data was replaced by a refresh
    Data,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Updated => "updated",
            ChangeKind::Lock => "lock",
            ChangeKind::Data => "data",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event describing a mutation of one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyChangeEvent {
    #[serde(flatten)]
    pub policy: PolicyId,
    pub kind: ChangeKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl PolicyChangeEvent {
    pub fn new(policy: PolicyId, kind: ChangeKind) -> Self {
        Self {
            policy,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn updated(policy: PolicyId) -> Self {
        Self::new(policy, ChangeKind::Updated)
    }

    pub fn lock(policy: PolicyId) -> Self {
        Self::new(policy, ChangeKind::Lock)
    }

    pub fn data(policy: PolicyId) -> Self {
        Self::new(policy, ChangeKind::Data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_flat() {
        let event = PolicyChangeEvent::lock(PolicyId::new("r", "g", "n", "1"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["repository"], "r");
        assert_eq!(json["version"], "1");
        assert_eq!(json["kind"], "lock");
        assert!(json["timestamp"].is_string());
    }
}
