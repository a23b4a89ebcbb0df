use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Data refresh scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub enabled: bool,
    /// How often due policies are claimed (in seconds).
    pub poll_interval_secs: u64,
    /// Timeout for one refresh request (in milliseconds).
    pub http_timeout_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 10,
            http_timeout_ms: 10_000,
        }
    }
}

impl RefreshConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// Auto-import scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoImportConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub http_timeout_ms: u64,
}

impl Default for AutoImportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 60,
            http_timeout_ms: 30_000,
        }
    }
}

impl AutoImportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}
