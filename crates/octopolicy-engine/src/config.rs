//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Top-level engine settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub quickjs: QuickJsConfig,
    pub result_cache: ResultCacheConfig,
}

/// QuickJS resource limits.
///
/// Every prepared query owns one runtime, so the memory limit applies per
/// compiled policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuickJsConfig {
    /// Memory limit in megabytes.
    pub memory_limit_mb: usize,

    /// Stack size limit in kilobytes.
    pub max_stack_size_kb: usize,

    /// Evaluation timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for QuickJsConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 16,
            max_stack_size_kb: 256,
            timeout_ms: 1_000,
        }
    }
}

impl QuickJsConfig {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_memory_limit_mb(mut self, memory_limit_mb: usize) -> Self {
        self.memory_limit_mb = memory_limit_mb;
        self
    }
}

/// Where evaluation results are pushed in the external result cache.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResultCacheConfig {
    pub namespace: String,
    pub scope: String,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            namespace: "Login".to_string(),
            scope: "administration".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({"quickjs": {"timeout_ms": 50}})).unwrap();
        assert_eq!(config.quickjs.timeout_ms, 50);
        assert_eq!(config.quickjs.memory_limit_mb, 16);
        assert_eq!(config.result_cache.namespace, "Login");
    }
}
