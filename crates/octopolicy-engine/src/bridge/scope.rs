use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Per-evaluation state shared with capability functions.
///
/// Carries the caller's cancellation token and memoizes successful capability
/// results keyed by function name and canonical arguments. A scope lives for
/// exactly one evaluation; nothing is remembered across evaluations.
#[derive(Debug, Clone, Default)]
pub struct EvalScope {
    token: CancellationToken,
    memo: Arc<Mutex<HashMap<String, Value>>>,
}

impl EvalScope {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            memo: Arc::default(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `serde_json` maps are ordered, so equal arguments give equal keys.
    pub(crate) fn memo_key(name: &str, args: &[Value]) -> String {
        let args = serde_json::to_string(args).unwrap_or_default();
        format!("{name}:{args}")
    }

    pub(crate) fn recall(&self, key: &str) -> Option<Value> {
        self.memo.lock().get(key).cloned()
    }

    pub(crate) fn remember(&self, key: String, value: Value) {
        self.memo.lock().insert(key, value);
    }

    pub fn memoized_calls(&self) -> usize {
        self.memo.lock().len()
    }
}
