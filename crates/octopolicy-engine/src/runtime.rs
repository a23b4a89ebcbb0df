//! Contract between the evaluation pipeline and an embedded policy runtime.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::bridge::EvalScope;
use crate::error::RuntimeError;

/// One result row: binding name to value.
pub type Bindings = Map<String, Value>;

/// A query over a compiled module.
///
/// `expression` is evaluated with `module` (the compiled policy) and `input`
/// in scope, and its value is bound to `binding` in each result row. `data`
/// is the policy's static data document, visible to the module as `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub binding: String,
    pub expression: String,
    pub data: Value,
}

impl Query {
    /// Binding name the pipeline reads the decision from.
    pub const RESULT: &'static str = "result";

    pub fn new(binding: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            binding: binding.into(),
            expression: expression.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// `result = module(input)`.
    pub fn policy_result() -> Self {
        Self::new(Self::RESULT, "module(input)")
    }
}

/// Compiles policy sources into reusable prepared queries.
#[async_trait]
pub trait PolicyRuntime: Send + Sync {
    async fn compile(
        &self,
        module_name: &str,
        source: &str,
        query: &Query,
    ) -> Result<Arc<dyn PreparedQuery>, RuntimeError>;
}

/// A compiled query, reusable across evaluations until invalidated.
#[async_trait]
pub trait PreparedQuery: Send + Sync {
    /// Evaluate against `input`. An empty vector means the query produced no
    /// rows.
    async fn evaluate(&self, input: Value, scope: EvalScope)
    -> Result<Vec<Bindings>, RuntimeError>;
}
