//! Capability bridge: extension functions policies can call mid-evaluation.
//!
//! A [`CapabilityRegistry`] maps stable dotted names (`did.resolve`,
//! `cache.get`, ...) to a [`FunctionDecl`] describing the argument shapes and
//! a [`CapabilityHandler`] performing the outbound call. Arguments are decoded
//! against the declaration before the handler runs, so a wrong shape is an
//! evaluation error and never reaches a collaborator.
//!
//! The registry is a plain value built once at startup and handed to the
//! runtime; tests build their own.

mod functions;
mod scope;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::BridgeError;

pub use functions::Collaborators;
pub use scope::EvalScope;

/// Shape of an argument or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Object,
    Array,
    Any,
}

impl ArgKind {
    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any value",
        }
    }

    fn decode(self, value: Value) -> Option<Arg> {
        match (self, value) {
            (Self::String, Value::String(s)) => Some(Arg::String(s)),
            (Self::Object, Value::Object(o)) => Some(Arg::Object(o)),
            (Self::Array, Value::Array(a)) => Some(Arg::Array(a)),
            (Self::Any, v) => Some(Arg::Any(v)),
            _ => None,
        }
    }
}

/// A decoded argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    String(String),
    Object(Map<String, Value>),
    Array(Vec<Value>),
    Any(Value),
}

impl Arg {
    pub fn into_value(self) -> Value {
        match self {
            Self::String(s) => Value::String(s),
            Self::Object(o) => Value::Object(o),
            Self::Array(a) => Value::Array(a),
            Self::Any(v) => v,
        }
    }
}

/// Decoded arguments of one call.
#[derive(Debug, Clone)]
pub struct Args {
    function: String,
    values: Vec<Arg>,
}

impl Args {
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn str(&self, index: usize) -> Result<&str, BridgeError> {
        match self.values.get(index) {
            Some(Arg::String(s)) => Ok(s),
            _ => Err(self.mismatch(index, ArgKind::String)),
        }
    }

    pub fn array(&self, index: usize) -> Result<&[Value], BridgeError> {
        match self.values.get(index) {
            Some(Arg::Array(a)) => Ok(a),
            _ => Err(self.mismatch(index, ArgKind::Array)),
        }
    }

    /// Argument `index` as JSON, whatever its declared shape.
    pub fn value(&self, index: usize) -> Result<Value, BridgeError> {
        self.values
            .get(index)
            .cloned()
            .map(Arg::into_value)
            .ok_or_else(|| self.mismatch(index, ArgKind::Any))
    }

    fn mismatch(&self, index: usize, expected: ArgKind) -> BridgeError {
        BridgeError::invalid_argument(
            &self.function,
            format!("argument {} must be {}", index + 1, expected.name()),
        )
    }
}

/// Name and signature of a capability function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<ArgKind>,
    pub returns: ArgKind,
}

impl FunctionDecl {
    pub fn new(name: impl Into<String>, params: &[ArgKind], returns: ArgKind) -> Self {
        Self {
            name: name.into(),
            params: params.to_vec(),
            returns,
        }
    }

    /// Check arity and shapes, then decode.
    pub fn decode(&self, raw: Vec<Value>) -> Result<Args, BridgeError> {
        if raw.len() != self.params.len() {
            return Err(BridgeError::invalid_argument(
                &self.name,
                format!(
                    "expected {} argument(s), got {}",
                    self.params.len(),
                    raw.len()
                ),
            ));
        }

        let mut values = Vec::with_capacity(raw.len());
        for (index, (kind, value)) in self.params.iter().zip(raw).enumerate() {
            match kind.decode(value) {
                Some(arg) => values.push(arg),
                None => {
                    return Err(BridgeError::invalid_argument(
                        &self.name,
                        format!("argument {} must be {}", index + 1, kind.name()),
                    ));
                }
            }
        }

        Ok(Args {
            function: self.name.clone(),
            values,
        })
    }
}

/// Performs the outbound call behind a capability.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn call(&self, args: Args) -> Result<Value, BridgeError>;
}

/// Adapter turning an async closure into a [`CapabilityHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CapabilityHandler for FnHandler<F>
where
    F: Fn(Args) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BridgeError>> + Send,
{
    async fn call(&self, args: Args) -> Result<Value, BridgeError> {
        (self.0)(args).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CapabilityHandler>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BridgeError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone)]
pub struct Capability {
    pub decl: FunctionDecl,
    pub handler: Arc<dyn CapabilityHandler>,
}

impl Capability {
    pub fn new(decl: FunctionDecl, handler: Arc<dyn CapabilityHandler>) -> Self {
        Self { decl, handler }
    }
}

/// Registry of capability functions available to policies.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    functions: BTreeMap<String, Capability>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every standard function wired to `collaborators`.
    pub fn standard(collaborators: Collaborators) -> Self {
        let mut registry = Self::new();
        functions::register_all(&mut registry, collaborators);
        registry
    }

    /// Add or replace a function.
    pub fn register(&mut self, capability: Capability) -> &mut Self {
        self.functions
            .insert(capability.decl.name.clone(), capability);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.functions.get(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Decode `raw` and run the handler, at most once per distinct call in
    /// `scope`.
    pub async fn invoke(
        &self,
        name: &str,
        raw: Vec<Value>,
        scope: &EvalScope,
    ) -> Result<Value, BridgeError> {
        let capability = self
            .get(name)
            .ok_or_else(|| BridgeError::UnknownFunction(name.to_string()))?;

        let key = EvalScope::memo_key(name, &raw);
        if let Some(value) = scope.recall(&key) {
            debug!(function = %name, "Capability result served from evaluation memo");
            return Ok(value);
        }

        let args = capability.decl.decode(raw)?;
        if scope.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let value = tokio::select! {
            biased;
            _ = scope.token().cancelled() => return Err(BridgeError::Cancelled),
            result = capability.handler.call(args) => result?,
        };

        scope.remember(key, value.clone());
        Ok(value)
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn echo_registry(calls: Arc<AtomicUsize>) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register(Capability::new(
            FunctionDecl::new("test.echo", &[ArgKind::String, ArgKind::Object], ArgKind::Object),
            handler_fn(move |args: Args| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"id": args.str(0)?, "body": args.value(1)?}))
                }
            }),
        ));
        registry
    }

    #[tokio::test]
    async fn test_invoke_decodes_and_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = echo_registry(calls.clone());
        let scope = EvalScope::default();

        let out = registry
            .invoke("test.echo", vec![json!("a"), json!({"x": 1})], &scope)
            .await
            .unwrap();
        assert_eq!(out, json!({"id": "a", "body": {"x": 1}}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_shape_never_calls_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = echo_registry(calls.clone());
        let scope = EvalScope::default();

        let err = registry
            .invoke("test.echo", vec![json!(1), json!({})], &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
        assert!(err.to_string().contains("argument 1 must be string"));

        let err = registry
            .invoke("test.echo", vec![json!("a")], &scope)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected 2 argument(s), got 1"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let registry = CapabilityRegistry::new();
        let err = registry
            .invoke("nope.nothing", vec![], &EvalScope::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownFunction(name) if name == "nope.nothing"));
    }

    #[tokio::test]
    async fn test_memoized_within_scope_only() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = echo_registry(calls.clone());
        let args = || vec![json!("a"), json!({"x": 1})];

        let scope = EvalScope::default();
        registry.invoke("test.echo", args(), &scope).await.unwrap();
        registry.invoke("test.echo", args(), &scope).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let next = EvalScope::default();
        registry.invoke("test.echo", args(), &next).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_scope_skips_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = echo_registry(calls.clone());
        let token = CancellationToken::new();
        token.cancel();

        let err = registry
            .invoke("test.echo", vec![json!("a"), json!({})], &EvalScope::new(token))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_slow_call() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Capability::new(
            FunctionDecl::new("test.slow", &[], ArgKind::Any),
            handler_fn(|_| async {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Ok(Value::Null)
            }),
        ));
        let token = CancellationToken::new();
        let scope = EvalScope::new(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = registry.invoke("test.slow", vec![], &scope).await.unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
        canceller.await.unwrap();
    }
}
