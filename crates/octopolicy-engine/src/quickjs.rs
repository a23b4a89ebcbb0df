//! Embedded QuickJS policy runtime.
//!
//! A policy source is the body of a JavaScript function of `input` that
//! returns the decision document:
//!
//! ```javascript
//! return { allow: input.msg === "yes" };
//! ```
//!
//! # Architecture
//!
//! ```text
//! compile(module, source, query)    (blocking thread, deadline armed)
//!   ├─ new Runtime (memory/stack limits)
//!   └─ prepare a scratch Context to check the source parses
//!
//! evaluate(input, scope)            (blocking thread)
//!   ├─ lock runtime, set interrupt handler (timeout + cancellation)
//!   ├─ prepare a fresh Context: console, capability stubs, frozen data,
//!   │  __module(input) and __query(module, input)
//!   ├─ expose __capability_call bound to this scope
//!   ├─ run __query(__module, input) and stringify { binding: value }
//!   └─ drop the Context and clear the handler
//! ```
//!
//! Sources and query expressions reach the engine as strings handed to
//! `new Function`, never spliced into script text. Every evaluation gets its
//! own global object, so nothing a policy writes survives into the next call.
//!
//! Capability stubs forward to [`CapabilityRegistry::invoke`] on the Tokio
//! runtime. A failed call throws inside the script, and the original
//! [`BridgeError`] is reported as the evaluation error.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex as SlotMutex;
use rquickjs::{Context, Ctx, Function, Object, Runtime};
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::{CapabilityRegistry, EvalScope};
use crate::config::QuickJsConfig;
use crate::error::{BridgeError, RuntimeError};
use crate::runtime::{Bindings, PolicyRuntime, PreparedQuery, Query};

/// `(names, source, data, expression)`; installs everything a policy sees.
const PRELUDE: &str = r#"
(function (names, source, data, expression) {
    const freeze = function (value) {
        if (value !== null && typeof value === "object" && !Object.isFrozen(value)) {
            Object.freeze(value);
            Object.getOwnPropertyNames(value).forEach(function (key) {
                freeze(value[key]);
            });
        }
        return value;
    };
    const invoke = function (name, args) {
        const reply = JSON.parse(__capability_call(name, JSON.stringify(args)));
        if (Object.prototype.hasOwnProperty.call(reply, "error")) {
            throw new Error(reply.error);
        }
        return reply.ok;
    };
    JSON.parse(names).forEach(function (path) {
        const parts = path.split(".");
        let target = globalThis;
        for (let i = 0; i < parts.length - 1; i++) {
            target = target[parts[i]] = target[parts[i]] || {};
        }
        target[parts[parts.length - 1]] = function (...args) {
            return invoke(path, args);
        };
    });
    globalThis.data = freeze(JSON.parse(data));
    globalThis.__module = new Function("input", source);
    globalThis.__query = new Function("module", "input", "return (" + expression + ");");
})"#;

/// Compiles policies into QuickJS-backed prepared queries.
pub struct QuickJsRuntime {
    config: QuickJsConfig,
    registry: Arc<CapabilityRegistry>,
}

impl QuickJsRuntime {
    pub fn new(config: QuickJsConfig, registry: Arc<CapabilityRegistry>) -> Self {
        Self { config, registry }
    }
}

#[async_trait]
impl PolicyRuntime for QuickJsRuntime {
    async fn compile(
        &self,
        module_name: &str,
        source: &str,
        query: &Query,
    ) -> Result<Arc<dyn PreparedQuery>, RuntimeError> {
        let names: Vec<&str> = self.registry.names().collect();
        let program = Arc::new(Program {
            names: serde_json::to_string(&names)
                .map_err(|e| RuntimeError::compile(module_name, e.to_string()))?,
            source: source.to_string(),
            data: serde_json::to_string(&query.data)
                .map_err(|e| RuntimeError::compile(module_name, e.to_string()))?,
            expression: query.expression.clone(),
        });

        let config = self.config.clone();
        let checked = program.clone();
        let module = module_name.to_string();
        let runtime = tokio::task::spawn_blocking(move || check(&config, &module, &checked))
            .await
            .map_err(|e| RuntimeError::compile(module_name, format!("compile task failed: {e}")))??;

        debug!(module = %module_name, "Compiled policy module");
        Ok(Arc::new(QuickJsQuery {
            module: module_name.to_string(),
            binding: query.binding.clone(),
            timeout_ms: self.config.timeout_ms,
            registry: self.registry.clone(),
            program,
            runtime: Arc::new(Mutex::new(runtime)),
        }))
    }
}

/// Everything needed to rebuild a policy's global scope.
struct Program {
    names: String,
    source: String,
    data: String,
    expression: String,
}

fn new_runtime(config: &QuickJsConfig) -> Result<Runtime, RuntimeError> {
    let runtime = Runtime::new().map_err(|e| RuntimeError::Init(e.to_string()))?;
    runtime.set_memory_limit(config.memory_limit_mb * 1024 * 1024);
    runtime.set_max_stack_size(config.max_stack_size_kb * 1024);
    Ok(runtime)
}

/// Interrupt the runtime once `token` is cancelled or `timeout_ms` elapses.
fn arm(runtime: &Runtime, timeout_ms: u64, token: CancellationToken) -> Instant {
    let start = Instant::now();
    runtime.set_interrupt_handler(Some(Box::new(move || {
        token.is_cancelled() || start.elapsed().as_millis() > timeout_ms as u128
    })));
    start
}

/// Build a runtime and prove `program` installs in it within the deadline.
fn check(config: &QuickJsConfig, module: &str, program: &Program) -> Result<Runtime, RuntimeError> {
    let runtime = new_runtime(config)?;
    let start = arm(&runtime, config.timeout_ms, CancellationToken::new());
    let outcome = Context::full(&runtime)
        .map_err(|e| e.to_string())
        .and_then(|context| context.with(|ctx| prepare(&ctx, program)));
    runtime.set_interrupt_handler(None);

    match outcome {
        Ok(()) => Ok(runtime),
        Err(_) if start.elapsed().as_millis() > config.timeout_ms as u128 => {
            warn!(module = %module, timeout_ms = config.timeout_ms, "Policy compile timed out");
            Err(RuntimeError::compile(
                module,
                format!("timed out after {} ms", config.timeout_ms),
            ))
        }
        Err(message) => Err(RuntimeError::compile(module, message)),
    }
}

fn prepare(ctx: &Ctx<'_>, program: &Program) -> Result<(), String> {
    setup_console(ctx).map_err(|e| e.to_string())?;
    let prelude: Function = ctx.eval(PRELUDE).map_err(|e| describe(ctx, e))?;
    prelude
        .call::<_, ()>((
            program.names.clone(),
            program.source.clone(),
            program.data.clone(),
            program.expression.clone(),
        ))
        .map_err(|e| describe(ctx, e))
}

/// A compiled policy bound to its own QuickJS runtime.
pub struct QuickJsQuery {
    module: String,
    binding: String,
    timeout_ms: u64,
    registry: Arc<CapabilityRegistry>,
    program: Arc<Program>,
    runtime: Arc<Mutex<Runtime>>,
}

#[async_trait]
impl PreparedQuery for QuickJsQuery {
    async fn evaluate(
        &self,
        input: Value,
        scope: EvalScope,
    ) -> Result<Vec<Bindings>, RuntimeError> {
        let input = serde_json::to_string(&input)
            .map_err(|e| RuntimeError::Evaluation(format!("input is not serializable: {e}")))?;
        let call = EvalCall {
            binding: self.binding.clone(),
            timeout_ms: self.timeout_ms,
            registry: self.registry.clone(),
            handle: Handle::current(),
            scope,
        };
        let program = self.program.clone();
        let runtime = self.runtime.clone();

        let rows = tokio::task::spawn_blocking(move || call.run(&runtime, &program, input))
            .await
            .map_err(|e| RuntimeError::Evaluation(format!("evaluation task failed: {e}")))??;
        debug!(module = %self.module, rows = rows.len(), "Evaluated policy");
        Ok(rows)
    }
}

struct EvalCall {
    binding: String,
    timeout_ms: u64,
    registry: Arc<CapabilityRegistry>,
    handle: Handle,
    scope: EvalScope,
}

impl EvalCall {
    fn run(
        self,
        runtime: &Mutex<Runtime>,
        program: &Program,
        input: String,
    ) -> Result<Vec<Bindings>, RuntimeError> {
        let binding = serde_json::to_string(&self.binding)
            .map_err(|e| RuntimeError::Evaluation(e.to_string()))?;
        let script = format!(
            "(function () {{\n\
               const out = __query(__module, JSON.parse(__input_json));\n\
               return out === undefined ? undefined : JSON.stringify({{ [{binding}]: out }});\n\
             }})()"
        );

        let runtime = runtime.lock().unwrap_or_else(PoisonError::into_inner);
        let timeout_ms = self.timeout_ms;
        let start = arm(&runtime, timeout_ms, self.scope.token().clone());

        let failure: Arc<SlotMutex<Option<BridgeError>>> = Arc::default();
        let outcome = Context::full(&runtime)
            .map_err(|e| e.to_string())
            .and_then(|context| {
                context.with(|ctx| -> Result<Option<String>, String> {
                    let globals = ctx.globals();
                    let bridge = self.bridge_fn(&ctx, failure.clone()).map_err(|e| e.to_string())?;
                    globals.set("__capability_call", bridge).map_err(|e| e.to_string())?;
                    globals.set("__input_json", input).map_err(|e| e.to_string())?;
                    prepare(&ctx, program)?;
                    ctx.eval::<Option<String>, _>(script.as_bytes())
                        .map_err(|e| describe(&ctx, e))
                })
            });

        runtime.set_interrupt_handler(None);
        runtime.run_gc();
        drop(runtime);

        match outcome {
            Ok(Some(json)) => {
                let row: Bindings = serde_json::from_str(&json)
                    .map_err(|e| RuntimeError::Evaluation(format!("invalid result: {e}")))?;
                Ok(vec![row])
            }
            Ok(None) => Ok(Vec::new()),
            Err(message) => {
                if let Some(err) = failure.lock().take() {
                    return Err(RuntimeError::Capability(err));
                }
                if self.scope.is_cancelled() {
                    return Err(RuntimeError::Cancelled);
                }
                if start.elapsed().as_millis() > timeout_ms as u128 {
                    warn!(timeout_ms, "Policy evaluation timed out");
                    return Err(RuntimeError::Timeout(timeout_ms));
                }
                let lower = message.to_lowercase();
                if lower.contains("out of memory") || lower.contains("stack overflow") {
                    return Err(RuntimeError::ResourceLimit);
                }
                Err(RuntimeError::Evaluation(message))
            }
        }
    }

    /// `__capability_call(name, argsJson) -> replyJson`.
    ///
    /// The reply is `{"ok": value}` or `{"error": message}`; the first error is
    /// also kept in `failure`.
    fn bridge_fn<'js>(
        &self,
        ctx: &Ctx<'js>,
        failure: Arc<SlotMutex<Option<BridgeError>>>,
    ) -> rquickjs::Result<Function<'js>> {
        let registry = self.registry.clone();
        let handle = self.handle.clone();
        let scope = self.scope.clone();
        Function::new(ctx.clone(), move |name: String, args: String| -> String {
            let result = match serde_json::from_str::<Vec<Value>>(&args) {
                Ok(args) => handle.block_on(registry.invoke(&name, args, &scope)),
                Err(e) => Err(BridgeError::invalid_argument(&name, e.to_string())),
            };
            let reply = match result {
                Ok(value) => json!({ "ok": value }),
                Err(err) => {
                    let message = err.to_string();
                    failure.lock().get_or_insert(err);
                    json!({ "error": message })
                }
            };
            reply.to_string()
        })
    }
}

fn setup_console(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    console.set(
        "log",
        Function::new(ctx.clone(), |msg: String| {
            tracing::debug!(target: "quickjs", message = %msg, "console.log");
        })?,
    )?;
    console.set(
        "warn",
        Function::new(ctx.clone(), |msg: String| {
            tracing::warn!(target: "quickjs", message = %msg, "console.warn");
        })?,
    )?;
    console.set(
        "error",
        Function::new(ctx.clone(), |msg: String| {
            tracing::error!(target: "quickjs", message = %msg, "console.error");
        })?,
    )?;
    ctx.globals().set("console", console)
}

/// Message of a pending exception, or the error itself.
fn describe(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if matches!(err, rquickjs::Error::Exception) {
        let caught = ctx.catch();
        if let Some(message) = caught.as_exception().and_then(|e| e.message()) {
            return message;
        }
        return "uncaught exception".to_string();
    }
    err.to_string()
}
