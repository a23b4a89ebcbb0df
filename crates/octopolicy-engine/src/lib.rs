//! # octopolicy-engine
//!
//! Policy evaluation for OctoPolicy:
//!
//! - [`PolicyService`]: the evaluation pipeline and lock management
//! - [`QueryCache`]: prepared queries keyed by policy identity, purged on change
//! - [`PolicyRuntime`]: the runtime contract, with [`QuickJsRuntime`] as the
//!   embedded implementation
//! - [`bridge`]: capability functions policies call during evaluation

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod purge;
pub mod quickjs;
pub mod runtime;
pub mod service;

pub use bridge::{
    Arg, ArgKind, Args, Capability, CapabilityHandler, CapabilityRegistry, Collaborators,
    EvalScope, FunctionDecl, handler_fn,
};
pub use cache::QueryCache;
pub use config::{EngineConfig, QuickJsConfig, ResultCacheConfig};
pub use error::{BridgeError, RuntimeError};
pub use purge::QueryCachePurger;
pub use quickjs::QuickJsRuntime;
pub use runtime::{Bindings, PolicyRuntime, PreparedQuery, Query};
pub use service::{EvaluateRequest, Evaluation, PolicyService};
