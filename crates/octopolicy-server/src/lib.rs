//! # octopolicy-server
//!
//! HTTP surface and process wiring for OctoPolicy: configuration loading,
//! logging bootstrap, the axum router and the background tasks.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod handlers;
pub mod observability;
pub mod server;
pub mod state;

pub use bootstrap::{Services, build_services, create_storage};
pub use config::AppConfig;
pub use error::{ApiError, ApiResult};
pub use server::{OctopolicyServer, build_app, shutdown_signal};
pub use state::AppState;
