// Tracing initialization with configurable and reloadable log level.
use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

use crate::config::{LogFormat, LoggingConfig};

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

pub fn init_tracing() {
    init_tracing_with(&LoggingConfig::default());
}

/// Install the global subscriber. The output format is fixed at this point;
/// the level can still change through [`apply_logging_level`].
pub fn init_tracing_with(logging: &LoggingConfig) {
    // Prefer RUST_LOG from env, otherwise use the configured level.
    let base_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(&logging.level));

    let (reload_layer, handle) = reload::Layer::new(base_filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let json = logging.format == LogFormat::Json;
    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .try_init();
}

/// Apply a new logging level at runtime. `RUST_LOG` keeps precedence.
pub fn apply_logging_level(level: &str) {
    if std::env::var("RUST_LOG").is_ok() {
        return;
    }
    if let Some(handle) = LOG_RELOAD_HANDLE.get() {
        let _ = handle.modify(|f| {
            *f = EnvFilter::new(level);
        });
    }
}
