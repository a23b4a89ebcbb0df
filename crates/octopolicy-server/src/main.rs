use std::env;

use octopolicy_server::config::loader::load_config;
use octopolicy_server::{OctopolicyServer, build_services, create_storage, shutdown_signal};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From OCTOPOLICY_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (octopolicy.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (OCTOPOLICY_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv()
        && !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
    {
        eprintln!("Warning: Failed to load .env file: {e}");
    }

    let (config_path, source) = resolve_config_path();
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    octopolicy_server::observability::init_tracing_with(&cfg.logging);
    tracing::info!(
        path = %config_path,
        source = %source,
        "Configuration loaded"
    );

    if let Err(e) = run(cfg).await {
        tracing::error!(error = %e, "Server error");
        eprintln!("Server error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cfg: octopolicy_server::AppConfig) -> anyhow::Result<()> {
    let storage = create_storage(&cfg).await?;
    let services = build_services(&cfg, storage.clone())?;
    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    {
        let storage = storage.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = storage.watch_changes(shutdown).await {
                tracing::error!(error = %e, "Change watcher stopped");
            }
        });
    }
    if let Some(refresher) = services.refresher {
        let shutdown = shutdown.clone();
        tasks.spawn(async move { refresher.run(shutdown).await });
    }
    if let Some(importer) = services.importer {
        let shutdown = shutdown.clone();
        tasks.spawn(async move { importer.run(shutdown).await });
    }
    if let Some(cache) = services.result_cache {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            cache
                .run_sweeper(octopolicy_clients::MemoryCache::SWEEP_INTERVAL, shutdown)
                .await
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let result = OctopolicyServer::new(services.state, &cfg)
        .run(shutdown.clone())
        .await;

    // The server also stops on bind errors; make sure the loops follow.
    shutdown.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Background task panicked");
        }
    }
    storage.close().await;
    tracing::info!("Shutdown complete");
    result
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: OCTOPOLICY_CONFIG
/// 3. Default: octopolicy.toml
fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config"
            && let Some(path) = args.next()
        {
            return (path, ConfigSource::CliArgument);
        }
    }

    if let Ok(path) = env::var("OCTOPOLICY_CONFIG")
        && !path.is_empty()
    {
        return (path, ConfigSource::EnvironmentVariable);
    }

    ("octopolicy.toml".to_string(), ConfigSource::Default)
}
