use std::net::SocketAddr;

use octopolicy_bundle::JwksCacheConfig;
use octopolicy_clients::ServiceConfig;
use octopolicy_db_postgres::PostgresConfig;
use octopolicy_engine::EngineConfig;
use octopolicy_notifications::{RedisConfig, WebhookConfig};
use octopolicy_scheduler::{AutoImportConfig, RefreshConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// QuickJS limits and result cache placement
    #[serde(default)]
    pub engine: EngineConfig,
    /// Data refresh scheduler
    #[serde(default)]
    pub refresh: RefreshConfig,
    /// Bundle auto-import scheduler
    #[serde(default)]
    pub auto_import: AutoImportConfig,
    /// Collaborating services; an absent entry disables its capability functions
    #[serde(default)]
    pub clients: ClientsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    /// JWKS fetching for bundle verification
    #[serde(default)]
    pub bundle: JwksCacheConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        if self.storage.backend == StorageBackend::Postgres {
            if self.storage.postgres.url.is_empty() {
                return Err("storage.postgres.url must not be empty".into());
            }
            if self.storage.postgres.max_connections == 0 {
                return Err("storage.postgres.max_connections must be > 0".into());
            }
        }
        let quickjs = &self.engine.quickjs;
        if quickjs.timeout_ms == 0 || quickjs.memory_limit_mb == 0 {
            return Err("engine.quickjs limits must be > 0".into());
        }
        if self.refresh.enabled && self.refresh.poll_interval_secs == 0 {
            return Err("refresh.poll_interval_secs must be > 0".into());
        }
        if self.auto_import.enabled && self.auto_import.poll_interval_secs == 0 {
            return Err("auto_import.poll_interval_secs must be > 0".into());
        }
        for (name, service) in self.clients.configured() {
            if service.base_url.is_empty() {
                return Err(format!("clients.{name}.base_url must not be empty"));
            }
        }
        if let Some(redis) = &self.notifications.redis
            && redis.channel.is_empty()
        {
            return Err("notifications.redis.channel must not be empty".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted request body, bundles included
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Used when `backend = "postgres"`
    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientsConfig {
    #[serde(default)]
    pub cache: Option<ServiceConfig>,
    #[serde(default)]
    pub signer: Option<ServiceConfig>,
    #[serde(default)]
    pub did_resolver: Option<ServiceConfig>,
    #[serde(default)]
    pub task: Option<ServiceConfig>,
    #[serde(default)]
    pub ocm: Option<ServiceConfig>,
}

impl ClientsConfig {
    fn configured(&self) -> impl Iterator<Item = (&'static str, &ServiceConfig)> {
        [
            ("cache", &self.cache),
            ("signer", &self.signer),
            ("did_resolver", &self.did_resolver),
            ("task", &self.task),
            ("ocm", &self.ocm),
        ]
        .into_iter()
        .filter_map(|(name, service)| service.as_ref().map(|s| (name, s)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Deliver change events to registered subscriber webhooks
    #[serde(default = "default_true")]
    pub webhook_enabled: bool,
    #[serde(default)]
    pub webhook: WebhookConfig,
    /// Publish change events on a Redis channel when set
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            webhook_enabled: true,
            webhook: WebhookConfig::default(),
            redis: None,
        }
    }
}

pub mod loader {
    use std::path::PathBuf;

    use config::{Config, Environment, File};

    use super::AppConfig;

    /// Load `path` if it exists, then apply `OCTOPOLICY__SECTION__KEY`
    /// environment overrides and validate.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let path = PathBuf::from(path.unwrap_or("octopolicy.toml"));
        if path.exists() {
            builder = builder.add_source(File::from(path));
        }
        // Environment variable overrides, e.g., OCTOPOLICY__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("OCTOPOLICY")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
