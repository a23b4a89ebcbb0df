//! Component wiring from [`AppConfig`].

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use octopolicy_bundle::{BundleService, BundleVerifier, JwksCache};
use octopolicy_clients::{
    CacheClient, ClientError, DidResolverClient, MemoryCache, OcmClient, ResultCache, Signer,
    SignerClient, TaskClient,
};
use octopolicy_engine::{
    CapabilityRegistry, Collaborators, PolicyService, QueryCache, QueryCachePurger,
    QuickJsRuntime,
};
use octopolicy_notifications::{
    ChangeNotifier, NotificationTransport, RedisPublisher, WebhookTransport,
};
use octopolicy_scheduler::{AutoImporter, DataRefresher};
use octopolicy_storage::{DynStorage, PolicySubscriber};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{AppConfig, StorageBackend};
use crate::state::AppState;

/// Everything the process runs.
pub struct Services {
    pub state: AppState,
    pub refresher: Option<DataRefresher>,
    pub importer: Option<AutoImporter>,
    /// Set when evaluation results are cached in process.
    pub result_cache: Option<Arc<MemoryCache>>,
}

pub async fn create_storage(cfg: &AppConfig) -> anyhow::Result<DynStorage> {
    match cfg.storage.backend {
        StorageBackend::Memory => {
            info!("Using in-memory policy store");
            Ok(octopolicy_db_memory::create_storage())
        }
        StorageBackend::Postgres => {
            info!("Connecting to PostgreSQL policy store");
            octopolicy_db_postgres::create_storage(cfg.storage.postgres.clone())
                .await
                .context("failed to initialize PostgreSQL storage")
        }
    }
}

/// Build services on top of `storage` and register its change subscribers.
pub fn build_services(cfg: &AppConfig, storage: DynStorage) -> anyhow::Result<Services> {
    let clients = &cfg.clients;
    let mut collaborators = Collaborators::new(storage.clone());

    let mut result_cache = None;
    let results: Arc<dyn ResultCache> = match &clients.cache {
        Some(service) => {
            let cache = Arc::new(CacheClient::new(service)?);
            collaborators = collaborators.with_cache(cache.clone());
            cache
        }
        None => {
            warn!("clients.cache is not configured, keeping evaluation results in process");
            let cache = Arc::new(MemoryCache::new());
            result_cache = Some(cache.clone());
            cache
        }
    };

    let signer: Arc<dyn Signer> = match &clients.signer {
        Some(service) => {
            let signer = Arc::new(SignerClient::new(service)?);
            collaborators = collaborators.with_signer(signer.clone());
            signer
        }
        None => {
            warn!("clients.signer is not configured, bundle export is unavailable");
            Arc::new(UnconfiguredSigner)
        }
    };
    if let Some(service) = &clients.did_resolver {
        collaborators = collaborators.with_did_resolver(Arc::new(DidResolverClient::new(service)?));
    }
    if let Some(service) = &clients.task {
        collaborators = collaborators.with_tasks(Arc::new(TaskClient::new(service)?));
    }
    if let Some(service) = &clients.ocm {
        collaborators = collaborators.with_ocm(Arc::new(OcmClient::new(service)?));
    }

    let registry = Arc::new(CapabilityRegistry::standard(collaborators));

    let runtime = Arc::new(QuickJsRuntime::new(cfg.engine.quickjs.clone(), registry));
    let queries = Arc::new(QueryCache::new());
    let policies = Arc::new(
        PolicyService::new(storage.clone(), runtime, queries.clone(), results)
            .with_result_cache(cfg.engine.result_cache.clone()),
    );

    let verifier = BundleVerifier::new(JwksCache::new(cfg.bundle.clone())?);
    let bundles = Arc::new(BundleService::new(storage.clone(), signer, verifier));

    let mut subscribers: Vec<Arc<dyn PolicySubscriber>> =
        vec![Arc::new(QueryCachePurger::new(queries))];
    let transports = notification_transports(cfg, &storage)?;
    if !transports.is_empty() {
        subscribers.push(Arc::new(ChangeNotifier::new(transports)));
    }
    storage.register_subscribers(subscribers);

    let refresher = if cfg.refresh.enabled {
        Some(DataRefresher::new(storage.clone(), &cfg.refresh)?)
    } else {
        info!("Data refresh scheduler disabled");
        None
    };
    let importer = if cfg.auto_import.enabled {
        Some(AutoImporter::new(
            storage.clone(),
            bundles.clone(),
            &cfg.auto_import,
        )?)
    } else {
        info!("Auto-import scheduler disabled");
        None
    };

    Ok(Services {
        state: AppState {
            storage,
            policies,
            bundles,
        },
        refresher,
        importer,
        result_cache,
    })
}

fn notification_transports(
    cfg: &AppConfig,
    storage: &DynStorage,
) -> anyhow::Result<Vec<Arc<dyn NotificationTransport>>> {
    let mut transports: Vec<Arc<dyn NotificationTransport>> = Vec::new();
    if cfg.notifications.webhook_enabled {
        transports.push(Arc::new(WebhookTransport::new(
            storage.clone(),
            cfg.notifications.webhook.clone(),
        )?));
    }
    if let Some(redis) = &cfg.notifications.redis {
        info!(channel = %redis.channel, "Publishing policy changes to Redis");
        transports.push(Arc::new(RedisPublisher::new(redis)?));
    }
    Ok(transports)
}

/// Stands in for the signer when none is configured.
struct UnconfiguredSigner;

impl UnconfiguredSigner {
    fn error() -> ClientError {
        ClientError::InvalidConfig("signer service is not configured".into())
    }
}

#[async_trait]
impl Signer for UnconfiguredSigner {
    async fn sign(&self, _: &str, _: &str, _: &[u8]) -> Result<Vec<u8>, ClientError> {
        Err(Self::error())
    }

    async fn get_key(&self, _: &str, _: &str) -> Result<Value, ClientError> {
        Err(Self::error())
    }

    async fn get_all_keys(&self, _: &str) -> Result<Value, ClientError> {
        Err(Self::error())
    }

    async fn create_proof(&self, _: Value) -> Result<Value, ClientError> {
        Err(Self::error())
    }

    async fn verify_proof(&self, _: Value) -> Result<Value, ClientError> {
        Err(Self::error())
    }
}
