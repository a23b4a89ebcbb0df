//! Periodic import of signed bundles from registered source URLs.

use std::sync::Arc;
use std::time::Duration;

use octopolicy_bundle::BundleService;
use octopolicy_core::ImportConfig;
use octopolicy_storage::DynStorage;
use reqwest::{Client, StatusCode};
use time::OffsetDateTime;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AutoImportConfig;
use crate::error::SchedulerError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub failed: usize,
}

pub struct AutoImporter {
    storage: DynStorage,
    bundles: Arc<BundleService>,
    http_client: Client,
    poll_interval: Duration,
}

impl AutoImporter {
    pub fn new(
        storage: DynStorage,
        bundles: Arc<BundleService>,
        config: &AutoImportConfig,
    ) -> Result<Self, SchedulerError> {
        let http_client = Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            storage,
            bundles,
            http_client,
            poll_interval: config.poll_interval(),
        })
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "Auto-import scheduler started"
        );
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick(OffsetDateTime::now_utc()).await {
                        Ok(summary) if summary.imported + summary.failed > 0 => info!(
                            imported = summary.imported,
                            failed = summary.failed,
                            "Auto-import tick complete"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Auto-import tick failed"),
                    }
                }
            }
        }
        info!("Auto-import scheduler stopped");
    }

    /// Claim due import configs and import each source's bundle.
    ///
    /// Claiming already advanced each config's next import, so a failed
    /// import is simply retried on the following interval.
    pub async fn tick(&self, now: OffsetDateTime) -> Result<ImportSummary, SchedulerError> {
        let configs = match self.storage.claim_due_import_configs(now).await {
            Ok(configs) => configs,
            Err(e) if e.is_not_found() => return Ok(ImportSummary::default()),
            Err(e) => return Err(e.into()),
        };

        let mut summary = ImportSummary::default();
        for config in &configs {
            match self.import(config).await {
                Ok(()) => summary.imported += 1,
                Err(reason) => {
                    summary.failed += 1;
                    error!(url = %config.source_url, error = %reason, "Auto-import failed");
                }
            }
        }
        Ok(summary)
    }

    async fn import(&self, config: &ImportConfig) -> Result<(), String> {
        let response = self
            .http_client
            .get(&config.source_url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status() != StatusCode::OK {
            return Err(format!("unexpected status {}", response.status().as_u16()));
        }
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;

        let policy = self
            .bundles
            .import(&bytes)
            .await
            .map_err(|e| e.to_string())?;
        info!(
            url = %config.source_url,
            repository = %policy.id.repository,
            group = %policy.id.group,
            name = %policy.id.name,
            version = %policy.id.version,
            "Auto-imported policy bundle"
        );
        Ok(())
    }
}
