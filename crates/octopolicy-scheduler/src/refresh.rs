//! Periodic refresh of policy static data from remote HTTP sources.
//!
//! Each tick claims the policies whose refresh is due and fetches their data
//! configuration's URL. Outcomes decide the next refresh time:
//!
//! | Outcome                                  | Next refresh      |
//! |------------------------------------------|-------------------|
//! | malformed config, request build failure  | never             |
//! | network error, non-200, body read error  | `now + period`    |
//! | success (data replaced)                  | `now + period`    |

use std::time::Duration;

use octopolicy_core::{DataConfig, Policy, RefreshMethod};
use octopolicy_storage::DynStorage;
use reqwest::{Client, Method, StatusCode};
use time::OffsetDateTime;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RefreshConfig;
use crate::error::SchedulerError;

/// What happened to one claimed policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Transient failure, retried after one period.
    Deferred,
    /// Permanent failure, no further refreshes until the config is fixed.
    Disabled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub deferred: usize,
    pub disabled: usize,
}

impl RefreshSummary {
    pub fn total(&self) -> usize {
        self.refreshed + self.deferred + self.disabled
    }

    fn record(&mut self, outcome: RefreshOutcome) {
        match outcome {
            RefreshOutcome::Refreshed => self.refreshed += 1,
            RefreshOutcome::Deferred => self.deferred += 1,
            RefreshOutcome::Disabled => self.disabled += 1,
        }
    }
}

pub struct DataRefresher {
    storage: DynStorage,
    http_client: Client,
    poll_interval: Duration,
}

impl DataRefresher {
    pub fn new(storage: DynStorage, config: &RefreshConfig) -> Result<Self, SchedulerError> {
        let http_client = Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            storage,
            http_client,
            poll_interval: config.poll_interval(),
        })
    }

    /// Poll until `shutdown` is cancelled. A tick in progress is finished
    /// before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "Data refresh scheduler started"
        );
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick(OffsetDateTime::now_utc()).await {
                        Ok(summary) if summary.total() > 0 => info!(
                            refreshed = summary.refreshed,
                            deferred = summary.deferred,
                            disabled = summary.disabled,
                            "Data refresh tick complete"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Data refresh tick failed"),
                    }
                }
            }
        }
        info!("Data refresh scheduler stopped");
    }

    /// Claim and refresh every policy due at `now`.
    pub async fn tick(&self, now: OffsetDateTime) -> Result<RefreshSummary, SchedulerError> {
        let policies = match self.storage.claim_due_refresh_policies(now).await {
            Ok(policies) => policies,
            Err(e) if e.is_not_found() => return Ok(RefreshSummary::default()),
            Err(e) => return Err(e.into()),
        };

        let mut summary = RefreshSummary::default();
        for policy in policies {
            summary.record(self.refresh(&policy, now).await);
        }
        Ok(summary)
    }

    /// Refresh one claimed policy and record the outcome in the store.
    pub async fn refresh(&self, policy: &Policy, now: OffsetDateTime) -> RefreshOutcome {
        let config = match DataConfig::parse(policy.data_config.as_deref().unwrap_or_default()) {
            Ok(config) => config,
            Err(e) => {
                error!(
                    repository = %policy.id.repository,
                    group = %policy.id.group,
                    name = %policy.id.name,
                    version = %policy.id.version,
                    error = %e,
                    "Invalid data refresh config, disabling refresh"
                );
                self.record(policy, None, None).await;
                return RefreshOutcome::Disabled;
            }
        };
        let next = Some(now + config.period);

        let request = match self.build_request(&config) {
            Ok(request) => request,
            Err(e) => {
                error!(
                    policy = %policy.id,
                    url = %config.url,
                    error = %e,
                    "Failed to build data refresh request, disabling refresh"
                );
                self.record(policy, None, None).await;
                return RefreshOutcome::Disabled;
            }
        };

        match self.fetch(request).await {
            Ok(body) => {
                info!(
                    repository = %policy.id.repository,
                    group = %policy.id.group,
                    name = %policy.id.name,
                    version = %policy.id.version,
                    url = %config.url,
                    size = body.len(),
                    "Refreshed policy data"
                );
                self.record(policy, Some(body), next).await;
                RefreshOutcome::Refreshed
            }
            Err(reason) => {
                error!(
                    repository = %policy.id.repository,
                    group = %policy.id.group,
                    name = %policy.id.name,
                    version = %policy.id.version,
                    url = %config.url,
                    error = %reason,
                    "Data refresh failed, retrying after one period"
                );
                self.record(policy, None, next).await;
                RefreshOutcome::Deferred
            }
        }
    }

    fn build_request(&self, config: &DataConfig) -> reqwest::Result<reqwest::Request> {
        let builder = match config.method {
            RefreshMethod::Get => self.http_client.request(Method::GET, config.url.clone()),
            RefreshMethod::Post => self
                .http_client
                .request(Method::POST, config.url.clone())
                .json(config.body.as_ref().unwrap_or(&serde_json::Value::Null)),
        };
        builder.build()
    }

    async fn fetch(&self, request: reqwest::Request) -> Result<String, String> {
        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| e.to_string())?;
        if response.status() != StatusCode::OK {
            return Err(format!("unexpected status {}", response.status().as_u16()));
        }
        response.text().await.map_err(|e| e.to_string())
    }

    async fn record(&self, policy: &Policy, data: Option<String>, next: Option<OffsetDateTime>) {
        match self
            .storage
            .update_after_refresh(&policy.id, data, next)
            .await
        {
            Ok(()) => debug!(policy = %policy.id, next = ?next, "Recorded refresh outcome"),
            Err(e) => warn!(
                policy = %policy.id,
                error = %e,
                "Failed to record data refresh outcome"
            ),
        }
    }
}
