//! PostgreSQL implementation of the policy store contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use octopolicy_core::{ExportConfig, ImportConfig, Policy, PolicyFilter, PolicyId, Subscriber};
use octopolicy_storage::{
    CLAIM_POSTPONE, ChangeDispatcher, PolicyStorage, PolicySubscriber, StorageError,
};
use serde_json::Value;
use sqlx_core::query::query;
use sqlx_core::query_scalar::query_scalar;
use sqlx_core::row::Row;
use sqlx_core::types::Json;
use sqlx_postgres::{PgPool, PgRow};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::PostgresConfig;
use crate::error::{PostgresError, is_unique_violation, query_error};
use crate::listener::{self, POLICY_CHANNEL};
use crate::{migrations, pool};

const POLICY_COLUMNS: &str = "id, repository, policy_group, name, version, source, data, \
     data_config, output_schema, export_config, locked, last_update, next_data_refresh_time";

const IMPORT_COLUMNS: &str = "source_url, interval_ms, next_import, created_at, updated_at";

const IDENTITY_PREDICATE: &str =
    "repository = $1 AND policy_group = $2 AND name = $3 AND version = $4";

/// PostgreSQL policy store.
///
/// Claims run as `SELECT … FOR UPDATE SKIP LOCKED` plus an `UPDATE` in one
/// transaction, so concurrent replicas never claim the same item.
pub struct PostgresStorage {
    pool: PgPool,
    dispatcher: ChangeDispatcher,
    closed: CancellationToken,
    claim_postpone: Duration,
    reconnect_delay: Duration,
}

impl PostgresStorage {
    /// Connects, runs migrations when configured, and returns the store.
    pub async fn new(config: PostgresConfig) -> Result<Self, PostgresError> {
        let pool = pool::connect(&config).await?;
        if config.run_migrations {
            migrations::run(&pool).await?;
        }
        Ok(Self::from_pool(pool)
            .with_reconnect_delay(config.listener_reconnect)
            .with_claim_postpone(config.claim_postpone))
    }

    /// Wraps an existing pool. Migrations are not run.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            dispatcher: ChangeDispatcher::new(),
            closed: CancellationToken::new(),
            claim_postpone: CLAIM_POSTPONE,
            reconnect_delay: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    #[must_use]
    pub fn with_claim_postpone(mut self, postpone: Duration) -> Self {
        self.claim_postpone = postpone;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trips a trivial query.
    pub async fn ping(&self) -> Result<(), StorageError> {
        pool::ping(&self.pool).await.map_err(Into::into)
    }

    /// Insert or replace `policy`. `last_update` of `None` stamps `now()`.
    async fn upsert_policy(
        &self,
        policy: Policy,
        last_update: Option<OffsetDateTime>,
    ) -> Result<Policy, StorageError> {
        let sql = format!(
            r#"INSERT INTO policies
                 (repository, policy_group, name, version, source, data, data_config,
                  output_schema, export_config, locked, last_update, next_data_refresh_time)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, COALESCE($12, now()), $11)
               ON CONFLICT (repository, policy_group, name, version) DO UPDATE SET
                 source = EXCLUDED.source,
                 data = EXCLUDED.data,
                 data_config = EXCLUDED.data_config,
                 output_schema = EXCLUDED.output_schema,
                 export_config = EXCLUDED.export_config,
                 locked = EXCLUDED.locked,
                 last_update = EXCLUDED.last_update,
                 next_data_refresh_time = EXCLUDED.next_data_refresh_time
               RETURNING {POLICY_COLUMNS}"#
        );
        let row = query(&sql)
            .bind(&policy.id.repository)
            .bind(&policy.id.group)
            .bind(&policy.id.name)
            .bind(&policy.id.version)
            .bind(&policy.source)
            .bind(&policy.data)
            .bind(&policy.data_config)
            .bind(&policy.output_schema)
            .bind(policy.export_config.clone().map(Json))
            .bind(policy.locked)
            .bind(policy.next_data_refresh_time)
            .bind(last_update)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_error("Failed to save policy", e))?;

        policy_from_row(&row)
            .map_err(|e| StorageError::invalid_data(format!("Failed to decode policy: {e}")))
    }
}

fn policy_from_row(row: &PgRow) -> Result<Policy, sqlx_core::error::Error> {
    let export_config: Option<Json<ExportConfig>> = row.try_get("export_config")?;
    Ok(Policy {
        id: PolicyId {
            repository: row.try_get("repository")?,
            group: row.try_get("policy_group")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
        },
        source: row.try_get("source")?,
        data: row.try_get("data")?,
        data_config: row.try_get("data_config")?,
        output_schema: row.try_get("output_schema")?,
        export_config: export_config.map(|c| c.0),
        locked: row.try_get("locked")?,
        last_update: row.try_get("last_update")?,
        next_data_refresh_time: row.try_get("next_data_refresh_time")?,
    })
}

fn import_config_from_row(row: &PgRow) -> Result<ImportConfig, sqlx_core::error::Error> {
    let interval_ms: i64 = row.try_get("interval_ms")?;
    Ok(ImportConfig {
        source_url: row.try_get("source_url")?,
        interval: Duration::from_millis(interval_ms.max(0) as u64),
        next_import: row.try_get("next_import")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_rows<T>(
    rows: &[PgRow],
    f: fn(&PgRow) -> Result<T, sqlx_core::error::Error>,
) -> Result<Vec<T>, StorageError> {
    rows.iter()
        .map(f)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::invalid_data(format!("Failed to decode row: {e}")))
}

#[async_trait]
impl PolicyStorage for PostgresStorage {
    #[instrument(skip(self), fields(policy = %id))]
    async fn get_policy(&self, id: &PolicyId) -> Result<Policy, StorageError> {
        let sql = format!("SELECT {POLICY_COLUMNS} FROM policies WHERE {IDENTITY_PREDICATE}");
        let row = query(&sql)
            .bind(&id.repository)
            .bind(&id.group)
            .bind(&id.name)
            .bind(&id.version)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("Failed to get policy", e))?
            .ok_or_else(|| StorageError::not_found("policy", id.to_string()))?;

        policy_from_row(&row)
            .map_err(|e| StorageError::invalid_data(format!("Failed to decode policy: {e}")))
    }

    #[instrument(skip(self, policy), fields(policy = %policy.id))]
    async fn save_policy(&self, policy: Policy) -> Result<Policy, StorageError> {
        self.upsert_policy(policy, None).await
    }

    #[instrument(skip(self, policy), fields(policy = %policy.id))]
    async fn import_policy(&self, policy: Policy) -> Result<Policy, StorageError> {
        let last_update = policy.last_update;
        self.upsert_policy(policy, Some(last_update)).await
    }

    #[instrument(skip(self), fields(policy = %id))]
    async fn set_lock(&self, id: &PolicyId, locked: bool) -> Result<(), StorageError> {
        let sql = format!(
            "UPDATE policies SET locked = $5, last_update = now() WHERE {IDENTITY_PREDICATE}"
        );
        let result = query(&sql)
            .bind(&id.repository)
            .bind(&id.group)
            .bind(&id.name)
            .bind(&id.version)
            .bind(locked)
            .execute(&self.pool)
            .await
            .map_err(|e| query_error("Failed to set policy lock", e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("policy", id.to_string()));
        }
        Ok(())
    }

    async fn list_policies(&self, filter: PolicyFilter) -> Result<Vec<Policy>, StorageError> {
        let sql = format!(
            "SELECT {POLICY_COLUMNS} FROM policies \
             WHERE ($1::boolean IS NULL OR locked = $1) \
             ORDER BY repository, policy_group, name, version"
        );
        let rows = query(&sql)
            .bind(filter.locked)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("Failed to list policies", e))?;
        map_rows(&rows, policy_from_row)
    }

    #[instrument(skip(self))]
    async fn claim_due_refresh_policies(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<Policy>, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_error("Failed to begin claim", e))?;

        let sql = format!(
            "SELECT {POLICY_COLUMNS} FROM policies \
             WHERE next_data_refresh_time IS NOT NULL AND next_data_refresh_time <= $1 \
             ORDER BY next_data_refresh_time \
             FOR UPDATE SKIP LOCKED"
        );
        let rows = query(&sql)
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| query_error("Failed to select due policies", e))?;

        let claimed = map_rows(&rows, policy_from_row)?;
        if !claimed.is_empty() {
            let ids = rows
                .iter()
                .map(|r| r.try_get::<i64, _>("id"))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::invalid_data(format!("Failed to decode id: {e}")))?;

            query("UPDATE policies SET next_data_refresh_time = $1 WHERE id = ANY($2)")
                .bind(now + self.claim_postpone)
                .bind(ids)
                .execute(&mut *tx)
                .await
                .map_err(|e| query_error("Failed to postpone claimed policies", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::transaction_error(format!("Failed to commit claim: {e}")))?;

        debug!(count = claimed.len(), "Claimed due refresh policies");
        Ok(claimed)
    }

    #[instrument(skip(self, data), fields(policy = %id))]
    async fn update_after_refresh(
        &self,
        id: &PolicyId,
        data: Option<String>,
        next: Option<OffsetDateTime>,
    ) -> Result<(), StorageError> {
        let result = match data {
            Some(data) => {
                let sql = format!(
                    "UPDATE policies SET data = $5, next_data_refresh_time = $6, \
                     last_update = now() WHERE {IDENTITY_PREDICATE}"
                );
                query(&sql)
                    .bind(&id.repository)
                    .bind(&id.group)
                    .bind(&id.name)
                    .bind(&id.version)
                    .bind(data)
                    .bind(next)
                    .execute(&self.pool)
                    .await
            }
            None => {
                let sql = format!(
                    "UPDATE policies SET next_data_refresh_time = $5 WHERE {IDENTITY_PREDICATE}"
                );
                query(&sql)
                    .bind(&id.repository)
                    .bind(&id.group)
                    .bind(&id.name)
                    .bind(&id.version)
                    .bind(next)
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(|e| query_error("Failed to update policy after refresh", e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("policy", id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_due_import_configs(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<ImportConfig>, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_error("Failed to begin claim", e))?;

        let sql = format!(
            "SELECT {IMPORT_COLUMNS} FROM import_configs WHERE next_import <= $1 \
             ORDER BY next_import FOR UPDATE SKIP LOCKED"
        );
        let rows = query(&sql)
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| query_error("Failed to select due import configs", e))?;

        let claimed = map_rows(&rows, import_config_from_row)?;
        if !claimed.is_empty() {
            let urls: Vec<String> = claimed.iter().map(|c| c.source_url.clone()).collect();
            query(
                "UPDATE import_configs \
                 SET next_import = $1 + interval_ms * interval '1 millisecond', updated_at = $1 \
                 WHERE source_url = ANY($2)",
            )
            .bind(now)
            .bind(urls)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_error("Failed to advance claimed import configs", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::transaction_error(format!("Failed to commit claim: {e}")))?;

        debug!(count = claimed.len(), "Claimed due import configs");
        Ok(claimed)
    }

    async fn save_import_config(
        &self,
        config: ImportConfig,
    ) -> Result<ImportConfig, StorageError> {
        let interval_ms = i64::try_from(config.interval.as_millis())
            .map_err(|_| StorageError::invalid_data("import interval is too large"))?;
        if interval_ms <= 0 {
            return Err(StorageError::invalid_data("import interval must be positive"));
        }

        let sql = format!(
            "INSERT INTO import_configs (source_url, interval_ms, next_import) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (source_url) DO UPDATE SET \
               interval_ms = EXCLUDED.interval_ms, \
               next_import = EXCLUDED.next_import, \
               updated_at = now() \
             RETURNING {IMPORT_COLUMNS}"
        );
        let row = query(&sql)
            .bind(&config.source_url)
            .bind(interval_ms)
            .bind(config.next_import)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_error("Failed to save import config", e))?;

        import_config_from_row(&row)
            .map_err(|e| StorageError::invalid_data(format!("Failed to decode import config: {e}")))
    }

    async fn list_import_configs(&self) -> Result<Vec<ImportConfig>, StorageError> {
        let sql = format!("SELECT {IMPORT_COLUMNS} FROM import_configs ORDER BY source_url");
        let rows = query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("Failed to list import configs", e))?;
        map_rows(&rows, import_config_from_row)
    }

    async fn add_subscriber(&self, subscriber: Subscriber) -> Result<Subscriber, StorageError> {
        let row = query(
            "INSERT INTO subscribers \
               (repository, policy_group, name, version, webhook_url, subscriber_name) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING created_at, updated_at",
        )
        .bind(&subscriber.policy.repository)
        .bind(&subscriber.policy.group)
        .bind(&subscriber.policy.name)
        .bind(&subscriber.policy.version)
        .bind(&subscriber.webhook_url)
        .bind(&subscriber.name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::already_exists(
                    "subscriber",
                    format!("{}@{}", subscriber.name, subscriber.webhook_url),
                )
            } else {
                query_error("Failed to add subscriber", e)
            }
        })?;

        let created_at = row
            .try_get("created_at")
            .map_err(|e| StorageError::invalid_data(e.to_string()))?;
        let updated_at = row
            .try_get("updated_at")
            .map_err(|e| StorageError::invalid_data(e.to_string()))?;
        Ok(Subscriber {
            created_at,
            updated_at,
            ..subscriber
        })
    }

    async fn get_subscribers(&self, policy: &PolicyId) -> Result<Vec<Subscriber>, StorageError> {
        let sql = format!(
            "SELECT webhook_url, subscriber_name, created_at, updated_at FROM subscribers \
             WHERE {IDENTITY_PREDICATE} ORDER BY id"
        );
        let rows = query(&sql)
            .bind(&policy.repository)
            .bind(&policy.group)
            .bind(&policy.name)
            .bind(&policy.version)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("Failed to get subscribers", e))?;

        rows.iter()
            .map(|row| {
                Ok(Subscriber {
                    policy: policy.clone(),
                    webhook_url: row.try_get("webhook_url")?,
                    name: row.try_get("subscriber_name")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx_core::error::Error>>()
            .map_err(|e| StorageError::invalid_data(format!("Failed to decode subscriber: {e}")))
    }

    async fn get_data(&self, key: &str) -> Result<Option<Value>, StorageError> {
        query_scalar::<_, Value>("SELECT value FROM storage WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("Failed to get data", e))
    }

    async fn set_data(&self, key: &str, value: Value) -> Result<(), StorageError> {
        query(
            "INSERT INTO storage (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to set data", e))?;
        Ok(())
    }

    async fn delete_data(&self, key: &str) -> Result<(), StorageError> {
        query("DELETE FROM storage WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| query_error("Failed to delete data", e))?;
        Ok(())
    }

    fn register_subscribers(&self, subscribers: Vec<Arc<dyn PolicySubscriber>>) {
        self.dispatcher.register(subscribers);
    }

    async fn watch_changes(&self, shutdown: CancellationToken) -> Result<(), StorageError> {
        info!(channel = POLICY_CHANNEL, "Watching PostgreSQL policy changes");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.closed.cancelled() => break,
                result = listener::listen_loop(&self.pool, &self.dispatcher) => {
                    if let Err(e) = result {
                        error!(
                            error = %e,
                            delay_ms = self.reconnect_delay.as_millis() as u64,
                            "Policy change listener error, reconnecting"
                        );
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.closed.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        info!("Stopped watching PostgreSQL policy changes");
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
        self.pool.close().await;
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
