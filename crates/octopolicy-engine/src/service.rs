//! Evaluation pipeline and lock management.

use std::sync::Arc;

use octopolicy_clients::ResultCache;
use octopolicy_core::{Error, ErrorKind, Policy, PolicyId, Result};
use octopolicy_storage::{DynStorage, StorageError};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bridge::EvalScope;
use crate::cache::QueryCache;
use crate::config::ResultCacheConfig;
use crate::error::RuntimeError;
use crate::runtime::{PolicyRuntime, PreparedQuery, Query};

#[derive(Debug, Clone)]
pub struct EvaluateRequest {
    pub policy: PolicyId,
    pub input: Value,
    /// Caller-chosen evaluation id; a random one is generated when absent.
    pub evaluation_id: Option<String>,
    /// Result cache TTL in seconds.
    pub ttl: Option<u64>,
}

impl EvaluateRequest {
    pub fn new(policy: PolicyId, input: Value) -> Self {
        Self {
            policy,
            input,
            evaluation_id: None,
            ttl: None,
        }
    }

    pub fn with_evaluation_id(mut self, id: impl Into<String>) -> Self {
        self.evaluation_id = Some(id.into());
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Decision document plus the id it was cached under.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub result: Value,
    pub etag: String,
}

/// Orchestrates store lookup, lock check, prepared-query reuse, evaluation
/// and result caching.
pub struct PolicyService {
    storage: DynStorage,
    runtime: Arc<dyn PolicyRuntime>,
    queries: Arc<QueryCache>,
    results: Arc<dyn ResultCache>,
    result_cache: ResultCacheConfig,
}

impl PolicyService {
    pub fn new(
        storage: DynStorage,
        runtime: Arc<dyn PolicyRuntime>,
        queries: Arc<QueryCache>,
        results: Arc<dyn ResultCache>,
    ) -> Self {
        Self {
            storage,
            runtime,
            queries,
            results,
            result_cache: ResultCacheConfig::default(),
        }
    }

    pub fn with_result_cache(mut self, config: ResultCacheConfig) -> Self {
        self.result_cache = config;
        self
    }

    pub fn queries(&self) -> &Arc<QueryCache> {
        &self.queries
    }

    pub fn storage(&self) -> &DynStorage {
        &self.storage
    }

    #[instrument(skip_all, fields(policy = %request.policy))]
    pub async fn evaluate(
        &self,
        request: EvaluateRequest,
        token: CancellationToken,
    ) -> Result<Evaluation> {
        // Read before the fetch so a purge racing with it invalidates the compile.
        let generation = self.queries.generation();
        let policy = self.fetch(&request.policy).await?;
        if policy.locked {
            return Err(Error::forbidden("policy is locked"));
        }

        let query = self.prepared_query(&policy, generation).await?;
        let rows = query
            .evaluate(request.input, EvalScope::new(token))
            .await
            .map_err(evaluation_error)?;

        let result = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal("policy evaluation returned no results"))?
            .remove(Query::RESULT)
            .ok_or_else(|| Error::internal("policy evaluation result has no result binding"))?;

        let etag = request
            .evaluation_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let body = serde_json::to_vec(&result)?;
        self.results
            .set(
                &etag,
                &self.result_cache.namespace,
                &self.result_cache.scope,
                body,
                request.ttl,
            )
            .await
            .map_err(|e| {
                Error::wrap(
                    ErrorKind::Unknown,
                    "error storing policy result in cache",
                    e,
                )
            })?;

        debug!(etag = %etag, "Policy evaluated");
        Ok(Evaluation { result, etag })
    }

    pub async fn lock(&self, id: &PolicyId) -> Result<()> {
        let policy = self.fetch(id).await?;
        if policy.locked {
            return Err(Error::forbidden("policy is already locked"));
        }
        self.storage
            .set_lock(id, true)
            .await
            .map_err(|e| Error::wrap(ErrorKind::Internal, "error locking policy", e))?;
        info!(policy = %id, "Policy locked");
        Ok(())
    }

    pub async fn unlock(&self, id: &PolicyId) -> Result<()> {
        let policy = self.fetch(id).await?;
        if !policy.locked {
            return Err(Error::forbidden("policy is unlocked"));
        }
        self.storage
            .set_lock(id, false)
            .await
            .map_err(|e| Error::wrap(ErrorKind::Internal, "error unlocking policy", e))?;
        info!(policy = %id, "Policy unlocked");
        Ok(())
    }

    async fn fetch(&self, id: &PolicyId) -> Result<Policy> {
        self.storage.get_policy(id).await.map_err(|e| match e {
            e @ StorageError::NotFound { .. } => Error::from(e),
            other => Error::wrap(ErrorKind::Unknown, "error getting policy", other),
        })
    }

    async fn prepared_query(
        &self,
        policy: &Policy,
        generation: u64,
    ) -> Result<Arc<dyn PreparedQuery>> {
        if let Some(query) = self.queries.get(&policy.id) {
            return Ok(query);
        }

        let data = match policy.data.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map_err(|e| {
                Error::wrap(ErrorKind::Internal, "policy static data is not valid json", e)
            })?,
            _ => Value::Null,
        };

        let query = self
            .runtime
            .compile(
                &policy.id.module_name(),
                &policy.source,
                &Query::policy_result().with_data(data),
            )
            .await
            .map_err(|e| Error::wrap(ErrorKind::Internal, "error preparing policy query", e))?;

        if !self
            .queries
            .set_if_generation(policy.id.clone(), query.clone(), generation)
        {
            warn!(policy = %policy.id, "Policy changed while compiling, prepared query not cached");
        }
        Ok(query)
    }
}

fn evaluation_error(err: RuntimeError) -> Error {
    let kind = match err {
        RuntimeError::Timeout(_) => ErrorKind::Timeout,
        _ => ErrorKind::Internal,
    };
    Error::wrap(kind, "error evaluating policy", err)
}
