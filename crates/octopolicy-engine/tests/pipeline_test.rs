//! Evaluation pipeline tests against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use octopolicy_clients::{ClientError, MemoryCache, ResultCache};
use octopolicy_core::{ErrorKind, Policy, PolicyId};
use octopolicy_db_memory::create_storage;
use octopolicy_engine::{
    Bindings, CapabilityRegistry, EvalScope, EvaluateRequest, PolicyRuntime, PolicyService,
    PreparedQuery, Query, QueryCache, QueryCachePurger, QuickJsConfig, QuickJsRuntime,
    RuntimeError,
};
use octopolicy_storage::DynStorage;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Runtime double that counts compiles and returns a fixed row set.
struct CountingRuntime {
    compiles: AtomicUsize,
    evaluations: Arc<AtomicUsize>,
    rows: Vec<Bindings>,
}

impl CountingRuntime {
    fn returning(rows: Vec<Bindings>) -> Arc<Self> {
        Arc::new(Self {
            compiles: AtomicUsize::new(0),
            evaluations: Arc::new(AtomicUsize::new(0)),
            rows,
        })
    }

    fn allow() -> Arc<Self> {
        let mut row = Bindings::new();
        row.insert("result".into(), json!({"allow": true}));
        Self::returning(vec![row])
    }

    fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

struct FixedQuery {
    evaluations: Arc<AtomicUsize>,
    rows: Vec<Bindings>,
}

#[async_trait]
impl PreparedQuery for FixedQuery {
    async fn evaluate(&self, _: Value, _: EvalScope) -> Result<Vec<Bindings>, RuntimeError> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.clone())
    }
}

#[async_trait]
impl PolicyRuntime for CountingRuntime {
    async fn compile(
        &self,
        module_name: &str,
        source: &str,
        _: &Query,
    ) -> Result<Arc<dyn PreparedQuery>, RuntimeError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if source.contains("syntax error") {
            return Err(RuntimeError::compile(module_name, "unexpected token"));
        }
        Ok(Arc::new(FixedQuery {
            evaluations: self.evaluations.clone(),
            rows: self.rows.clone(),
        }))
    }
}

struct FailingCache;

#[async_trait]
impl ResultCache for FailingCache {
    async fn set(&self, _: &str, _: &str, _: &str, _: Vec<u8>, _: Option<u64>) -> Result<(), ClientError> {
        Err(ClientError::status(503, "cache down"))
    }

    async fn get(&self, _: &str, _: &str, _: &str) -> Result<Vec<u8>, ClientError> {
        Err(ClientError::NotFound)
    }
}

fn example_id() -> PolicyId {
    PolicyId::new("policies", "example", "example", "1.0")
}

async fn seeded_storage(policy: Policy) -> DynStorage {
    let storage = create_storage();
    storage.save_policy(policy).await.unwrap();
    storage
}

fn service(storage: DynStorage, runtime: Arc<dyn PolicyRuntime>, cache: Arc<dyn ResultCache>) -> PolicyService {
    PolicyService::new(storage, runtime, Arc::new(QueryCache::new()), cache)
}

#[tokio::test]
async fn test_second_evaluation_reuses_prepared_query() {
    let storage = seeded_storage(Policy::new(example_id(), "source")).await;
    let runtime = CountingRuntime::allow();
    let svc = service(storage, runtime.clone(), Arc::new(MemoryCache::new()));

    for _ in 0..2 {
        let out = svc
            .evaluate(EvaluateRequest::new(example_id(), json!({})), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.result, json!({"allow": true}));
    }
    assert_eq!(runtime.compiles(), 1);
    assert_eq!(runtime.evaluations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_locked_policy_never_reaches_runtime() {
    let storage = seeded_storage(Policy::new(example_id(), "source").locked(true)).await;
    let runtime = CountingRuntime::allow();
    let svc = service(storage, runtime.clone(), Arc::new(MemoryCache::new()));

    let err = svc
        .evaluate(EvaluateRequest::new(example_id(), json!({})), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(err.to_string().contains("policy is locked"));
    assert_eq!(runtime.compiles(), 0);
}

#[tokio::test]
async fn test_missing_policy_is_not_found_everywhere() {
    let svc = service(create_storage(), CountingRuntime::allow(), Arc::new(MemoryCache::new()));
    let id = PolicyId::new("nope", "nope", "nope", "0");

    let err = svc
        .evaluate(EvaluateRequest::new(id.clone(), json!({})), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(svc.lock(&id).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(svc.unlock(&id).await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_lock_and_unlock_are_not_idempotent() {
    let storage = seeded_storage(Policy::new(example_id(), "source")).await;
    let svc = service(storage.clone(), CountingRuntime::allow(), Arc::new(MemoryCache::new()));

    let err = svc.unlock(&example_id()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert_eq!(err.message(), "policy is unlocked");

    svc.lock(&example_id()).await.unwrap();
    assert!(storage.get_policy(&example_id()).await.unwrap().locked);

    let err = svc.lock(&example_id()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert_eq!(err.message(), "policy is already locked");
    assert!(storage.get_policy(&example_id()).await.unwrap().locked);

    svc.unlock(&example_id()).await.unwrap();
    assert!(!storage.get_policy(&example_id()).await.unwrap().locked);
}

#[tokio::test]
async fn test_no_rows_is_internal() {
    let storage = seeded_storage(Policy::new(example_id(), "source")).await;
    let svc = service(storage, CountingRuntime::returning(vec![]), Arc::new(MemoryCache::new()));

    let err = svc
        .evaluate(EvaluateRequest::new(example_id(), json!({})), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
}

#[tokio::test]
async fn test_missing_binding_is_internal() {
    let storage = seeded_storage(Policy::new(example_id(), "source")).await;
    let mut row = Bindings::new();
    row.insert("other".into(), json!(true));
    let svc = service(storage, CountingRuntime::returning(vec![row]), Arc::new(MemoryCache::new()));

    let err = svc
        .evaluate(EvaluateRequest::new(example_id(), json!({})), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
}

#[tokio::test]
async fn test_compile_failure_is_internal_and_not_cached() {
    let storage = seeded_storage(Policy::new(example_id(), "syntax error")).await;
    let runtime = CountingRuntime::allow();
    let svc = service(storage, runtime.clone(), Arc::new(MemoryCache::new()));

    for _ in 0..2 {
        let err = svc
            .evaluate(EvaluateRequest::new(example_id(), json!({})), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
    assert_eq!(runtime.compiles(), 2);
    assert!(svc.queries().is_empty());
}

#[tokio::test]
async fn test_result_is_cached_under_evaluation_id() {
    let storage = seeded_storage(Policy::new(example_id(), "source")).await;
    let cache = Arc::new(MemoryCache::new());
    let svc = service(storage, CountingRuntime::allow(), cache.clone());

    let out = svc
        .evaluate(
            EvaluateRequest::new(example_id(), json!({})).with_evaluation_id("eval-1"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(out.etag, "eval-1");

    let stored = cache.get("eval-1", "Login", "administration").await.unwrap();
    assert_eq!(serde_json::from_slice::<Value>(&stored).unwrap(), json!({"allow": true}));
}

#[tokio::test]
async fn test_generated_evaluation_ids_differ() {
    let storage = seeded_storage(Policy::new(example_id(), "source")).await;
    let svc = service(storage, CountingRuntime::allow(), Arc::new(MemoryCache::new()));

    let a = svc
        .evaluate(EvaluateRequest::new(example_id(), json!({})), CancellationToken::new())
        .await
        .unwrap();
    let b = svc
        .evaluate(EvaluateRequest::new(example_id(), json!({})), CancellationToken::new())
        .await
        .unwrap();
    assert!(!a.etag.is_empty());
    assert_ne!(a.etag, b.etag);
}

#[tokio::test]
async fn test_result_cache_failure_fails_evaluation() {
    let storage = seeded_storage(Policy::new(example_id(), "source")).await;
    let svc = service(storage, CountingRuntime::allow(), Arc::new(FailingCache));

    let err = svc
        .evaluate(EvaluateRequest::new(example_id(), json!({})), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert!(err.to_string().contains("error storing policy result in cache"));
}

#[tokio::test]
async fn test_change_purges_prepared_queries() {
    let storage = seeded_storage(Policy::new(example_id(), "source")).await;
    let runtime = CountingRuntime::allow();
    let queries = Arc::new(QueryCache::new());
    storage.register_subscribers(vec![Arc::new(QueryCachePurger::new(queries.clone()))]);
    let svc = PolicyService::new(
        storage.clone(),
        runtime.clone(),
        queries.clone(),
        Arc::new(MemoryCache::new()),
    );

    let shutdown = CancellationToken::new();
    let watcher = {
        let storage = storage.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { storage.watch_changes(shutdown).await })
    };

    svc.evaluate(EvaluateRequest::new(example_id(), json!({})), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(queries.len(), 1);

    svc.lock(&example_id()).await.unwrap();
    for _ in 0..50 {
        if queries.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(queries.is_empty());

    svc.unlock(&example_id()).await.unwrap();
    svc.evaluate(EvaluateRequest::new(example_id(), json!({})), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(runtime.compiles(), 2);

    shutdown.cancel();
    watcher.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quickjs_allow_scenario() {
    let storage = seeded_storage(Policy::new(
        example_id(),
        r#"return { allow: input.msg === "yes" };"#,
    ))
    .await;
    let runtime = Arc::new(QuickJsRuntime::new(
        QuickJsConfig::default(),
        Arc::new(CapabilityRegistry::new()),
    ));
    let svc = service(storage, runtime, Arc::new(MemoryCache::new()));

    let out = svc
        .evaluate(
            EvaluateRequest::new(example_id(), json!({"msg": "yes"})),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(out.result, json!({"allow": true}));
    assert!(!out.etag.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quickjs_reads_static_data() {
    let storage = seeded_storage(
        Policy::new(example_id(), "return { allow: data.admins.includes(input.user) };")
            .with_data(r#"{"admins": ["ada"]}"#),
    )
    .await;
    let runtime = Arc::new(QuickJsRuntime::new(
        QuickJsConfig::default(),
        Arc::new(CapabilityRegistry::new()),
    ));
    let svc = service(storage, runtime, Arc::new(MemoryCache::new()));

    let out = svc
        .evaluate(
            EvaluateRequest::new(example_id(), json!({"user": "ada"})),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(out.result, json!({"allow": true}));
}
