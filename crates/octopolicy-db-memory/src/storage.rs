use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use octopolicy_core::{
    ImportConfig, Policy, PolicyChangeEvent, PolicyFilter, PolicyId, Subscriber,
};
use octopolicy_storage::{
    CLAIM_POSTPONE, ChangeDispatcher, PolicyStorage, PolicySubscriber, StorageError,
};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tuning knobs for the in-memory backend.
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Capacity of the change channel.
    pub channel_capacity: usize,
    /// How long a writer waits for room in the change channel before the
    /// event is dropped.
    pub send_timeout: Duration,
    /// How far a claim postpones an item.
    pub claim_postpone: Duration,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            send_timeout: Duration::from_secs(10),
            claim_postpone: CLAIM_POSTPONE,
        }
    }
}

/// In-process policy store.
///
/// Policies, subscribers, key/value storage and import configs each sit
/// behind an independent lock, so operations on one map never block another.
pub struct InMemoryStorage {
    policies: RwLock<HashMap<PolicyId, Policy>>,
    subscribers: RwLock<Vec<Subscriber>>,
    storage: RwLock<HashMap<String, Value>>,
    import_configs: RwLock<HashMap<String, ImportConfig>>,
    changes_tx: mpsc::Sender<PolicyChangeEvent>,
    /// Taken by the active watcher, put back when it stops.
    changes_rx: Mutex<Option<mpsc::Receiver<PolicyChangeEvent>>>,
    dispatcher: ChangeDispatcher,
    closed: CancellationToken,
    options: MemoryOptions,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_options(MemoryOptions::default())
    }

    pub fn with_options(options: MemoryOptions) -> Self {
        let (changes_tx, changes_rx) = mpsc::channel(options.channel_capacity.max(1));
        Self {
            policies: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            storage: RwLock::new(HashMap::new()),
            import_configs: RwLock::new(HashMap::new()),
            changes_tx,
            changes_rx: Mutex::new(Some(changes_rx)),
            dispatcher: ChangeDispatcher::new(),
            closed: CancellationToken::new(),
            options,
        }
    }

    /// Number of stored policies.
    pub async fn count(&self) -> usize {
        self.policies.read().await.len()
    }

    /// Queue a change event for the watcher. Called after the map lock is
    /// released; a full channel drops the event after the send timeout.
    async fn emit(&self, event: PolicyChangeEvent) {
        if self.closed.is_cancelled() {
            return;
        }
        let policy = event.policy.clone();
        match self
            .changes_tx
            .send_timeout(event, self.options.send_timeout)
            .await
        {
            Ok(()) => debug!(policy = %policy, "Queued policy change"),
            Err(e) => warn!(
                policy = %policy,
                error = %e,
                "Dropped policy change notification"
            ),
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.is_cancelled() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorage")
            .field("options", &self.options)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PolicyStorage for InMemoryStorage {
    async fn get_policy(&self, id: &PolicyId) -> Result<Policy, StorageError> {
        self.policies
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("policy", id.to_string()))
    }

    async fn save_policy(&self, mut policy: Policy) -> Result<Policy, StorageError> {
        policy.last_update = OffsetDateTime::now_utc();
        self.import_policy(policy).await
    }

    async fn import_policy(&self, policy: Policy) -> Result<Policy, StorageError> {
        self.ensure_open()?;
        self.policies
            .write()
            .await
            .insert(policy.id.clone(), policy.clone());
        self.emit(PolicyChangeEvent::updated(policy.id.clone())).await;
        Ok(policy)
    }

    async fn set_lock(&self, id: &PolicyId, locked: bool) -> Result<(), StorageError> {
        self.ensure_open()?;
        {
            let mut policies = self.policies.write().await;
            let policy = policies
                .get_mut(id)
                .ok_or_else(|| StorageError::not_found("policy", id.to_string()))?;
            policy.locked = locked;
            policy.last_update = OffsetDateTime::now_utc();
        }
        self.emit(PolicyChangeEvent::lock(id.clone())).await;
        Ok(())
    }

    async fn list_policies(&self, filter: PolicyFilter) -> Result<Vec<Policy>, StorageError> {
        let mut out: Vec<Policy> = self
            .policies
            .read()
            .await
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn claim_due_refresh_policies(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<Policy>, StorageError> {
        self.ensure_open()?;
        let postponed = now + self.options.claim_postpone;
        let mut policies = self.policies.write().await;
        let mut claimed = Vec::new();
        for policy in policies.values_mut() {
            if policy.refresh_due(now) {
                claimed.push(policy.clone());
                policy.next_data_refresh_time = Some(postponed);
            }
        }
        Ok(claimed)
    }

    async fn update_after_refresh(
        &self,
        id: &PolicyId,
        data: Option<String>,
        next: Option<OffsetDateTime>,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        let data_changed = data.is_some();
        {
            let mut policies = self.policies.write().await;
            let policy = policies
                .get_mut(id)
                .ok_or_else(|| StorageError::not_found("policy", id.to_string()))?;
            if let Some(data) = data {
                policy.data = Some(data);
                policy.last_update = OffsetDateTime::now_utc();
            }
            policy.next_data_refresh_time = next;
        }
        if data_changed {
            self.emit(PolicyChangeEvent::data(id.clone())).await;
        }
        Ok(())
    }

    async fn claim_due_import_configs(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<ImportConfig>, StorageError> {
        self.ensure_open()?;
        let mut configs = self.import_configs.write().await;
        let mut claimed = Vec::new();
        for config in configs.values_mut() {
            if config.import_due(now) {
                claimed.push(config.clone());
                config.next_import = now + config.interval;
                config.updated_at = now;
            }
        }
        Ok(claimed)
    }

    async fn save_import_config(
        &self,
        mut config: ImportConfig,
    ) -> Result<ImportConfig, StorageError> {
        self.ensure_open()?;
        if config.interval.is_zero() {
            return Err(StorageError::invalid_data("import interval must be positive"));
        }
        let mut configs = self.import_configs.write().await;
        if let Some(existing) = configs.get(&config.source_url) {
            config.created_at = existing.created_at;
        }
        config.updated_at = OffsetDateTime::now_utc();
        configs.insert(config.source_url.clone(), config.clone());
        Ok(config)
    }

    async fn list_import_configs(&self) -> Result<Vec<ImportConfig>, StorageError> {
        let mut out: Vec<ImportConfig> =
            self.import_configs.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.source_url.cmp(&b.source_url));
        Ok(out)
    }

    async fn add_subscriber(&self, subscriber: Subscriber) -> Result<Subscriber, StorageError> {
        self.ensure_open()?;
        let mut subscribers = self.subscribers.write().await;
        if subscribers.iter().any(|s| s.same_identity(&subscriber)) {
            return Err(StorageError::already_exists(
                "subscriber",
                format!("{}@{}", subscriber.name, subscriber.webhook_url),
            ));
        }
        subscribers.push(subscriber.clone());
        Ok(subscriber)
    }

    async fn get_subscribers(&self, policy: &PolicyId) -> Result<Vec<Subscriber>, StorageError> {
        Ok(self
            .subscribers
            .read()
            .await
            .iter()
            .filter(|s| &s.policy == policy)
            .cloned()
            .collect())
    }

    async fn get_data(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.storage.read().await.get(key).cloned())
    }

    async fn set_data(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.storage.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_data(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.storage.write().await.remove(key);
        Ok(())
    }

    fn register_subscribers(&self, subscribers: Vec<Arc<dyn PolicySubscriber>>) {
        self.dispatcher.register(subscribers);
    }

    async fn watch_changes(&self, shutdown: CancellationToken) -> Result<(), StorageError> {
        let mut rx = self
            .changes_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| StorageError::internal("change watcher is already running"))?;

        info!("Watching in-memory policy changes");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.closed.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        self.dispatcher.dispatch(&event).await;
                    }
                    None => break,
                },
            }
        }

        *self.changes_rx.lock().await = Some(rx);
        info!("Stopped watching in-memory policy changes");
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octopolicy_core::ChangeKind;
    use octopolicy_storage::SubscriberError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;

    fn id(name: &str) -> PolicyId {
        PolicyId::new("policies", "example", name, "1.0")
    }

    struct Recorder {
        events: std::sync::Mutex<Vec<PolicyChangeEvent>>,
        notify: tokio::sync::Notify,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: std::sync::Mutex::new(Vec::new()),
                notify: tokio::sync::Notify::new(),
            })
        }

        fn len(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PolicySubscriber for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn policy_data_change(&self, event: &PolicyChangeEvent) -> Result<(), SubscriberError> {
            self.events.lock().unwrap().push(event.clone());
            self.notify.notify_one();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_policy_crud() {
        let storage = InMemoryStorage::new();
        let err = storage.get_policy(&id("a")).await.unwrap_err();
        assert!(err.is_not_found());

        let saved = storage
            .save_policy(Policy::new(id("a"), "return {};"))
            .await
            .unwrap();
        assert_eq!(storage.get_policy(&id("a")).await.unwrap(), saved);
        assert_eq!(storage.count().await, 1);

        storage.set_lock(&id("a"), true).await.unwrap();
        assert!(storage.get_policy(&id("a")).await.unwrap().locked);

        let err = storage.set_lock(&id("missing"), true).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_policies_by_lock_state() {
        let storage = InMemoryStorage::new();
        storage.save_policy(Policy::new(id("a"), "")).await.unwrap();
        storage
            .save_policy(Policy::new(id("b"), "").locked(true))
            .await
            .unwrap();

        assert_eq!(storage.list_policies(PolicyFilter::all()).await.unwrap().len(), 2);
        let locked = storage.list_policies(PolicyFilter::locked(true)).await.unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].id, id("b"));
    }

    #[tokio::test]
    async fn test_claim_postpones_due_policies() {
        let storage = InMemoryStorage::new();
        let now = datetime!(2024-05-01 12:00 UTC);
        storage
            .save_policy(Policy::new(id("due"), "").with_next_refresh(datetime!(2024-05-01 11:00 UTC)))
            .await
            .unwrap();
        storage
            .save_policy(Policy::new(id("later"), "").with_next_refresh(datetime!(2024-05-01 13:00 UTC)))
            .await
            .unwrap();
        storage.save_policy(Policy::new(id("never"), "")).await.unwrap();

        let claimed = storage.claim_due_refresh_policies(now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id("due"));

        let stored = storage.get_policy(&id("due")).await.unwrap();
        assert_eq!(stored.next_data_refresh_time, Some(now + CLAIM_POSTPONE));

        // Second tick at the same instant claims nothing.
        assert!(storage.claim_due_refresh_policies(now).await.unwrap().is_empty());
        // Once the postpone period elapses the item is eligible again.
        let again = storage
            .claim_due_refresh_policies(now + CLAIM_POSTPONE)
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_exclusive() {
        let storage = Arc::new(InMemoryStorage::new());
        let now = OffsetDateTime::now_utc();
        storage
            .save_policy(Policy::new(id("due"), "").with_next_refresh(now))
            .await
            .unwrap();

        let total = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let storage = storage.clone();
            let total = total.clone();
            handles.push(tokio::spawn(async move {
                let claimed = storage.claim_due_refresh_policies(now).await.unwrap();
                total.fetch_add(claimed.len(), Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(total.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_after_refresh() {
        let storage = InMemoryStorage::new();
        let now = OffsetDateTime::now_utc();
        storage
            .save_policy(Policy::new(id("a"), "").with_next_refresh(now))
            .await
            .unwrap();

        storage
            .update_after_refresh(&id("a"), Some(r#"{"k":1}"#.into()), Some(now + Duration::from_secs(3600)))
            .await
            .unwrap();
        let p = storage.get_policy(&id("a")).await.unwrap();
        assert_eq!(p.data.as_deref(), Some(r#"{"k":1}"#));
        assert_eq!(p.next_data_refresh_time, Some(now + Duration::from_secs(3600)));

        storage.update_after_refresh(&id("a"), None, None).await.unwrap();
        let p = storage.get_policy(&id("a")).await.unwrap();
        assert_eq!(p.data.as_deref(), Some(r#"{"k":1}"#));
        assert_eq!(p.next_data_refresh_time, None);
    }

    #[tokio::test]
    async fn test_import_config_claims() {
        let storage = InMemoryStorage::new();
        let now = OffsetDateTime::now_utc();
        let mut cfg = ImportConfig::new("https://bundles.example.com/a.tar", Duration::from_secs(600));
        cfg.next_import = now;
        storage.save_import_config(cfg).await.unwrap();

        let claimed = storage.claim_due_import_configs(now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(storage.claim_due_import_configs(now).await.unwrap().is_empty());

        let configs = storage.list_import_configs().await.unwrap();
        assert_eq!(configs[0].next_import, now + Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_zero_import_interval_is_rejected() {
        let storage = InMemoryStorage::new();
        let cfg = ImportConfig::new("https://bundles.example.com/a.tar", Duration::ZERO);
        let err = storage.save_import_config(cfg).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidData { .. }));
        assert!(storage.list_import_configs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_keeps_last_update() {
        let storage = InMemoryStorage::new();
        let published = datetime!(2025-03-01 12:00 UTC);
        let mut policy = Policy::new(id("a"), "return {};");
        policy.last_update = published;

        assert_eq!(storage.import_policy(policy.clone()).await.unwrap().last_update, published);
        assert_eq!(storage.get_policy(&id("a")).await.unwrap().last_update, published);

        let resaved = storage.save_policy(policy).await.unwrap();
        assert!(resaved.last_update > published);
    }

    #[tokio::test]
    async fn test_subscribers() {
        let storage = InMemoryStorage::new();
        let sub = Subscriber::new(id("a"), "https://hooks.example.com", "billing");
        storage.add_subscriber(sub.clone()).await.unwrap();
        let err = storage.add_subscriber(sub).await.unwrap_err();
        assert!(err.is_already_exists());

        assert_eq!(storage.get_subscribers(&id("a")).await.unwrap().len(), 1);
        assert!(storage.get_subscribers(&id("b")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_value_storage() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.get_data("k").await.unwrap(), None);
        storage.set_data("k", serde_json::json!({"v": 1})).await.unwrap();
        assert_eq!(
            storage.get_data("k").await.unwrap(),
            Some(serde_json::json!({"v": 1}))
        );
        storage.delete_data("k").await.unwrap();
        storage.delete_data("k").await.unwrap();
        assert_eq!(storage.get_data("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_watch_delivers_mutations() {
        let storage = Arc::new(InMemoryStorage::new());
        let recorder = Recorder::new();
        storage.register_subscribers(vec![recorder.clone()]);

        let shutdown = CancellationToken::new();
        let watcher = {
            let storage = storage.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { storage.watch_changes(shutdown).await })
        };

        storage.save_policy(Policy::new(id("a"), "")).await.unwrap();
        storage.set_lock(&id("a"), true).await.unwrap();
        storage
            .update_after_refresh(&id("a"), Some("{}".into()), None)
            .await
            .unwrap();
        // Claims and schedule-only updates do not notify.
        storage.update_after_refresh(&id("a"), None, None).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.len() < 3 {
                recorder.notify.notified().await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        watcher.await.unwrap().unwrap();

        let kinds: Vec<_> = recorder
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![ChangeKind::Updated, ChangeKind::Lock, ChangeKind::Data]);
    }

    #[tokio::test]
    async fn test_close_stops_watcher_and_writes() {
        let storage = Arc::new(InMemoryStorage::new());
        let watcher = {
            let storage = storage.clone();
            tokio::spawn(async move { storage.watch_changes(CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        storage.close().await;
        watcher.await.unwrap().unwrap();

        let err = storage.save_policy(Policy::new(id("a"), "")).await.unwrap_err();
        assert!(matches!(err, StorageError::Closed));
    }

    #[tokio::test]
    async fn test_full_channel_drops_event() {
        let storage = InMemoryStorage::with_options(MemoryOptions {
            channel_capacity: 1,
            send_timeout: Duration::from_millis(10),
            ..MemoryOptions::default()
        });
        storage.save_policy(Policy::new(id("a"), "")).await.unwrap();
        // No watcher is draining; the second write still completes.
        storage.set_lock(&id("a"), true).await.unwrap();
        assert!(storage.get_policy(&id("a")).await.unwrap().locked);
    }
}
