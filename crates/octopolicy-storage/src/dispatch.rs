//! Fan-out of policy change events to registered subscribers.
//!
//! Backends own one [`ChangeDispatcher`] and call [`ChangeDispatcher::dispatch`]
//! from their watch loop for every detected mutation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use octopolicy_core::PolicyChangeEvent;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::traits::PolicySubscriber;

/// Default timeout for a single subscriber call.
const DEFAULT_SUBSCRIBER_TIMEOUT: Duration = Duration::from_secs(30);

/// Registered subscribers plus the delivery policy.
pub struct ChangeDispatcher {
    subscribers: RwLock<Vec<Arc<dyn PolicySubscriber>>>,
    timeout: Duration,
}

impl ChangeDispatcher {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SUBSCRIBER_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            timeout,
        }
    }

    pub fn register(&self, subscribers: Vec<Arc<dyn PolicySubscriber>>) {
        let mut guard = self.subscribers.write();
        for sub in subscribers {
            debug!(subscriber = %sub.name(), "Registered policy subscriber");
            guard.push(sub);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Invoke every subscriber in registration order.
    ///
    /// Each call is isolated: a failure, timeout or panic is logged and the
    /// remaining subscribers still run. Returns the number of subscribers
    /// that completed successfully.
    pub async fn dispatch(&self, event: &PolicyChangeEvent) -> usize {
        let subscribers = self.subscribers.read().clone();
        let mut delivered = 0;

        for sub in subscribers {
            let result = tokio::time::timeout(
                self.timeout,
                AssertUnwindSafe(sub.policy_data_change(event)).catch_unwind(),
            )
            .await;

            match result {
                Ok(Ok(Ok(()))) => {
                    delivered += 1;
                    debug!(
                        subscriber = %sub.name(),
                        policy = %event.policy,
                        "Delivered policy change"
                    );
                }
                Ok(Ok(Err(e))) => {
                    warn!(
                        subscriber = %sub.name(),
                        repository = %event.policy.repository,
                        group = %event.policy.group,
                        name = %event.policy.name,
                        version = %event.policy.version,
                        error = %e,
                        "Policy subscriber failed"
                    );
                }
                Ok(Err(panic)) => {
                    let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "Unknown panic".to_string()
                    };
                    error!(
                        subscriber = %sub.name(),
                        policy = %event.policy,
                        panic = %panic_msg,
                        "Policy subscriber panicked"
                    );
                }
                Err(_) => {
                    error!(
                        subscriber = %sub.name(),
                        policy = %event.policy,
                        timeout_secs = self.timeout.as_secs(),
                        "Policy subscriber timed out"
                    );
                }
            }
        }

        delivered
    }
}

impl Default for ChangeDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChangeDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDispatcher")
            .field("subscribers", &self.subscriber_count())
            .field("timeout", &self.timeout)
            .finish()
    }
}
