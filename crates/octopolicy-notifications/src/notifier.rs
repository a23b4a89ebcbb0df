use std::sync::Arc;

use async_trait::async_trait;
use octopolicy_core::PolicyChangeEvent;
use octopolicy_storage::{PolicySubscriber, SubscriberError};
use tracing::{debug, warn};

use crate::transport::NotificationTransport;

/// Change subscriber that forwards every event to the configured transports.
///
/// All transports are attempted for each event. The first failure is
/// reported back to the watch loop after the rest have run.
pub struct ChangeNotifier {
    transports: Vec<Arc<dyn NotificationTransport>>,
}

impl ChangeNotifier {
    pub fn new(transports: Vec<Arc<dyn NotificationTransport>>) -> Self {
        Self { transports }
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

#[async_trait]
impl PolicySubscriber for ChangeNotifier {
    fn name(&self) -> &str {
        "change-notifier"
    }

    async fn policy_data_change(&self, event: &PolicyChangeEvent) -> Result<(), SubscriberError> {
        let mut first_error = None;
        for transport in &self.transports {
            match transport.send(event).await {
                Ok(()) => debug!(
                    transport = transport.name(),
                    repository = %event.policy.repository,
                    group = %event.policy.group,
                    name = %event.policy.name,
                    version = %event.policy.version,
                    "Forwarded change event"
                ),
                Err(e) => {
                    warn!(
                        transport = transport.name(),
                        policy = %event.policy,
                        error = %e,
                        "Forwarding change event failed"
                    );
                    first_error.get_or_insert(SubscriberError::network(format!(
                        "{}: {e}",
                        transport.name()
                    )));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
