use async_trait::async_trait;
use octopolicy_core::PolicyChangeEvent;

use crate::error::NotificationError;

/// Outbound channel for policy change events.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, event: &PolicyChangeEvent) -> Result<(), NotificationError>;
}
