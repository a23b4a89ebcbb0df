//! Policy change feed over PostgreSQL LISTEN/NOTIFY.
//!
//! The `policies` table triggers publish a JSON payload on
//! [`POLICY_CHANNEL`] for every insert and content update. The payload has
//! the same shape as [`PolicyChangeEvent`].

use octopolicy_core::PolicyChangeEvent;
use octopolicy_storage::ChangeDispatcher;
use sqlx_postgres::{PgListener, PgPool};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Channel for policy change notifications.
pub const POLICY_CHANNEL: &str = "octopolicy_policy_changes";

/// Parse a NOTIFY payload into a change event.
pub fn parse_payload(payload: &str) -> Result<PolicyChangeEvent> {
    Ok(serde_json::from_str(payload)?)
}

/// Connect, listen and dispatch until the connection fails.
///
/// Returns only with an error; the caller decides whether to reconnect.
pub(crate) async fn listen_loop(pool: &PgPool, dispatcher: &ChangeDispatcher) -> Result<()> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(POLICY_CHANNEL).await?;

    info!(channel = POLICY_CHANNEL, "Listening for policy changes");

    loop {
        let notification = listener.recv().await?;
        let payload = notification.payload();

        debug!(payload = %payload, "Received NOTIFY");

        match parse_payload(payload) {
            Ok(event) => {
                dispatcher.dispatch(&event).await;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %payload,
                    "Failed to parse NOTIFY payload"
                );
            }
        }
    }
}
