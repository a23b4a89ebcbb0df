//! # octopolicy-notifications
//!
//! Outbound notification of policy changes. [`ChangeNotifier`] is registered
//! with the store as a change subscriber and forwards each event to its
//! transports: [`WebhookTransport`] posts to the subscribers registered for
//! the policy, [`RedisPublisher`] publishes on an event-bus channel.

pub mod error;
pub mod notifier;
pub mod redis;
pub mod transport;
pub mod webhook;

pub use error::NotificationError;
pub use notifier::ChangeNotifier;
pub use redis::{RedisConfig, RedisPublisher};
pub use transport::NotificationTransport;
pub use webhook::{SIGNATURE_HEADER, WebhookConfig, WebhookPayload, WebhookTransport, sign_payload};
