use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Delivery to {url} rejected with status {status}")]
    Rejected { url: String, status: u16 },

    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Redis publish error: {0}")]
    Publish(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Subscriber lookup failed: {0}")]
    Storage(#[from] octopolicy_storage::StorageError),
}

impl NotificationError {
    pub fn send_failed(msg: impl Into<String>) -> Self {
        Self::SendFailed(msg.into())
    }
}
