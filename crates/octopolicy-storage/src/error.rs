//! Storage error types for the policy store contract.

use octopolicy_core::{Error, ErrorKind};

/// Failures of a [`PolicyStorage`](crate::PolicyStorage) backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// `entity` is one of policy, subscriber, import config or data.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// A claim transaction could not complete.
    #[error("Transaction error: {message}")]
    TransactionError { message: String },

    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    /// The store was closed.
    #[error("storage is closed")]
    Closed,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StorageError {
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    #[must_use]
    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    #[must_use]
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn transaction_error(message: impl Into<String>) -> Self {
        Self::TransactionError {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        let kind = match &err {
            StorageError::NotFound { .. } => ErrorKind::NotFound,
            StorageError::AlreadyExists { .. } => ErrorKind::Exist,
            StorageError::InvalidData { .. } => ErrorKind::BadRequest,
            StorageError::ConnectionError { .. } | StorageError::Closed => {
                ErrorKind::ServiceUnavailable
            }
            StorageError::TransactionError { .. } | StorageError::Internal { .. } => {
                ErrorKind::Unknown
            }
        };
        let message = err.to_string();
        Error::wrap(kind, message, err)
    }
}
