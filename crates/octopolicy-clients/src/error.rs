use octopolicy_core::{Error, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Not found")]
    NotFound,

    #[error("Invalid response: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound) || matches!(self, Self::Status { status: 404, .. })
    }

    /// Remote status code, when the remote answered.
    pub fn remote_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::NotFound => Some(404),
            _ => None,
        }
    }
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        let kind = match &err {
            ClientError::InvalidConfig(_) => ErrorKind::Internal,
            ClientError::Request(e) if e.is_timeout() => ErrorKind::Timeout,
            ClientError::Request(_) => ErrorKind::ServiceUnavailable,
            ClientError::NotFound => ErrorKind::NotFound,
            ClientError::Status { status, .. } => match status {
                400 => ErrorKind::BadRequest,
                401 => ErrorKind::Unauthorized,
                403 => ErrorKind::Forbidden,
                404 => ErrorKind::NotFound,
                409 => ErrorKind::Exist,
                408 => ErrorKind::Timeout,
                503 => ErrorKind::ServiceUnavailable,
                _ => ErrorKind::Unknown,
            },
            ClientError::Decode(_) => ErrorKind::Unknown,
        };
        let message = err.to_string();
        Error::wrap(kind, message, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_status_maps_to_kind() {
        let err: Error = ClientError::status(403, "denied").into();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let err: Error = ClientError::status(502, "bad gateway").into();
        assert_eq!(err.kind(), ErrorKind::Unknown);

        let err: Error = ClientError::NotFound.into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_predicates() {
        assert!(ClientError::NotFound.is_not_found());
        assert!(ClientError::status(404, "").is_not_found());
        assert_eq!(ClientError::status(500, "x").remote_status(), Some(500));
        assert_eq!(ClientError::Decode("x".into()).remote_status(), None);
    }
}
