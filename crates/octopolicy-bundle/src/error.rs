use octopolicy_clients::ClientError;
use octopolicy_core::{Error, ErrorKind};
use octopolicy_storage::StorageError;
use thiserror::Error;

/// Errors raised while fetching a JWK set.
#[derive(Debug, Error)]
pub enum JwksError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error: status {0}")]
    Http(u16),

    #[error("Failed to parse JWKS: {0}")]
    Parse(String),

    #[error("JWKS fetch for {0} is rate limited")]
    RateLimited(String),

    #[error("JWKS response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge { max_size: usize },
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("invalid bundle format: {0}")]
    Format(String),

    #[error("bundle io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bundle metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("policy has no export configuration")]
    MissingExportConfig,

    #[error("error fetching public key: {0}")]
    Jwks(#[from] JwksError),

    #[error("expected exactly one public key, found {0}")]
    KeyCount(usize),

    #[error("unsupported key type {0}")]
    UnsupportedKeyType(String),

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("bundle signature verification failed: {0}")]
    Verification(String),

    #[error("error signing bundle: {0}")]
    Signer(#[source] ClientError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl BundleError {
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn verification(msg: impl Into<String>) -> Self {
        Self::Verification(msg.into())
    }

    pub fn is_verification(&self) -> bool {
        matches!(self, Self::Verification(_))
    }
}

impl From<BundleError> for Error {
    fn from(err: BundleError) -> Self {
        let kind = match &err {
            BundleError::Format(_)
            | BundleError::Metadata(_)
            | BundleError::MissingExportConfig
            | BundleError::KeyCount(_)
            | BundleError::UnsupportedKeyType(_)
            | BundleError::InvalidKey(_)
            | BundleError::Verification(_) => ErrorKind::BadRequest,
            BundleError::Io(_) => ErrorKind::Internal,
            BundleError::Jwks(_) => ErrorKind::ServiceUnavailable,
            BundleError::Signer(_) => ErrorKind::Unknown,
            BundleError::Storage(StorageError::NotFound { .. }) => ErrorKind::NotFound,
            BundleError::Storage(_) => ErrorKind::Unknown,
        };
        let message = err.to_string();
        Error::wrap(kind, message, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let err: Error = BundleError::verification("bad signature").into();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let err: Error = BundleError::Jwks(JwksError::Http(500)).into();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);

        let err: Error = BundleError::Storage(StorageError::not_found("policy", "a/b/c/1")).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_key_count_message() {
        assert_eq!(
            BundleError::KeyCount(0).to_string(),
            "expected exactly one public key, found 0"
        );
    }
}
