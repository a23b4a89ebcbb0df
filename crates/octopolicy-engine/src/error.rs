use octopolicy_clients::ClientError;
use thiserror::Error;

/// Errors raised by a capability function during evaluation.
///
/// Any of these aborts the whole evaluation; there is no partial result.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("unknown function {0}")]
    UnknownFunction(String),

    #[error("{function}: invalid argument: {message}")]
    InvalidArgument { function: String, message: String },

    #[error("remote call failed with status {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("remote call failed: {0}")]
    Call(String),

    #[error("evaluation cancelled")]
    Cancelled,
}

impl BridgeError {
    pub fn invalid_argument(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            function: function.into(),
            message: message.into(),
        }
    }

    pub fn remote_status(&self) -> Option<u16> {
        match self {
            Self::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<ClientError> for BridgeError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Status { status, message } => Self::Remote { status, message },
            ClientError::NotFound => Self::Remote {
                status: 404,
                message: "not found".into(),
            },
            other => Self::Call(other.to_string()),
        }
    }
}

/// Errors produced by a [`crate::PolicyRuntime`] or its prepared queries.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to initialize runtime: {0}")]
    Init(String),

    #[error("failed to compile module {module}: {message}")]
    Compile { module: String, message: String },

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("evaluation timed out after {0} ms")]
    Timeout(u64),

    #[error("evaluation exceeded its memory or stack limit")]
    ResourceLimit,

    #[error("evaluation cancelled")]
    Cancelled,

    #[error(transparent)]
    Capability(#[from] BridgeError),
}

impl RuntimeError {
    pub fn compile(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compile {
            module: module.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_status_becomes_remote() {
        let err: BridgeError = ClientError::status(502, "bad gateway").into();
        assert_eq!(err.remote_status(), Some(502));
        assert_eq!(
            err.to_string(),
            "remote call failed with status 502: bad gateway"
        );
    }

    #[test]
    fn test_client_not_found_keeps_status() {
        let err: BridgeError = ClientError::NotFound.into();
        assert_eq!(err.remote_status(), Some(404));
    }

    #[test]
    fn test_config_error_has_no_status() {
        let err: BridgeError = ClientError::InvalidConfig("no base url".into()).into();
        assert!(err.remote_status().is_none());
        assert!(err.to_string().contains("no base url"));
    }
}
