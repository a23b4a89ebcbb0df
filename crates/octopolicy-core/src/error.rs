use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classification of service errors.
///
/// The kind survives JSON round-trips between services and maps to a
/// transport status code through [`ErrorKind::status_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    Exist,
    NotFound,
    Timeout,
    Internal,
    ServiceUnavailable,
    Unknown,
}

impl ErrorKind {
    /// HTTP status code used when the error crosses the transport boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::Exist => 409,
            Self::NotFound => 404,
            Self::Timeout => 408,
            Self::Internal => 500,
            Self::ServiceUnavailable => 503,
            Self::Unknown => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::Exist => "exist",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service-level error.
///
/// Every error carries a random identifier for correlating log lines across
/// services, a [`ErrorKind`], a human readable message and an optional cause.
pub struct Error {
    id: String,
    kind: ErrorKind,
    message: String,
    cause: Option<BoxError>,
}

impl Error {
    /// Create a new error with a fresh identifier.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap `cause` with additional context.
    ///
    /// When the cause is itself an [`Error`] with a kind other than
    /// [`ErrorKind::Unknown`], its kind and identifier are kept and `kind`
    /// is ignored. Any other cause is re-kinded to `kind`.
    pub fn wrap(kind: ErrorKind, message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        let cause = cause.into();
        let (kind, id) = match cause.downcast_ref::<Error>() {
            Some(inner) if inner.kind != ErrorKind::Unknown => (inner.kind, inner.id.clone()),
            Some(inner) => (kind, inner.id.clone()),
            None => (kind, Uuid::new_v4().to_string()),
        };
        Self {
            id,
            kind,
            message: message.into(),
            cause: Some(cause),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn exist(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exist, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn is_not_found(&self) -> bool {
        self.is(ErrorKind::NotFound)
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.message, cause),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[derive(Serialize, Deserialize)]
struct ErrorBody {
    id: String,
    kind: ErrorKind,
    message: String,
}

impl Serialize for Error {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ErrorBody {
            id: self.id.clone(),
            kind: self.kind,
            message: self.message.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Error {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let body = ErrorBody::deserialize(deserializer)?;
        Ok(Self {
            id: body.id,
            kind: body.kind,
            message: body.message,
            cause: None,
        })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::wrap(ErrorKind::BadRequest, "invalid json", err)
    }
}

/// Convenience result type for service operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (ErrorKind::BadRequest, 400),
            (ErrorKind::Unauthorized, 401),
            (ErrorKind::Forbidden, 403),
            (ErrorKind::Exist, 409),
            (ErrorKind::NotFound, 404),
            (ErrorKind::Timeout, 408),
            (ErrorKind::Internal, 500),
            (ErrorKind::ServiceUnavailable, 503),
            (ErrorKind::Unknown, 500),
        ];
        for (kind, status) in cases {
            assert_eq!(kind.status_code(), status, "{kind}");
        }
    }

    #[test]
    fn test_wrap_keeps_deliberate_kind() {
        let inner = Error::not_found("policy not found");
        let inner_id = inner.id().to_string();
        let err = Error::wrap(ErrorKind::Internal, "error getting policy", inner);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.id(), inner_id);
        assert_eq!(err.to_string(), "error getting policy: policy not found");
    }

    #[test]
    fn test_wrap_rekinds_unknown() {
        let inner = Error::unknown("connection reset");
        let err = Error::wrap(ErrorKind::Internal, "error locking policy", inner);
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_wrap_foreign_cause() {
        let io = std::io::Error::other("disk gone");
        let err = Error::wrap(ErrorKind::ServiceUnavailable, "store failed", io);
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_json_round_trip_keeps_kind_and_id() {
        let err = Error::forbidden("policy is locked");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "forbidden");
        assert_eq!(json["message"], "policy is locked");

        let back: Error = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), ErrorKind::Forbidden);
        assert_eq!(back.id(), err.id());
        assert_eq!(back.message(), "policy is locked");
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Error::internal("a");
        let b = Error::internal("a");
        assert_ne!(a.id(), b.id());
    }
}
