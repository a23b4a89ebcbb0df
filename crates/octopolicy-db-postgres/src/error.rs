//! Errors raised by the PostgreSQL policy store.

use octopolicy_storage::StorageError;
use sqlx_core::error::Error as SqlxError;

#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    #[error("database error: {0}")]
    Database(#[from] SqlxError),

    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx_core::migrate::MigrateError),

    /// A NOTIFY payload that is not a change event.
    #[error("invalid change payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<PostgresError> for StorageError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Database(e) => query_error("database", e),
            PostgresError::Migration(e) => StorageError::internal(e.to_string()),
            PostgresError::Payload(e) => StorageError::invalid_data(e.to_string()),
        }
    }
}

/// `23505`, raised by the subscribers unique index.
pub(crate) fn is_unique_violation(err: &SqlxError) -> bool {
    matches!(err, SqlxError::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Pool and transport failures become connection errors so callers can tell
/// an unreachable database from a failing statement.
pub(crate) fn query_error(context: &str, err: SqlxError) -> StorageError {
    match err {
        SqlxError::Io(_) | SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Tls(_) => {
            StorageError::connection_error(format!("{context}: {err}"))
        }
        other => StorageError::internal(format!("{context}: {other}")),
    }
}

pub type Result<T> = std::result::Result<T, PostgresError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_connection_errors() {
        let err = query_error("get policy", SqlxError::PoolTimedOut);
        assert!(matches!(err, StorageError::ConnectionError { .. }));

        let err = query_error("get policy", SqlxError::RowNotFound);
        assert!(matches!(err, StorageError::Internal { .. }));
    }

    #[test]
    fn test_bad_payload_is_invalid_data() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: StorageError = PostgresError::from(err).into();
        assert!(matches!(err, StorageError::InvalidData { .. }));
    }
}
