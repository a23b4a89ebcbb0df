use octopolicy_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
