//! Error kinds surfaced by the instance data model, the supervisor, and the registry.

use thiserror::Error;

/// Errors that can occur while validating or mutating an [`crate::options::InstanceOptions`].
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("instance name must not be empty")]
    EmptyName,
    #[error("instance name `{0}` contains a path separator or control character")]
    InvalidName(String),
    #[error("host must not be empty")]
    EmptyHost,
}

/// Errors surfaced by [`crate::instance::Instance`] lifecycle operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("instance is already running")]
    AlreadyRunning,
    #[error("instance is not running")]
    NotRunning,
    #[error("instance has no options configured")]
    NoOptions,
    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to open log file: {0}")]
    LogFile(#[source] std::io::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Errors surfaced by [`crate::registry::Registry`] operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("instance `{0}` not found")]
    NotFound(String),
    #[error("instance `{0}` already exists")]
    AlreadyExists(String),
    #[error("instance `{0}` must be stopped before it can be deleted")]
    DeleteWhileRunning(String),
    #[error("global capacity of {max} running instances reached; no evictable candidate")]
    CapacityExceeded { max: usize },
    #[error("a start is already in progress for instance `{0}`")]
    StartInProgress(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}
