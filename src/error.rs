use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task '{task_id}' cannot be routed: {reason}")]
    Routing { task_id: String, reason: String },

    #[error("Provider not available: {0}")]
    ProviderNotAvailable(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is held by a running orchestrator: {0}")]
    SessionLocked(String),

    #[error("Checkpoint write failed: {0}")]
    Checkpoint(String),
}

pub type Result<T> = std::result::Result<T, Error>;
