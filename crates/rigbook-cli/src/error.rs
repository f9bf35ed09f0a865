use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] rigbook_core::Error),
    #[error(transparent)]
    Transport(#[from] rigbook_core::sync::TransportError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Background push failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("ID cannot be empty")]
    EmptyId,
    #[error("Invalid date '{0}': expected RFC 3339 or YYYY-MM-DD")]
    InvalidDate(String),
    #[error("Invalid checklist item '{0}': expected \"Section: Title\" or \"Title\"")]
    InvalidItem(String),
    #[error(
        "Sync is not configured. Set RIGBOOK_REMOTE_URL and RIGBOOK_REMOTE_TOKEN, or RIGBOOK_REMOTE_PATH for a shared database file."
    )]
    SyncNotConfigured,
}
