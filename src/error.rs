//! Engine error taxonomy

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("A session is already running")]
    AlreadyRunning,
    #[error("No session is running")]
    NotRunning,
    #[error("Failed to spawn session: {0}")]
    Spawn(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Short machine-readable code used in `error` events on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::AlreadyRunning => "already_running",
            EngineError::NotRunning => "not_running",
            EngineError::Spawn(_) => "spawn_failed",
            EngineError::Io(_) => "io_error",
        }
    }
}
