use std::time::Duration;

use thiserror::Error;

/// Fatal conditions of a recognition session.
///
/// None of these are retried inside the session; retry policy, if any,
/// belongs to the caller.
#[derive(Debug, Clone, Error)]
pub enum AsrError {
    #[error("Failed to connect to ASR endpoint: {0}")]
    Connect(String),
    #[error("No task-started acknowledgment within {0:?}")]
    TaskStartTimeout(Duration),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Remote task failed: {code}: {message}")]
    RemoteTaskFailure { code: String, message: String },
    #[error("Transport closed unexpectedly")]
    TransportClosed,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Session is closed")]
    SessionClosed,
    #[error("Configuration error: {0}")]
    Config(String),
}
