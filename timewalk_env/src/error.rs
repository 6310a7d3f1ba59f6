//! Error types for the TimeWalk environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The receiving end of a tracking channel was dropped
    #[error("Tracking source closed")]
    SourceClosed,

    /// Event could not be delivered (buffer full, etc.)
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Host reported an event that cannot describe a physical pose
    #[error("Invalid tracking event: {0}")]
    InvalidEvent(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a send error.
    pub fn send(msg: impl Into<String>) -> Self {
        Self::SendFailed(msg.into())
    }

    /// Creates an invalid-event error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidEvent(msg.into())
    }
}
