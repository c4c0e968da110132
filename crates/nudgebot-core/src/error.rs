//! Error taxonomy shared across NudgeBot crates.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NudgeError>;

#[derive(Debug, Error)]
pub enum NudgeError {
    /// Rejected input, raised before any side effect.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown job, task or record in an admin operation.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Messaging Gateway / network failure. `message` is the raw transport text.
    #[error("Transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("Responder error: {0}")]
    Responder(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// An engaged audit event already exists for this (channel, thread) key.
    #[error("Already engaged: {0}")]
    DuplicateEngagement(String),

    /// Unexpected failure (e.g. a panicking handler) caught at a task boundary.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NudgeError {
    /// Transport failure worth retrying (rate limits, 5xx, connection resets).
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Transport failure that retrying cannot fix (bad channel, revoked token).
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                retryable: true,
                ..
            } | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_message_is_preserved() {
        let err = NudgeError::transport_fatal("channel_not_found");
        assert!(err.to_string().contains("channel_not_found"));
        assert!(!err.is_retryable());
        assert!(NudgeError::transport("ratelimited").is_retryable());
        assert!(NudgeError::Timeout("send".into()).is_retryable());
        assert!(!NudgeError::Validation("p".into()).is_retryable());
    }
}
