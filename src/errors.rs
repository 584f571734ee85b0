use thiserror::Error;

/// Longest error text ever sent back to a client.
pub const MAX_USER_MESSAGE_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Device start error: {0}")]
    DeviceStart(String),
    #[error("Device stop error: {0}")]
    DeviceStop(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Delivery failure: {0}")]
    DeliveryFailure(String),
    #[error("Sink unavailable: {0}")]
    SinkUnavailable(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Server error: {0}")]
    Server(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    /// Client-safe rendering, truncated to [`MAX_USER_MESSAGE_LEN`] characters.
    pub fn user_message(&self) -> String {
        truncate_message(&self.to_string())
    }

    /// Local to one peer or one device; never stops the relay.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, RelayError::Server(_))
    }
}

pub(crate) fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_USER_MESSAGE_LEN {
        return message.to_string();
    }
    let mut out: String = message.chars().take(MAX_USER_MESSAGE_LEN - 3).collect();
    out.push_str("...");
    out
}
