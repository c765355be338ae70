//! Channel error type.

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors talking to the messaging platform.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Message send failed: {0}")]
    SendFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ChannelError> for relay_common::Error {
    fn from(err: ChannelError) -> Self {
        const SERVICE: &str = "whatsapp";
        match err {
            ChannelError::Auth(message) => Self::Unauthorized {
                service: SERVICE,
                message,
            },
            ChannelError::RateLimited { retry_after_secs } => Self::Throttled {
                service: SERVICE,
                retry_after_secs,
            },
            ChannelError::SendFailed(message) | ChannelError::Internal(message) => Self::Upstream {
                service: SERVICE,
                message,
            },
        }
    }
}
