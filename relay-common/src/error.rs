//! Failures that cross the relay's boundaries.
//!
//! Webhook handlers turn these into HTTP responses; delivery failures carry
//! them inside `anyhow::Error` so the session core can tell a throttled
//! platform from a broken one.

use crate::validation::ValidationError;
use thiserror::Error;

/// Relay boundary error.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    Config(#[from] ValidationError),

    /// `X-Hub-Signature-256` missing or wrong
    #[error("Invalid webhook signature")]
    BadSignature,

    /// Webhook body could not be read
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// An upstream service refused our credentials
    #[error("{service} rejected credentials: {message}")]
    Unauthorized { service: &'static str, message: String },

    /// An upstream service asked us to back off
    #[error("{service} throttled the relay, retry after {retry_after_secs}s")]
    Throttled {
        service: &'static str,
        retry_after_secs: u64,
    },

    /// An upstream service failed or returned garbage
    #[error("{service} failed: {message}")]
    Upstream { service: &'static str, message: String },
}

impl Error {
    /// HTTP status to answer with when this error ends a request.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::BadSignature => 401,
            Self::MalformedPayload(_) => 400,
            Self::Throttled { .. } => 429,
            Self::Unauthorized { .. } | Self::Upstream { .. } => 502,
            Self::Config(_) => 500,
        }
    }

    /// Whether retrying later can succeed without operator action.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::Upstream { .. })
    }
}
