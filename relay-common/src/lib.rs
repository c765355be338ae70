//! Relay Common - Shared types and utilities for the chat relay.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Boundary error type
//! - Logging setup

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::{
    Config, LlmConfig, ObservabilityConfig, ServerConfig, SessionConfig, WhatsAppConfig,
};
pub use error::Error;
pub use validation::{Validate, ValidationError, ValidationResult};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{Config, SessionConfig};
    pub use crate::error::Error;
    pub use crate::logging::init_logging;
    pub use crate::validation::{Validate, ValidationError};
}
