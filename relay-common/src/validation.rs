//! Configuration validation for the chat relay.
//!
//! Ensures limits are positive and mutually consistent before any
//! store is built from them.

use thiserror::Error;

use crate::config::{Config, ObservabilityConfig, ServerConfig, SessionConfig, WhatsAppConfig};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid port {port}: must be between 1 and 65535")]
    InvalidPort { port: u16, field: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Configuration conflict: {reason}")]
    Conflict { reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors: Vec<ValidationError> = [
            self.server.validate(),
            self.session.validate(),
            self.whatsapp.validate(),
            self.observability.validate(),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }

    /// Load, apply environment overrides, and validate configuration.
    pub fn load_and_validate() -> anyhow::Result<Self> {
        let config = Self::load_with_env()?;
        config.validate().map_err(crate::Error::from)?;
        Ok(config)
    }
}

impl Validate for ServerConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort {
                port: self.port,
                field: "server.port".into(),
            });
        }
        Ok(())
    }
}

fn positive(value: u64, field: &str) -> ValidationResult<()> {
    if value == 0 {
        return Err(ValidationError::InvalidValue {
            field: field.into(),
            reason: "must be greater than 0".into(),
        });
    }
    Ok(())
}

impl Validate for SessionConfig {
    fn validate(&self) -> ValidationResult<()> {
        positive(self.per_minute_limit as u64, "session.per_minute_limit")?;
        positive(self.per_hour_limit as u64, "session.per_hour_limit")?;
        positive(self.history_limit as u64, "session.history_limit")?;
        positive(self.recent_raw_limit as u64, "session.recent_raw_limit")?;
        positive(self.max_tracked_users as u64, "session.max_tracked_users")?;
        positive(self.stale_threshold_secs, "session.stale_threshold_secs")?;
        positive(self.sweep_interval_secs, "session.sweep_interval_secs")?;

        if self.recent_raw_limit > self.history_limit {
            return Err(ValidationError::Conflict {
                reason: format!(
                    "session.recent_raw_limit ({}) exceeds session.history_limit ({})",
                    self.recent_raw_limit, self.history_limit
                ),
            });
        }

        if self.per_minute_limit > self.per_hour_limit {
            return Err(ValidationError::Conflict {
                reason: format!(
                    "session.per_minute_limit ({}) exceeds session.per_hour_limit ({})",
                    self.per_minute_limit, self.per_hour_limit
                ),
            });
        }

        if self.system_prompt.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "session.system_prompt".into(),
            });
        }

        Ok(())
    }
}

impl Validate for WhatsAppConfig {
    fn validate(&self) -> ValidationResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let required = [
            (&self.access_token, "whatsapp.access_token"),
            (&self.phone_number_id, "whatsapp.phone_number_id"),
            (&self.verify_token, "whatsapp.verify_token"),
        ];
        for (value, field) in required {
            if value.as_deref().map_or(true, str::is_empty) {
                return Err(ValidationError::MissingField {
                    field: field.into(),
                });
            }
        }

        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.observability.log_level = "loud".into();
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ValidationError::InvalidValue { ref field, .. }) if field == "observability.log_level"
        ));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let mut config = Config::default();
        config.session.per_minute_limit = 0;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidValue { ref field, .. }) if field == "session.per_minute_limit"
        ));
    }

    #[test]
    fn test_recent_window_larger_than_history() {
        let mut config = Config::default();
        config.session.recent_raw_limit = 150;
        match config.validate() {
            Err(ValidationError::Conflict { reason }) => {
                assert!(reason.contains("recent_raw_limit"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_whatsapp_enabled_without_tokens() {
        let mut config = Config::default();
        config.whatsapp.enabled = true;
        config.whatsapp.access_token = Some("token".into());
        assert!(matches!(
            config.validate(),
            Err(ValidationError::MissingField { ref field }) if field == "whatsapp.phone_number_id"
        ));
    }

    #[test]
    fn test_multiple_errors_collected() {
        let mut config = Config::default();
        config.server.port = 0;
        config.observability.log_format = "xml".into();
        match config.validate() {
            Err(ValidationError::Multiple(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }
}
