//! Configuration management for the chat relay.
//!
//! The relay reads a single configuration file at `~/.chatrelay/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (RELAY_* prefix and provider-specific keys)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `RELAY_PORT` → server.port
//! - `RELAY_BIND_ADDRESS` → server.host
//! - `RELAY_LOG_LEVEL` → observability.log_level
//! - `RELAY_LLM_MODEL` → llm.model
//! - `OPENAI_API_KEY` → llm.api_key
//! - `WHATSAPP_ACCESS_TOKEN` → whatsapp.access_token
//! - `WHATSAPP_PHONE_NUMBER_ID` → whatsapp.phone_number_id
//! - `WHATSAPP_VERIFY_TOKEN` → whatsapp.verify_token
//! - `WHATSAPP_APP_SECRET` → whatsapp.app_secret

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".chatrelay"),
        |dirs| dirs.home_dir().join(".chatrelay"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Server Configuration
// ============================================================================

/// HTTP listener configuration for the webhook server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address. Default: "127.0.0.1" (local only)
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    4431
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Per-user conversation state limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Admitted requests per user per rolling minute
    #[serde(default = "default_per_minute_limit")]
    pub per_minute_limit: usize,

    /// Admitted requests per user per rolling hour
    #[serde(default = "default_per_hour_limit")]
    pub per_hour_limit: usize,

    /// Hard cap on stored turns per user
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Most recent turns sent verbatim to the model
    #[serde(default = "default_recent_raw_limit")]
    pub recent_raw_limit: usize,

    /// Tracked users before the oldest ones are evicted
    #[serde(default = "default_max_tracked_users")]
    pub max_tracked_users: usize,

    /// Idle time after which a user's state is swept
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,

    /// Interval between staleness sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Fixed system instruction leading every model prompt
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Sent when the model backend fails
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,

    /// Sent when a user is throttled
    #[serde(default = "default_rate_limited_reply")]
    pub rate_limited_reply: String,
}

impl SessionConfig {
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            per_minute_limit: default_per_minute_limit(),
            per_hour_limit: default_per_hour_limit(),
            history_limit: default_history_limit(),
            recent_raw_limit: default_recent_raw_limit(),
            max_tracked_users: default_max_tracked_users(),
            stale_threshold_secs: default_stale_threshold_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            system_prompt: default_system_prompt(),
            fallback_reply: default_fallback_reply(),
            rate_limited_reply: default_rate_limited_reply(),
        }
    }
}

fn default_per_minute_limit() -> usize {
    6
}

fn default_per_hour_limit() -> usize {
    60
}

fn default_history_limit() -> usize {
    100
}

fn default_recent_raw_limit() -> usize {
    50
}

fn default_max_tracked_users() -> usize {
    500
}

fn default_stale_threshold_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    30 * 60
}

fn default_system_prompt() -> String {
    "You are a helpful assistant chatting over WhatsApp. \
     Keep answers short, friendly and plain-text."
        .into()
}

fn default_fallback_reply() -> String {
    "Sorry, I couldn't come up with a reply right now. Please try again in a moment.".into()
}

fn default_rate_limited_reply() -> String {
    "You're sending messages too quickly. Please wait a little before trying again.".into()
}

// ============================================================================
// LLM Configuration
// ============================================================================

/// OpenAI-compatible model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API base URL (without `/v1/chat/completions`)
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// API key
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model identifier
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Sampling temperature for replies
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: None,
            model: default_llm_model(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com".into()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".into()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_llm_timeout() -> u64 {
    60
}

// ============================================================================
// WhatsApp Configuration
// ============================================================================

/// WhatsApp Business Cloud API credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Graph API access token
    #[serde(default)]
    pub access_token: Option<String>,

    /// Sending phone number ID
    #[serde(default)]
    pub phone_number_id: Option<String>,

    /// Token echoed during the webhook verification handshake
    #[serde(default)]
    pub verify_token: Option<String>,

    /// App secret for X-Hub-Signature-256 verification
    #[serde(default)]
    pub app_secret: Option<String>,

    /// Allowed sender numbers in E.164 format ("*" = anyone)
    #[serde(default = "default_allowed_numbers")]
    pub allowed_numbers: Vec<String>,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            access_token: None,
            phone_number_id: None,
            verify_token: None,
            app_secret: None,
            allowed_numbers: default_allowed_numbers(),
        }
    }
}

fn default_allowed_numbers() -> Vec<String> {
    vec!["*".into()]
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub whatsapp: WhatsAppConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("RELAY_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(host) = lookup("RELAY_BIND_ADDRESS") {
            self.server.host = host;
        }
        if let Some(level) = lookup("RELAY_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(model) = lookup("RELAY_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(token) = lookup("WHATSAPP_ACCESS_TOKEN") {
            self.whatsapp.access_token = Some(token);
        }
        if let Some(id) = lookup("WHATSAPP_PHONE_NUMBER_ID") {
            self.whatsapp.phone_number_id = Some(id);
        }
        if let Some(token) = lookup("WHATSAPP_VERIFY_TOKEN") {
            self.whatsapp.verify_token = Some(token);
        }
        if let Some(secret) = lookup("WHATSAPP_APP_SECRET") {
            self.whatsapp.app_secret = Some(secret);
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}
