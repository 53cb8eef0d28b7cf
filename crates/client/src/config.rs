//! Configuration management for the nobody-call client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/nobody-chat/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call::webrtc::IceServer;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("relay url must start with ws:// or wss://, got {0}")]
    InvalidRelayUrl(String),

    #[error("handshake_timeout_secs must be between 1 and 300, got {0}")]
    InvalidHandshakeTimeout(u64),

    #[error("request_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidRequestTimeout(u64),

    #[error("ice server entry has no urls")]
    EmptyIceServer,

    #[error("ice url must start with stun:, turn: or turns:, got {0}")]
    InvalidIceUrl(String),

    #[error("turn server {0} requires both username and credential")]
    IncompleteTurnServer(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default public STUN server.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Main configuration structure for the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General client configuration.
    pub client: ClientConfig,

    /// Relay connection configuration.
    pub relay: RelayConfig,

    /// ICE servers handed to every peer connection.
    pub ice: IceConfig,

    /// Call negotiation configuration.
    pub call: CallConfig,
}

/// General client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Relay connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket URL of the relay.
    pub url: String,

    /// Seconds to wait for the peer public key and the assigned identity.
    pub handshake_timeout_secs: u64,
}

/// ICE server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IceConfig {
    /// STUN and TURN servers.
    pub servers: Vec<IceServer>,
}

/// Call negotiation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    /// Seconds an outgoing request waits for an answer before giving up.
    pub request_timeout_secs: u64,

    /// Accept incoming requests without prompting.
    pub auto_accept: bool,

    /// Whether local media may be captured. When false every acquisition
    /// is reported as a permission denial.
    pub allow_media: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            handshake_timeout_secs: 10,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            auto_accept: false,
            allow_media: true,
        }
    }
}

impl RelayConfig {
    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl CallConfig {
    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nobody-chat")
        .join("config.toml")
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - NOBODY_RELAY_URL: Override relay URL
    /// - NOBODY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - NOBODY_TURN_URL, NOBODY_TURN_USERNAME, NOBODY_TURN_CREDENTIAL: add a
    ///   TURN server in front of the configured ones
    ///
    /// Returns the names of the variables that were applied. Nothing is
    /// logged here since this usually runs before the subscriber exists.
    pub fn apply_env_overrides(&mut self) -> Vec<&'static str> {
        let mut applied = Vec::new();

        if let Some(url) = non_empty_env("NOBODY_RELAY_URL") {
            self.relay.url = url;
            applied.push("NOBODY_RELAY_URL");
        }

        if let Some(level) = non_empty_env("NOBODY_LOG_LEVEL") {
            self.client.log_level = level;
            applied.push("NOBODY_LOG_LEVEL");
        }

        if let Some(url) = non_empty_env("NOBODY_TURN_URL") {
            let server = IceServer {
                urls: vec![url],
                username: non_empty_env("NOBODY_TURN_USERNAME"),
                credential: non_empty_env("NOBODY_TURN_CREDENTIAL"),
            };
            self.ice.servers.insert(0, server);
            applied.push("NOBODY_TURN_URL");
        }

        applied
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.relay.url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidRelayUrl(url.clone()));
        }

        let handshake = self.relay.handshake_timeout_secs;
        if handshake == 0 || handshake > 300 {
            return Err(ConfigError::InvalidHandshakeTimeout(handshake));
        }

        let request = self.call.request_timeout_secs;
        if request == 0 || request > 3600 {
            return Err(ConfigError::InvalidRequestTimeout(request));
        }

        for server in &self.ice.servers {
            if server.urls.is_empty() {
                return Err(ConfigError::EmptyIceServer);
            }
            for url in &server.urls {
                let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
                if !is_turn && !url.starts_with("stun:") {
                    return Err(ConfigError::InvalidIceUrl(url.clone()));
                }
                if is_turn && (server.username.is_none() || server.credential.is_none()) {
                    return Err(ConfigError::IncompleteTurnServer(url.clone()));
                }
            }
        }

        let level = self.client.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.client.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
