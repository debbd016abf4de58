//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (HOST, PORT)
//! 2. Environment variables (APP_SERVER__PORT, APP_RELAY__STOP_TIMEOUT_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::provider::RecognitionOptions;
use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables
use std::time::Duration;

/// Main relay configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, relay, recognition, azure)
/// keeps transport settings apart from engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub recognition: RecognitionOptions,
    pub azure: AzureConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (mobile clients on the LAN)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
    pub shutdown_timeout_secs: u64,
}

/// Per-connection relay behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Language tag used when a `config` command leaves `language` out
    pub default_language: String,
    /// Upper bound on provider stop and on waiting for its completion signal
    pub stop_timeout_ms: u64,
    /// Capacity of the ordered outbound event queue of each session
    pub event_queue_capacity: usize,
    /// Upgrades beyond this many live sessions are refused with 503
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_frame_bytes: usize,
}

/// Azure Speech service location.
///
/// `endpoint_template` must contain `{region}`, which is replaced by the region
/// the client sends in its `config` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureConfig {
    pub endpoint_template: String,
    pub connect_timeout_ms: u64,
}

impl RelayConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl AzureConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the relay can start even if no configuration file exists.
/// The port and recognition tuning match what existing mobile clients expect.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                shutdown_timeout_secs: 10,
            },
            relay: RelayConfig {
                default_language: "en-US".to_string(),
                stop_timeout_ms: 5_000,
                event_queue_capacity: 256,
                max_concurrent_sessions: 64,
                heartbeat_interval_secs: 15,
                client_timeout_secs: 60,
                max_frame_bytes: 1024 * 1024,
            },
            recognition: RecognitionOptions::default(),
            azure: AzureConfig {
                endpoint_template: "wss://{region}.stt.speech.microsoft.com".to_string(),
                connect_timeout_ms: 10_000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=8080`: Override server port
    /// - `APP_RELAY__STOP_TIMEOUT_MS=2000`: Shorter stop bound
    /// - `APP_RECOGNITION__PROFANITY=masked`: Engine profanity handling
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let settings = Self::builder(config::File::with_name("config").required(false))?;
        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    fn builder<S>(file: S) -> Result<config::ConfigBuilder<config::builder::DefaultState>>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        // Deployment platforms hand these over without our prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        Ok(settings)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## Why validate:
    /// Catching configuration errors early prevents runtime failures and
    /// provides clear error messages about what's wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.relay.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.relay.event_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Event queue capacity must be greater than 0"));
        }

        if self.relay.stop_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Stop timeout must be greater than 0"));
        }

        if self.relay.heartbeat_interval_secs == 0
            || self.relay.client_timeout_secs <= self.relay.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }

        if self.relay.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        if self.relay.default_language.trim().is_empty() {
            return Err(anyhow::anyhow!("Default language cannot be empty"));
        }

        if self.azure.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Azure connect timeout must be greater than 0"));
        }

        if !self.azure.endpoint_template.contains("{region}") {
            return Err(anyhow::anyhow!("Azure endpoint template must contain {{region}}"));
        }

        Ok(())  // All validation passed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::RecognitionMode;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.relay.default_language, "en-US");
        assert_eq!(config.recognition.segmentation_silence_timeout_ms, 100);
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.client_timeout_secs = config.relay.heartbeat_interval_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.azure.endpoint_template = "wss://speech.example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.azure.connect_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.stop_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    /// A config file only overrides the keys it names.
    #[test]
    fn test_file_layer_overrides_defaults() {
        let toml = r#"
            [relay]
            stop_timeout_ms = 1500

            [recognition]
            mode = "dictation"
        "#;
        let config: AppConfig = AppConfig::builder(config::File::from_str(toml, config::FileFormat::Toml))
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.relay.stop_timeout(), Duration::from_millis(1500));
        assert_eq!(config.recognition.mode, RecognitionMode::Dictation);
        assert_eq!(config.relay.event_queue_capacity, 256);
        assert_eq!(config.azure.connect_timeout_ms, 10_000);
    }
}
