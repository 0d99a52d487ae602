//! Bridge configuration management
//!
//! The device identity and channel table are compiled in; the file only tunes
//! transfer, discovery and logging behaviour. It is read only when a path is
//! given explicitly.

use crate::engine::TransferPolicy;
use anyhow::{Context, Result, anyhow};
use common::usb::{DiscoveryPolicy, SessionOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest accepted transfer buffer
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "BridgeConfig::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Bulk transfer timeout in milliseconds (0 = block indefinitely)
    #[serde(default)]
    pub timeout_ms: u64,
    /// Detach a bound kernel driver before claiming the interface
    #[serde(default = "UsbSettings::default_detach")]
    pub detach_kernel_driver: bool,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            detach_kernel_driver: Self::default_detach(),
        }
    }
}

impl UsbSettings {
    fn default_detach() -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Number of bus scans before giving up
    #[serde(default = "DiscoverySettings::default_attempts")]
    pub attempts: u32,
    /// Delay between scans in milliseconds
    #[serde(default = "DiscoverySettings::default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            attempts: Self::default_attempts(),
            poll_interval_ms: Self::default_poll_interval(),
        }
    }
}

impl DiscoverySettings {
    fn default_attempts() -> u32 {
        60
    }

    fn default_poll_interval() -> u64 {
        1000
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Per-direction transfer buffer in bytes
    #[serde(default = "TransferSettings::default_buffer_size")]
    pub buffer_size: usize,
    /// Longest wait on the pty before re-checking for a stop request
    #[serde(default = "TransferSettings::default_terminal_poll")]
    pub terminal_poll_ms: u64,
    /// Time given to the second relay loop once the first has ended
    #[serde(default = "TransferSettings::default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            buffer_size: Self::default_buffer_size(),
            terminal_poll_ms: Self::default_terminal_poll(),
            shutdown_grace_ms: Self::default_shutdown_grace(),
        }
    }
}

impl TransferSettings {
    fn default_buffer_size() -> usize {
        8192
    }

    fn default_terminal_poll() -> u64 {
        200
    }

    fn default_shutdown_grace() -> u64 {
        500
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            usb: UsbSettings::default(),
            discovery: DiscoverySettings::default(),
            transfer: TransferSettings::default(),
        }
    }
}

impl BridgeConfig {
    fn default_log_level() -> String {
        "warn".to_string()
    }

    /// Load configuration from `path` (`~` is expanded)
    pub fn load(path: &Path) -> Result<Self> {
        let config_path = expand_path(path);

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("inq1-usbserial").join("bridge.toml")
        } else {
            PathBuf::from(".config/inq1-usbserial/bridge.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.discovery.attempts == 0 {
            return Err(anyhow!("discovery.attempts must be at least 1"));
        }

        if self.transfer.buffer_size == 0 || self.transfer.buffer_size > MAX_BUFFER_SIZE {
            return Err(anyhow!(
                "transfer.buffer_size must be between 1 and {} bytes, got {}",
                MAX_BUFFER_SIZE,
                self.transfer.buffer_size
            ));
        }

        if self.transfer.terminal_poll_ms == 0 {
            return Err(anyhow!("transfer.terminal_poll_ms must be greater than 0"));
        }

        Ok(())
    }

    pub fn discovery_policy(&self) -> DiscoveryPolicy {
        DiscoveryPolicy {
            attempts: self.discovery.attempts,
            poll_interval: Duration::from_millis(self.discovery.poll_interval_ms),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            detach_kernel_driver: self.usb.detach_kernel_driver,
        }
    }

    pub fn transfer_policy(&self) -> TransferPolicy {
        TransferPolicy {
            buffer_size: self.transfer.buffer_size,
            usb_timeout: Duration::from_millis(self.usb.timeout_ms),
            usb_tick: self.terminal_poll(),
            shutdown_grace: Duration::from_millis(self.transfer.shutdown_grace_ms),
        }
    }

    pub fn terminal_poll(&self) -> Duration {
        Duration::from_millis(self.transfer.terminal_poll_ms)
    }
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.usb.timeout_ms, 0);
        assert!(config.usb.detach_kernel_driver);
        assert_eq!(config.discovery.attempts, 60);
        assert_eq!(config.discovery.poll_interval_ms, 1000);
        assert_eq!(config.transfer.buffer_size, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_policies_from_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.discovery_policy(), DiscoveryPolicy::default());
        assert_eq!(config.transfer_policy(), TransferPolicy::default());
        assert!(config.session_options().detach_kernel_driver);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_partial_file() {
        let config: BridgeConfig = toml::from_str(
            r#"
log_level = "debug"

[usb]
timeout_ms = 1000
"#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.usb.timeout_ms, 1000);
        assert!(config.usb.detach_kernel_driver);
        assert_eq!(
            config.transfer_policy().usb_timeout,
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_invalid_log_level() {
        let config = BridgeConfig {
            log_level: "loud".to_string(),
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = BridgeConfig::default();
        config.discovery.attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_size_bounds() {
        let mut config = BridgeConfig::default();
        config.transfer.buffer_size = 0;
        assert!(config.validate().is_err());

        config.transfer.buffer_size = MAX_BUFFER_SIZE + 1;
        assert!(config.validate().is_err());

        config.transfer.buffer_size = MAX_BUFFER_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_terminal_poll_rejected() {
        let mut config = BridgeConfig::default();
        config.transfer.terminal_poll_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_path_name() {
        let path = BridgeConfig::default_path();
        assert!(path.ends_with("inq1-usbserial/bridge.toml"));
    }
}
