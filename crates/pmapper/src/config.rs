//! Runtime configuration

use crate::error::{PortMapperError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Verbosity of the native USB library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NativeLogLevel {
    None,
    Error,
    #[default]
    Warning,
    Info,
    Debug,
}

impl From<NativeLogLevel> for rusb::LogLevel {
    fn from(level: NativeLogLevel) -> Self {
        match level {
            NativeLogLevel::None => rusb::LogLevel::None,
            NativeLogLevel::Error => rusb::LogLevel::Error,
            NativeLogLevel::Warning => rusb::LogLevel::Warning,
            NativeLogLevel::Info => rusb::LogLevel::Info,
            NativeLogLevel::Debug => rusb::LogLevel::Debug,
        }
    }
}

/// Timing and logging knobs of the port-mapper runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound of one native event-service call
    pub poll_timeout_ms: u64,
    /// Pause after a failed event-service call
    pub error_backoff_ms: u64,
    /// Bound on forwarded control transfers
    pub control_timeout_ms: u64,
    pub libusb_log_level: NativeLogLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 1000,
            error_backoff_ms: 1000,
            control_timeout_ms: 300,
            libusb_log_level: NativeLogLevel::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| PortMapperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout_ms == 0 {
            return Err(PortMapperError::Config(
                "poll_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.control_timeout_ms == 0 {
            return Err(PortMapperError::Config(
                "control_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.poll_timeout(), Duration::from_secs(1));
        assert_eq!(config.error_backoff(), Duration::from_secs(1));
        assert_eq!(config.control_timeout(), Duration::from_millis(300));
        assert_eq!(config.libusb_log_level, NativeLogLevel::Warning);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            poll_timeout_ms = 250
            libusb_log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.poll_timeout_ms, 250);
        assert_eq!(config.error_backoff_ms, 1000);
        assert_eq!(config.libusb_log_level, NativeLogLevel::Debug);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = RuntimeConfig::from_toml_str("control_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, PortMapperError::Config(_)));

        assert!(RuntimeConfig::from_toml_str("libusb_log_level = \"loud\"").is_err());
    }
}
