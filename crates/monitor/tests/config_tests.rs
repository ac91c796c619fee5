//! Integration tests for monitor configuration files
//!
//! - The `[monitor]` table
//! - The `[runtime]` table as read by the port mapper
//! - Invalid configuration handling

use pmapper::{NativeLogLevel, RuntimeConfig};
use std::time::Duration;

const FULL_CONFIG: &str = r#"
[monitor]
log_level = "debug"
event_capacity = 64

[runtime]
poll_timeout_ms = 250
error_backoff_ms = 500
control_timeout_ms = 1000
libusb_log_level = "info"
"#;

fn runtime_table(config: &str) -> String {
    let parsed: toml::Value = toml::from_str(config).unwrap();
    toml::to_string(parsed.get("runtime").unwrap()).unwrap()
}

mod monitor_section {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: toml::Value = toml::from_str(FULL_CONFIG).unwrap();
        let monitor = config.get("monitor").unwrap();
        assert_eq!(monitor.get("log_level").unwrap().as_str().unwrap(), "debug");
        assert_eq!(monitor.get("event_capacity").unwrap().as_integer().unwrap(), 64);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let broken = "[monitor\nlog_level = \"info\"";
        let parsed: Result<toml::Value, _> = toml::from_str(broken);
        assert!(parsed.is_err());
    }
}

mod runtime_section {
    use super::*;

    #[test]
    fn test_full_runtime_section() {
        let runtime = RuntimeConfig::from_toml_str(&runtime_table(FULL_CONFIG)).unwrap();
        assert_eq!(runtime.poll_timeout(), Duration::from_millis(250));
        assert_eq!(runtime.error_backoff(), Duration::from_millis(500));
        assert_eq!(runtime.control_timeout(), Duration::from_secs(1));
        assert_eq!(runtime.libusb_log_level, NativeLogLevel::Info);
    }

    #[test]
    fn test_partial_runtime_section_uses_defaults() {
        let config = r#"
[runtime]
libusb_log_level = "none"
"#;
        let runtime = RuntimeConfig::from_toml_str(&runtime_table(config)).unwrap();
        assert_eq!(runtime.libusb_log_level, NativeLogLevel::None);
        assert_eq!(runtime.poll_timeout_ms, 1000);
        assert_eq!(runtime.control_timeout_ms, 300);
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        assert!(RuntimeConfig::from_toml_str("libusb_log_level = \"chatty\"").is_err());
    }

    #[test]
    fn test_zero_poll_timeout_rejected() {
        let err = RuntimeConfig::from_toml_str("poll_timeout_ms = 0").unwrap_err();
        assert!(err.to_string().contains("poll_timeout_ms"));
    }
}
