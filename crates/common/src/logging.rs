//! Logging setup

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `default_level` when set. Installing twice is an
/// error rather than a panic, so embedders that already own a subscriber can
/// ignore the result.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_rejected() {
        // RUST_LOG would take precedence over the bad default
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let err = setup_logging("pmapper=verbose").unwrap_err();
        assert!(err.to_string().contains("Invalid log filter"));
    }
}
