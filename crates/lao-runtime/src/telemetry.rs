//! Tracing setup

use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Emit JSON lines instead of the human-readable format
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset or invalid
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: false,
            default_filter: "info".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn json() -> Self {
        Self {
            json: true,
            ..Self::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.default_filter))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init_tracing(config: &TelemetryConfig) -> bool {
    let builder = tracing_subscriber::fmt().with_env_filter(config.filter());
    let installed = if config.json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.with_target(false).try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        init_tracing(&TelemetryConfig::default());
        assert!(!init_tracing(&TelemetryConfig::json()));
    }

    #[test]
    fn test_bad_default_filter_falls_back() {
        let config = TelemetryConfig {
            json: false,
            default_filter: "=[".into(),
        };
        // Must not panic
        let _ = config.filter();
    }
}
