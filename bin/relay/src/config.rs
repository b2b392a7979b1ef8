//! Configuration file loading

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use zlayer_relay::RelayServerConfig;

use crate::logging::LoggingConfig;

/// Contents of the TOML configuration file
///
/// ```toml
/// [server]
/// bind = "0.0.0.0:8080"
/// key_strategy = "sequential"
/// request_timeout = "15s"
///
/// [logging]
/// level = "debug"
/// format = "json"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct FileConfig {
    pub server: RelayServerConfig,
    pub logging: LoggingConfig,
}

impl FileConfig {
    /// Load the configuration from `path`, or defaults when no path is given
    pub(crate) fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub(crate) fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use zlayer_relay::KeyStrategy;

    use crate::logging::{LogFormat, LogLevel};

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = FileConfig::parse("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_parse_full_config() {
        let config = FileConfig::parse(
            r#"
            [server]
            bind = "127.0.0.1:9000"
            public_url = "https://relay.example.com"
            key_strategy = "sequential"
            request_timeout = "15s"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.server.key_strategy, KeyStrategy::Sequential);
        assert_eq!(config.server.request_timeout, Duration::from_secs(15));
        assert_eq!(
            config.server.public_url.as_deref(),
            Some("https://relay.example.com")
        );
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_rejects_unknown_format() {
        assert!(FileConfig::parse("[logging]\nformat = \"xml\"").is_err());
    }

    #[test]
    fn test_load_without_path() {
        let config = FileConfig::load(None).unwrap();
        assert!(config.server.public_url.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(FileConfig::load(Some(Path::new("/nonexistent/relay.toml"))).is_err());
    }
}
