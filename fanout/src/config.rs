use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use fanout_sfu::SfuConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// Override host and port from a listen address such as `:8080` or
    /// `127.0.0.1:9000`. An empty host keeps listening on every interface.
    pub fn apply_listen_address(&mut self, addr: &str) -> anyhow::Result<()> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("Listen address must be host:port, got {addr}"))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| anyhow::anyhow!("Invalid port in listen address {addr}: {e}"))?;

        self.host = if host.is_empty() {
            "0.0.0.0".to_string()
        } else {
            host.trim_start_matches('[').trim_end_matches(']').to_string()
        };
        self.port = port;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then `FANOUT_` environment
    /// variables (`FANOUT_SERVER__PORT`, `FANOUT_SFU__RTC__ICE_SERVERS`, ...)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FANOUT")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sfu.rtc.ice_servers")
                .with_list_parse_key("sfu.benign_forward_errors")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// HTTP listen address
    #[must_use]
    pub fn http_address(&self) -> String {
        if self.server.host.contains(':') {
            format!("[{}]:{}", self.server.host, self.server.port)
        } else {
            format!("{}:{}", self.server.host, self.server.port)
        }
    }

    /// Validate the configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if crate::logging::parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level is invalid: {}", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }
        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.http_address(), "0.0.0.0:8080");
        assert_eq!(config.sfu.max_sync_attempts, 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  host: 127.0.0.1\n  port: 9000\nlogging:\n  format: json\nsfu:\n  keyframe_interval_secs: 5\n  rtc:\n    ice_servers: [\"stun:stun.example.org:3478\"]"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.http_address(), "127.0.0.1:9000");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.sfu.keyframe_interval_secs, 5);
        assert_eq!(config.sfu.max_sync_attempts, 25);
        assert_eq!(config.sfu.rtc.ice_servers, vec!["stun:stun.example.org:3478"]);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load(Some("/nonexistent/fanout.yaml")).unwrap();
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_apply_listen_address() {
        let mut server = ServerConfig::default();

        server.apply_listen_address(":9090").unwrap();
        assert_eq!((server.host.as_str(), server.port), ("0.0.0.0", 9090));

        server.apply_listen_address("127.0.0.1:7000").unwrap();
        assert_eq!((server.host.as_str(), server.port), ("127.0.0.1", 7000));

        server.apply_listen_address("[::1]:7001").unwrap();
        assert_eq!((server.host.as_str(), server.port), ("::1", 7001));

        assert!(server.apply_listen_address("8080").is_err());
        assert!(server.apply_listen_address("host:http").is_err());
    }

    #[test]
    fn test_ipv6_http_address() {
        let mut config = Config::default();
        config.server.host = "::".to_string();
        assert_eq!(config.http_address(), "[::]:8080");
    }

    #[test]
    fn test_validate_collects_every_error() {
        let mut config = Config::default();
        config.server.port = 0;
        config.logging.level = "loud".to_string();
        config.logging.format = "xml".to_string();
        config.sfu.keyframe_interval_secs = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("keyframe_interval_secs")));
    }
}
