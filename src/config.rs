//! Broker configuration.
//!
//! Supports configuration from:
//! - TOML file (default: `relaymq.toml`)
//! - Environment variables with `RELAYMQ__` prefix (double underscore for
//!   nesting), e.g. `RELAYMQ__SERVER__BIND=0.0.0.0:1884`
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! ```toml
//! [server]
//! bind = "${MQTT_HOST:-0.0.0.0}:${MQTT_PORT:-1883}"
//! ```

use std::net::SocketAddr;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Default broker bind address.
pub const DEFAULT_BIND: &str = "0.0.0.0:1883";

/// Default stats HTTP bind address.
pub const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";

/// Substitute `${VAR}` / `${VAR:-default}` occurrences in a string.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub http: HttpConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit one debug line per handled packet with its cycle time.
    #[serde(default)]
    pub packet_times: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            packet_times: false,
        }
    }
}

/// Broker listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Number of worker threads (0 = CPU count).
    #[serde(default)]
    pub workers: usize,
}

fn default_bind() -> SocketAddr {
    DEFAULT_BIND.parse().unwrap()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workers: 0,
        }
    }
}

/// Stats HTTP endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Serve /stats and /metrics.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// HTTP bind address.
    #[serde(default = "default_http_bind")]
    pub bind: SocketAddr,
}

fn default_true() -> bool {
    true
}

fn default_http_bind() -> SocketAddr {
    DEFAULT_HTTP_BIND.parse().unwrap()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_http_bind(),
        }
    }
}

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Config {
    /// Load configuration: defaults, then the TOML file if present (with
    /// `${VAR}` substitution), then `RELAYMQ__` environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("log.packet_times", false)?
            .set_default("server.bind", DEFAULT_BIND)?
            .set_default("server.workers", 0)?
            .set_default("http.enabled", true)?
            .set_default("http.bind", DEFAULT_HTTP_BIND)?;

        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("RELAYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only.
    #[allow(dead_code)]
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a TOML string (for testing).
    #[allow(dead_code)]
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content);
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "unknown log level '{}'",
                    other
                )))
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind.port(), 1883);
        assert_eq!(config.server.workers, 0);
        assert!(config.http.enabled);
        assert_eq!(config.http.bind.port(), 8080);
        assert!(!config.log.packet_times);
    }

    #[test]
    fn parse_toml_overrides() {
        let toml = r#"
[log]
level = "debug"
packet_times = true

[server]
bind = "127.0.0.1:1884"
workers = 4

[http]
enabled = false
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.log.level, "debug");
        assert!(config.log.packet_times);
        assert_eq!(config.server.bind.port(), 1884);
        assert_eq!(config.server.workers, 4);
        assert!(!config.http.enabled);
        // Untouched sections keep their defaults.
        assert_eq!(config.http.bind.port(), 8080);
    }

    #[test]
    fn parse_partial_toml_keeps_defaults() {
        let toml = r#"
[server]
workers = 2
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.server.workers, 2);
        assert_eq!(config.server.bind, default_bind());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn invalid_log_level_rejected() {
        let config = Config::parse("[log]\nlevel = \"loud\"\n");
        assert!(config.is_err());
    }

    #[test]
    fn env_var_substitution() {
        std::env::set_var("RELAYMQ_TEST_PORT", "1885");
        let content = r#"
[server]
bind = "0.0.0.0:${RELAYMQ_TEST_PORT}"
"#;
        let substituted = substitute_env_vars(content);
        assert!(substituted.contains("0.0.0.0:1885"));
        std::env::remove_var("RELAYMQ_TEST_PORT");
    }

    #[test]
    fn env_var_substitution_with_default() {
        std::env::remove_var("RELAYMQ_NONEXISTENT_VAR");
        let content = r#"bind = "${RELAYMQ_NONEXISTENT_VAR:-0.0.0.0:1883}""#;
        let substituted = substitute_env_vars(content);
        assert!(substituted.contains("0.0.0.0:1883"));
    }
}
