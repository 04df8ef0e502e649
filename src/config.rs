//! Configuration management for Turnstile.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file, then
//! `TURNSTILE__`-prefixed environment variables (for example
//! `TURNSTILE__LIMITER__REDIS_URL`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Policy, DEFAULT_KEY_PREFIX};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limiter backend configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Per route-class policies
    #[serde(default)]
    pub policies: PoliciesConfig,

    /// Routes that are never rate limited, matched exactly
    #[serde(default = "default_bypass")]
    pub bypass: Vec<String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            limiter: LimiterConfig::default(),
            policies: PoliciesConfig::default(),
            bypass: default_bypass(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_bypass() -> Vec<String> {
    vec!["/health".to_string(), "/metrics".to_string()]
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Largest request body buffered for body-derived limiter keys
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_body_limit() -> usize {
    64 * 1024
}

/// Which limiter backend holds bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Shared Redis store, falling back to local if Redis is unreachable at startup
    Redis,
    /// In-process registry
    Local,
}

/// Limiter backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Backend selection
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace for bucket keys in Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on one Redis round-trip in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            store_timeout_ms: default_store_timeout(),
        }
    }
}

fn default_backend() -> BackendKind {
    BackendKind::Redis
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_store_timeout() -> u64 {
    100
}

impl LimiterConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Policies per route class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoliciesConfig {
    /// Loose per-client-per-route policy applied to every limited route
    #[serde(default = "default_policy")]
    pub default: Policy,

    /// Strict policy for credential endpoints
    #[serde(default = "login_policy")]
    pub login: Policy,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            default: default_policy(),
            login: login_policy(),
        }
    }
}

impl PoliciesConfig {
    /// Idle lifetime for the local registry: the longest ttl of any policy, so no bucket
    /// is swept before its own policy would let it expire.
    pub fn local_ttl(&self) -> Duration {
        self.default.ttl().max(self.login.ttl())
    }
}

fn default_policy() -> Policy {
    Policy::new(2.0, 10, Duration::from_secs(60)).expect("built-in default policy is valid")
}

fn login_policy() -> Policy {
    Policy::new(0.2, 5, Duration::from_secs(60)).expect("built-in login policy is valid")
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl TurnstileConfig {
    /// Load configuration from an optional file path plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would silently disable limiting.
    ///
    /// Policies validate themselves when deserialized.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.store_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "limiter.store_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.server.body_limit_bytes == 0 {
            return Err(TurnstileError::Config(
                "server.body_limit_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.limiter.backend, BackendKind::Redis);
        assert_eq!(config.limiter.store_timeout(), Duration::from_millis(100));
        assert_eq!(config.policies.default.burst(), 10);
        assert_eq!(config.policies.login.rate(), 0.2);
        assert_eq!(config.bypass, ["/health", "/metrics"]);
        assert_eq!(config.policies.local_ttl(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_overrides() {
        let yaml = r#"
server:
  listen_addr: 127.0.0.1:9000
limiter:
  backend: local
policies:
  login:
    rate: 0.5
    burst: 3
    ttl_secs: 120
bypass:
  - /ready
logging:
  format: json
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.limiter.backend, BackendKind::Local);
        assert_eq!(config.policies.local_ttl(), Duration::from_secs(120));
        assert_eq!(config.policies.login.burst(), 3);
        assert_eq!(config.policies.default.burst(), 10);
        assert_eq!(config.bypass, ["/ready"]);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_policy_is_a_config_error() {
        let yaml = r#"
policies:
  default:
    rate: 0
    burst: 10
    ttl_secs: 60
"#;
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_store_timeout_is_rejected() {
        let yaml = "limiter:\n  store_timeout_ms: 0\n";
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(ref message) if message.contains("store_timeout_ms")));
    }

    #[test]
    fn test_zero_body_limit_is_rejected() {
        let yaml = "server:\n  body_limit_bytes: 0\n";
        assert!(matches!(
            TurnstileConfig::from_yaml(yaml),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_zero_policy_ttl_is_rejected() {
        let yaml = r#"
policies:
  login:
    rate: 0.2
    burst: 5
    ttl_secs: 0
"#;
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }
}
