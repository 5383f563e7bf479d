//! Configuration management for Throttle.
//!
//! Settings come from an optional YAML file layered under `THROTTLE__`
//! environment variables (`THROTTLE__SERVER__LISTEN_ADDR=0.0.0.0:9000`). The
//! shared store may also be configured with the conventional
//! `UPSTASH_REDIS_REST_URL` and `UPSTASH_REDIS_REST_TOKEN` variables.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, ThrottleError};
use crate::ratelimit::memory::DEFAULT_MAX_BUCKETS;
use crate::ratelimit::upstash::{UpstashConfig, DEFAULT_PREFIX};
use crate::ratelimit::FailurePolicy;

/// Conventional variable naming the store's REST endpoint.
pub const STORE_URL_ENV: &str = "UPSTASH_REDIS_REST_URL";
/// Conventional variable naming the store's REST token.
pub const STORE_TOKEN_ENV: &str = "UPSTASH_REDIS_REST_TOKEN";

/// Main configuration for the Throttle service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the action policy file; built-in defaults apply without one
    #[serde(default)]
    pub policies_path: Option<String>,

    /// How often to re-read the policy file, in seconds (0 disables)
    #[serde(default = "default_reload_interval")]
    pub policy_reload_interval_secs: u64,

    /// Soft cap on keys tracked by the in-process limiter
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,

    /// How often expired in-process buckets are swept, in seconds (0 disables)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// What to do when the shared store cannot answer
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            policies_path: None,
            policy_reload_interval_secs: default_reload_interval(),
            max_buckets: default_max_buckets(),
            sweep_interval_secs: default_sweep_interval(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl RateLimitingConfig {
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn policy_reload_interval(&self) -> Option<Duration> {
        (self.policy_reload_interval_secs > 0)
            .then(|| Duration::from_secs(self.policy_reload_interval_secs))
    }
}

fn default_reload_interval() -> u64 {
    60
}

fn default_max_buckets() -> usize {
    DEFAULT_MAX_BUCKETS
}

fn default_sweep_interval() -> u64 {
    60
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Upstash REST endpoint
    #[serde(default)]
    pub url: Option<String>,

    /// Upstash REST token
    #[serde(default)]
    pub token: Option<String>,

    /// Prefix for keys written to the store
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            prefix: default_prefix(),
            timeout_ms: default_store_timeout(),
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_store_timeout() -> u64 {
    1000
}

impl StoreConfig {
    /// Connection settings for the shared store, if it is configured.
    ///
    /// Blank values count as absent. Supplying only one of url and token is
    /// an error rather than a silent fallback.
    pub fn upstash(&self) -> Result<Option<UpstashConfig>> {
        let non_blank = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        match (non_blank(&self.url), non_blank(&self.token)) {
            (Some(url), Some(token)) => Ok(Some(UpstashConfig {
                url,
                token,
                prefix: self.prefix.clone(),
                timeout: Duration::from_millis(self.timeout_ms),
            })),
            (None, None) => Ok(None),
            (Some(_), None) => Err(ThrottleError::Config(
                "store url is set but store token is missing".to_string(),
            )),
            (None, Some(_)) => Err(ThrottleError::Config(
                "store token is set but store url is missing".to_string(),
            )),
        }
    }
}

impl ThrottleConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| ThrottleError::Config(e.to_string()))
    }

    /// Load configuration from an optional file, then `THROTTLE__` variables,
    /// then the conventional store variables for any store field still unset.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }

        let mut loaded: ThrottleConfig = builder
            .add_source(
                ::config::Environment::with_prefix("THROTTLE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.apply_store_env(
            std::env::var(STORE_URL_ENV).ok(),
            std::env::var(STORE_TOKEN_ENV).ok(),
        );
        Ok(loaded)
    }

    /// Fill unset store credentials from the conventional variables.
    pub fn apply_store_env(&mut self, url: Option<String>, token: Option<String>) {
        if self.store.url.is_none() {
            self.store.url = url;
        }
        if self.store.token.is_none() {
            self.store.token = token;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ThrottleConfig::default();
        assert_eq!(config.server.listen_addr, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(config.rate_limiting.failure_policy, FailurePolicy::Open);
        assert_eq!(config.rate_limiting.sweep_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.store.prefix, "ratelimit");
        assert!(config.store.upstash().unwrap().is_none());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  listen_addr: 0.0.0.0:9000
rate_limiting:
  policies_path: /etc/throttle/policies.yaml
  sweep_interval_secs: 0
  failure_policy: closed
store:
  url: https://eu1-example.upstash.io
  token: abc
  timeout_ms: 250
"#;
        let config = ThrottleConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.rate_limiting.failure_policy, FailurePolicy::Closed);
        assert_eq!(config.rate_limiting.sweep_interval(), None);
        assert_eq!(config.rate_limiting.max_buckets, DEFAULT_MAX_BUCKETS);

        let upstash = config.store.upstash().unwrap().unwrap();
        assert_eq!(upstash.url, "https://eu1-example.upstash.io");
        assert_eq!(upstash.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_partial_store_is_an_error() {
        let mut store = StoreConfig::default();
        store.url = Some("https://eu1-example.upstash.io".to_string());
        assert!(store.upstash().is_err());

        store.url = None;
        store.token = Some("abc".to_string());
        assert!(store.upstash().is_err());
    }

    #[test]
    fn test_blank_store_values_are_absent() {
        let mut store = StoreConfig::default();
        store.url = Some(" ".to_string());
        store.token = Some(String::new());
        assert!(store.upstash().unwrap().is_none());
    }

    #[test]
    fn test_store_env_fills_only_unset_fields() {
        let mut config = ThrottleConfig::default();
        config.store.url = Some("https://from-file.upstash.io".to_string());

        config.apply_store_env(
            Some("https://from-env.upstash.io".to_string()),
            Some("env-token".to_string()),
        );

        assert_eq!(config.store.url.as_deref(), Some("https://from-file.upstash.io"));
        assert_eq!(config.store.token.as_deref(), Some("env-token"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("throttle-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("throttle.yaml");
        std::fs::write(&path, "rate_limiting:\n  max_buckets: 42\n").unwrap();

        let config = ThrottleConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.rate_limiting.max_buckets, 42);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
