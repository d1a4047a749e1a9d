//! Configuration management for Turnstile.

use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Prefix for environment variable overrides, e.g. `TURNSTILE__RATE_LIMITER__RATE`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Interval between sweeps of expired limiters, in seconds (0 disables)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl ServerConfig {
    /// Sweep interval, or `None` when sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_sweep_interval() -> u64 {
    60
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Tokens added to each client's bucket per second
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Bucket capacity (maximum burst) per client
    #[serde(default = "default_bucket")]
    pub bucket: u32,

    /// Header trusted to carry the client address
    #[serde(default)]
    pub ip_header: Option<String>,

    /// Maximum number of clients tracked at once
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,

    /// Idle time after which a client's limiter is discarded, in seconds
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Number of independently locked cache shards
    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            bucket: default_bucket(),
            ip_header: None,
            max_keys: default_max_keys(),
            ttl_secs: default_ttl(),
            shards: default_shards(),
        }
    }
}

fn default_rate() -> f64 {
    10.0
}

fn default_bucket() -> u32 {
    20
}

fn default_max_keys() -> usize {
    10000
}

fn default_ttl() -> u64 {
    300
}

fn default_shards() -> usize {
    16
}

impl RateLimiterConfig {
    /// Check every setting, reporting the first invalid one.
    pub fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(TurnstileError::Config(format!(
                "rate_limiter.rate must be positive, got {}",
                self.rate
            )));
        }
        if self.bucket == 0 {
            return Err(TurnstileError::Config(
                "rate_limiter.bucket must be at least 1".to_string(),
            ));
        }
        if self.ttl_secs == 0 {
            return Err(TurnstileError::Config(
                "rate_limiter.ttl_secs must be at least 1".to_string(),
            ));
        }
        self.max_keys()?;
        self.shard_count()?;
        self.ip_header_name()?;
        Ok(())
    }

    /// Maximum number of tracked clients.
    pub fn max_keys(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.max_keys).ok_or_else(|| {
            TurnstileError::Config("rate_limiter.max_keys must be at least 1".to_string())
        })
    }

    /// Number of cache shards.
    pub fn shard_count(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.shards).ok_or_else(|| {
            TurnstileError::Config("rate_limiter.shards must be at least 1".to_string())
        })
    }

    /// Idle TTL for cached limiters.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// The trusted identity header, parsed. Blank names count as unset.
    pub fn ip_header_name(&self) -> Result<Option<HeaderName>> {
        let Some(name) = self.ip_header.as_deref().map(str::trim) else {
            return Ok(None);
        };
        if name.is_empty() {
            return Ok(None);
        }
        HeaderName::from_bytes(name.as_bytes())
            .map(Some)
            .map_err(|e| {
                TurnstileError::Config(format!(
                    "rate_limiter.ip_header {:?} is not a valid header name: {}",
                    name, e
                ))
            })
    }
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, overlaid with environment
    /// variables such as `TURNSTILE__RATE_LIMITER__BUCKET=50`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiter.validate()
    }
}
