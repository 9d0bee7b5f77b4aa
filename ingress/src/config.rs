use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Empty redis URL for the {0} store")]
    EmptyRedisUrl(&'static str),

    #[error("Rate limit max_requests cannot be 0")]
    InvalidMaxRequests,

    #[error("Rate limit window_secs cannot be 0")]
    InvalidWindow,

    #[error("max_payload_bytes cannot be 0")]
    InvalidMaxPayload,
}

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Ingress configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for pushed events
    pub listener: Listener,
    /// Admin listener for health and readiness probes
    pub admin_listener: Listener,
    /// Store holding project configurations, data lists and usage counters
    pub ingress_store: StoreConfig,
    /// Store holding rate limiter counters
    pub rate_limit_store: StoreConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Larger request bodies are dropped as invalid payloads
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Where `GET /` redirects to
    pub homepage: Option<Url>,
}

fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

impl Config {
    /// Validates the ingress configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.ingress_store.redis_url.trim().is_empty() {
            return Err(ValidationError::EmptyRedisUrl("ingress"));
        }
        if self.rate_limit_store.redis_url.trim().is_empty() {
            return Err(ValidationError::EmptyRedisUrl("rate limit"));
        }

        self.rate_limit.validate()?;

        if self.max_payload_bytes == 0 {
            return Err(ValidationError::InvalidMaxPayload);
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    /// Validates the listener configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StoreConfig {
    pub redis_url: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Requests allowed per project and client in one window
    pub max_requests: u64,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_requests: 200,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_requests == 0 {
            return Err(ValidationError::InvalidMaxRequests);
        }
        if self.window_secs == 0 {
            return Err(ValidationError::InvalidWindow);
        }
        Ok(())
    }
}
