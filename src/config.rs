//! Environment-driven gateway configuration.
//!
//! Every recognised option has a typed default; only `DATABASE_URL` and
//! `ENCRYPTION_KEY` are mandatory. Malformed values refuse startup rather
//! than falling back silently.

use std::time::Duration;

/// Fatal configuration errors. Any of these refuses startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    InvalidVar { name: &'static str, value: String },
    #[error("ENCRYPTION_KEY must be 64 hex characters (32 bytes), got {0} bytes")]
    BadKeyLength(usize),
}

/// Resolved gateway settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub http_port: u16,
    pub database_url: String,
    pub database_pool_size: u32,
    pub redis_address: String,
    pub redis_pool_size: u32,
    /// 32-byte AES-256-GCM key for the provider credential channel.
    pub encryption_key: [u8; 32],
    pub provider_reload_interval: Duration,
    pub provider_request_timeout: Duration,
    pub cache_api_key_size: usize,
    pub cache_api_key_ttl: Duration,
    pub cache_model_size: usize,
    pub cache_model_ttl: Duration,
    pub billing_flush_interval: Duration,
    pub queue_capacity: usize,
    pub queue_batch_size: usize,
    pub queue_batch_timeout: Duration,
    pub queue_max_retries: u32,
    pub queue_retry_backoff: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary lookup function. `from_env` delegates
    /// here; tests pass a closure over a map instead of mutating the process
    /// environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = get("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingVar("DATABASE_URL"))?;

        let key_hex = get("ENCRYPTION_KEY")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingVar("ENCRYPTION_KEY"))?;
        let key_bytes = hex::decode(key_hex.trim()).map_err(|_| ConfigError::InvalidVar {
            name: "ENCRYPTION_KEY",
            value: "<not hex>".to_string(),
        })?;
        let encryption_key: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| ConfigError::BadKeyLength(key_bytes.len()))?;

        Ok(Settings {
            http_port: parse_or(&get, "HTTP_PORT", 8080)?,
            database_url,
            database_pool_size: parse_or(&get, "DATABASE_POOL_SIZE", 10)?,
            redis_address: get("REDIS_ADDRESS")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "localhost:6379".to_string()),
            redis_pool_size: parse_or(&get, "REDIS_POOL_SIZE", 10)?,
            encryption_key,
            provider_reload_interval: secs_or(&get, "PROVIDER_RELOAD_INTERVAL", 300)?,
            provider_request_timeout: secs_or(&get, "PROVIDER_REQUEST_TIMEOUT", 60)?,
            cache_api_key_size: parse_or(&get, "CACHE_API_KEY_SIZE", 1000)?,
            cache_api_key_ttl: secs_or(&get, "CACHE_API_KEY_TTL", 300)?,
            cache_model_size: parse_or(&get, "CACHE_MODEL_SIZE", 500)?,
            cache_model_ttl: secs_or(&get, "CACHE_MODEL_TTL", 900)?,
            billing_flush_interval: secs_or(&get, "BILLING_FLUSH_INTERVAL", 300)?,
            queue_capacity: parse_or(&get, "QUEUE_CAPACITY", 10_000)?,
            queue_batch_size: parse_or(&get, "QUEUE_BATCH_SIZE", 100)?,
            queue_batch_timeout: secs_or(&get, "QUEUE_BATCH_TIMEOUT", 5)?,
            queue_max_retries: parse_or(&get, "QUEUE_MAX_RETRIES", 3)?,
            queue_retry_backoff: millis_or(&get, "QUEUE_RETRY_BACKOFF_MS", 500)?,
        })
    }

    /// Connection URL for the shared key-value store.
    pub fn redis_url(&self) -> String {
        if self.redis_address.contains("://") {
            self.redis_address.clone()
        } else {
            format!("redis://{}", self.redis_address)
        }
    }

    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.http_port)
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name, value: raw }),
        _ => Ok(default),
    }
}

fn secs_or(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_or(get, name, default)?))
}

fn millis_or(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse_or(get, name, default)?))
}
