use std::{env, fmt::Display, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{CacheConfig, RetryPolicy};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backend_url: String,
    pub jwt_secret: Option<String>,
    pub heartbeat: Duration,
    pub cache: CacheConfig,
    pub upstream_events_path: Option<String>,
    /// Service token presented to the backend's event stream.
    pub upstream_token: Option<String>,
    pub log_format: LogFormat,
    pub log_dir: Option<String>,
    pub cookie_secure: bool,
}

impl Config {
    /// Reads `.env` (if present) and then the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            info!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let retry = RetryPolicy {
            attempts: try_load(&lookup, "DMS_RETRY_ATTEMPTS", "3")?,
            base_delay: Duration::from_millis(try_load(&lookup, "DMS_RETRY_BASE_MS", "1000")?),
            max_delay: Duration::from_millis(try_load(&lookup, "DMS_RETRY_MAX_MS", "30000")?),
        };

        let cache = CacheConfig {
            stale_time: Duration::from_secs(try_load(&lookup, "DMS_CACHE_STALE_SECS", "60")?),
            gc_time: Duration::from_secs(try_load(&lookup, "DMS_CACHE_GC_SECS", "300")?),
            retry,
        };

        let heartbeat_secs: u64 = try_load(&lookup, "DMS_HEARTBEAT_SECS", "30")?;
        if heartbeat_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "DMS_HEARTBEAT_SECS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let backend_url: String =
            try_load(&lookup, "DMS_BACKEND_URL", "http://localhost:8080/api")?;

        Ok(Self {
            port: try_load(&lookup, "DMS_PORT", "3000")?,
            backend_url: backend_url.trim_end_matches('/').to_string(),
            jwt_secret: optional(&lookup, "DMS_JWT_SECRET"),
            heartbeat: Duration::from_secs(heartbeat_secs),
            cache,
            upstream_events_path: optional(&lookup, "DMS_UPSTREAM_EVENTS_PATH"),
            upstream_token: optional(&lookup, "DMS_UPSTREAM_TOKEN"),
            log_format: try_load(&lookup, "DMS_LOG_FORMAT", "pretty")?,
            log_dir: optional(&lookup, "DMS_LOG_DIR"),
            cookie_secure: try_load(&lookup, "DMS_COOKIE_SECURE", "false")?,
        })
    }
}

fn optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn try_load<F, T>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    let raw = optional(lookup, key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.parse().map_err(|e: T::Err| {
        warn!("Invalid {key} value: {e}");
        ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.heartbeat, Duration::from_secs(30));
        assert_eq!(config.cache.stale_time, Duration::from_secs(60));
        assert_eq!(config.cache.retry.attempts, 3);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.jwt_secret.is_none());
        assert!(config.upstream_events_path.is_none());
    }

    #[test]
    fn overrides_are_parsed_and_trimmed() {
        let config = config_from(&[
            ("DMS_PORT", "8081"),
            ("DMS_BACKEND_URL", "https://dms.example.com/api/"),
            ("DMS_LOG_FORMAT", "JSON"),
            ("DMS_JWT_SECRET", "  "),
            ("DMS_UPSTREAM_EVENTS_PATH", "/events"),
        ])
        .unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.backend_url, "https://dms.example.com/api");
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.jwt_secret.is_none());
        assert_eq!(config.upstream_events_path.as_deref(), Some("/events"));
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(config_from(&[("DMS_PORT", "eighty")]).is_err());
        assert!(config_from(&[("DMS_HEARTBEAT_SECS", "0")]).is_err());
        assert!(config_from(&[("DMS_COOKIE_SECURE", "maybe")]).is_err());
    }
}
