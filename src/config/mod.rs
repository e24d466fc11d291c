use std::env;
use std::time::Duration;

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub push: PushConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Chunk size for bulk writes when flushing the pending queue (default: 100)
    pub write_batch_size: usize,
    /// Days an undelivered notification stays redeliverable (default: 7)
    pub backlog_ttl_days: i64,
    /// Seconds between redelivery reconciliation passes (default: 5)
    pub redelivery_interval_secs: u64,
    /// Max pending records fetched per reconciliation pass (default: 1000)
    pub redelivery_fetch_limit: i64,
    /// Seconds between expired-backlog sweeps (default: 10800, i.e. 3h)
    pub expiry_sweep_interval_secs: u64,
    /// Seconds an SSE connection may stay open before forced teardown (default: 1800)
    pub idle_timeout_secs: u64,
    /// Seconds between SSE comment heartbeats (default: 30)
    pub heartbeat_interval_secs: u64,
}

impl PushConfig {
    pub fn redelivery_interval(&self) -> Duration {
        Duration::from_secs(self.redelivery_interval_secs)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        Ok(Config {
            app: AppConfig {
                env: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
                port: env_parse("PORT", 8086),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .map_err(|_| AppError::Config("DATABASE_URL missing".into()))?,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
            },
            push: PushConfig::from_env(),
        })
    }
}

impl PushConfig {
    pub fn from_env() -> Self {
        PushConfig {
            write_batch_size: env_parse("PENDING_WRITE_BATCH_SIZE", 100),
            backlog_ttl_days: env_parse("BACKLOG_TTL_DAYS", 7),
            redelivery_interval_secs: env_parse("REDELIVERY_INTERVAL_SECS", 5),
            redelivery_fetch_limit: env_parse("REDELIVERY_FETCH_LIMIT", 1000),
            expiry_sweep_interval_secs: env_parse("EXPIRY_SWEEP_INTERVAL_SECS", 10800),
            idle_timeout_secs: env_parse("IDLE_TIMEOUT_SECS", 1800),
            heartbeat_interval_secs: env_parse("HEARTBEAT_INTERVAL_SECS", 30),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        PushConfig {
            write_batch_size: 100,
            backlog_ttl_days: 7,
            redelivery_interval_secs: 5,
            redelivery_fetch_limit: 1000,
            expiry_sweep_interval_secs: 10800,
            idle_timeout_secs: 1800,
            heartbeat_interval_secs: 30,
        }
    }
}

#[cfg(test)]
impl Config {
    pub fn test_defaults() -> Self {
        Config {
            app: AppConfig {
                env: "test".into(),
                port: 8086,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/test".into(),
                max_connections: 5,
            },
            push: PushConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_defaults_match_documented_values() {
        let push = PushConfig::default();
        assert_eq!(push.write_batch_size, 100);
        assert_eq!(push.backlog_ttl_days, 7);
        assert_eq!(push.redelivery_interval(), Duration::from_secs(5));
        assert_eq!(push.expiry_sweep_interval(), Duration::from_secs(3 * 60 * 60));
        assert_eq!(push.idle_timeout(), Duration::from_secs(30 * 60));
        assert_eq!(push.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(push.redelivery_fetch_limit, 1000);
    }

    #[test]
    fn test_defaults_builds() {
        let config = Config::test_defaults();
        assert_eq!(config.app.env, "test");
        assert_eq!(config.database.max_connections, 5);
    }
}
