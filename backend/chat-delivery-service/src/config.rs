use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. `None` selects the in-memory backend.
    pub database_url: Option<String>,
    pub port: u16,
    pub db_max_connections: usize,
    pub edit_window_secs: i64,
    pub subscription_ttl_secs: i64,
    pub subscription_sweep_secs: u64,
    /// Members fetched per page while fanning out to a group
    pub fanout_batch_size: usize,
    /// Conversations with more recipients than this are fanned out by workers
    pub fanout_inline_limit: usize,
    pub fanout_workers: usize,
    pub history_max_limit: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key/value source. `from_env` is the production
    /// entry point; tests feed a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());

        let config = Config {
            database_url,
            port: parse_or(&lookup, "PORT", 8085)?,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 16)?,
            edit_window_secs: parse_or(&lookup, "EDIT_WINDOW_SECS", 300)?,
            subscription_ttl_secs: parse_or(&lookup, "SUBSCRIPTION_TTL_SECS", 45)?,
            subscription_sweep_secs: parse_or(&lookup, "SUBSCRIPTION_SWEEP_SECS", 5)?,
            fanout_batch_size: parse_or(&lookup, "FANOUT_BATCH_SIZE", 256)?,
            fanout_inline_limit: parse_or(&lookup, "FANOUT_INLINE_LIMIT", 64)?,
            fanout_workers: parse_or(&lookup, "FANOUT_WORKERS", 4)?,
            history_max_limit: parse_or(&lookup, "HISTORY_MAX_LIMIT", 200)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults with the in-memory backend, for tests and local runs.
    pub fn test_defaults() -> Self {
        Config {
            database_url: None,
            port: 0,
            db_max_connections: 4,
            edit_window_secs: 300,
            subscription_ttl_secs: 45,
            subscription_sweep_secs: 5,
            fanout_batch_size: 256,
            fanout_inline_limit: 64,
            fanout_workers: 2,
            history_max_limit: 200,
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.edit_window_secs < 0 {
            return Err(AppError::Config("EDIT_WINDOW_SECS must be >= 0".into()));
        }
        if self.subscription_ttl_secs <= 0 {
            return Err(AppError::Config("SUBSCRIPTION_TTL_SECS must be > 0".into()));
        }
        if self.subscription_sweep_secs == 0 {
            return Err(AppError::Config("SUBSCRIPTION_SWEEP_SECS must be > 0".into()));
        }
        if self.fanout_batch_size == 0 || self.fanout_workers == 0 {
            return Err(AppError::Config(
                "FANOUT_BATCH_SIZE and FANOUT_WORKERS must be > 0".into(),
            ));
        }
        if self.history_max_limit == 0 {
            return Err(AppError::Config("HISTORY_MAX_LIMIT must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} must be a number, got {raw:?}"))),
        None => Ok(default),
    }
}
