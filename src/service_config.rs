//! Process-wide configuration, loaded once from the environment at startup.

use std::env;

use crate::error::Error;

#[derive(Clone, Debug)]
pub struct Config {
    pub store_url: String,
    pub retry_limit: u32,
    pub log_level: String,
    pub enable_logging: bool,
}

impl Config {
    pub fn from_env() -> Result<Config, Error> {
        let store_url =
            env::var("STORE_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        if store_url.trim().is_empty() {
            return Err(Error::ConfigError("STORE_URL must not be empty".to_string()));
        }

        Ok(Config {
            store_url,
            retry_limit: envoption::with_default("RETRY_LIMIT", 3u32)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            enable_logging: envoption::with_default("ENABLE_LOGGING", true)?,
        })
    }
}
