// src/env.rs
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use dotenv::dotenv;

use crate::rabbitmq::{
    ConnectionConfig, RabbitMQError, Result, DEFAULT_MAX_RECONNECT_TIMES, DEFAULT_STABLE_AFTER,
};

pub const URI_VAR: &str = "SRV_RMQ_URI";
pub const MAX_RECONNECT_TIMES_VAR: &str = "SRV_RMQ_MAXX_RECONNECT_TIMES";
pub const RECONNECT_DELAY_VAR: &str = "SRV_RMQ_RECONNECT_DELAY_MS";
pub const CONNECTION_TIMEOUT_VAR: &str = "SRV_RMQ_CONNECTION_TIMEOUT_MS";
pub const STABLE_AFTER_VAR: &str = "SRV_RMQ_STABLE_AFTER_MS";
pub const TOPOLOGY_FILE_VAR: &str = "SRV_RMQ_TOPOLOGY_FILE";

/// Process settings read from the environment (and `.env`, when present).
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub uri: String,
    pub max_reconnect_times: u32,
    pub reconnect_delay_ms: u64,
    pub connection_timeout_ms: u64,
    /// Uptime after which a dropped connection gets a fresh reconnect budget.
    pub stable_after_ms: u64,
    pub topology_file: Option<PathBuf>,
}

fn default_reconnect_delay_ms() -> u64 {
    0
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from any key lookup; a missing URI is an error, never an exit.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let uri = lookup(URI_VAR)
            .filter(|uri| !uri.trim().is_empty())
            .ok_or_else(|| RabbitMQError::ConfigError(format!("{URI_VAR} is not set")))?;

        Ok(Settings {
            uri,
            max_reconnect_times: parse_or(&lookup, MAX_RECONNECT_TIMES_VAR, DEFAULT_MAX_RECONNECT_TIMES)?,
            reconnect_delay_ms: parse_or(&lookup, RECONNECT_DELAY_VAR, default_reconnect_delay_ms())?,
            connection_timeout_ms: parse_or(
                &lookup,
                CONNECTION_TIMEOUT_VAR,
                default_connection_timeout_ms(),
            )?,
            stable_after_ms: parse_or(
                &lookup,
                STABLE_AFTER_VAR,
                DEFAULT_STABLE_AFTER.as_millis() as u64,
            )?,
            topology_file: lookup(TOPOLOGY_FILE_VAR)
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.uri.clone())
            .with_reconnect_policy(self.max_reconnect_times, self.reconnect_delay())
            .with_connection_timeout(self.connection_timeout())
            .with_stable_after(self.stable_after())
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e| {
            RabbitMQError::ConfigError(format!("{key}='{raw}' is not valid: {e}"))
        }),
        None => Ok(default),
    }
}
