//! Runtime configuration shared by the client session and the server.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::{
    DEDUPE_WINDOW, DEFAULT_PORT, HEARTBEAT_INTERVAL_MS, MAX_RECONNECT_ATTEMPTS,
    RECONNECT_MIN_INTERVAL_MS, RECONNECT_TIMEOUT_MS, RETRY_DELAY_MS, SEND_RETRIES,
    SEND_TIMEOUT_MS, SNAPSHOT_TIMEOUT_MS,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Port the authoritative server binds to
    pub port: u16,
    /// Attempts per acknowledged send
    pub send_retries: u32,
    /// Upper bound for one send, retries included
    pub send_timeout: Duration,
    /// Fixed pause between send attempts
    pub retry_delay: Duration,
    /// Minimum spacing between reconnect attempts
    pub reconnect_min_interval: Duration,
    /// How long one reconnect waits for the transport
    pub reconnect_timeout: Duration,
    /// Reconnect attempts before the session gives up
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub snapshot_timeout: Duration,
    pub dedupe_window: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            send_retries: SEND_RETRIES,
            send_timeout: Duration::from_millis(SEND_TIMEOUT_MS),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
            reconnect_min_interval: Duration::from_millis(RECONNECT_MIN_INTERVAL_MS),
            reconnect_timeout: Duration::from_millis(RECONNECT_TIMEOUT_MS),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            snapshot_timeout: Duration::from_millis(SNAPSHOT_TIMEOUT_MS),
            dedupe_window: DEDUPE_WINDOW,
        }
    }
}

impl CoordinatorConfig {
    /// Defaults overridden by environment variables. Unparseable values are
    /// logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(port) = parse_var(&lookup, "PORT") {
            config.port = port;
        }
        if let Some(retries) = parse_var::<u32>(&lookup, "SEND_RETRIES") {
            config.send_retries = retries.max(1);
        }
        if let Some(ms) = parse_var(&lookup, "SEND_TIMEOUT_MS") {
            config.send_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "RECONNECT_MIN_INTERVAL_MS") {
            config.reconnect_min_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "RECONNECT_TIMEOUT_MS") {
            config.reconnect_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var(&lookup, "MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = parse_var(&lookup, "SNAPSHOT_TIMEOUT_MS") {
            config.snapshot_timeout = Duration::from_millis(ms);
        }
        config
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable config value");
            None
        }
    }
}
