//! Environment configuration for the daemon.
//!
//! | Variable                        | Default |
//! |---------------------------------|---------|
//! | `LIVEFEED_ENDPOINT`             | (required) |
//! | `LIVEFEED_RECONNECT_DELAY_MS`   | 5000    |
//! | `LIVEFEED_CONNECT_TIMEOUT_MS`   | 10000   |
//! | `LIVEFEED_ACCEPT_GZIP`          | true    |
//! | `LIVEFEED_ACCEPT_CHUNKS`        | true    |
//! | `LIVEFEED_CHUNK_MAX_PENDING`    | 64      |
//! | `LIVEFEED_CHUNK_MAX_AGE_SECS`   | 60      |
//! | `LIVEFEED_CHUNK_MAX_PARTS`      | 4096    |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use livefeed_sync::{ConfigError, SyncConfig};

/// Build a [`SyncConfig`] from the process environment.
pub fn from_env() -> Result<SyncConfig, ConfigError> {
    from_lookup(|key| env::var(key).ok())
}

/// Build a [`SyncConfig`] from any key lookup. Unset or blank keys keep
/// their defaults; values that do not parse are errors.
pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<SyncConfig, ConfigError> {
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let mut config = SyncConfig::default();

    config.endpoint = get("LIVEFEED_ENDPOINT").ok_or(ConfigError::MissingEndpoint)?;

    if let Some(ms) = parse::<u64>("LIVEFEED_RECONNECT_DELAY_MS", get("LIVEFEED_RECONNECT_DELAY_MS"))? {
        config.reconnect_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = parse::<u64>("LIVEFEED_CONNECT_TIMEOUT_MS", get("LIVEFEED_CONNECT_TIMEOUT_MS"))? {
        config.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(flag) = flag("LIVEFEED_ACCEPT_GZIP", get("LIVEFEED_ACCEPT_GZIP"))? {
        config.accept_compressed = flag;
    }
    if let Some(flag) = flag("LIVEFEED_ACCEPT_CHUNKS", get("LIVEFEED_ACCEPT_CHUNKS"))? {
        config.accept_chunks = flag;
    }
    if let Some(n) = parse::<usize>("LIVEFEED_CHUNK_MAX_PENDING", get("LIVEFEED_CHUNK_MAX_PENDING"))? {
        config.assembly.max_pending = n;
    }
    if let Some(secs) = parse::<u64>("LIVEFEED_CHUNK_MAX_AGE_SECS", get("LIVEFEED_CHUNK_MAX_AGE_SECS"))? {
        config.assembly.max_age = Duration::from_secs(secs);
    }
    if let Some(n) = parse::<u32>("LIVEFEED_CHUNK_MAX_PARTS", get("LIVEFEED_CHUNK_MAX_PARTS"))? {
        config.assembly.max_parts = n;
    }

    Ok(config)
}

fn parse<T: FromStr>(key: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError> {
    value
        .map(|v| v.parse().map_err(|_| ConfigError::InvalidValue { key, value: v }))
        .transpose()
}

fn flag(key: &'static str, value: Option<String>) -> Result<Option<bool>, ConfigError> {
    value
        .map(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value: v }),
        })
        .transpose()
}
