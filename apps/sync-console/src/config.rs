//! Environment-backed runtime configuration for `sync-console`.

use std::{env, error::Error, fmt};

use sync_core::SyncConfig;
use url::Url;

/// Runtime configuration used by the console client.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleConfig {
    /// Base URL of the request/response API.
    pub api_url: Url,
    /// WebSocket endpoint of the push channel.
    pub socket_url: Url,
    /// Session token. Without one, live sync stays off.
    pub token: Option<String>,
    /// Keyring account used to persist or look up the token.
    pub keyring_account: Option<String>,
    /// Tuning forwarded to the sync runtime.
    pub sync: SyncConfig,
}

impl ConsoleConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_url = required_url("SYNC_API_URL", &["http", "https"], &mut lookup)?;
        let socket_url = required_url("SYNC_SOCKET_URL", &["ws", "wss"], &mut lookup)?;
        let token = optional_trimmed_env("SYNC_TOKEN", &mut lookup);
        let keyring_account = optional_trimmed_env("SYNC_KEYRING_ACCOUNT", &mut lookup);

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            keepalive_interval_ms: parse_nonzero_u64(
                "SYNC_KEEPALIVE_MS",
                defaults.keepalive_interval_ms,
                &mut lookup,
            )?,
            reconnect_delay_ms: parse_u64("SYNC_RECONNECT_DELAY_MS", defaults.reconnect_delay_ms, &mut lookup)?,
            max_reconnect_attempts: parse_u32(
                "SYNC_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
                &mut lookup,
            )?,
            dedup_window_ms: parse_nonzero_u64("SYNC_DEDUP_WINDOW_MS", defaults.dedup_window_ms, &mut lookup)?,
            history_limit: parse_u16("SYNC_HISTORY_LIMIT", defaults.history_limit, &mut lookup)?,
            timeline_max_items: parse_usize(
                "SYNC_TIMELINE_MAX_ITEMS",
                defaults.timeline_max_items,
                &mut lookup,
            )?,
            conversation_refresh_interval_ms: parse_nonzero_u64(
                "SYNC_REFRESH_INTERVAL_MS",
                defaults.conversation_refresh_interval_ms,
                &mut lookup,
            )?,
        };

        if sync.history_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SYNC_HISTORY_LIMIT",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if sync.timeline_max_items == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SYNC_TIMELINE_MAX_ITEMS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            api_url,
            socket_url,
            token,
            keyring_account,
            sync,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is unset or blank.
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { key } => write!(f, "{key} is required"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_url<F>(key: &'static str, schemes: &[&str], lookup: &mut F) -> Result<Url, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = optional_trimmed_env(key, lookup).ok_or(ConfigError::Missing { key })?;
    let url = Url::parse(&value).map_err(|err| ConfigError::InvalidValue {
        key,
        value: value.clone(),
        reason: err.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidValue {
            key,
            value,
            reason: format!("scheme must be one of {}", schemes.join(", ")),
        });
    }
    Ok(url)
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_u16<F>(key: &'static str, default: u16, lookup: &mut F) -> Result<u16, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_with_default(key, default, lookup)
}

fn parse_u32<F>(key: &'static str, default: u32, lookup: &mut F) -> Result<u32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_with_default(key, default, lookup)
}

fn parse_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_with_default(key, default, lookup)
}

fn parse_usize<F>(key: &'static str, default: usize, lookup: &mut F) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_with_default(key, default, lookup)
}

/// Intervals of zero would disable keepalive, dedup or refresh entirely.
fn parse_nonzero_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = parse_u64(key, default, lookup)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be greater than 0".to_owned(),
        });
    }
    Ok(value)
}
