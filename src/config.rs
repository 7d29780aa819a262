//! Runtime configuration, read from `SIGNAL_HUB_*` environment variables.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::signaling::{DEFAULT_SIGNALING_PORT, OverflowPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Per-hub timing and queue sizes
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Idle window armed on creation, on registration and while members remain
    pub register_idle: Duration,

    /// Idle window armed after an unregistration
    pub unregister_idle: Duration,

    /// Pending relays a hub buffers before submitters wait
    pub relay_capacity: usize,

    /// Pending info queries a hub buffers before submitters wait
    pub info_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            register_idle: Duration::from_secs(30),
            unregister_idle: Duration::from_secs(5),
            relay_capacity: 8192,
            info_capacity: 512,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    /// Shared admission token; `None` admits everyone
    pub token: Option<String>,

    /// Outbound queue size of each connected client
    pub outbound_capacity: usize,

    pub overflow: OverflowPolicy,

    pub ping_interval: Duration,
    pub pong_timeout: Duration,

    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SIGNALING_PORT)),
            token: None,
            outbound_capacity: 256,
            overflow: OverflowPolicy::default(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source, starting from defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("SIGNAL_HUB_BIND") {
            config.bind_addr = parse("SIGNAL_HUB_BIND", &addr)?;
        }
        if let Some(token) = lookup("SIGNAL_HUB_TOKEN").filter(|t| !t.is_empty()) {
            config.token = Some(token);
        }
        if let Some(secs) = lookup("SIGNAL_HUB_REGISTER_IDLE_SECS") {
            config.hub.register_idle = Duration::from_secs(parse("SIGNAL_HUB_REGISTER_IDLE_SECS", &secs)?);
        }
        if let Some(secs) = lookup("SIGNAL_HUB_UNREGISTER_IDLE_SECS") {
            config.hub.unregister_idle =
                Duration::from_secs(parse("SIGNAL_HUB_UNREGISTER_IDLE_SECS", &secs)?);
        }
        if let Some(n) = lookup("SIGNAL_HUB_RELAY_CAPACITY") {
            config.hub.relay_capacity = parse_capacity("SIGNAL_HUB_RELAY_CAPACITY", &n)?;
        }
        if let Some(n) = lookup("SIGNAL_HUB_INFO_CAPACITY") {
            config.hub.info_capacity = parse_capacity("SIGNAL_HUB_INFO_CAPACITY", &n)?;
        }
        if let Some(n) = lookup("SIGNAL_HUB_OUTBOUND_CAPACITY") {
            config.outbound_capacity = parse_capacity("SIGNAL_HUB_OUTBOUND_CAPACITY", &n)?;
        }
        if let Some(policy) = lookup("SIGNAL_HUB_OVERFLOW") {
            config.overflow = match policy.as_str() {
                "disconnect" => OverflowPolicy::Disconnect,
                "drop_newest" => OverflowPolicy::DropNewest,
                "drop_oldest" => OverflowPolicy::DropOldest,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "SIGNAL_HUB_OVERFLOW",
                        reason: format!("unknown policy {other:?}"),
                    });
                }
            };
        }

        Ok(config)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        reason: e.to_string(),
    })
}

fn parse_capacity(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match parse::<usize>(key, value)? {
        0 => Err(ConfigError::InvalidValue {
            key,
            reason: "must be greater than zero".to_string(),
        }),
        n => Ok(n),
    }
}
