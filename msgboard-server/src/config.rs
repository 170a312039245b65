//! Server configuration.
//!
//! Defaults can be overridden from the environment:
//!
//! | Variable                    | Field                     |
//! |-----------------------------|---------------------------|
//! | `MSGBOARD_BIND_ADDR`        | `bind_addr`               |
//! | `MSGBOARD_SESSION_CAPACITY` | `session_capacity`        |
//! | `MSGBOARD_HEARTBEAT_SECS`   | `heartbeat_interval_secs` |
//! | `MSGBOARD_MAX_CONNECTIONS`  | `max_connections`         |

use std::str::FromStr;

pub const ENV_BIND_ADDR: &str = "MSGBOARD_BIND_ADDR";
pub const ENV_SESSION_CAPACITY: &str = "MSGBOARD_SESSION_CAPACITY";
pub const ENV_HEARTBEAT_SECS: &str = "MSGBOARD_HEARTBEAT_SECS";
pub const ENV_MAX_CONNECTIONS: &str = "MSGBOARD_MAX_CONNECTIONS";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Events buffered per observer before it is closed with `Overflow`
    pub session_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Connections beyond this are refused
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4000".to_string(),
            session_capacity: 256,
            heartbeat_interval_secs: 30,
            max_connections: 1024,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `MSGBOARD_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_BIND_ADDR).filter(|v| !v.trim().is_empty()) {
            config.bind_addr = addr.trim().to_string();
        }
        if let Some(capacity) = parse_var(&lookup, ENV_SESSION_CAPACITY) {
            config.session_capacity = capacity;
        }
        if let Some(secs) = parse_var(&lookup, ENV_HEARTBEAT_SECS) {
            config.heartbeat_interval_secs = secs;
        }
        if let Some(max) = parse_var(&lookup, ENV_MAX_CONNECTIONS) {
            config.max_connections = max;
        }
        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}
