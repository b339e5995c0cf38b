//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;

use crate::util::time::{DEFAULT_TICK_RATE, MAX_TICK_RATE, MIN_TICK_RATE};

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address (HTTP control surface and `/ws`)
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON formatted logs
    pub log_json: bool,

    /// Simulation ticks per second
    pub tick_rate: u32,

    /// Persistence store base URL, stats are only logged when unset
    pub store_url: Option<String>,
    /// Persistence store service key
    pub store_service_key: String,

    /// Allowed client origins for CORS (comma separated), permissive when unset
    pub client_origin: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8492".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),

            tick_rate: env_int_or_default(
                env::var("TICK_RATE").ok().as_deref(),
                DEFAULT_TICK_RATE,
                MIN_TICK_RATE,
                MAX_TICK_RATE,
            ),

            store_url: non_empty(env::var("STORE_URL").ok()),
            store_service_key: env::var("STORE_SERVICE_KEY").unwrap_or_default(),

            client_origin: non_empty(env::var("CLIENT_ORIGIN").ok()),
        })
    }
}

/// Parse an integer setting, falling back to `default` when missing,
/// malformed or outside `[min, max]`
pub fn env_int_or_default(value: Option<&str>, default: u32, min: u32, max: u32) -> u32 {
    value
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| (min..=max).contains(v))
        .unwrap_or(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_settings_fall_back_outside_bounds() {
        assert_eq!(env_int_or_default(Some("30"), 60, 1, 240), 30);
        assert_eq!(env_int_or_default(Some("0"), 60, 1, 240), 60);
        assert_eq!(env_int_or_default(Some("999"), 60, 1, 240), 60);
        assert_eq!(env_int_or_default(Some("fast"), 60, 1, 240), 60);
        assert_eq!(env_int_or_default(None, 60, 1, 240), 60);
    }

    #[test]
    fn blank_values_are_unset() {
        assert_eq!(non_empty(Some("  ".to_string())), None);
        assert_eq!(
            non_empty(Some("http://db".to_string())).as_deref(),
            Some("http://db")
        );
    }
}
