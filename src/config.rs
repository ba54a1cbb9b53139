/// Runtime settings read from the environment
///
/// | variable | default | meaning |
/// |---|---|---|
/// | `HOST` | `127.0.0.1` | server bind address |
/// | `PORT` | `8080` | server port |
/// | `LIVEFILTER_POPOUT_TIMEOUT_MS` | `5000` | how long a pop-out waits for a peer |
use crate::error::ConfigurationError;
use std::time::Duration;

pub const HOST_VAR: &str = "HOST";
pub const PORT_VAR: &str = "PORT";
pub const POPOUT_TIMEOUT_VAR: &str = "LIVEFILTER_POPOUT_TIMEOUT_MS";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_POPOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for a SyncBridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Bounded wait for a pop-out acknowledgement
    pub popout_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            popout_timeout: DEFAULT_POPOUT_TIMEOUT,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigurationError> {
        let mut config = SyncConfig::default();
        if let Some(value) = lookup(POPOUT_TIMEOUT_VAR) {
            let millis: u64 = parse(POPOUT_TIMEOUT_VAR, &value)?;
            if millis == 0 {
                return Err(invalid(POPOUT_TIMEOUT_VAR, &value, "must be greater than zero"));
            }
            config.popout_timeout = Duration::from_millis(millis);
        }
        Ok(config)
    }
}

/// Settings for the WebSocket server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigurationError> {
        let mut config = ServerConfig::default();
        if let Some(host) = lookup(HOST_VAR) {
            if host.trim().is_empty() {
                return Err(invalid(HOST_VAR, &host, "must not be empty"));
            }
            config.host = host;
        }
        if let Some(value) = lookup(PORT_VAR) {
            config.port = parse(PORT_VAR, &value)?;
        }
        Ok(config)
    }

    /// Address the server binds to, as `host:port`
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigurationError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, value, &e.to_string()))
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
