use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::util::http::Uri;

const DEFAULT_API_ENDPOINT: &str = "https://api.particle.io";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed delay between login attempts while recovering a lost session.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} undefined")]
    Missing(&'static str),

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Cloud connection settings.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base URI of the device-cloud API.
    pub api_endpoint: Uri,

    /// OAuth client identity used to obtain access tokens.
    pub client_id: String,
    pub client_secret: String,

    /// Timeout for one-shot requests. Streaming requests are exempt.
    pub request_timeout: Duration,

    /// Delay between re-login attempts during recovery.
    pub retry_interval: Duration,
}

impl Config {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            api_endpoint: Uri::from_static(DEFAULT_API_ENDPOINT),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id = env::var("TETHER_CLIENT_ID")
            .map_err(|_| ConfigError::Missing("TETHER_CLIENT_ID"))?;
        let client_secret = env::var("TETHER_CLIENT_SECRET")
            .map_err(|_| ConfigError::Missing("TETHER_CLIENT_SECRET"))?;

        let mut config = Self::new(client_id, client_secret);

        if let Ok(endpoint) = env::var("TETHER_API_ENDPOINT") {
            config.api_endpoint = endpoint.try_into().map_err(|e| ConfigError::Invalid {
                name: "TETHER_API_ENDPOINT",
                reason: format!("{e}"),
            })?;
        }
        if let Ok(ms) = env::var("TETHER_REQUEST_TIMEOUT_MS") {
            config.request_timeout = parse_duration_ms("TETHER_REQUEST_TIMEOUT_MS", &ms)?;
        }
        if let Ok(ms) = env::var("TETHER_RETRY_INTERVAL_MS") {
            config.retry_interval = parse_duration_ms("TETHER_RETRY_INTERVAL_MS", &ms)?;
        }

        Ok(config)
    }
}

fn parse_duration_ms(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new("client-id", "client-secret");
        assert_eq!(config.api_endpoint, Uri::from_static(DEFAULT_API_ENDPOINT));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_duration_ms() {
        assert_eq!(
            parse_duration_ms("X", "1500").unwrap(),
            Duration::from_millis(1500)
        );
        assert!(parse_duration_ms("X", "not-a-number").is_err());
    }
}
