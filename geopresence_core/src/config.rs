//! Startup configuration.
//!
//! Both endpoint addresses are supplied from outside (environment variables
//! in the binaries). A missing or unusable address is a startup error, never
//! a runtime fault.

use crate::connection::HubOptions;
use geopresence_env::{DefaultReconnectPolicy, NegotiateOptions};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Hub endpoint (required).
pub const HUB_URL_VAR: &str = "PRESENCE_HUB_URL";
/// Base address of the user listing API (required).
pub const API_BASE_URL_VAR: &str = "PRESENCE_API_BASE_URL";
/// Skip the negotiate round-trip (`true`/`false`).
pub const SKIP_NEGOTIATION_VAR: &str = "PRESENCE_SKIP_NEGOTIATION";
/// Bearer token for the hub.
pub const ACCESS_TOKEN_VAR: &str = "PRESENCE_ACCESS_TOKEN";
/// Reconnect delays in milliseconds, comma separated.
pub const RECONNECT_DELAYS_VAR: &str = "PRESENCE_RECONNECT_DELAYS_MS";
/// Keep-alive interval in milliseconds (0 disables).
pub const KEEP_ALIVE_VAR: &str = "PRESENCE_KEEP_ALIVE_MS";
/// Server timeout in milliseconds (0 disables).
pub const SERVER_TIMEOUT_VAR: &str = "PRESENCE_SERVER_TIMEOUT_MS";

/// Schemes accepted for the hub endpoint.
pub const HUB_SCHEMES: &[&str] = &["http", "https", "ws", "wss"];
/// Schemes accepted for the listing API.
pub const API_SCHEMES: &[&str] = &["http", "https"];

/// Configuration faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{var} is not a valid URL: {reason}")]
    InvalidUrl { var: &'static str, reason: String },

    #[error("{var} uses unsupported scheme '{scheme}'")]
    UnsupportedScheme { var: &'static str, scheme: String },

    #[error("{var} has invalid value '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

/// Parses and checks an absolute endpoint URL.
pub fn parse_endpoint(var: &'static str, raw: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConfigError::Missing(var));
    }
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        var,
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::UnsupportedScheme {
            var,
            scheme: url.scheme().to_string(),
        });
    }
    Ok(url)
}

/// Everything a presence client needs to start.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Hub endpoint address
    pub hub_url: Url,

    /// Base address of the user listing API
    pub api_base_url: Url,

    /// Keep-alive and timeout settings for the hub connection
    pub hub: HubOptions,

    /// Reconnect delays, one per attempt
    pub reconnect_delays: Vec<Duration>,

    /// Negotiate step settings
    pub negotiate: NegotiateOptions,
}

impl PresenceConfig {
    /// Creates a configuration with default connection settings.
    pub fn new(hub_url: Url, api_base_url: Url) -> Self {
        Self {
            hub_url,
            api_base_url,
            hub: HubOptions::default(),
            reconnect_delays: DefaultReconnectPolicy::default().delays().to_vec(),
            negotiate: NegotiateOptions::default(),
        }
    }

    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through an arbitrary key lookup.
    ///
    /// Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let hub_url = get(HUB_URL_VAR).ok_or(ConfigError::Missing(HUB_URL_VAR))?;
        let api_base_url = get(API_BASE_URL_VAR).ok_or(ConfigError::Missing(API_BASE_URL_VAR))?;
        let mut config = Self::new(
            parse_endpoint(HUB_URL_VAR, &hub_url, HUB_SCHEMES)?,
            parse_endpoint(API_BASE_URL_VAR, &api_base_url, API_SCHEMES)?,
        );

        if let Some(value) = get(SKIP_NEGOTIATION_VAR) {
            config.negotiate.skip_negotiation = parse_bool(SKIP_NEGOTIATION_VAR, &value)?;
        }
        config.negotiate.access_token = get(ACCESS_TOKEN_VAR).map(|t| t.trim().to_string());

        if let Some(value) = get(RECONNECT_DELAYS_VAR) {
            config.reconnect_delays = value
                .split(',')
                .map(|part| parse_millis(RECONNECT_DELAYS_VAR, part))
                .collect::<Result<_, _>>()?;
        }
        if let Some(value) = get(KEEP_ALIVE_VAR) {
            config.hub.keep_alive_interval = non_zero(parse_millis(KEEP_ALIVE_VAR, &value)?);
        }
        if let Some(value) = get(SERVER_TIMEOUT_VAR) {
            config.hub.server_timeout = non_zero(parse_millis(SERVER_TIMEOUT_VAR, &value)?);
        }

        Ok(config)
    }

    /// Replaces the hub connection settings.
    pub fn with_hub_options(mut self, hub: HubOptions) -> Self {
        self.hub = hub;
        self
    }

    /// Replaces the reconnect delays.
    pub fn with_reconnect_delays(mut self, delays: Vec<Duration>) -> Self {
        self.reconnect_delays = delays;
        self
    }

    /// Reconnect policy built from the configured delays.
    pub fn reconnect_policy(&self) -> DefaultReconnectPolicy {
        DefaultReconnectPolicy::with_delays(self.reconnect_delays.clone())
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_millis(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        })
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = PresenceConfig::from_lookup(lookup(&[
            (HUB_URL_VAR, "https://hub.example.com/locationHub"),
            (API_BASE_URL_VAR, "https://api.example.com"),
        ]))
        .unwrap();

        assert_eq!(config.hub_url.as_str(), "https://hub.example.com/locationHub");
        assert_eq!(config.reconnect_delays.len(), 4);
        assert_eq!(config.hub.keep_alive_interval, Some(Duration::from_secs(15)));
        assert!(!config.negotiate.skip_negotiation);
        assert!(config.negotiate.access_token.is_none());
    }

    #[test]
    fn test_missing_endpoints_are_errors() {
        let err = PresenceConfig::from_lookup(lookup(&[(API_BASE_URL_VAR, "https://api.example.com")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing(HUB_URL_VAR));

        let err = PresenceConfig::from_lookup(lookup(&[
            (HUB_URL_VAR, "https://hub.example.com/hub"),
            (API_BASE_URL_VAR, "   "),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing(API_BASE_URL_VAR));
    }

    #[test]
    fn test_invalid_values() {
        let err = PresenceConfig::from_lookup(lookup(&[
            (HUB_URL_VAR, "not a url"),
            (API_BASE_URL_VAR, "https://api.example.com"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { var: HUB_URL_VAR, .. }));

        let err = PresenceConfig::from_lookup(lookup(&[
            (HUB_URL_VAR, "https://hub.example.com/hub"),
            (API_BASE_URL_VAR, "ws://api.example.com"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnsupportedScheme {
                var: API_BASE_URL_VAR,
                scheme: "ws".to_string()
            }
        );

        let err = PresenceConfig::from_lookup(lookup(&[
            (HUB_URL_VAR, "https://hub.example.com/hub"),
            (API_BASE_URL_VAR, "https://api.example.com"),
            (RECONNECT_DELAYS_VAR, "0, 1000, soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: RECONNECT_DELAYS_VAR, .. }));
    }

    #[test]
    fn test_overrides() {
        let config = PresenceConfig::from_lookup(lookup(&[
            (HUB_URL_VAR, "http://localhost:5000/hub"),
            (API_BASE_URL_VAR, "http://localhost:5001"),
            (SKIP_NEGOTIATION_VAR, "TRUE"),
            (ACCESS_TOKEN_VAR, " secret "),
            (RECONNECT_DELAYS_VAR, "0, 500,1500"),
            (KEEP_ALIVE_VAR, "0"),
            (SERVER_TIMEOUT_VAR, "45000"),
        ]))
        .unwrap();

        assert!(config.negotiate.skip_negotiation);
        assert_eq!(config.negotiate.access_token.as_deref(), Some("secret"));
        assert_eq!(
            config.reconnect_delays,
            vec![Duration::ZERO, Duration::from_millis(500), Duration::from_millis(1500)]
        );
        assert_eq!(config.hub.keep_alive_interval, None);
        assert_eq!(config.hub.server_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.reconnect_policy().delays().len(), 3);
    }
}
