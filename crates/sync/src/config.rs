use std::str::FromStr;
use std::time::Duration;

use crate::poll::PollConfig;
use crate::reconnect::ReconnectConfig;

/// Synchronization configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local backend on port 8000.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Push-channel base URL (default: `ws://127.0.0.1:8000/ws`).
    pub ws_url: String,
    /// Backend HTTP base URL (default: `http://127.0.0.1:8000`).
    pub api_url: String,
    pub reconnect: ReconnectConfig,
    pub poll: PollConfig,
    /// Keep a low-frequency poll running while the push channel is open
    /// (default: `true`).
    pub safety_net_poll: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8000/ws".into(),
            api_url: "http://127.0.0.1:8000".into(),
            reconnect: ReconnectConfig::default(),
            poll: PollConfig::default(),
            safety_net_poll: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

impl SyncConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                         | Default                   |
    /// |---------------------------------|---------------------------|
    /// | `TRAPICK_WS_URL`                | `ws://127.0.0.1:8000/ws`  |
    /// | `TRAPICK_API_URL`               | `http://127.0.0.1:8000`   |
    /// | `RECONNECT_DELAY_SECS`          | `3`                       |
    /// | `RECONNECT_MAX_ATTEMPTS`        | `5`                       |
    /// | `POLL_ACTIVE_INTERVAL_SECS`     | `5`                       |
    /// | `POLL_SAFETY_NET_INTERVAL_SECS` | `10`                      |
    /// | `POLL_SAFETY_NET`               | `true`                    |
    /// | `POLL_REQUEST_TIMEOUT_SECS`     | `10`                      |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let ws_url = lookup("TRAPICK_WS_URL").unwrap_or(defaults.ws_url);
        let api_url = lookup("TRAPICK_API_URL").unwrap_or(defaults.api_url);

        let reconnect = ReconnectConfig {
            delay: secs(&lookup, "RECONNECT_DELAY_SECS", defaults.reconnect.delay)?,
            max_attempts: parse(
                &lookup,
                "RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect.max_attempts,
            )?,
        };

        let poll = PollConfig {
            active_interval: positive_secs(
                &lookup,
                "POLL_ACTIVE_INTERVAL_SECS",
                defaults.poll.active_interval,
            )?,
            safety_net_interval: positive_secs(
                &lookup,
                "POLL_SAFETY_NET_INTERVAL_SECS",
                defaults.poll.safety_net_interval,
            )?,
            request_timeout: positive_secs(
                &lookup,
                "POLL_REQUEST_TIMEOUT_SECS",
                defaults.poll.request_timeout,
            )?,
        };

        let safety_net_poll = parse(&lookup, "POLL_SAFETY_NET", defaults.safety_net_poll)?;

        Ok(Self {
            ws_url,
            api_url,
            reconnect,
            poll,
            safety_net_poll,
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse(lookup, var, default.as_secs()).map(Duration::from_secs)
}

/// Intervals and timeouts of zero would spin or never complete.
fn positive_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let value = secs(lookup, var, default)?;
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            var,
            value: "0".into(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.reconnect.delay, Duration::from_secs(3));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.poll.active_interval, Duration::from_secs(5));
        assert_eq!(config.poll.safety_net_interval, Duration::from_secs(10));
        assert!(config.safety_net_poll);
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("TRAPICK_WS_URL", "wss://example.test/ws"),
            ("RECONNECT_MAX_ATTEMPTS", "2"),
            ("POLL_ACTIVE_INTERVAL_SECS", " 7 "),
            ("POLL_SAFETY_NET", "false"),
        ])
        .unwrap();
        assert_eq!(config.ws_url, "wss://example.test/ws");
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.poll.active_interval, Duration::from_secs(7));
        assert!(!config.safety_net_poll);
    }

    #[test]
    fn invalid_number_names_the_variable() {
        let err = load(&[("RECONNECT_DELAY_SECS", "soon")]).unwrap_err();
        assert_matches!(err, ConfigError::Invalid { var: "RECONNECT_DELAY_SECS", .. });
        assert!(err.to_string().contains("soon"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        assert_matches!(
            load(&[("POLL_ACTIVE_INTERVAL_SECS", "0")]),
            Err(ConfigError::Invalid { var: "POLL_ACTIVE_INTERVAL_SECS", .. })
        );
    }
}
