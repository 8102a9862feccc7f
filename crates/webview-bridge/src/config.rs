use std::env;
use std::path::PathBuf;
use std::time::Duration;

use collab_relay::RelayConfig;
use thiserror::Error;
use url::Url;

pub const DEFAULT_AUTOCONNECT: &str = "active-runtime,ask";
pub const DEFAULT_RUN_URL: &str = platform_client::DEFAULT_RUN_URL;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub request_timeout: Duration,
    /// Auto-connect strategy names, tried in order.
    pub autoconnect: Vec<String>,
    pub relay: RelayConfig,
    pub cache_dir: Option<PathBuf>,
    pub expiry_sweep_interval: Duration,
    pub run_url: String,
    pub token: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: crate::requests::DEFAULT_REQUEST_TIMEOUT,
            autoconnect: parse_strategy_list(DEFAULT_AUTOCONNECT),
            relay: RelayConfig::default(),
            cache_dir: None,
            expiry_sweep_interval: Duration::from_secs(30),
            run_url: DEFAULT_RUN_URL.to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid EDITOR_BRIDGE_REQUEST_TIMEOUT_MS: {0}")]
    InvalidRequestTimeout(String),
    #[error("invalid EDITOR_BRIDGE_COLLAB_DEBOUNCE_MS: {0}")]
    InvalidCollabDebounce(String),
    #[error("invalid EDITOR_BRIDGE_RECONNECT_FLOOR_MS: {0}")]
    InvalidReconnectFloor(String),
    #[error("invalid EDITOR_BRIDGE_RECONNECT_CAP_MS: {0}")]
    InvalidReconnectCap(String),
    #[error("invalid EDITOR_BRIDGE_EXPIRY_SWEEP_SECONDS: {0}")]
    InvalidExpirySweep(String),
    #[error("invalid DATALAYER_RUN_URL: {0}")]
    InvalidRunUrl(String),
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let request_timeout_ms = parse_u64_lookup(
            &lookup,
            "EDITOR_BRIDGE_REQUEST_TIMEOUT_MS",
            defaults.request_timeout.as_millis() as u64,
            ConfigError::InvalidRequestTimeout,
        )?;
        if request_timeout_ms == 0 {
            return Err(ConfigError::InvalidRequestTimeout(
                "must be greater than zero".to_string(),
            ));
        }

        let autoconnect = lookup("EDITOR_BRIDGE_AUTOCONNECT")
            .map_or_else(|| defaults.autoconnect.clone(), |raw| parse_strategy_list(&raw));

        let debounce_ms = parse_u64_lookup(
            &lookup,
            "EDITOR_BRIDGE_COLLAB_DEBOUNCE_MS",
            defaults.relay.disconnect_debounce.as_millis() as u64,
            ConfigError::InvalidCollabDebounce,
        )?;
        let floor_ms = parse_u64_lookup(
            &lookup,
            "EDITOR_BRIDGE_RECONNECT_FLOOR_MS",
            defaults.relay.reconnect_floor.as_millis() as u64,
            ConfigError::InvalidReconnectFloor,
        )?;
        if floor_ms == 0 {
            return Err(ConfigError::InvalidReconnectFloor(
                "must be greater than zero".to_string(),
            ));
        }
        let cap_ms = parse_u64_lookup(
            &lookup,
            "EDITOR_BRIDGE_RECONNECT_CAP_MS",
            defaults.relay.reconnect_cap.as_millis() as u64,
            ConfigError::InvalidReconnectCap,
        )?;
        if cap_ms < floor_ms {
            return Err(ConfigError::InvalidReconnectCap(format!(
                "{cap_ms} is below the reconnect floor {floor_ms}"
            )));
        }

        let sweep_seconds = parse_u64_lookup(
            &lookup,
            "EDITOR_BRIDGE_EXPIRY_SWEEP_SECONDS",
            defaults.expiry_sweep_interval.as_secs(),
            ConfigError::InvalidExpirySweep,
        )?;
        if sweep_seconds == 0 {
            return Err(ConfigError::InvalidExpirySweep(
                "must be greater than zero".to_string(),
            ));
        }

        let cache_dir = lookup("EDITOR_BRIDGE_CACHE_DIR")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let run_url = lookup("DATALAYER_RUN_URL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_RUN_URL.to_string());
        Url::parse(&run_url).map_err(|error| ConfigError::InvalidRunUrl(format!("{run_url}: {error}")))?;

        let token = lookup("DATALAYER_TOKEN")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Ok(Self {
            request_timeout: Duration::from_millis(request_timeout_ms),
            autoconnect,
            relay: RelayConfig {
                disconnect_debounce: Duration::from_millis(debounce_ms),
                reconnect_floor: Duration::from_millis(floor_ms),
                reconnect_cap: Duration::from_millis(cap_ms),
                ..defaults.relay
            },
            cache_dir,
            expiry_sweep_interval: Duration::from_secs(sweep_seconds),
            run_url,
            token,
        })
    }
}

/// `"a, b,,c"` -> `["a", "b", "c"]`. An empty value disables auto-connect.
pub fn parse_strategy_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_u64_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    error: fn(String) -> ConfigError,
) -> Result<u64, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|parse_error| error(format!("{raw}: {parse_error}"))),
        None => Ok(default),
    }
}
