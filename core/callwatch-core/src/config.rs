//! Monitor configuration.
//!
//! Loaded from `~/.callwatch/config.toml`. A missing file yields defaults, and
//! every field may be omitted. A few values can be overridden from the
//! environment so a one-off session does not need a config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallwatchError, Result};

pub const CONFIG_DIR_NAME: &str = ".callwatch";
pub const CONFIG_FILE_NAME: &str = "config.toml";

pub const ENV_API_URL: &str = "CALLWATCH_API_URL";
pub const ENV_SOCKET_URL: &str = "CALLWATCH_SOCKET_URL";
pub const ENV_OPERATOR: &str = "CALLWATCH_OPERATOR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub api_base_url: String,
    /// Socket.IO server base URL; the Engine.IO path is appended when missing.
    pub socket_url: String,
    /// Telephony address of the operator. Scopes `call_started` events.
    pub operator_identity: Option<String>,
    /// Key passed to the active-call snapshot. Falls back to the operator identity.
    pub owner_key: Option<String>,
    pub poll_interval_ms: u64,
    pub liveness_sample_ms: u64,
    pub refetch_delay_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            socket_url: "ws://localhost:8001".to_string(),
            operator_identity: None,
            owner_key: None,
            poll_interval_ms: 3_000,
            liveness_sample_ms: 5_000,
            refetch_delay_ms: 1_500,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl MonitorConfig {
    /// Owner key for snapshot fetches; empty when neither key nor identity is set.
    pub fn snapshot_owner(&self) -> String {
        self.owner_key
            .as_deref()
            .or(self.operator_identity.as_deref())
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn liveness_sample_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_sample_ms)
    }

    pub fn refetch_delay(&self) -> Duration {
        Duration::from_millis(self.refetch_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("liveness_sample_ms", self.liveness_sample_ms),
            ("reconnect_base_ms", self.reconnect_base_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(CallwatchError::ConfigInvalid {
                    field: field.to_string(),
                    details: "must be greater than zero".to_string(),
                });
            }
        }
        if self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(CallwatchError::ConfigInvalid {
                field: "reconnect_max_ms".to_string(),
                details: format!(
                    "must be at least reconnect_base_ms ({})",
                    self.reconnect_base_ms
                ),
            });
        }
        for (field, value) in [
            ("api_base_url", &self.api_base_url),
            ("socket_url", &self.socket_url),
        ] {
            if value.trim().is_empty() {
                return Err(CallwatchError::ConfigInvalid {
                    field: field.to_string(),
                    details: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Applies `CALLWATCH_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary lookup. Blank values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(url) = read(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(url) = read(ENV_SOCKET_URL) {
            self.socket_url = url;
        }
        if let Some(identity) = read(ENV_OPERATOR) {
            self.operator_identity = Some(identity);
        }
    }
}

pub fn callwatch_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR_NAME))
        .ok_or(CallwatchError::HomeDirNotFound)
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(callwatch_dir()?.join(CONFIG_FILE_NAME))
}

/// Loads configuration from `path`, or the default location when `None`.
///
/// Environment overrides are not applied here; see
/// [`MonitorConfig::apply_env_overrides`].
pub fn load_config(path: Option<PathBuf>) -> Result<MonitorConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(MonitorConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| {
        CallwatchError::ConfigReadFailed {
            path: config_path.clone(),
            source,
        }
    })?;
    parse_config(&config_path, &content)
}

fn parse_config(path: &Path, content: &str) -> Result<MonitorConfig> {
    let config =
        toml::from_str::<MonitorConfig>(content).map_err(|err| CallwatchError::ConfigMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?;
    config.validate()?;
    Ok(config)
}
