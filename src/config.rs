//! Configuration: built-in defaults, then TOML file, then `EPORTAL_` environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::{BaseDirs, ProjectDirs};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interface::SelectionPolicy;
use crate::model::InterfaceKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub portal: PortalConfig,
    #[serde(default)]
    pub reachability: ReachabilityConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub auto_login: AutoLoginConfig,
    #[serde(default)]
    pub interfaces: InterfaceConfig,
    /// Saved accounts file; defaults to `<home>/net_ids.json`.
    pub credentials_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PortalConfig {
    pub landing_url: String,
    /// Base of the `eportal/portal` API (no trailing slash).
    pub eportal_url: String,
    pub ip_lookup_url: String,
    pub request_timeout_secs: u64,
    pub accept_invalid_certs: bool,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            landing_url: "https://xha.ouc.edu.cn".into(),
            eportal_url: "https://xha.ouc.edu.cn:802/eportal/portal".into(),
            ip_lookup_url: "http://ip.ouc.edu.cn".into(),
            request_timeout_secs: 10,
            accept_invalid_certs: false,
        }
    }
}

impl PortalConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReachabilityConfig {
    pub internet: String,
    pub campus_dns: String,
    pub campus_gateway: String,
    pub timeout_secs: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            internet: "www.baidu.com".into(),
            campus_dns: "211.64.142.5".into(),
            campus_gateway: "192.168.101.201".into(),
            timeout_secs: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ScheduleConfig {
    pub refresh_interval_secs: u64,
    /// How long refreshes keep running after start or a connectivity change; 0 = forever.
    pub refresh_window_secs: u64,
    pub reachability_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 5,
            refresh_window_secs: 20,
            reachability_interval_secs: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AutoLoginConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub cooldown_secs: u64,
    pub interface: InterfaceKind,
}

impl Default for AutoLoginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            cooldown_secs: 30,
            interface: InterfaceKind::Wireless,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InterfaceConfig {
    /// Substrings an interface display name must contain to be considered.
    pub markers: Vec<String>,
    pub policy: SelectionPolicy,
    /// Line anchor for the `ipconfig /all` DNS fallback when the adapter has no IPv4.
    pub dns_anchor: String,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            markers: ["Ethernet", "以太网", "WLAN", "Wi-Fi", "Wireless"]
                .into_iter()
                .map(String::from)
                .collect(),
            policy: SelectionPolicy::PreferWired,
            dns_anchor: "10.191.222.147".into(),
        }
    }
}

/// Resolve the config file path via platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("edu", "ouc", "eportal-watchdog").map_or_else(
        || PathBuf::from("eportal-watchdog.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// `<home>/net_ids.json`, the file the desktop client always used.
pub fn default_credentials_path() -> PathBuf {
    let home = BaseDirs::new().map_or_else(|| PathBuf::from("."), |d| d.home_dir().to_path_buf());
    home.join("net_ids.json")
}

impl Config {
    /// Load from `path` (or the platform default) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(config_path, Path::to_path_buf);
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("EPORTAL_").split("__"));
        Self::from_figment(&figment)
    }

    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_path
            .clone()
            .unwrap_or_else(default_credentials_path)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("portal.request_timeout_secs", self.portal.request_timeout_secs),
            ("reachability.timeout_secs", self.reachability.timeout_secs),
            (
                "schedule.refresh_interval_secs",
                self.schedule.refresh_interval_secs,
            ),
            (
                "schedule.reachability_interval_secs",
                self.schedule.reachability_interval_secs,
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Validation {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.auto_login.max_attempts == 0 {
            return Err(ConfigError::Validation {
                field: "auto_login.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
