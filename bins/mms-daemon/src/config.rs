use mms_core::config::{CoreConfig, TransactionSettings};
use mms_core::policy::RetryPolicy;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    pub mmsc: MmscConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub control: ControlConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MmscConfig {
    pub url: String,
    #[serde(default)]
    pub proxy_address: Option<String>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default = "default_enabled")]
    pub auto_retrieve: bool,
    #[serde(default = "default_lease_extension_ms")]
    pub lease_extension_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_transactions: usize,
    #[serde(default)]
    pub alarm_horizon_ms: Option<u64>,
    #[serde(default = "default_send_rate")]
    pub max_send_rate_per_minute: u32,
    #[serde(default = "default_enabled")]
    pub scan_on_start: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            auto_retrieve: true,
            lease_extension_ms: default_lease_extension_ms(),
            max_concurrent_transactions: default_max_concurrent(),
            alarm_horizon_ms: None,
            max_send_rate_per_minute: default_send_rate(),
            scan_on_start: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeaseConfig {
    #[default]
    Active,
    Deferred,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    #[serde(default = "default_enabled")]
    pub available: bool,
    #[serde(default)]
    pub lease: LeaseConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            available: true,
            lease: LeaseConfig::Active,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_lease_extension_ms() -> u64 {
    30 * 1000
}

fn default_max_concurrent() -> usize {
    4
}

fn default_send_rate() -> u32 {
    100
}

fn default_bind_addr() -> String {
    "127.0.0.1:9180".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io")]
    Io,
    #[error("parse")]
    Parse,
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.mmsc.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid("mmsc.url must be http(s)".to_string()));
        }
        if self.mmsc.proxy_port.is_some() && self.mmsc.proxy_address.is_none() {
            return Err(ConfigError::Invalid(
                "mmsc.proxy_port requires mmsc.proxy_address".to_string(),
            ));
        }
        if self.mmsc.timeout_secs == 0 {
            return Err(ConfigError::Invalid("mmsc.timeout_secs".to_string()));
        }
        if self.service.max_concurrent_transactions == 0 {
            return Err(ConfigError::Invalid(
                "service.max_concurrent_transactions".to_string(),
            ));
        }
        if self.service.lease_extension_ms == 0 {
            return Err(ConfigError::Invalid("service.lease_extension_ms".to_string()));
        }
        self.retry
            .validate()
            .map_err(|err| ConfigError::Invalid(format!("retry: {}", err)))?;
        self.control
            .bind_addr
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::Invalid("control.bind_addr".to_string()))?;
        Ok(())
    }

    pub fn settings(&self) -> TransactionSettings {
        TransactionSettings {
            mmsc_url: self.mmsc.url.trim().to_string(),
            proxy_address: self.mmsc.proxy_address.clone(),
            proxy_port: self.mmsc.proxy_port,
        }
    }

    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            settings: self.settings(),
            auto_retrieve: self.service.auto_retrieve,
            lease_extension_ms: self.service.lease_extension_ms,
            max_concurrent_transactions: self.service.max_concurrent_transactions,
            alarm_horizon_ms: self.service.alarm_horizon_ms,
            max_send_rate_per_minute: self.service.max_send_rate_per_minute,
            ..CoreConfig::default()
        }
    }
}

pub fn load_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    toml::from_str(&content).map_err(|_| ConfigError::Parse)
}
