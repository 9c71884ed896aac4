use serde::{Deserialize, Serialize};

/// Where and how to reach the MMS relay for one transaction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct TransactionSettings {
    pub mmsc_url: String,
    #[serde(default)]
    pub proxy_address: Option<String>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
}

impl TransactionSettings {
    pub fn new(mmsc_url: impl Into<String>) -> Self {
        Self {
            mmsc_url: mmsc_url.into(),
            proxy_address: None,
            proxy_port: None,
        }
    }

    pub fn is_proxy_set(&self) -> bool {
        self.proxy_address
            .as_deref()
            .map(|addr| !addr.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    pub settings: TransactionSettings,
    pub auto_retrieve: bool,
    pub lease_extension_ms: u64,
    pub max_concurrent_transactions: usize,
    pub alarm_horizon_ms: Option<u64>,
    pub event_buffer: usize,
    pub max_send_rate_per_minute: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            settings: TransactionSettings::default(),
            auto_retrieve: true,
            lease_extension_ms: 30 * 1000,
            max_concurrent_transactions: 4,
            alarm_horizon_ms: None,
            event_buffer: 256,
            max_send_rate_per_minute: 100,
        }
    }
}
