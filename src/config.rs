//! Device bring-up configuration (§3.8).
//!
//! `DeviceConfig` is the serde-deserializable record a host hands the
//! `Device` façade at construction: MAC address, queue pair topology, default
//! PMTU, RSS key/table overrides, and default flow-control/backpressure/EEE
//! thresholds plus PTP clock config. It lives in memory only for the
//! lifetime of bring-up; nothing here is read from or written to disk by the
//! crate itself, the one place a caller might round-trip it through JSON
//! (`serde_json`) being the `main` binary's own command-line handling.

use serde::{Deserialize, Serialize};

use crate::backpressure::{BackpressureConfig, EeeConfig};
use crate::error::{NicError, Result};
use crate::flowcontrol::{FlowControlConfig, PfcPriorityConfig, PFC_PRIORITIES};
use crate::rss::RssConfig;

fn default_mac_address() -> [u8; 6] {
    [0x02, 0x00, 0x00, 0x00, 0x00, 0x01]
}

fn default_queue_pair_count() -> u16 {
    4
}

fn default_ring_capacity() -> usize {
    256
}

fn default_cq_capacity() -> usize {
    512
}

fn default_pmtu() -> u32 {
    1500
}

fn default_pfc() -> [PfcPriorityConfig; PFC_PRIORITIES] {
    [PfcPriorityConfig::default(); PFC_PRIORITIES]
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PtpConfig {
    pub enabled: bool,
    pub drift_ppb: i64,
}

impl Default for PtpConfig {
    fn default() -> Self {
        Self { enabled: true, drift_ppb: 0 }
    }
}

/// Bring-up record for a whole device. Every field carries a default so a
/// caller can deserialize a partial JSON document and get a runnable
/// configuration; [`DeviceConfig::validate`] rejects the combinations that
/// would otherwise surface as a confusing panic deep inside subsystem
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    #[serde(default = "default_mac_address")]
    pub mac_address: [u8; 6],
    #[serde(default = "default_queue_pair_count")]
    pub queue_pair_count: u16,
    #[serde(default = "default_ring_capacity")]
    pub tx_ring_capacity: usize,
    #[serde(default = "default_ring_capacity")]
    pub rx_ring_capacity: usize,
    #[serde(default = "default_cq_capacity")]
    pub cq_capacity: usize,
    #[serde(default = "default_pmtu")]
    pub default_pmtu: u32,
    pub rss: RssConfig,
    pub flow_control: FlowControlConfig,
    #[serde(default = "default_pfc")]
    pub pfc: [PfcPriorityConfig; PFC_PRIORITIES],
    pub backpressure: BackpressureConfig,
    pub eee: EeeConfig,
    pub ptp: PtpConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mac_address: default_mac_address(),
            queue_pair_count: default_queue_pair_count(),
            tx_ring_capacity: default_ring_capacity(),
            rx_ring_capacity: default_ring_capacity(),
            cq_capacity: default_cq_capacity(),
            default_pmtu: default_pmtu(),
            rss: RssConfig::default(),
            flow_control: FlowControlConfig::default(),
            pfc: default_pfc(),
            backpressure: BackpressureConfig::default(),
            eee: EeeConfig::default(),
            ptp: PtpConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Parses a `DeviceConfig` from a JSON bring-up document. The only
    /// place this crate touches `serde_json` directly; everything else
    /// treats the config as an in-memory struct.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_pair_count == 0 {
            return Err(NicError::Config("queue_pair_count must be at least 1".into()));
        }
        if self.tx_ring_capacity == 0 || self.rx_ring_capacity == 0 {
            return Err(NicError::Config("ring capacities must be non-zero".into()));
        }
        if self.default_pmtu == 0 {
            return Err(NicError::Config("default_pmtu must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(DeviceConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_queue_pairs_is_rejected() {
        let config = DeviceConfig { queue_pair_count: 0, ..DeviceConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config = DeviceConfig::from_json(r#"{"default_pmtu": 9000}"#).unwrap();
        assert_eq!(config.default_pmtu, 9000);
        assert_eq!(config.queue_pair_count, default_queue_pair_count());
        assert_eq!(config.mac_address, default_mac_address());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(DeviceConfig::from_json("not json").is_err());
    }
}
