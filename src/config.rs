//! Transport configuration
//!
//! Every tunable of the links, loadable from a TOML file. Missing keys take
//! the Wi-Fi defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Link tunables
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Number of transmissions of an acknowledged command before giving up
    pub max_packet_retries: u32,
    /// Time to wait for an acknowledgement after each transmission
    pub ack_wait_ms: u64,
    /// Slice of the cooperative sleep
    pub sleep_granularity_ms: u64,
    /// Read timeout of the receive loop, bounds the latency of a disconnect
    pub read_timeout_ms: u64,
    /// Reconnection attempts after a BLE write failure
    pub reconnect_retries: u32,
    /// Local port the drone sends its datagrams to (0 picks a free port)
    pub d2c_port: u16,
    /// Controller type declared in the handshake
    pub controller_type: String,
    /// Controller name declared in the handshake
    pub controller_name: String,
    /// Video stream port declared to video capable airframes
    pub stream_port: u16,
    /// Video stream control port declared to video capable airframes
    pub stream_control_port: u16,
}

impl LinkConfig {
    /// Defaults of the Wi-Fi transport
    pub fn wifi_defaults() -> Self {
        Self {
            max_packet_retries: 1,
            ack_wait_ms: 500,
            sleep_granularity_ms: 100,
            read_timeout_ms: 5000,
            reconnect_retries: 3,
            d2c_port: 43210,
            controller_type: "computer".to_string(),
            controller_name: "parrotlink".to_string(),
            stream_port: 55004,
            stream_control_port: 55005,
        }
    }

    /// Defaults of the BLE transport
    pub fn ble_defaults() -> Self {
        Self { max_packet_retries: 3, ..Self::wifi_defaults() }
    }

    /// Load configuration from a TOML file
    ///
    /// # Arguments
    /// - `path`: Path to the TOML file
    ///
    /// # Returns
    /// Parsed configuration or error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Acknowledgement wait per transmission
    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }

    /// Cooperative sleep slice
    pub fn sleep_granularity(&self) -> Duration {
        Duration::from_millis(self.sleep_granularity_ms.max(1))
    }

    /// Receive loop read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::wifi_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let wifi = LinkConfig::wifi_defaults();
        assert_eq!(wifi.max_packet_retries, 1);
        assert_eq!(wifi.ack_wait(), Duration::from_millis(500));
        assert_eq!(wifi.sleep_granularity(), Duration::from_millis(100));
        assert_eq!(wifi.read_timeout(), Duration::from_secs(5));
        assert_eq!(wifi.d2c_port, 43210);

        let ble = LinkConfig::ble_defaults();
        assert_eq!(ble.max_packet_retries, 3);
        assert_eq!(ble.reconnect_retries, 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: LinkConfig = toml::from_str("max_packet_retries = 4\ncontroller_name = \"ground\"\n").unwrap();
        assert_eq!(config.max_packet_retries, 4);
        assert_eq!(config.controller_name, "ground");
        assert_eq!(config.ack_wait_ms, 500);
        assert_eq!(config.stream_port, 55004);
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("parrotlink-config-{}.toml", std::process::id()));
        let mut config = LinkConfig::ble_defaults();
        config.read_timeout_ms = 250;
        config.to_file(&path).unwrap();

        let loaded = LinkConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
