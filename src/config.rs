//! # Adapter Configuration
//!
//! Deserialisable configuration for Modbus/TCP devices, protocol adapters and
//! sources. Keys are PascalCase; durations are given in milliseconds.
//!
//! ```json
//! {
//!   "ProtocolAdapters": {
//!     "tcp-adapter": {
//!       "Devices": {
//!         "plc-1": { "Address": "10.0.0.5", "DeviceId": 1, "RequestDepth": 4 }
//!       }
//!     }
//!   },
//!   "Sources": {
//!     "line-1": { "ProtocolAdapter": "tcp-adapter", "AdapterDevice": "plc-1" }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_READ_TIMEOUT, DEFAULT_TCP_PORT,
    DEFAULT_WAIT_AFTER_ERROR_MS, MIN_CONFIGURED_DURATION_MS,
};
use crate::error::{ModbusError, ModbusResult};

/// Default number of requests a source may have in flight.
pub const DEFAULT_REQUEST_DEPTH: usize = 1;

fn default_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_request_depth() -> usize {
    DEFAULT_REQUEST_DEPTH
}

fn default_wait_ms() -> u64 {
    DEFAULT_WAIT_AFTER_ERROR_MS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT.as_millis() as u64
}

// ============================================================================
// Device
// ============================================================================

/// Connection settings for one Modbus/TCP device.
///
/// # Example
///
/// ```rust
/// use modbus_link::DeviceConfig;
///
/// let device = DeviceConfig::new("10.0.0.5")
///     .with_device_id(3)
///     .with_request_depth(4)
///     .with_connect_timeout_ms(2_000);
///
/// assert!(device.validate().is_ok());
/// assert_eq!(device.endpoint(), "10.0.0.5:502");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceConfig {
    /// Host name or IP address of the device.
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Unit identifier used when a request does not carry one.
    #[serde(default)]
    pub device_id: u8,
    /// Maximum number of concurrent requests per read cycle.
    #[serde(default = "default_request_depth")]
    pub request_depth: usize,
    #[serde(rename = "ConnectTimeout", default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(rename = "WaitAfterConnectError", default = "default_wait_ms")]
    pub wait_after_connect_error_ms: u64,
    #[serde(rename = "WaitAfterReadError", default = "default_wait_ms")]
    pub wait_after_read_error_ms: u64,
    #[serde(rename = "WaitAfterWriteError", default = "default_wait_ms")]
    pub wait_after_write_error_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: DEFAULT_TCP_PORT,
            device_id: 0,
            request_depth: DEFAULT_REQUEST_DEPTH,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            wait_after_connect_error_ms: DEFAULT_WAIT_AFTER_ERROR_MS,
            wait_after_read_error_ms: DEFAULT_WAIT_AFTER_ERROR_MS,
            wait_after_write_error_ms: DEFAULT_WAIT_AFTER_ERROR_MS,
        }
    }
}

impl DeviceConfig {
    /// Create a device configuration with default port and timings.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_device_id(mut self, device_id: u8) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_request_depth(mut self, depth: usize) -> Self {
        self.request_depth = depth;
        self
    }

    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn with_wait_after_connect_error_ms(mut self, ms: u64) -> Self {
        self.wait_after_connect_error_ms = ms;
        self
    }

    pub fn with_wait_after_read_error_ms(mut self, ms: u64) -> Self {
        self.wait_after_read_error_ms = ms;
        self
    }

    pub fn with_wait_after_write_error_ms(mut self, ms: u64) -> Self {
        self.wait_after_write_error_ms = ms;
        self
    }

    /// `address:port` as used in log lines.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn wait_after_connect_error(&self) -> Duration {
        Duration::from_millis(self.wait_after_connect_error_ms)
    }

    pub fn wait_after_read_error(&self) -> Duration {
        Duration::from_millis(self.wait_after_read_error_ms)
    }

    pub fn wait_after_write_error(&self) -> Duration {
        Duration::from_millis(self.wait_after_write_error_ms)
    }

    /// Check address, port, request depth and the minimum of every timing.
    pub fn validate(&self) -> ModbusResult<()> {
        if self.address.trim().is_empty() {
            return Err(ModbusError::configuration("Address of device must be set"));
        }
        if self.port == 0 {
            return Err(ModbusError::configuration(format!(
                "Port {} is not a valid port",
                self.port
            )));
        }
        if self.request_depth < 1 {
            return Err(ModbusError::configuration(
                "RequestDepth must be 1 or more",
            ));
        }
        for (key, ms) in [
            ("ConnectTimeout", self.connect_timeout_ms),
            ("WaitAfterConnectError", self.wait_after_connect_error_ms),
            ("WaitAfterReadError", self.wait_after_read_error_ms),
            ("WaitAfterWriteError", self.wait_after_write_error_ms),
        ] {
            if ms < MIN_CONFIGURED_DURATION_MS {
                return Err(ModbusError::configuration(format!(
                    "{} must be at least {}ms, got {}ms",
                    key, MIN_CONFIGURED_DURATION_MS, ms
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Adapter and source
// ============================================================================

/// Devices served by one protocol adapter, keyed by device name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AdapterConfig {
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

impl AdapterConfig {
    pub fn with_device(mut self, name: impl Into<String>, device: DeviceConfig) -> Self {
        self.devices.insert(name.into(), device);
        self
    }
}

/// A named data source reading from one adapter device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SourceConfig {
    pub protocol_adapter: String,
    pub adapter_device: String,
    /// Upper bound for one read cycle of this source.
    #[serde(rename = "ReadTimeout", default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl SourceConfig {
    pub fn new(protocol_adapter: impl Into<String>, adapter_device: impl Into<String>) -> Self {
        Self {
            protocol_adapter: protocol_adapter.into(),
            adapter_device: adapter_device.into(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }

    pub fn with_read_timeout_ms(mut self, ms: u64) -> Self {
        self.read_timeout_ms = ms;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Top-level configuration: adapters and the sources that use them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModbusTcpConfig {
    #[serde(default)]
    pub protocol_adapters: BTreeMap<String, AdapterConfig>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

impl ModbusTcpConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ModbusError::configuration(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_adapter(mut self, name: impl Into<String>, adapter: AdapterConfig) -> Self {
        self.protocol_adapters.insert(name.into(), adapter);
        self
    }

    pub fn with_source(mut self, name: impl Into<String>, source: SourceConfig) -> Self {
        self.sources.insert(name.into(), source);
        self
    }

    /// Look up the device a source reads from.
    pub fn source_device(&self, source: &str) -> Option<&DeviceConfig> {
        let source = self.sources.get(source)?;
        self.protocol_adapters
            .get(&source.protocol_adapter)?
            .devices
            .get(&source.adapter_device)
    }

    /// Validate every device and every source reference.
    pub fn validate(&self) -> ModbusResult<()> {
        if self.sources.is_empty() {
            return Err(ModbusError::configuration(
                "configuration must have at least one source",
            ));
        }

        for (adapter_id, adapter) in &self.protocol_adapters {
            for (device_name, device) in &adapter.devices {
                device.validate().map_err(|e| {
                    ModbusError::configuration(format!(
                        "adapter \"{}\" device \"{}\": {}",
                        adapter_id, device_name, e
                    ))
                })?;
            }
        }

        for (source_id, source) in &self.sources {
            if source.read_timeout_ms == 0 {
                return Err(ModbusError::configuration(format!(
                    "Source \"{}\", ReadTimeout must be at least 1 millisecond",
                    source_id
                )));
            }
            let adapter = self.protocol_adapters.get(&source.protocol_adapter).ok_or_else(|| {
                ModbusError::configuration(format!(
                    "Source \"{}\", ProtocolAdapter \"{}\" does not exist, existing adapters are {:?}",
                    source_id,
                    source.protocol_adapter,
                    self.protocol_adapters.keys().collect::<Vec<_>>()
                ))
            })?;
            if !adapter.devices.contains_key(&source.adapter_device) {
                return Err(ModbusError::configuration(format!(
                    "Source \"{}\", AdapterDevice \"{}\" does not exist for ProtocolAdapter \"{}\", existing devices are {:?}",
                    source_id,
                    source.adapter_device,
                    source.protocol_adapter,
                    adapter.devices.keys().collect::<Vec<_>>()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_defaults() {
        let device = DeviceConfig::new("plc");
        assert_eq!(device.port, 502);
        assert_eq!(device.request_depth, 1);
        assert_eq!(device.connect_timeout(), Duration::from_secs(10));
        assert_eq!(device.wait_after_read_error(), Duration::from_secs(10));
        assert!(device.validate().is_ok());
    }

    #[test]
    fn test_device_validation() {
        assert!(DeviceConfig::new("").validate().is_err());
        assert!(DeviceConfig::new("plc").with_port(0).validate().is_err());
        assert!(DeviceConfig::new("plc")
            .with_request_depth(0)
            .validate()
            .is_err());

        let err = DeviceConfig::new("plc")
            .with_wait_after_write_error_ms(999)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("WaitAfterWriteError"));

        assert!(DeviceConfig::new("plc")
            .with_connect_timeout_ms(1000)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "ProtocolAdapters": {
                "tcp": {
                    "Devices": {
                        "plc-1": {
                            "Address": "10.0.0.5",
                            "Port": 5020,
                            "DeviceId": 7,
                            "RequestDepth": 3,
                            "WaitAfterConnectError": 2500
                        }
                    }
                }
            },
            "Sources": {
                "line-1": { "ProtocolAdapter": "tcp", "AdapterDevice": "plc-1", "ReadTimeout": 500 }
            }
        }"#;

        let config = ModbusTcpConfig::from_json(json).unwrap();
        let device = config.source_device("line-1").unwrap();
        assert_eq!(device.address, "10.0.0.5");
        assert_eq!(device.port, 5020);
        assert_eq!(device.device_id, 7);
        assert_eq!(device.request_depth, 3);
        assert_eq!(device.wait_after_connect_error_ms, 2500);
        assert_eq!(device.wait_after_read_error_ms, 10_000);
        assert_eq!(
            config.sources["line-1"].read_timeout(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_unknown_device_reference() {
        let config = ModbusTcpConfig::default()
            .with_adapter(
                "tcp",
                AdapterConfig::default().with_device("plc-1", DeviceConfig::new("10.0.0.5")),
            )
            .with_source("line-1", SourceConfig::new("tcp", "plc-2"));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("\"plc-2\" does not exist"));
    }

    #[test]
    fn test_unknown_adapter_reference() {
        let config = ModbusTcpConfig::default()
            .with_source("line-1", SourceConfig::new("missing", "plc-1"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_requires_a_source() {
        assert!(ModbusTcpConfig::default().validate().is_err());
    }
}
