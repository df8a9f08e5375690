//! # Modbus Link - Modbus/TCP framing and transport
//!
//! The connection core of an industrial data-collection adapter: it keeps a
//! persistent, auto-reconnecting TCP socket to each PLC and exposes a
//! request/response channel to polling logic above it.
//!
//! ## Layers
//!
//! | Layer | Type | Role |
//! |-------|------|------|
//! | Codec | [`MbapHeader`] | 7-byte MBAP header encode/decode |
//! | Transport | [`TcpTransport`] | Reconnecting socket, bounded byte queues, metrics |
//! | Protocol | [`ModbusTcp`] | Writer task + header/function reader state machine |
//! | Registry | [`DeviceRegistry`] | One transport and pump per configured device |
//!
//! ## Supported Function Codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x01 | Read Coils |
//! | 0x02 | Read Discrete Inputs |
//! | 0x03 | Read Holding Registers |
//! | 0x04 | Read Input Registers |
//! | 0x05 | Write Single Coil |
//! | 0x06 | Write Single Register |
//! | 0x0F | Write Multiple Coils |
//! | 0x10 | Write Multiple Registers |
//! | 0x16 | Mask Write Register |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use modbus_link::{DeviceConfig, ModbusResult, ModbusTcp, Request, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let transport = Arc::new(TcpTransport::new(
//!         DeviceConfig::new("127.0.0.1"),
//!         "tcp-adapter",
//!         Default::default(),
//!         None,
//!     ));
//!     transport.start()?;
//!
//!     let pump = ModbusTcp::new(Arc::clone(&transport), Duration::from_secs(10));
//!     let tid = pump.next_transaction_id();
//!     pump.send(Request::read_holding_registers(1, 0, 10)?.with_transaction_id(tid)).await?;
//!
//!     if let Some(response) = pump.receive().await {
//!         println!("TID {}: {:?}", response.transaction_id(), response);
//!     }
//!
//!     pump.stop(Duration::from_secs(10)).await;
//!     transport.close(Duration::from_secs(10)).await;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus/TCP protocol and runtime constants
pub mod constants;

/// MBAP header codec
pub mod mbap;

/// Requests, function codes and response decoding
pub mod protocol;

/// Request PDU construction
pub mod pdu;

/// Reconnecting TCP byte transport
pub mod transport;

/// Request/response pump over a transport
pub mod pump;

// ============================================================================
// Adapter modules
// ============================================================================

/// Device, adapter and source configuration
pub mod config;

/// Metric data points and sinks
pub mod metrics;

/// Packet logging helpers
pub mod logging;

/// Device registry and source read cycles
pub mod registry;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Error handling ===
pub use error::{ModbusError, ModbusResult};

// === Protocol ===
pub use mbap::MbapHeader;
pub use pdu::PduBuilder;
pub use protocol::{
    decode_response_shell, BodyLayout, DeviceId, ExceptionCode, ExceptionResponse, FunctionCode,
    NormalResponse, Request, Response, ResponseBody, ResponseShell,
};

// === Transport and pump ===
pub use pump::ModbusTcp;
pub use transport::{
    Connector, ModbusTransport, TcpConnector, TcpTransport, TransportGuard, TransportStats,
};

// === Configuration ===
pub use config::{AdapterConfig, DeviceConfig, ModbusTcpConfig, SourceConfig};

// === Monitoring ===
pub use metrics::{MetricDimensions, MetricUnit, MetricsBuffer, MetricsDataPoint, MetricsSink};

// === Registry ===
pub use registry::{DeviceChannel, DeviceRegistry, ModbusSource};

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    DEFAULT_TCP_PORT, MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Modbus Link v{} - Modbus/TCP framing and transport", VERSION)
}
