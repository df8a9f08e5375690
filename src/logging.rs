//! Packet logging helpers
//!
//! Raw frames are dumped as space-separated upper-case hex, prefixed with the
//! protocol tag and direction, e.g. `[MODBUS-TCP] TX plc-1:502 00 01 00 00 00 06 01 03 00 00 00 01`.

use tracing::trace;

/// Direction of a logged packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx,
    Rx,
}

impl PacketDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketDirection::Tx => "TX",
            PacketDirection::Rx => "RX",
        }
    }
}

/// Format bytes as `0A 1B 2C`
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format a single byte the way framing errors report it, e.g. `0x8F`
pub fn hex_byte(b: u8) -> String {
    format!("0x{:02X}", b)
}

/// Format bytes the way framing errors report them, e.g. `0x01 0x00`
pub fn hex_bytes(data: &[u8]) -> String {
    data.iter()
        .map(|&b| hex_byte(b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log a packet hex dump at trace level
pub fn log_packet(direction: PacketDirection, endpoint: &str, data: &[u8]) {
    trace!(
        "[MODBUS-TCP] {} {} {}",
        direction.as_str(),
        endpoint,
        format_hex_packet(data)
    );
}
