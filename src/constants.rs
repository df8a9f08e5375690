//! Modbus/TCP protocol and runtime constants
//!
//! Frame limits follow the Modbus application protocol:
//! - Maximum PDU size: 253 bytes (inherited from the RS485 ADU limit of 256 bytes)
//! - Register/coil limits are calculated to fit within the PDU size constraint
//!
//! Queue sizes and wait intervals are the runtime defaults of the transport
//! and the protocol pump.

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header length on the wire
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1) = 7 bytes
pub const MBAP_HEADER_LEN: usize = 7;

/// Protocol identifier carried by every Modbus/TCP frame
pub const MODBUS_TCP_PROTOCOL_ID: u16 = 0x0000;

/// Maximum PDU (Protocol Data Unit) size
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Function code bit set on exception responses
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04
/// 1 (FC) + 1 (byte count) + N × 2 ≤ 253 → N ≤ 125
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16
/// 1 (FC) + 2 (addr) + 2 (qty) + 1 (byte count) + N × 2 ≤ 253 → N ≤ 123
pub const MAX_WRITE_REGISTERS: usize = 123;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum number of coils for FC01/FC02
pub const MAX_READ_COILS: usize = 2000;

/// Maximum number of coils for FC15
pub const MAX_WRITE_COILS: usize = 1968;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Mask Write Register (FC22)
pub const FC_MASK_WRITE_REGISTER: u8 = 0x16;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

// ============================================================================
// Queue Capacities
// ============================================================================

/// Capacity of the pump's request and response queues
pub const PROTOCOL_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the transport's outbound chunk queue
pub const TRANSPORT_WRITE_QUEUE_CAPACITY: usize = 128;

/// Capacity of the transport's inbound byte queue
pub const TRANSPORT_READ_QUEUE_CAPACITY: usize = 128;

/// Size of the buffer each socket read fills
pub const READ_BUFFER_SIZE: usize = 128;

// ============================================================================
// Timing Defaults
// ============================================================================

/// Default Modbus/TCP port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Poll interval of a blocking socket read; expiry is not an error
pub const READ_BLOCKING_DURATION: Duration = Duration::from_millis(1000);

/// Idle wait of the transport writer while no socket is connected
pub const DISCONNECTED_WRITER_WAIT: Duration = Duration::from_millis(1000);

/// Default timeout for the pump's single-byte and sub-field reads
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default timeout for `close`/`stop`
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default connect timeout and error backoff, in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_WAIT_AFTER_ERROR_MS: u64 = 10_000;

/// Lower bound for any configured timeout or wait
pub const MIN_CONFIGURED_DURATION_MS: u64 = 1_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_HEADER_LEN, 7);
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(MAX_MBAP_LENGTH, 254);
    }

    #[test]
    fn test_register_limits_fit_pdu() {
        assert!(1 + 1 + MAX_READ_REGISTERS * 2 <= MAX_PDU_SIZE);
        assert!(1 + 2 + 2 + 1 + MAX_WRITE_REGISTERS * 2 <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_coil_limits_fit_pdu() {
        assert!(1 + 1 + MAX_READ_COILS.div_ceil(8) <= MAX_PDU_SIZE);
        assert!(1 + 2 + 2 + 1 + MAX_WRITE_COILS.div_ceil(8) <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_exception_flag_is_outside_function_range() {
        for fc in [
            FC_READ_COILS,
            FC_READ_DISCRETE_INPUTS,
            FC_READ_HOLDING_REGISTERS,
            FC_READ_INPUT_REGISTERS,
            FC_WRITE_SINGLE_COIL,
            FC_WRITE_SINGLE_REGISTER,
            FC_WRITE_MULTIPLE_COILS,
            FC_WRITE_MULTIPLE_REGISTERS,
            FC_MASK_WRITE_REGISTER,
        ] {
            assert_eq!(fc & EXCEPTION_FLAG, 0);
        }
    }
}
