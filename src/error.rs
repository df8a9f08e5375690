//! Error types for the Modbus/TCP link
//!
//! Every fallible operation in the crate returns [`ModbusResult`]. Framing
//! errors never reach the caller of `send`: the protocol reader logs them and
//! resynchronises. They are still modelled here so the reader and the MBAP
//! codec can report them uniformly.

use thiserror::Error;

/// Result alias used throughout the crate
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors produced by the codec, transport, pump and registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// A frame could not be read off the wire (timeout mid-frame, bad protocol id)
    #[error("{message}")]
    Framing { message: String },

    /// Malformed or unsupported protocol content
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Function code outside the supported set
    #[error("invalid function code 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Request arguments out of range
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    /// Socket could not be established
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Socket level I/O failure
    #[error("I/O error: {message}")]
    Io { message: String },

    /// An operation did not finish in time
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Invalid device or adapter configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The device answered with an exception response
    #[error("device exception for function 0x{function:02X}: code 0x{code:02X}")]
    Exception { function: u8, code: u8 },

    /// The transport or pump has been shut down
    #[error("channel closed")]
    Closed,

    /// A source or device name is not known to the registry
    #[error("device not found: {name}")]
    DeviceNotFound { name: String },
}

impl ModbusError {
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn device_not_found(name: impl Into<String>) -> Self {
        Self::DeviceNotFound { name: name.into() }
    }

    /// True for errors that only discard the current frame
    pub fn is_framing(&self) -> bool {
        matches!(self, Self::Framing { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True once the underlying queues are gone and no retry can succeed
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_message_is_verbatim() {
        let err = ModbusError::framing("timeout reading MBAP length");
        assert_eq!(err.to_string(), "timeout reading MBAP length");
        assert!(err.is_framing());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeout_display() {
        let err = ModbusError::timeout("read cycle", 1500);
        assert_eq!(err.to_string(), "read cycle timed out after 1500ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: ModbusError = io.into();
        assert!(matches!(err, ModbusError::Io { ref message } if message.contains("reset")));
    }

    #[test]
    fn test_exception_display() {
        let err = ModbusError::Exception {
            function: 0x03,
            code: 0x02,
        };
        assert_eq!(
            err.to_string(),
            "device exception for function 0x03: code 0x02"
        );
    }
}
