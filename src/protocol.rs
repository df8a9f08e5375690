//! Modbus application-layer messages
//!
//! Requests travel as opaque PDU payloads. Responses are decoded straight off
//! the transport: the pump reads the MBAP header and the function byte, asks
//! [`decode_response_shell`] which body layout that function has, then lets
//! the returned [`ResponseShell`] consume the body.
//!
//! | Code | Function | Response body |
//! |------|----------|---------------|
//! | 0x01 | Read Coils | byte count + data |
//! | 0x02 | Read Discrete Inputs | byte count + data |
//! | 0x03 | Read Holding Registers | byte count + data |
//! | 0x04 | Read Input Registers | byte count + data |
//! | 0x05 | Write Single Coil | address + value |
//! | 0x06 | Write Single Register | address + value |
//! | 0x0F | Write Multiple Coils | address + quantity |
//! | 0x10 | Write Multiple Registers | address + quantity |
//! | 0x16 | Mask Write Register | address + AND mask + OR mask |
//!
//! Exception responses (function byte | 0x80) carry a single exception code.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::constants::{
    EXCEPTION_ACKNOWLEDGE, EXCEPTION_FLAG, EXCEPTION_GATEWAY_PATH_UNAVAILABLE,
    EXCEPTION_GATEWAY_TARGET_FAILED, EXCEPTION_ILLEGAL_DATA_ADDRESS,
    EXCEPTION_ILLEGAL_DATA_VALUE, EXCEPTION_ILLEGAL_FUNCTION, EXCEPTION_MEMORY_PARITY_ERROR,
    EXCEPTION_SERVER_DEVICE_BUSY, EXCEPTION_SERVER_DEVICE_FAILURE, FC_MASK_WRITE_REGISTER,
    FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER,
};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::hex_byte;
use crate::transport::{read_bytes, ModbusTransport};

/// Modbus unit identifier
pub type DeviceId = u8;

// ============================================================================
// Request
// ============================================================================

/// An outbound Modbus request.
///
/// `payload` is the PDU: function code followed by its arguments. The
/// transaction id is filled in by the pump when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub transaction_id: Option<u16>,
    pub device_id: DeviceId,
    pub payload: Bytes,
}

impl Request {
    pub fn new(device_id: DeviceId, payload: impl Into<Bytes>) -> Self {
        Self {
            transaction_id: None,
            device_id,
            payload: payload.into(),
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: u16) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    /// Function code of the payload, if any
    pub fn function_code(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

// ============================================================================
// Function codes
// ============================================================================

/// Supported function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
    MaskWriteRegister,
}

/// Shape of a normal response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLayout {
    /// One byte count followed by that many data bytes
    ByteCount,
    /// Address and value, two bytes each
    AddressValue,
    /// Address and quantity, two bytes each
    AddressQuantity,
    /// Address, AND mask and OR mask, two bytes each
    AddressMasks,
}

impl FunctionCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            FC_READ_COILS => Some(Self::ReadCoils),
            FC_READ_DISCRETE_INPUTS => Some(Self::ReadDiscreteInputs),
            FC_READ_HOLDING_REGISTERS => Some(Self::ReadHoldingRegisters),
            FC_READ_INPUT_REGISTERS => Some(Self::ReadInputRegisters),
            FC_WRITE_SINGLE_COIL => Some(Self::WriteSingleCoil),
            FC_WRITE_SINGLE_REGISTER => Some(Self::WriteSingleRegister),
            FC_WRITE_MULTIPLE_COILS => Some(Self::WriteMultipleCoils),
            FC_WRITE_MULTIPLE_REGISTERS => Some(Self::WriteMultipleRegisters),
            FC_MASK_WRITE_REGISTER => Some(Self::MaskWriteRegister),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::ReadCoils => FC_READ_COILS,
            Self::ReadDiscreteInputs => FC_READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters => FC_READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters => FC_READ_INPUT_REGISTERS,
            Self::WriteSingleCoil => FC_WRITE_SINGLE_COIL,
            Self::WriteSingleRegister => FC_WRITE_SINGLE_REGISTER,
            Self::WriteMultipleCoils => FC_WRITE_MULTIPLE_COILS,
            Self::WriteMultipleRegisters => FC_WRITE_MULTIPLE_REGISTERS,
            Self::MaskWriteRegister => FC_MASK_WRITE_REGISTER,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ReadCoils => "Read Coils",
            Self::ReadDiscreteInputs => "Read Discrete Inputs",
            Self::ReadHoldingRegisters => "Read Holding Registers",
            Self::ReadInputRegisters => "Read Input Registers",
            Self::WriteSingleCoil => "Write Single Coil",
            Self::WriteSingleRegister => "Write Single Register",
            Self::WriteMultipleCoils => "Write Multiple Coils",
            Self::WriteMultipleRegisters => "Write Multiple Registers",
            Self::MaskWriteRegister => "Mask Write Register",
        }
    }

    pub fn body_layout(self) -> BodyLayout {
        match self {
            Self::ReadCoils
            | Self::ReadDiscreteInputs
            | Self::ReadHoldingRegisters
            | Self::ReadInputRegisters => BodyLayout::ByteCount,
            Self::WriteSingleCoil | Self::WriteSingleRegister => BodyLayout::AddressValue,
            Self::WriteMultipleCoils | Self::WriteMultipleRegisters => {
                BodyLayout::AddressQuantity
            }
            Self::MaskWriteRegister => BodyLayout::AddressMasks,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), hex_byte(self.to_u8()))
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = ModbusError;

    fn try_from(code: u8) -> ModbusResult<Self> {
        Self::from_u8(code).ok_or_else(|| ModbusError::invalid_function(code))
    }
}

/// True when the function byte has the exception bit set
pub fn is_exception_code(function_byte: u8) -> bool {
    function_byte & EXCEPTION_FLAG != 0
}

// ============================================================================
// Exception codes
// ============================================================================

/// Exception code carried by an exception response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    Unknown(u8),
}

impl ExceptionCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            EXCEPTION_ILLEGAL_FUNCTION => Self::IllegalFunction,
            EXCEPTION_ILLEGAL_DATA_ADDRESS => Self::IllegalDataAddress,
            EXCEPTION_ILLEGAL_DATA_VALUE => Self::IllegalDataValue,
            EXCEPTION_SERVER_DEVICE_FAILURE => Self::ServerDeviceFailure,
            EXCEPTION_ACKNOWLEDGE => Self::Acknowledge,
            EXCEPTION_SERVER_DEVICE_BUSY => Self::ServerDeviceBusy,
            EXCEPTION_MEMORY_PARITY_ERROR => Self::MemoryParityError,
            EXCEPTION_GATEWAY_PATH_UNAVAILABLE => Self::GatewayPathUnavailable,
            EXCEPTION_GATEWAY_TARGET_FAILED => Self::GatewayTargetFailed,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::IllegalFunction => EXCEPTION_ILLEGAL_FUNCTION,
            Self::IllegalDataAddress => EXCEPTION_ILLEGAL_DATA_ADDRESS,
            Self::IllegalDataValue => EXCEPTION_ILLEGAL_DATA_VALUE,
            Self::ServerDeviceFailure => EXCEPTION_SERVER_DEVICE_FAILURE,
            Self::Acknowledge => EXCEPTION_ACKNOWLEDGE,
            Self::ServerDeviceBusy => EXCEPTION_SERVER_DEVICE_BUSY,
            Self::MemoryParityError => EXCEPTION_MEMORY_PARITY_ERROR,
            Self::GatewayPathUnavailable => EXCEPTION_GATEWAY_PATH_UNAVAILABLE,
            Self::GatewayTargetFailed => EXCEPTION_GATEWAY_TARGET_FAILED,
            Self::Unknown(code) => code,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal function",
            Self::IllegalDataAddress => "Illegal data address",
            Self::IllegalDataValue => "Illegal data value",
            Self::ServerDeviceFailure => "Server device failure",
            Self::Acknowledge => "Acknowledge",
            Self::ServerDeviceBusy => "Server device busy",
            Self::MemoryParityError => "Memory parity error",
            Self::GatewayPathUnavailable => "Gateway path unavailable",
            Self::GatewayTargetFailed => "Gateway target device failed to respond",
            Self::Unknown(_) => "Unknown exception",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), hex_byte(self.to_u8()))
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Decoded body of a normal response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Data(Bytes),
    AddressValue { address: u16, value: u16 },
    AddressQuantity { address: u16, quantity: u16 },
    AddressMasks { address: u16, and_mask: u16, or_mask: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalResponse {
    pub transaction_id: u16,
    pub device_id: DeviceId,
    pub function: FunctionCode,
    pub body: ResponseBody,
}

impl NormalResponse {
    /// Raw data bytes of a read response
    pub fn data(&self) -> Option<&Bytes> {
        match &self.body {
            ResponseBody::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Register values of a FC03/FC04 response
    pub fn registers(&self) -> Option<Vec<u16>> {
        if !matches!(
            self.function,
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters
        ) {
            return None;
        }
        let data = self.data()?;
        Some(
            data.chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect(),
        )
    }

    /// First `quantity` bits of a FC01/FC02 response, least significant bit first
    pub fn coils(&self, quantity: usize) -> Option<Vec<bool>> {
        if !matches!(
            self.function,
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs
        ) {
            return None;
        }
        let data = self.data()?;
        Some(
            (0..quantity.min(data.len() * 8))
                .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
                .collect(),
        )
    }

    /// Echoed address of a write response
    pub fn address(&self) -> Option<u16> {
        match self.body {
            ResponseBody::AddressValue { address, .. }
            | ResponseBody::AddressQuantity { address, .. }
            | ResponseBody::AddressMasks { address, .. } => Some(address),
            ResponseBody::Data(_) => None,
        }
    }

    pub fn value(&self) -> Option<u16> {
        match self.body {
            ResponseBody::AddressValue { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn quantity(&self) -> Option<u16> {
        match self.body {
            ResponseBody::AddressQuantity { quantity, .. } => Some(quantity),
            _ => None,
        }
    }

    /// `(and_mask, or_mask)` of a mask write response
    pub fn masks(&self) -> Option<(u16, u16)> {
        match self.body {
            ResponseBody::AddressMasks {
                and_mask, or_mask, ..
            } => Some((and_mask, or_mask)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionResponse {
    pub transaction_id: u16,
    pub device_id: DeviceId,
    pub function: FunctionCode,
    /// Function byte as received, exception bit included
    pub raw_function: u8,
    pub exception: ExceptionCode,
}

/// A response as delivered by the pump
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Normal(NormalResponse),
    Exception(ExceptionResponse),
}

impl Response {
    pub fn transaction_id(&self) -> u16 {
        match self {
            Response::Normal(r) => r.transaction_id,
            Response::Exception(r) => r.transaction_id,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        match self {
            Response::Normal(r) => r.device_id,
            Response::Exception(r) => r.device_id,
        }
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            Response::Normal(r) => r.function,
            Response::Exception(r) => r.function,
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, Response::Exception(_))
    }

    /// Turn an exception response into [`ModbusError::Exception`]
    pub fn into_result(self) -> ModbusResult<NormalResponse> {
        match self {
            Response::Normal(r) => Ok(r),
            Response::Exception(r) => Err(ModbusError::Exception {
                function: r.function.to_u8(),
                code: r.exception.to_u8(),
            }),
        }
    }
}

// ============================================================================
// Decoding off the transport
// ============================================================================

/// Response header information known before its body is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseShell {
    pub transaction_id: u16,
    pub device_id: DeviceId,
    pub function: FunctionCode,
}

/// Look up the response type for a function code (exception bit already cleared).
///
/// `None` for codes outside the supported set.
pub fn decode_response_shell(
    function_code: u8,
    device_id: DeviceId,
    transaction_id: u16,
) -> Option<ResponseShell> {
    FunctionCode::from_u8(function_code).map(|function| ResponseShell {
        transaction_id,
        device_id,
        function,
    })
}

fn be_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

impl ResponseShell {
    async fn read_field<T: ModbusTransport>(
        &self,
        transport: &T,
        count: usize,
        field: &str,
        timeout: Duration,
    ) -> ModbusResult<Bytes> {
        read_bytes(transport, count, timeout).await?.ok_or_else(|| {
            ModbusError::framing(format!(
                "timeout reading {} of {} response",
                field,
                self.function.name()
            ))
        })
    }

    /// Consume a normal response body laid out per [`FunctionCode::body_layout`].
    pub async fn read_normal_body<T: ModbusTransport>(
        &self,
        transport: &T,
        timeout: Duration,
    ) -> ModbusResult<Response> {
        let body = match self.function.body_layout() {
            BodyLayout::ByteCount => {
                let count = self.read_field(transport, 1, "byte count", timeout).await?[0];
                if count == 0 {
                    return Err(ModbusError::framing(format!(
                        "byte count of {} response is 0",
                        self.function.name()
                    )));
                }
                let data = self
                    .read_field(transport, count as usize, "data", timeout)
                    .await?;
                ResponseBody::Data(data)
            }
            BodyLayout::AddressValue => {
                let raw = self
                    .read_field(transport, 4, "address and value", timeout)
                    .await?;
                ResponseBody::AddressValue {
                    address: be_u16(&raw, 0),
                    value: be_u16(&raw, 2),
                }
            }
            BodyLayout::AddressQuantity => {
                let raw = self
                    .read_field(transport, 4, "address and quantity", timeout)
                    .await?;
                ResponseBody::AddressQuantity {
                    address: be_u16(&raw, 0),
                    quantity: be_u16(&raw, 2),
                }
            }
            BodyLayout::AddressMasks => {
                let raw = self
                    .read_field(transport, 6, "address and masks", timeout)
                    .await?;
                ResponseBody::AddressMasks {
                    address: be_u16(&raw, 0),
                    and_mask: be_u16(&raw, 2),
                    or_mask: be_u16(&raw, 4),
                }
            }
        };

        debug!(
            "Response decoded: TID={:04X}, unit={}, FC={}",
            self.transaction_id, self.device_id, self.function
        );
        Ok(Response::Normal(NormalResponse {
            transaction_id: self.transaction_id,
            device_id: self.device_id,
            function: self.function,
            body,
        }))
    }

    /// Consume the single exception code byte of an exception response.
    pub async fn read_error_body<T: ModbusTransport>(
        &self,
        transport: &T,
        raw_function: u8,
        timeout: Duration,
    ) -> ModbusResult<Response> {
        let code = self
            .read_field(transport, 1, "exception code", timeout)
            .await?[0];
        let exception = ExceptionCode::from_u8(code);

        debug!(
            "Exception decoded: TID={:04X}, unit={}, FC={}, {}",
            self.transaction_id,
            self.device_id,
            hex_byte(raw_function),
            exception
        );
        Ok(Response::Exception(ExceptionResponse {
            transaction_id: self.transaction_id,
            device_id: self.device_id,
            function: self.function,
            raw_function,
            exception,
        }))
    }
}
