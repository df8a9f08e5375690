//! Request PDU construction
//!
//! [`PduBuilder`] assembles a PDU into a `BytesMut` with a fluent API; the
//! `Request` constructors below validate quantities against the protocol
//! limits and wrap the finished PDU for the pump.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::constants::{
    FC_MASK_WRITE_REGISTER, FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS,
    FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE, MAX_READ_COILS,
    MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{DeviceId, FunctionCode, Request};

/// PDU builder - fluent API
#[derive(Debug, Default)]
pub struct PduBuilder {
    buf: BytesMut,
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_PDU_SIZE),
        }
    }

    fn ensure_room(&self, extra: usize) -> ModbusResult<()> {
        if self.buf.len() + extra > MAX_PDU_SIZE {
            return Err(ModbusError::protocol(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.buf.len(),
                extra,
                MAX_PDU_SIZE
            )));
        }
        Ok(())
    }

    /// Set function code; codes outside [`FunctionCode`] are rejected
    #[inline]
    pub fn function_code(self, fc: u8) -> ModbusResult<Self> {
        let function = FunctionCode::try_from(fc)?;
        self.byte(function.to_u8())
    }

    /// Add a big-endian address
    #[inline]
    pub fn address(self, addr: u16) -> ModbusResult<Self> {
        self.word(addr)
    }

    /// Add a big-endian quantity
    #[inline]
    pub fn quantity(self, qty: u16) -> ModbusResult<Self> {
        self.word(qty)
    }

    #[inline]
    pub fn word(mut self, value: u16) -> ModbusResult<Self> {
        self.ensure_room(2)?;
        self.buf.put_u16(value);
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.ensure_room(1)?;
        self.buf.put_u8(b);
        Ok(self)
    }

    #[inline]
    pub fn data(mut self, data: &[u8]) -> ModbusResult<Self> {
        self.ensure_room(data.len())?;
        self.buf.put_slice(data);
        Ok(self)
    }

    /// Finish the PDU
    pub fn build(self) -> Bytes {
        match self.buf.first().copied().and_then(FunctionCode::from_u8) {
            Some(function) => debug!("PDU built: FC={}, total_len={}", function, self.buf.len()),
            None => debug!("PDU built: total_len={}", self.buf.len()),
        }
        self.buf.freeze()
    }
}

fn check_quantity(what: &str, quantity: u16, max: usize) -> ModbusResult<()> {
    if quantity == 0 || quantity as usize > max {
        return Err(ModbusError::invalid_data(format!(
            "{} quantity {} out of range 1..={}",
            what, quantity, max
        )));
    }
    Ok(())
}

/// Pack booleans into bytes, least significant bit first
fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; values.len().div_ceil(8)];
    for (i, &value) in values.iter().enumerate() {
        if value {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

impl Request {
    fn read(device_id: DeviceId, fc: u8, address: u16, quantity: u16) -> ModbusResult<Self> {
        let pdu = PduBuilder::new()
            .function_code(fc)?
            .address(address)?
            .quantity(quantity)?
            .build();
        Ok(Request::new(device_id, pdu))
    }

    /// FC01
    pub fn read_coils(device_id: DeviceId, address: u16, quantity: u16) -> ModbusResult<Self> {
        check_quantity("coil", quantity, MAX_READ_COILS)?;
        Self::read(device_id, FC_READ_COILS, address, quantity)
    }

    /// FC02
    pub fn read_discrete_inputs(
        device_id: DeviceId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Self> {
        check_quantity("discrete input", quantity, MAX_READ_COILS)?;
        Self::read(device_id, FC_READ_DISCRETE_INPUTS, address, quantity)
    }

    /// FC03
    pub fn read_holding_registers(
        device_id: DeviceId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Self> {
        check_quantity("register", quantity, MAX_READ_REGISTERS)?;
        Self::read(device_id, FC_READ_HOLDING_REGISTERS, address, quantity)
    }

    /// FC04
    pub fn read_input_registers(
        device_id: DeviceId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Self> {
        check_quantity("register", quantity, MAX_READ_REGISTERS)?;
        Self::read(device_id, FC_READ_INPUT_REGISTERS, address, quantity)
    }

    /// FC05; `true` is sent as 0xFF00
    pub fn write_single_coil(device_id: DeviceId, address: u16, value: bool) -> ModbusResult<Self> {
        let pdu = PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_COIL)?
            .address(address)?
            .word(if value { 0xFF00 } else { 0x0000 })?
            .build();
        Ok(Request::new(device_id, pdu))
    }

    /// FC06
    pub fn write_single_register(
        device_id: DeviceId,
        address: u16,
        value: u16,
    ) -> ModbusResult<Self> {
        let pdu = PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_REGISTER)?
            .address(address)?
            .word(value)?
            .build();
        Ok(Request::new(device_id, pdu))
    }

    /// FC15
    pub fn write_multiple_coils(
        device_id: DeviceId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<Self> {
        let quantity = u16::try_from(values.len())
            .map_err(|_| ModbusError::invalid_data("too many coils"))?;
        check_quantity("coil", quantity, MAX_WRITE_COILS)?;
        let packed = pack_bits(values);

        let pdu = PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_COILS)?
            .address(address)?
            .quantity(quantity)?
            .byte(packed.len() as u8)?
            .data(&packed)?
            .build();
        Ok(Request::new(device_id, pdu))
    }

    /// FC16
    pub fn write_multiple_registers(
        device_id: DeviceId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<Self> {
        let quantity = u16::try_from(values.len())
            .map_err(|_| ModbusError::invalid_data("too many registers"))?;
        check_quantity("register", quantity, MAX_WRITE_REGISTERS)?;

        let mut builder = PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .address(address)?
            .quantity(quantity)?
            .byte((values.len() * 2) as u8)?;
        for &value in values {
            builder = builder.word(value)?;
        }
        Ok(Request::new(device_id, builder.build()))
    }

    /// FC22: `register = (register AND and_mask) OR (or_mask AND NOT and_mask)`
    pub fn mask_write_register(
        device_id: DeviceId,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<Self> {
        let pdu = PduBuilder::new()
            .function_code(FC_MASK_WRITE_REGISTER)?
            .address(address)?
            .word(and_mask)?
            .word(or_mask)?
            .build();
        Ok(Request::new(device_id, pdu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_builder() {
        let pdu = PduBuilder::new()
            .function_code(0x03)
            .unwrap()
            .address(0x0100)
            .unwrap()
            .quantity(0x000A)
            .unwrap()
            .build();
        assert_eq!(&pdu[..], &[0x03, 0x01, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn test_pdu_builder_rejects_oversize() {
        let result = PduBuilder::new()
            .function_code(0x10)
            .unwrap()
            .data(&[0u8; MAX_PDU_SIZE]);
        assert!(result.is_err());
    }

    #[test]
    fn test_pdu_builder_rejects_unsupported_function() {
        let err = PduBuilder::new().function_code(0x2B).unwrap_err();
        assert_eq!(err, ModbusError::InvalidFunction { code: 0x2B });
        assert_eq!(err.to_string(), "invalid function code 0x2B");
    }

    #[test]
    fn test_read_holding_registers() {
        let request = Request::read_holding_registers(1, 0x006B, 3).unwrap();
        assert_eq!(request.device_id, 1);
        assert_eq!(request.transaction_id, None);
        assert_eq!(&request.payload[..], &[0x03, 0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn test_read_quantity_limits() {
        assert!(Request::read_holding_registers(1, 0, 0).is_err());
        assert!(Request::read_input_registers(1, 0, 126).is_err());
        assert!(Request::read_input_registers(1, 0, 125).is_ok());
        assert!(Request::read_coils(1, 0, 2001).is_err());
        assert!(Request::read_discrete_inputs(1, 0, 2000).is_ok());
    }

    #[test]
    fn test_write_single_coil() {
        let request = Request::write_single_coil(1, 0x00AC, true).unwrap();
        assert_eq!(&request.payload[..], &[0x05, 0x00, 0xAC, 0xFF, 0x00]);
    }

    #[test]
    fn test_write_single_register() {
        let request = Request::write_single_register(1, 0x0001, 0x0003).unwrap();
        assert_eq!(&request.payload[..], &[0x06, 0x00, 0x01, 0x00, 0x03]);
    }

    #[test]
    fn test_write_multiple_coils() {
        let values = [true, false, true, true, false, false, true, true, true, false];
        let request = Request::write_multiple_coils(1, 0x0013, &values).unwrap();
        assert_eq!(
            &request.payload[..],
            &[0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]
        );
    }

    #[test]
    fn test_write_multiple_registers() {
        let request = Request::write_multiple_registers(1, 0x0001, &[0x000A, 0x0102]).unwrap();
        assert_eq!(
            &request.payload[..],
            &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
        assert!(Request::write_multiple_registers(1, 0, &[0u16; 124]).is_err());
    }

    #[test]
    fn test_mask_write_register() {
        let request = Request::mask_write_register(1, 0x0004, 0x00F2, 0x0025).unwrap();
        assert_eq!(
            &request.payload[..],
            &[0x16, 0x00, 0x04, 0x00, 0xF2, 0x00, 0x25]
        );
        assert_eq!(request.function_code(), Some(0x16));
    }
}
