#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use modbus_link::{Request, MAX_PDU_SIZE};

#[derive(Debug, Arbitrary)]
enum Op {
    ReadCoils { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
    MaskWrite { address: u16, and_mask: u16, or_mask: u16 },
}

fuzz_target!(|op: Op| {
    let built = match op {
        Op::ReadCoils { address, quantity } => Request::read_coils(1, address, quantity),
        Op::ReadHoldingRegisters { address, quantity } => {
            Request::read_holding_registers(1, address, quantity)
        }
        Op::WriteSingleCoil { address, value } => Request::write_single_coil(1, address, value),
        Op::WriteMultipleCoils { address, values } => {
            Request::write_multiple_coils(1, address, &values)
        }
        Op::WriteMultipleRegisters { address, values } => {
            Request::write_multiple_registers(1, address, &values)
        }
        Op::MaskWrite {
            address,
            and_mask,
            or_mask,
        } => Request::mask_write_register(1, address, and_mask, or_mask),
    };

    if let Ok(request) = built {
        assert!(!request.payload.is_empty());
        assert!(request.payload.len() <= MAX_PDU_SIZE);
    }
});
