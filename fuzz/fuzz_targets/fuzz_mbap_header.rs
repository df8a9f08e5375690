#![no_main]

use libfuzzer_sys::fuzz_target;
use modbus_link::MbapHeader;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = MbapHeader::decode(data) {
        assert_eq!(header.protocol_id, 0);
        assert_eq!(&header.encode()[..], &data[..7]);
    }
});
