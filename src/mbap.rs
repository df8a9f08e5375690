//! MBAP header codec
//!
//! ```text
//! +----------------+-------------+--------+---------+
//! | transaction id | protocol id | length | unit id |
//! |     2 bytes    |   0x0000    | 2 bytes| 1 byte  |
//! +----------------+-------------+--------+---------+
//! ```
//!
//! All fields are big-endian. `length` counts the unit id plus the PDU.

use std::time::Duration;

use tracing::debug;

use crate::constants::{MAX_MBAP_LENGTH, MAX_PDU_SIZE, MBAP_HEADER_LEN, MODBUS_TCP_PROTOCOL_ID};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::hex_bytes;
use crate::protocol::Request;
use crate::transport::{read_bytes, ModbusTransport};

/// Modbus Application Protocol header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Header for a request; a missing transaction id encodes as 0.
    ///
    /// Payloads longer than [`MAX_PDU_SIZE`] are rejected.
    pub fn create(request: &Request) -> ModbusResult<Self> {
        let payload_len = request.payload.len();
        if payload_len > MAX_PDU_SIZE {
            return Err(ModbusError::invalid_data(format!(
                "PDU of {} bytes exceeds the maximum of {}",
                payload_len, MAX_PDU_SIZE
            )));
        }
        let length = u16::try_from(payload_len + 1)
            .map_err(|_| ModbusError::invalid_data("MBAP length does not fit in 16 bits"))?;
        let header = Self {
            transaction_id: request.transaction_id.unwrap_or(0),
            protocol_id: MODBUS_TCP_PROTOCOL_ID,
            length,
            unit_id: request.device_id,
        };
        debug!(
            "MBAP header: TID={:04X}, length={}, unit={}",
            header.transaction_id, header.length, header.unit_id
        );
        Ok(header)
    }

    pub fn encode(&self) -> [u8; MBAP_HEADER_LEN] {
        let tid = self.transaction_id.to_be_bytes();
        let pid = self.protocol_id.to_be_bytes();
        let len = self.length.to_be_bytes();
        [tid[0], tid[1], pid[0], pid[1], len[0], len[1], self.unit_id]
    }

    /// Decode a complete 7-byte header.
    pub fn decode(bytes: &[u8]) -> ModbusResult<Self> {
        if bytes.len() < MBAP_HEADER_LEN {
            return Err(ModbusError::framing(format!(
                "MBAP header needs {} bytes, got {}",
                MBAP_HEADER_LEN,
                bytes.len()
            )));
        }
        check_protocol_id([bytes[2], bytes[3]])?;
        Ok(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: MODBUS_TCP_PROTOCOL_ID,
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }

    /// Read the rest of a header whose first byte has already been consumed.
    ///
    /// Sub-fields are read separately (1, 2, 2 and 1 bytes), each bounded by
    /// `timeout`. A timeout, a foreign protocol id or a length that cannot
    /// hold a function code fails the frame.
    pub async fn read<T: ModbusTransport>(
        transport: &T,
        timeout: Duration,
        transaction_id_high: u8,
    ) -> ModbusResult<Self> {
        let tid_low = read_bytes(transport, 1, timeout)
            .await?
            .ok_or_else(|| ModbusError::framing("timeout reading MBAP transaction ID LOW"))?;

        let protocol_id = read_bytes(transport, 2, timeout)
            .await?
            .ok_or_else(|| ModbusError::framing("timeout reading MBAP protocol ID"))?;
        check_protocol_id([protocol_id[0], protocol_id[1]])?;

        let length = read_bytes(transport, 2, timeout)
            .await?
            .ok_or_else(|| ModbusError::framing("timeout reading MBAP length"))?;

        let unit_id = read_bytes(transport, 1, timeout)
            .await?
            .ok_or_else(|| ModbusError::framing("timeout reading MBAP unit ID"))?;

        let header = Self {
            transaction_id: u16::from_be_bytes([transaction_id_high, tid_low[0]]),
            protocol_id: MODBUS_TCP_PROTOCOL_ID,
            length: u16::from_be_bytes([length[0], length[1]]),
            unit_id: unit_id[0],
        };
        if header.length < 2 || header.length as usize > MAX_MBAP_LENGTH {
            return Err(ModbusError::framing(format!(
                "MBAP length {} outside 2..={} for TID={:04X}",
                header.length, MAX_MBAP_LENGTH, header.transaction_id
            )));
        }
        Ok(header)
    }
}

fn check_protocol_id(received: [u8; 2]) -> ModbusResult<()> {
    let expected = MODBUS_TCP_PROTOCOL_ID.to_be_bytes();
    if received != expected {
        return Err(ModbusError::framing(format!(
            "{} is not the expected protocol ID {}",
            hex_bytes(&received),
            hex_bytes(&expected)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::ChannelTransport;
    use proptest::prelude::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn test_create_from_request() {
        let request = Request::new(0x11, vec![0x03, 0x00, 0x6B, 0x00, 0x03]).with_transaction_id(1);
        let header = MbapHeader::create(&request).unwrap();
        assert_eq!(header.length, 6);
        assert_eq!(
            header.encode(),
            [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11]
        );
    }

    #[test]
    fn test_missing_transaction_id_encodes_zero() {
        let header = MbapHeader::create(&Request::new(1, vec![0x03])).unwrap();
        assert_eq!(header.transaction_id, 0);
    }

    #[test]
    fn test_create_rejects_oversized_payload() {
        let at_limit = Request::new(1, vec![0x10; MAX_PDU_SIZE]);
        assert_eq!(MbapHeader::create(&at_limit).unwrap().length, 254);

        let err = MbapHeader::create(&Request::new(1, vec![0x03; 65_535])).unwrap_err();
        assert!(matches!(err, ModbusError::InvalidData { .. }));
        assert!(MbapHeader::create(&Request::new(1, vec![0x03; MAX_PDU_SIZE + 1])).is_err());
    }

    #[test]
    fn test_decode_rejects_foreign_protocol() {
        let err = MbapHeader::decode(&[0x00, 0x01, 0x01, 0x00, 0x00, 0x06, 0x01]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "0x01 0x00 is not the expected protocol ID 0x00 0x00"
        );
        assert!(MbapHeader::decode(&[0x00, 0x01]).is_err());
    }

    proptest! {
        #[test]
        fn prop_header_round_trip(
            tid in any::<u16>(),
            unit in any::<u8>(),
            payload in prop::collection::vec(any::<u8>(), 1..=MAX_PDU_SIZE),
        ) {
            let request = Request::new(unit, payload.clone()).with_transaction_id(tid);
            let header = MbapHeader::create(&request).unwrap();
            let decoded = MbapHeader::decode(&header.encode()).unwrap();
            prop_assert_eq!(decoded, header);
            prop_assert_eq!(decoded.transaction_id, tid);
            prop_assert_eq!(decoded.unit_id, unit);
            prop_assert_eq!(decoded.length as usize, payload.len() + 1);
        }
    }

    #[tokio::test]
    async fn test_read_from_transport() {
        let (transport, peer) = ChannelTransport::pair();
        peer.feed(&[0x34, 0x00, 0x00, 0x00, 0x05, 0x07]).await;

        let header = MbapHeader::read(&transport, TIMEOUT, 0x12).await.unwrap();
        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.length, 5);
        assert_eq!(header.unit_id, 7);
    }

    #[tokio::test]
    async fn test_read_rejects_foreign_protocol() {
        let (transport, peer) = ChannelTransport::pair();
        peer.feed(&[0x01, 0x01, 0x00, 0x00, 0x05, 0x01]).await;

        let err = MbapHeader::read(&transport, TIMEOUT, 0x00).await.unwrap_err();
        assert!(err.is_framing());
        assert_eq!(
            err.to_string(),
            "0x01 0x00 is not the expected protocol ID 0x00 0x00"
        );
    }

    #[tokio::test]
    async fn test_read_rejects_impossible_length() {
        for length in [[0x00, 0x01], [0x01, 0x00]] {
            let (transport, peer) = ChannelTransport::pair();
            peer.feed(&[0x01, 0x00, 0x00, length[0], length[1], 0x01]).await;

            let err = MbapHeader::read(&transport, TIMEOUT, 0x00).await.unwrap_err();
            assert!(err.is_framing());
            assert!(err.to_string().starts_with("MBAP length"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_names_the_missing_field() {
        let cases: [(&[u8], &str); 4] = [
            (&[], "timeout reading MBAP transaction ID LOW"),
            (&[0x01, 0x00], "timeout reading MBAP protocol ID"),
            (&[0x01, 0x00, 0x00, 0x00], "timeout reading MBAP length"),
            (
                &[0x01, 0x00, 0x00, 0x00, 0x05],
                "timeout reading MBAP unit ID",
            ),
        ];

        for (bytes, message) in cases {
            let (transport, peer) = ChannelTransport::pair();
            peer.feed(bytes).await;
            let err = MbapHeader::read(&transport, TIMEOUT, 0x00).await.unwrap_err();
            assert_eq!(err, ModbusError::framing(message));
        }
    }

    #[tokio::test]
    async fn test_read_propagates_closed_transport() {
        let (transport, peer) = ChannelTransport::pair();
        drop(peer);
        let err = MbapHeader::read(&transport, TIMEOUT, 0x00).await.unwrap_err();
        assert_eq!(err, ModbusError::Closed);
    }
}
