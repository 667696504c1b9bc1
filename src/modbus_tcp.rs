use std::fmt;

use super::*;
use crate::modbus_rtu::HexBytes;
use crate::pdu::{parse_pdu, write_coils_pdu, write_multiple_pdu, write_single_pdu};

/// Standard Modbus TCP port.
pub const MODBUS_TCP_PORT: u16 = 502;

/// Bytes in the MBAP header including the unit id.
pub const MBAP_LEN: usize = 7;

/// Modbus Application Protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Bytes following the length field: unit id + function + payload.
    pub length: u16,
    pub unit_id: u8,
}

/// MBAP header followed by the PDU. No checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFrame {
    bytes: Vec<u8>,
}

impl TcpFrame {
    fn wrap(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Self {
        let length = (pdu.len() + 1) as u16;
        let mut bytes = Vec::with_capacity(MBAP_LEN + pdu.len());
        bytes.extend_from_slice(&transaction_id.to_be_bytes());
        bytes.extend_from_slice(&[0x00, 0x00]);
        bytes.extend_from_slice(&length.to_be_bytes());
        bytes.push(unit_id);
        bytes.extend_from_slice(pdu);
        Self { bytes }
    }

    pub fn header(&self) -> MbapHeader {
        MbapHeader {
            transaction_id: u16::from_be_bytes([self.bytes[0], self.bytes[1]]),
            protocol_id: u16::from_be_bytes([self.bytes[2], self.bytes[3]]),
            length: u16::from_be_bytes([self.bytes[4], self.bytes[5]]),
            unit_id: self.bytes[6],
        }
    }

    /// Function code and payload.
    pub fn pdu(&self) -> &[u8] {
        &self.bytes[MBAP_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl AsRef<[u8]> for TcpFrame {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for TcpFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&HexBytes(&self.bytes), f)
    }
}

/// Modbus TCP encapsulation with an incrementing transaction id.
#[derive(Debug, Clone, Default)]
pub struct ModbusTcp {
    transaction_id: u16,
}

impl ModbusTcp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts numbering after `transaction_id`; the next frame carries `transaction_id + 1`.
    pub fn starting_at(transaction_id: u16) -> Self {
        Self { transaction_id }
    }

    /// Transaction id carried by the most recent frame.
    pub fn last_transaction_id(&self) -> u16 {
        self.transaction_id
    }

    /// Register/coil request with a 16-bit data word (quantity or value).
    pub fn build_tcp(&mut self, unit_id: u8, function: u8, register: u16, data: u16) -> TcpFrame {
        self.wrap_tcp(unit_id, &write_single_pdu(function, register, data))
    }

    pub fn build_tcp_write_multiple(
        &mut self,
        unit_id: u8,
        function: u8,
        register: u16,
        values: &[u16],
    ) -> Result<TcpFrame, ModbusError> {
        let pdu = write_multiple_pdu(function, register, values)?;
        Ok(self.wrap_tcp(unit_id, &pdu))
    }

    pub fn build_tcp_write_coils(
        &mut self,
        unit_id: u8,
        function: u8,
        coil: u16,
        states: &[bool],
    ) -> Result<TcpFrame, ModbusError> {
        let pdu = write_coils_pdu(function, coil, states)?;
        Ok(self.wrap_tcp(unit_id, &pdu))
    }

    pub fn build_request(&mut self, unit_id: u8, request: &Request) -> Result<TcpFrame, ModbusError> {
        let pdu = request.to_pdu()?;
        Ok(self.wrap_tcp(unit_id, &pdu))
    }

    fn wrap_tcp(&mut self, unit_id: u8, pdu: &[u8]) -> TcpFrame {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        TcpFrame::wrap(self.transaction_id, unit_id, pdu)
    }
}

/// Decodes a TCP reply. The header is returned whenever the first seven bytes
/// are present, even if the PDU turns out malformed.
pub fn parse_tcp_response(frame: &[u8]) -> (Option<MbapHeader>, ResponseResult) {
    let malformed = |reason| ResponseResult::Malformed {
        reason,
        raw: frame.to_vec(),
    };

    if frame.len() < MBAP_LEN + 1 {
        return (
            None,
            malformed(Malformation::TooShort {
                len: frame.len(),
                min: MBAP_LEN + 1,
            }),
        );
    }

    let header = MbapHeader {
        transaction_id: u16::from_be_bytes([frame[0], frame[1]]),
        protocol_id: u16::from_be_bytes([frame[2], frame[3]]),
        length: u16::from_be_bytes([frame[4], frame[5]]),
        unit_id: frame[6],
    };

    if header.protocol_id != 0 {
        return (
            Some(header),
            malformed(Malformation::ProtocolId(header.protocol_id)),
        );
    }

    let available = frame.len() - 6;
    if header.length < 2 || header.length as usize > available {
        return (
            Some(header),
            malformed(Malformation::MbapLength {
                declared: header.length,
                available,
            }),
        );
    }

    let end = 6 + header.length as usize;
    (
        Some(header),
        parse_pdu(header.unit_id, &frame[MBAP_LEN..end], frame),
    )
}

/// Bytes still to read after the MBAP header.
pub(crate) fn remaining_len(head: &[u8; MBAP_LEN]) -> usize {
    let length = u16::from_be_bytes([head[4], head[5]]) as usize;
    length.saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_counts_unit_and_function() {
        let mut tcp = ModbusTcp::new();
        let frame = tcp.build_tcp(1, 0x06, 0x0000, 0x0001);
        let header = frame.header();
        assert_eq!(header.length as usize, 1 + frame.pdu().len());
        assert_eq!(header.protocol_id, 0);
    }

    #[test]
    fn test_transaction_id_wraps() {
        let mut tcp = ModbusTcp::starting_at(u16::MAX);
        let frame = tcp.build_tcp(1, 0x03, 0, 1);
        assert_eq!(frame.header().transaction_id, 0);
    }

    #[test]
    fn test_remaining_len() {
        assert_eq!(remaining_len(&[0, 1, 0, 0, 0, 6, 1]), 5);
    }
}
