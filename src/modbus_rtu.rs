use std::fmt;

use super::*;
use crate::crc::{append_crc, verify_crc};
use crate::pdu::{parse_pdu, read_pdu, write_coils_pdu, write_multiple_pdu, write_single_pdu};

/// Smallest valid RTU reply: address, function, exception code, CRC.
pub const MIN_RTU_RESPONSE: usize = 5;

/// A complete RTU frame: slave address, PDU, CRC low byte, CRC high byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    pub(crate) fn wrap(slave: u8, pdu: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(1 + pdu.len() + 2);
        bytes.push(slave);
        bytes.extend_from_slice(pdu);
        append_crc(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn slave(&self) -> u8 {
        self.bytes[0]
    }

    pub fn function(&self) -> u8 {
        self.bytes[1]
    }

    /// The two trailing checksum bytes as a value.
    pub fn crc(&self) -> u16 {
        let len = self.bytes.len();
        (self.bytes[len - 1] as u16) << 8 | self.bytes[len - 2] as u16
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&HexBytes(&self.bytes), f)
    }
}

/// Space-separated upper-case hex, as used in frame traces and errors.
pub(crate) struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Read request: register address and quantity, both big-endian.
pub fn build_read(slave: u8, function: u8, register: u16, quantity: u16) -> Frame {
    Frame::wrap(slave, &read_pdu(function, register, quantity))
}

/// Single register write (normally function 0x06).
pub fn build_write_single(slave: u8, function: u8, register: u16, value: u16) -> Frame {
    Frame::wrap(slave, &write_single_pdu(function, register, value))
}

/// Multiple register write (normally function 0x10).
pub fn build_write_multiple(
    slave: u8,
    function: u8,
    register: u16,
    values: &[u16],
) -> Result<Frame, ModbusError> {
    Ok(Frame::wrap(slave, &write_multiple_pdu(function, register, values)?))
}

/// Single coil write with function 0x05.
pub fn build_write_coil(slave: u8, coil: u16, on: bool) -> Frame {
    let value = if on { COIL_ON } else { COIL_OFF };
    Frame::wrap(
        slave,
        &write_single_pdu(function::WRITE_SINGLE_COIL, coil, value),
    )
}

/// Multiple coil write (normally function 0x0F).
pub fn build_write_coils(
    slave: u8,
    function: u8,
    coil: u16,
    states: &[bool],
) -> Result<Frame, ModbusError> {
    Ok(Frame::wrap(slave, &write_coils_pdu(function, coil, states)?))
}

/// Frame for an arbitrary request.
pub fn build_request(slave: u8, request: &Request) -> Result<Frame, ModbusError> {
    Ok(Frame::wrap(slave, &request.to_pdu()?))
}

/// Decodes an RTU reply. The checksum is verified; the slave address and
/// function are reported as received, not compared with any request.
pub fn parse_response(frame: &[u8]) -> ResponseResult {
    if frame.len() < MIN_RTU_RESPONSE {
        return ResponseResult::Malformed {
            reason: Malformation::TooShort {
                len: frame.len(),
                min: MIN_RTU_RESPONSE,
            },
            raw: frame.to_vec(),
        };
    }

    let body = match verify_crc(frame) {
        Ok(body) => body,
        Err((expected, received)) => {
            return ResponseResult::Malformed {
                reason: Malformation::CrcMismatch { expected, received },
                raw: frame.to_vec(),
            };
        }
    };

    parse_pdu(body[0], &body[1..], frame)
}

/// Total reply length implied by the first three bytes of an RTU response.
pub(crate) fn response_len(head: &[u8; 3]) -> usize {
    let function_code = head[1];
    if function_code & function::EXCEPTION_FLAG != 0 {
        return MIN_RTU_RESPONSE;
    }
    match function_code {
        function::READ_HOLDING_REGISTERS | function::READ_INPUT_REGISTERS => {
            MIN_RTU_RESPONSE + head[2] as usize
        }
        _ => 8,
    }
}
