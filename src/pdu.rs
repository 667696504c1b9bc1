use std::fmt;

use thiserror::Error;

use crate::ModbusError;

/// Function codes spoken by the drivers in this crate.
pub mod function {
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

    /// Set on the function code of an exception response.
    pub const EXCEPTION_FLAG: u8 = 0x80;
}

/// Coil value for "on" in a single coil write.
pub const COIL_ON: u16 = 0xFF00;
/// Coil value for "off" in a single coil write.
pub const COIL_OFF: u16 = 0x0000;

/// Upper bound on registers in one 0x10 request.
pub const MAX_WRITE_REGISTERS: usize = 123;
/// Upper bound on coils in one 0x0F request.
pub const MAX_WRITE_COILS: usize = 1968;

/// Structural reason a response could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Malformation {
    #[error("frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("CRC mismatch: expected {expected:#06x}, received {received:#06x}")]
    CrcMismatch { expected: u16, received: u16 },

    #[error("byte count {declared} but {available} data bytes present")]
    ByteCount { declared: usize, available: usize },

    #[error("unknown function code {0:#04x}")]
    UnknownFunction(u8),

    #[error("invalid protocol ID: {0}")]
    ProtocolId(u16),

    #[error("MBAP length {declared} but {available} bytes follow")]
    MbapLength { declared: u16, available: usize },
}

/// Decoded response, produced only by the frame parsers.
///
/// Parsing never checks the response against a request; see
/// [`Request::check_response`] for that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseResult {
    /// Reply to 0x03 / 0x04 with every register value in order.
    ReadRegisters { slave: u8, function: u8, values: Vec<u16> },
    /// Echo of 0x05 / 0x06 / 0x0F / 0x10. `value` is the written value for
    /// single writes and the quantity for multiple writes.
    WriteAck { slave: u8, function: u8, register: u16, value: u16 },
    /// Exception reply; `function` has the 0x80 flag stripped.
    Exception { slave: u8, function: u8, code: u8 },
    /// Anything that failed structural decoding. `raw` holds the full frame.
    Malformed { reason: Malformation, raw: Vec<u8> },
}

impl ResponseResult {
    pub fn slave(&self) -> Option<u8> {
        match self {
            Self::ReadRegisters { slave, .. }
            | Self::WriteAck { slave, .. }
            | Self::Exception { slave, .. } => Some(*slave),
            Self::Malformed { .. } => None,
        }
    }

    pub fn function(&self) -> Option<u8> {
        match self {
            Self::ReadRegisters { function, .. }
            | Self::WriteAck { function, .. }
            | Self::Exception { function, .. } => Some(*function),
            Self::Malformed { .. } => None,
        }
    }

    /// First register of a read, or the echoed value of a write.
    pub fn value(&self) -> Option<u16> {
        match self {
            Self::ReadRegisters { values, .. } => values.first().copied(),
            Self::WriteAck { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }

    /// Exceptions and malformed frames become errors; everything else passes through.
    pub fn into_result(self) -> Result<Self, ModbusError> {
        match self {
            Self::Exception { function, code, .. } => Err(ModbusError::Exception { function, code }),
            Self::Malformed { reason, raw } => Err(ModbusError::Malformed { reason, raw }),
            other => Ok(other),
        }
    }
}

/// What a correct reply to a request must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Echo {
    pub slave: u8,
    pub function: u8,
    pub register: u16,
    pub value: u16,
}

impl fmt::Display for Echo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slave {} fc {:#04x} register {:#06x} value {:#06x}",
            self.slave, self.function, self.register, self.value
        )
    }
}

/// One Modbus request, independent of RTU or TCP encapsulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadHoldingRegisters { register: u16, quantity: u16 },
    ReadInputRegisters { register: u16, quantity: u16 },
    WriteSingleRegister { register: u16, value: u16 },
    WriteMultipleRegisters { register: u16, values: Vec<u16> },
    WriteSingleCoil { coil: u16, on: bool },
    WriteMultipleCoils { coil: u16, states: Vec<bool> },
}

impl Request {
    pub fn function(&self) -> u8 {
        match self {
            Self::ReadHoldingRegisters { .. } => function::READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters { .. } => function::READ_INPUT_REGISTERS,
            Self::WriteSingleRegister { .. } => function::WRITE_SINGLE_REGISTER,
            Self::WriteMultipleRegisters { .. } => function::WRITE_MULTIPLE_REGISTERS,
            Self::WriteSingleCoil { .. } => function::WRITE_SINGLE_COIL,
            Self::WriteMultipleCoils { .. } => function::WRITE_MULTIPLE_COILS,
        }
    }

    /// Starting register or coil address.
    pub fn register(&self) -> u16 {
        match self {
            Self::ReadHoldingRegisters { register, .. }
            | Self::ReadInputRegisters { register, .. }
            | Self::WriteSingleRegister { register, .. }
            | Self::WriteMultipleRegisters { register, .. } => *register,
            Self::WriteSingleCoil { coil, .. } | Self::WriteMultipleCoils { coil, .. } => *coil,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Self::ReadHoldingRegisters { .. } | Self::ReadInputRegisters { .. }
        )
    }

    pub(crate) fn to_pdu(&self) -> Result<Vec<u8>, ModbusError> {
        let function = self.function();
        match self {
            Self::ReadHoldingRegisters { register, quantity }
            | Self::ReadInputRegisters { register, quantity } => {
                Ok(read_pdu(function, *register, *quantity))
            }
            Self::WriteSingleRegister { register, value } => {
                Ok(write_single_pdu(function, *register, *value))
            }
            Self::WriteMultipleRegisters { register, values } => {
                write_multiple_pdu(function, *register, values)
            }
            Self::WriteSingleCoil { coil, on } => {
                Ok(write_single_pdu(function, *coil, if *on { COIL_ON } else { COIL_OFF }))
            }
            Self::WriteMultipleCoils { coil, states } => write_coils_pdu(function, *coil, states),
        }
    }

    /// Echo a device must return for this request.
    /// Reads report the requested quantity in `value`.
    pub fn expected_echo(&self, slave: u8) -> Echo {
        let value = match self {
            Self::ReadHoldingRegisters { quantity, .. }
            | Self::ReadInputRegisters { quantity, .. } => *quantity,
            Self::WriteSingleRegister { value, .. } => *value,
            Self::WriteMultipleRegisters { values, .. } => values.len() as u16,
            Self::WriteSingleCoil { on, .. } => {
                if *on {
                    COIL_ON
                } else {
                    COIL_OFF
                }
            }
            Self::WriteMultipleCoils { states, .. } => states.len() as u16,
        };
        Echo {
            slave,
            function: self.function(),
            register: self.register(),
            value,
        }
    }

    /// Validates `response` as the reply to this request from `slave`.
    ///
    /// Exceptions and malformed frames map to their own errors; a structurally
    /// valid reply that does not answer this request is `UnmatchedEcho`.
    pub fn check_response(
        &self,
        slave: u8,
        response: ResponseResult,
    ) -> Result<ResponseResult, ModbusError> {
        let response = response.into_result()?;
        let expected = self.expected_echo(slave);
        let matches = match &response {
            ResponseResult::WriteAck {
                slave,
                function,
                register,
                value,
            } => {
                self.is_write()
                    && *slave == expected.slave
                    && *function == expected.function
                    && *register == expected.register
                    && *value == expected.value
            }
            ResponseResult::ReadRegisters {
                slave,
                function,
                values,
            } => {
                !self.is_write()
                    && *slave == expected.slave
                    && *function == expected.function
                    && values.len() == expected.value as usize
            }
            _ => false,
        };
        if !matches {
            return Err(ModbusError::UnmatchedEcho {
                expected,
                received: response,
            });
        }
        Ok(response)
    }
}

pub(crate) fn read_pdu(function: u8, register: u16, quantity: u16) -> Vec<u8> {
    write_single_pdu(function, register, quantity)
}

pub(crate) fn write_single_pdu(function: u8, register: u16, value: u16) -> Vec<u8> {
    let mut msg: [u8; 5] = [0; 5];
    msg[0] = function;
    msg[1..3].copy_from_slice(&register.to_be_bytes());
    msg[3..5].copy_from_slice(&value.to_be_bytes());
    Vec::from(msg)
}

pub(crate) fn write_multiple_pdu(
    function: u8,
    register: u16,
    values: &[u16],
) -> Result<Vec<u8>, ModbusError> {
    if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
        return Err(ModbusError::OutOfRange {
            what: "register count",
            value: values.len() as i64,
            min: 1,
            max: MAX_WRITE_REGISTERS as i64,
        });
    }
    let mut result: Vec<u8> = Vec::with_capacity(6 + values.len() * 2);
    result.push(function);
    result.extend_from_slice(&register.to_be_bytes());
    result.extend_from_slice(&(values.len() as u16).to_be_bytes());
    result.push((values.len() * 2) as u8);
    for value in values {
        result.extend_from_slice(&value.to_be_bytes());
    }
    Ok(result)
}

pub(crate) fn write_coils_pdu(
    function: u8,
    coil: u16,
    states: &[bool],
) -> Result<Vec<u8>, ModbusError> {
    if states.is_empty() || states.len() > MAX_WRITE_COILS {
        return Err(ModbusError::OutOfRange {
            what: "coil count",
            value: states.len() as i64,
            min: 1,
            max: MAX_WRITE_COILS as i64,
        });
    }
    let byte_count = states.len().div_ceil(8);
    let mut result: Vec<u8> = Vec::with_capacity(6 + byte_count);
    result.push(function);
    result.extend_from_slice(&coil.to_be_bytes());
    result.extend_from_slice(&(states.len() as u16).to_be_bytes());
    result.push(byte_count as u8);

    // LSB of the first byte is the first coil
    let mut bytes = vec![0u8; byte_count];
    for (i, &on) in states.iter().enumerate() {
        if on {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    result.extend(bytes);
    Ok(result)
}

/// Decodes a response PDU (function code onwards). `raw` is the whole frame
/// as received, kept for diagnostics when decoding fails.
pub(crate) fn parse_pdu(slave: u8, pdu: &[u8], raw: &[u8]) -> ResponseResult {
    let malformed = |reason| ResponseResult::Malformed {
        reason,
        raw: raw.to_vec(),
    };

    let Some(&function_code) = pdu.first() else {
        return malformed(Malformation::TooShort { len: 0, min: 1 });
    };

    if (function_code & function::EXCEPTION_FLAG) != 0 {
        return match pdu.get(1) {
            Some(&code) => ResponseResult::Exception {
                slave,
                function: function_code & !function::EXCEPTION_FLAG,
                code,
            },
            None => malformed(Malformation::TooShort {
                len: pdu.len(),
                min: 2,
            }),
        };
    }

    match function_code {
        function::READ_HOLDING_REGISTERS | function::READ_INPUT_REGISTERS => {
            if pdu.len() < 2 {
                return malformed(Malformation::TooShort {
                    len: pdu.len(),
                    min: 2,
                });
            }
            let byte_count = pdu[1] as usize;
            let available = pdu.len() - 2;
            if byte_count % 2 != 0 || byte_count > available {
                return malformed(Malformation::ByteCount {
                    declared: byte_count,
                    available,
                });
            }
            let values = pdu[2..2 + byte_count]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            ResponseResult::ReadRegisters {
                slave,
                function: function_code,
                values,
            }
        }
        function::WRITE_SINGLE_COIL
        | function::WRITE_SINGLE_REGISTER
        | function::WRITE_MULTIPLE_COILS
        | function::WRITE_MULTIPLE_REGISTERS => {
            if pdu.len() < 5 {
                return malformed(Malformation::TooShort {
                    len: pdu.len(),
                    min: 5,
                });
            }
            ResponseResult::WriteAck {
                slave,
                function: function_code,
                register: u16::from_be_bytes([pdu[1], pdu[2]]),
                value: u16::from_be_bytes([pdu[3], pdu[4]]),
            }
        }
        other => malformed(Malformation::UnknownFunction(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_multiple_pdu_layout() {
        let pdu = write_multiple_pdu(0x10, 0x009C, &[0x0000, 0x01F4]).unwrap();
        assert_eq!(pdu, vec![0x10, 0x00, 0x9C, 0x00, 0x02, 0x04, 0x00, 0x00, 0x01, 0xF4]);
    }

    #[test]
    fn test_write_multiple_rejects_empty() {
        let result = write_multiple_pdu(0x10, 0, &[]);
        assert!(matches!(
            result,
            Err(ModbusError::OutOfRange { what: "register count", .. })
        ));
    }

    #[test]
    fn test_coil_bit_packing() {
        let states = [true, false, true, true, false, false, false, false, true];
        let pdu = write_coils_pdu(0x0F, 100, &states).unwrap();
        assert_eq!(pdu, vec![0x0F, 0x00, 0x64, 0x00, 0x09, 0x02, 0x0D, 0x01]);
    }

    #[test]
    fn test_parse_exception_strips_flag() {
        let result = parse_pdu(1, &[0x86, 0x02], &[0x01, 0x86, 0x02]);
        assert_eq!(
            result,
            ResponseResult::Exception {
                slave: 1,
                function: 0x06,
                code: 0x02
            }
        );
    }

    #[test]
    fn test_parse_read_with_short_data() {
        let result = parse_pdu(1, &[0x03, 0x04, 0x00, 0x01], &[]);
        assert!(matches!(
            result,
            ResponseResult::Malformed {
                reason: Malformation::ByteCount { declared: 4, available: 2 },
                ..
            }
        ));
    }

    #[test]
    fn test_check_response_rejects_wrong_register() {
        let request = Request::WriteSingleRegister {
            register: 0x2105,
            value: 1,
        };
        let ack = ResponseResult::WriteAck {
            slave: 1,
            function: 0x06,
            register: 0x2000,
            value: 1,
        };
        assert!(matches!(
            request.check_response(1, ack),
            Err(ModbusError::UnmatchedEcho { .. })
        ));
    }

    #[test]
    fn test_check_response_accepts_read() {
        let request = Request::ReadHoldingRegisters {
            register: 0,
            quantity: 1,
        };
        let read = ResponseResult::ReadRegisters {
            slave: 1,
            function: 0x03,
            values: vec![0],
        };
        assert_eq!(request.check_response(1, read.clone()).unwrap(), read);
    }
}
