// lib.rs

mod crc;
mod modbus_rtu;
mod modbus_tcp;
mod pdu;
mod transport;

pub mod config;
pub mod peripherals;
pub mod registers;
pub mod sequencer;

pub use crc::crc16;
pub use pdu::{
    COIL_OFF, COIL_ON, Echo, MAX_WRITE_COILS, MAX_WRITE_REGISTERS, Malformation, Request,
    ResponseResult, function,
};
pub use modbus_rtu::{
    Frame, MIN_RTU_RESPONSE, build_read, build_request, build_write_coil, build_write_coils,
    build_write_multiple, build_write_single, parse_response,
};
pub use modbus_tcp::{MBAP_LEN, MODBUS_TCP_PORT, MbapHeader, ModbusTcp, TcpFrame, parse_tcp_response};
pub use registers::{DeviceModel, Parameter, RegisterMap, RegisterWrite, Segment};
pub use sequencer::{
    Direction, MotionCommand, MotionObserver, MotionSequencer, MotionState, Outcome, PulseRun,
    SegmentProfile,
};
pub use transport::{Framing, ModbusLink, StreamTransport, Transport, connect_tcp};

#[derive(Debug, thiserror::Error)]
pub enum ModbusError {
    #[error("Malformed response ({reason}): {}", modbus_rtu::HexBytes(.raw))]
    Malformed { reason: Malformation, raw: Vec<u8> },

    #[error("Response does not echo the request: expected {expected}, received {received:?}")]
    UnmatchedEcho {
        expected: Echo,
        received: ResponseResult,
    },

    #[error("Device exception {code:#04x} for function {function:#04x}")]
    Exception { function: u8, code: u8 },

    #[error("Value out of range: {what} = {value}, allowed {min}..={max}")]
    OutOfRange {
        what: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Parameter {parameter:?} not defined for {model:?}")]
    UnknownParameter {
        model: DeviceModel,
        parameter: Parameter,
    },

    #[error("Parameter {0:?} is per-segment and needs a segment")]
    SegmentRequired(Parameter),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device still moving after {attempts} status polls")]
    TimedOut { attempts: u32 },

    #[error("Operation not allowed while sequencer is {0:?}")]
    InvalidState(MotionState),
}
