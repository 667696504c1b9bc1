//! Simulated Modbus slave for integration tests.
//!
//! `SimulatedDevice` implements `Transport`: every frame written to it is
//! decoded, recorded, and answered the way a well-behaved device would,
//! either in RTU or in TCP framing.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;

use a3ot_modbus_motion::config::SequencerConfig;
use a3ot_modbus_motion::{Request, Transport, crc16, function};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Sequencer settings with no real-time waits.
pub fn fast_config(max_attempts: u32) -> SequencerConfig {
    SequencerConfig {
        slave: 1,
        max_attempts,
        settle_delay_ms: 0,
        poll_interval_ms: 0,
        response_timeout_ms: 10,
    }
}

/// Appends the Modbus CRC, low byte first.
pub fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFraming {
    Rtu,
    Tcp,
}

#[derive(Debug)]
pub struct SimulatedDevice {
    pub slave: u8,
    framing: SimFraming,
    /// Every decoded request, in order.
    pub requests: Vec<Request>,
    /// Register file served to reads and updated by writes.
    pub registers: HashMap<u16, u16>,
    /// Values handed out, one per read, to reads of `status_register`.
    status_script: VecDeque<u16>,
    status_register: u16,
    /// Returned for status reads once the script runs out, unless the status
    /// register has been written; then the written value reads back.
    pub idle_status: u16,
    /// Writes start failing with `BrokenPipe` after this many frames.
    pub fail_after: Option<usize>,
    /// Flip the CRC of read replies.
    pub corrupt_reads: bool,
    pending: VecDeque<u8>,
}

impl SimulatedDevice {
    pub fn rtu(slave: u8, status_register: u16) -> Self {
        Self::new(slave, SimFraming::Rtu, status_register)
    }

    pub fn tcp(unit_id: u8, status_register: u16) -> Self {
        Self::new(unit_id, SimFraming::Tcp, status_register)
    }

    fn new(slave: u8, framing: SimFraming, status_register: u16) -> Self {
        Self {
            slave,
            framing,
            requests: Vec::new(),
            registers: HashMap::new(),
            status_script: VecDeque::new(),
            status_register,
            idle_status: 0,
            fail_after: None,
            corrupt_reads: false,
            pending: VecDeque::new(),
        }
    }

    pub fn script_status(mut self, statuses: &[u16]) -> Self {
        self.status_script.extend(statuses);
        self
    }

    pub fn with_idle_status(mut self, status: u16) -> Self {
        self.idle_status = status;
        self
    }

    pub fn with_register(mut self, register: u16, value: u16) -> Self {
        self.registers.insert(register, value);
        self
    }

    pub fn writes(&self) -> Vec<&Request> {
        self.requests.iter().filter(|request| request.is_write()).collect()
    }

    pub fn reads(&self) -> usize {
        self.requests.iter().filter(|request| !request.is_write()).count()
    }

    fn register(&mut self, register: u16) -> u16 {
        if register == self.status_register {
            return self
                .status_script
                .pop_front()
                .or_else(|| self.registers.get(&register).copied())
                .unwrap_or(self.idle_status);
        }
        self.registers.get(&register).copied().unwrap_or(0)
    }

    /// Decodes a request PDU, applies it and returns the reply PDU.
    fn handle(&mut self, pdu: &[u8]) -> (Request, Vec<u8>) {
        let word = |at: usize| u16::from_be_bytes([pdu[at], pdu[at + 1]]);
        let function_code = pdu[0];
        let register = word(1);
        match function_code {
            function::READ_HOLDING_REGISTERS | function::READ_INPUT_REGISTERS => {
                let quantity = word(3);
                let mut reply = vec![function_code, (quantity * 2) as u8];
                for offset in 0..quantity {
                    reply.extend_from_slice(&self.register(register + offset).to_be_bytes());
                }
                let request = if function_code == function::READ_HOLDING_REGISTERS {
                    Request::ReadHoldingRegisters { register, quantity }
                } else {
                    Request::ReadInputRegisters { register, quantity }
                };
                (request, reply)
            }
            function::WRITE_SINGLE_REGISTER => {
                let value = word(3);
                self.registers.insert(register, value);
                (
                    Request::WriteSingleRegister { register, value },
                    pdu[..5].to_vec(),
                )
            }
            function::WRITE_MULTIPLE_REGISTERS => {
                let quantity = word(3);
                let values: Vec<u16> = (0..quantity as usize).map(|i| word(6 + i * 2)).collect();
                for (offset, value) in values.iter().enumerate() {
                    self.registers.insert(register + offset as u16, *value);
                }
                (
                    Request::WriteMultipleRegisters { register, values },
                    pdu[..5].to_vec(),
                )
            }
            function::WRITE_SINGLE_COIL => (
                Request::WriteSingleCoil {
                    coil: register,
                    on: word(3) == 0xFF00,
                },
                pdu[..5].to_vec(),
            ),
            function::WRITE_MULTIPLE_COILS => {
                let quantity = word(3) as usize;
                let states = (0..quantity).map(|i| pdu[6 + i / 8] & (1 << (i % 8)) != 0).collect();
                (
                    Request::WriteMultipleCoils {
                        coil: register,
                        states,
                    },
                    pdu[..5].to_vec(),
                )
            }
            other => panic!("simulated device got unknown function {other:#04x}"),
        }
    }
}

impl Transport for SimulatedDevice {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let sent = self.requests.len();
        if self.fail_after.is_some_and(|limit| sent >= limit) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "line down"));
        }

        let reply = match self.framing {
            SimFraming::Rtu => {
                let (body, tail) = bytes.split_at(bytes.len() - 2);
                assert_eq!(crc16(body).to_le_bytes(), tail, "request CRC");
                assert_eq!(body[0], self.slave, "request slave address");
                let (request, pdu) = self.handle(&body[1..]);
                let is_read = !request.is_write();
                self.requests.push(request);

                let mut frame = vec![self.slave];
                frame.extend(pdu);
                let mut frame = with_crc(frame);
                if is_read && self.corrupt_reads {
                    let last = frame.len() - 1;
                    frame[last] ^= 0xFF;
                }
                frame
            }
            SimFraming::Tcp => {
                assert_eq!(bytes[6], self.slave, "request unit id");
                let declared = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
                assert_eq!(declared, bytes.len() - 6, "MBAP length");
                let (request, pdu) = self.handle(&bytes[7..]);
                self.requests.push(request);

                let mut frame = bytes[..4].to_vec();
                frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
                frame.push(self.slave);
                frame.extend(pdu);
                frame
            }
        };
        self.pending.extend(reply);
        Ok(())
    }

    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        Ok(self.pending.drain(..).collect())
    }

    fn read_exact(&mut self, n: usize, _timeout: Duration) -> io::Result<Vec<u8>> {
        if self.pending.len() < n {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply"));
        }
        Ok(self.pending.drain(..n).collect())
    }
}
