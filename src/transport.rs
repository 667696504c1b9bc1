use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use super::*;
use crate::config::TcpTarget;
use crate::modbus_rtu::{HexBytes, build_request, response_len};
use crate::modbus_tcp::{MBAP_LEN, remaining_len};

/// Byte channel to one device: a serial line or a TCP socket.
///
/// Implementations are owned by exactly one [`ModbusLink`]; nothing in this
/// crate shares a transport between callers.
pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Everything received so far, without blocking. May be empty.
    fn read_available(&mut self) -> io::Result<Vec<u8>>;

    /// Exactly `n` bytes, or `TimedOut` once `timeout` has elapsed.
    fn read_exact(&mut self, n: usize, timeout: Duration) -> io::Result<Vec<u8>>;
}

/// Interval between read attempts while waiting for the rest of a reply.
const READ_POLL: Duration = Duration::from_millis(5);

/// [`Transport`] over any blocking `Read + Write` handle.
///
/// The handle's own read timeout should be short (tens of milliseconds); the
/// deadline passed to `read_exact` is enforced here.
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
}

impl<S: Read + Write> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

impl<S: Read + Write> Transport for StreamTransport<S> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        let mut buffer = [0u8; 256];
        match self.stream.read(&mut buffer) {
            Ok(n) => Ok(buffer[..n].to_vec()),
            Err(ref e) if is_retryable(e) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn read_exact(&mut self, n: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut received = Vec::with_capacity(n);
        let mut buffer = [0u8; 256];
        while received.len() < n {
            let want = (n - received.len()).min(buffer.len());
            match self.stream.read(&mut buffer[..want]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-response",
                    ));
                }
                Ok(read) => received.extend_from_slice(&buffer[..read]),
                Err(ref e) if is_retryable(e) => {}
                Err(e) => return Err(e),
            }
            if received.len() < n {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("received {} of {} bytes", received.len(), n),
                    ));
                }
                thread::sleep(READ_POLL);
            }
        }
        Ok(received)
    }
}

/// Opens a Modbus TCP connection. Closing is dropping the returned transport.
pub fn connect_tcp(target: &TcpTarget) -> io::Result<StreamTransport<TcpStream>> {
    let stream = TcpStream::connect((target.host.as_str(), target.port))?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_POLL))?;
    debug!("connected to {}:{}", target.host, target.port);
    Ok(StreamTransport::new(stream))
}

/// Encapsulation used on a link.
#[derive(Debug, Clone)]
pub enum Framing {
    Rtu,
    Tcp(ModbusTcp),
}

impl Framing {
    pub fn tcp() -> Self {
        Self::Tcp(ModbusTcp::new())
    }
}

/// Request/response driver for one device on one transport.
///
/// One request is outstanding at a time; `request` writes a frame and reads
/// exactly one reply before returning.
#[derive(Debug)]
pub struct ModbusLink<T> {
    transport: T,
    framing: Framing,
    slave: u8,
    response_timeout: Duration,
}

impl<T: Transport> ModbusLink<T> {
    pub fn new(transport: T, framing: Framing, slave: u8, response_timeout: Duration) -> Self {
        Self {
            transport,
            framing,
            slave,
            response_timeout,
        }
    }

    pub fn rtu(transport: T, slave: u8, response_timeout: Duration) -> Self {
        Self::new(transport, Framing::Rtu, slave, response_timeout)
    }

    pub fn tcp(transport: T, unit_id: u8, response_timeout: Duration) -> Self {
        Self::new(transport, Framing::tcp(), unit_id, response_timeout)
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Sends `request` and returns the parsed reply without judging it.
    /// Transport failures are returned as `Io` and never retried.
    pub fn request(&mut self, request: &Request) -> Result<ResponseResult, ModbusError> {
        let frame = match &mut self.framing {
            Framing::Rtu => build_request(self.slave, request)?.into_bytes(),
            Framing::Tcp(tcp) => tcp.build_request(self.slave, request)?.into_bytes(),
        };
        let stale = self.transport.read_available()?;
        if !stale.is_empty() {
            debug!("discarding {} stale bytes: {}", stale.len(), HexBytes(&stale));
        }
        debug!("TX {}", HexBytes(&frame));
        self.transport.write(&frame)?;

        let reply = self.read_reply()?;
        debug!("RX {}", HexBytes(&reply));

        Ok(match self.framing {
            Framing::Rtu => parse_response(&reply),
            Framing::Tcp(_) => parse_tcp_response(&reply).1,
        })
    }

    /// Sends `request` and requires a reply that echoes it.
    pub fn execute(&mut self, request: &Request) -> Result<ResponseResult, ModbusError> {
        let response = self.request(request)?;
        request.check_response(self.slave, response)
    }

    fn read_reply(&mut self) -> Result<Vec<u8>, ModbusError> {
        let timeout = self.response_timeout;
        let mut reply = match self.framing {
            Framing::Rtu => self.transport.read_exact(3, timeout)?,
            Framing::Tcp(_) => self.transport.read_exact(MBAP_LEN, timeout)?,
        };
        // a short head is left for the parser to report as malformed
        let rest = match self.framing {
            Framing::Rtu => match reply.as_slice() {
                [address, function, count, ..] => {
                    response_len(&[*address, *function, *count]).saturating_sub(reply.len())
                }
                _ => 0,
            },
            Framing::Tcp(_) => reply
                .get(..MBAP_LEN)
                .and_then(|head| <&[u8; MBAP_LEN]>::try_from(head).ok())
                .map_or(0, remaining_len),
        };
        if rest > 0 {
            reply.extend(self.transport.read_exact(rest, timeout)?);
        }
        Ok(reply)
    }
}
