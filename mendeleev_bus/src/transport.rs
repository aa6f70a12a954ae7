use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, StopBits};

/// RS-485 line rate shared by every element.
pub const BAUD_RATE: u32 = 38_400;

/// Bound on a single TCP connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte stream the bus master talks through: a serial port, a TCP socket or
/// the in-memory test port.
pub trait BusPort: Read + Write + Send {}

impl<T: Read + Write + Send> BusPort for T {}

/// Opens the transport named by `url`.
///
/// `socket://host:port` connects over TCP; anything else is treated as a
/// serial device path, opened at 38400 baud 8-N-1 without flow control.
/// `read_timeout` bounds every blocking read so the session's I/O loop can
/// interleave pending writes.
pub fn open_port(url: &str, read_timeout: Duration) -> io::Result<Box<dyn BusPort>> {
    if let Some(addr) = url.strip_prefix("socket://") {
        let addr: SocketAddr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unresolvable address"))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    } else {
        let port = serialport::new(url, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(read_timeout)
            .open()
            .map_err(io::Error::other)?;
        Ok(Box::new(port))
    }
}

/// True for the error kinds a bounded read returns when no bytes arrived.
pub(crate) fn is_idle_read_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
