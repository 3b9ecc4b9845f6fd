//! TCP bridge transport for remotely managed devices
//!
//! Test farms expose a board's serial line as a raw TCP stream behind a
//! resource manager. The bridge owns the physical port; from the host's
//! point of view it is just another byte channel. Resetting a remotely
//! managed device is done by dropping and re-establishing the stream,
//! which the bridge translates into a board reset on reattach.

use std::{
    io::{self, ErrorKind, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::debug;

use crate::{error::Error, transport::Transport};

const READ_POLL_WINDOW: Duration = Duration::from_millis(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport backed by a TCP stream to a remote resource manager.
pub struct RemoteTransport {
    stream: TcpStream,
    addr: String,
}

impl RemoteTransport {
    pub fn connect(addr: &str) -> Result<Self, Error> {
        debug!("Connecting to remote resource manager at {}", addr);

        let stream = open_stream(addr).map_err(|source| Error::TransportOpen {
            target: addr.to_string(),
            source,
        })?;

        Ok(Self {
            stream,
            addr: addr.to_string(),
        })
    }
}

fn open_stream(addr: &str) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(ErrorKind::AddrNotAvailable, "no addresses resolved");

    for resolved in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&resolved, CONNECT_TIMEOUT) {
            Ok(stream) => {
                stream.set_read_timeout(Some(READ_POLL_WINDOW))?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = e,
        }
    }

    Err(last_err)
}

impl Transport for RemoteTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            // A zero-length read on TCP means the peer closed the stream.
            Ok(0) => Err(io::Error::new(
                ErrorKind::ConnectionAborted,
                "remote bridge closed the connection",
            )),
            Ok(count) => Ok(count),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()
    }

    fn reset(&mut self) -> io::Result<()> {
        debug!("Resetting remote device at {} via reattach", self.addr);

        let fresh = open_stream(&self.addr)?;
        self.stream = fresh;

        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.stream.peer_addr().is_ok()
    }

    fn describe(&self) -> String {
        format!("remote:{}", self.addr)
    }
}
