//! Serial port transport

use std::{
    io::{self, ErrorKind, Read, Write},
    thread::sleep,
    time::Duration,
};

use log::debug;
use serialport::{FlowControl, SerialPort};

use crate::{error::Error, transport::Transport};

/// How long a single read may block waiting for device output.
const READ_POLL_WINDOW: Duration = Duration::from_millis(10);
/// Width of the DTR pulse used to reset the device.
const RESET_PULSE: Duration = Duration::from_millis(100);

/// Transport backed by a local serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialTransport {
    /// Open the named port and configure it for polled reads.
    pub fn open(name: &str, baud_rate: u32) -> Result<Self, Error> {
        debug!("Opening serial port '{}' at {} baud", name, baud_rate);

        let port = serialport::new(name, baud_rate)
            .flow_control(FlowControl::None)
            .timeout(READ_POLL_WINDOW)
            .open()?;

        Ok(Self {
            port,
            name: name.to_string(),
        })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(count) => Ok(count),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    /// Pulse DTR to toggle the reset line wired to it on common dev boards.
    fn reset(&mut self) -> io::Result<()> {
        debug!("Resetting device on '{}' via DTR pulse", self.name);

        self.port
            .write_data_terminal_ready(true)
            .map_err(io::Error::from)?;
        sleep(RESET_PULSE);
        self.port
            .write_data_terminal_ready(false)
            .map_err(io::Error::from)?;

        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.port.bytes_to_read().is_ok()
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.name)
    }
}
