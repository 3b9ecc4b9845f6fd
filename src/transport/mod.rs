//! Byte transports connecting the host to a device under test
//!
//! The rest of the runtime treats a transport polymorphically: raw byte
//! reads and writes, a device reset, and a liveness check. Reads are
//! polled: a transport blocks for at most a short internal window and
//! returns `Ok(0)` when no data arrived, so the proxy's control loop stays
//! responsive. Recoverable read conditions (timeouts, interrupts) are never
//! surfaced as errors; an `Err` from [Transport::read] means the connection
//! is gone.

use std::{io, sync::Arc};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, VariantNames};

use crate::{config::DeviceConfig, error::Error};

pub mod remote;
pub mod serial;
pub mod sim;

/// Which kind of transport to open for a run.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, VariantNames)]
#[derive(Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// A local serial port.
    Serial,
    /// A TCP bridge exposed by a remote resource manager.
    Remote,
    /// The in-memory simulator.
    Sim,
}

/// Raw byte channel to a device under test.
pub trait Transport: Send {
    /// Read whatever is available, waiting at most a short poll window.
    /// `Ok(0)` means no data arrived in the window.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer to the device.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Reset the device on the far end of this transport.
    fn reset(&mut self) -> io::Result<()>;

    /// Whether the transport still looks usable.
    fn is_alive(&mut self) -> bool;

    /// Human-readable identity for log output.
    fn describe(&self) -> String;
}

/// Constructor the proxy calls from its own thread to acquire the
/// transport; invoked again whenever the proxy is restarted after a hard
/// reset, so it must hand out a fresh connection each time.
pub type TransportFactory = Arc<dyn Fn() -> Result<Box<dyn Transport>, Error> + Send + Sync>;

/// Build a transport factory for the configured transport kind.
pub fn factory_for(config: &DeviceConfig) -> Result<TransportFactory, Error> {
    match config.transport {
        TransportKind::Serial => {
            let port = config
                .serial_port
                .clone()
                .ok_or(Error::NoPortConfigured)?;
            let baud = config.baud_rate;
            Ok(Arc::new(move || {
                let transport = serial::SerialTransport::open(&port, baud)?;
                Ok(Box::new(transport) as Box<dyn Transport>)
            }))
        }
        TransportKind::Remote => {
            let addr = config
                .remote_addr
                .clone()
                .ok_or(Error::NoRemoteConfigured)?;
            Ok(Arc::new(move || {
                let transport = remote::RemoteTransport::connect(&addr)?;
                Ok(Box::new(transport) as Box<dyn Transport>)
            }))
        }
        TransportKind::Sim => Ok(Arc::new(|| {
            let (transport, _handle) = sim::SimTransport::new(sim::SimScript::echo_sync());
            Ok(Box::new(transport) as Box<dyn Transport>)
        })),
    }
}
