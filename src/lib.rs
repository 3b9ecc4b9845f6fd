//! A library and command-line runtime for executing on-device test
//! binaries against embedded targets.
//!
//! dutrun flashes a test binary onto a device under test, establishes a
//! framed `{{key;value}}` protocol over a serial port, a remote TCP
//! bridge, or the in-memory simulator, synchronizes host and device with a
//! token handshake, routes device events to a pluggable test supervisor,
//! and reports a stable verdict and exit code for CI systems.

pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod flasher;
pub mod lookup;
pub mod orchestrator;
pub mod proxy;
pub mod registry;
pub mod supervisor;
pub mod transport;
pub mod verdict;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "cli")]
pub mod logging;

pub use config::DeviceConfig;
pub use error::Error;
pub use orchestrator::TestOrchestrator;
pub use registry::Registry;
pub use supervisor::{SupervisorRegistry, TestSupervisor};
pub use verdict::Verdict;
