//! Library and application errors

use std::{io, path::PathBuf};

use miette::Diagnostic;
use thiserror::Error;

use crate::registry::CapabilityKind;

/// All possible errors returned by dutrun
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Failed to open transport for '{target}'")]
    #[diagnostic(code(dutrun::transport_open))]
    TransportOpen {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("No serial port configured for a serial transport")]
    #[diagnostic(
        code(dutrun::no_port_configured),
        help("Pass `--port` or set `serial_port` in the configuration file")
    )]
    NoPortConfigured,

    #[error("No remote address configured for a remote transport")]
    #[diagnostic(
        code(dutrun::no_remote_configured),
        help("Pass `--remote` or set `remote_addr` in the configuration file")
    )]
    NoRemoteConfigured,

    #[error("A {kind} capability named '{name}' is already registered")]
    #[diagnostic(code(dutrun::duplicate_capability))]
    DuplicateCapability { kind: CapabilityKind, name: String },

    #[error("Unknown {kind} capability '{name}'")]
    #[diagnostic(
        code(dutrun::unknown_capability),
        help("Run `dutrun list-plugins` to see the registered capabilities")
    )]
    UnknownCapability { kind: CapabilityKind, name: String },

    #[error("Capability '{name}' is missing required parameter '{parameter}'")]
    #[diagnostic(code(dutrun::missing_parameter))]
    MissingParameter { name: String, parameter: String },

    #[error("Capability '{name}' requires a live transport handle")]
    #[diagnostic(code(dutrun::transport_required))]
    TransportRequired { name: String },

    #[error("Unknown test supervisor '{0}'")]
    #[diagnostic(
        code(dutrun::unknown_supervisor),
        help("Run `dutrun list-supervisors` to see the registered supervisors")
    )]
    UnknownSupervisor(String),

    #[error("A supervisor named '{0}' is already registered")]
    #[diagnostic(code(dutrun::duplicate_supervisor))]
    DuplicateSupervisor(String),

    #[error("Supervisor setup failed: {0}")]
    #[diagnostic(code(dutrun::supervisor_setup))]
    SupervisorSetup(String),

    #[error("Failed to read configuration file '{}'", path.display())]
    #[diagnostic(code(dutrun::config_read))]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse configuration file '{}'", path.display())]
    #[diagnostic(code(dutrun::config_parse))]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(dutrun::io))]
    Io(#[from] io::Error),

    #[error(transparent)]
    #[diagnostic(code(dutrun::serial))]
    Serial(#[from] serialport::Error),
}
