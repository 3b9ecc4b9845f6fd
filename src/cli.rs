//! Command-line interface glue
//!
//! No stability guaranties apply

use std::{path::PathBuf, sync::atomic::Ordering, sync::Arc};

use clap::{Args, Parser, Subcommand};
use log::debug;
use miette::{IntoDiagnostic, Result};
use serialport::{available_ports, SerialPortType};

use crate::{
    config::DeviceConfig,
    lookup::{DeviceLookup, StaticLookup},
    orchestrator::TestOrchestrator,
    registry::{CapabilityKind, Registry},
    supervisor::SupervisorRegistry,
    transport::TransportKind,
};

#[derive(Debug, Parser)]
#[clap(about, propagate_version = true, version)]
pub struct Cli {
    #[clap(subcommand)]
    pub subcommand: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Flash a test binary and drive it to a verdict
    Run(RunArgs),
    /// List detected serial ports
    ListPorts,
    /// List registered flash and reset capabilities
    ListPlugins,
    /// List registered test supervisors
    ListSupervisors,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Test binary to flash onto the device
    pub image: Option<PathBuf>,

    /// Transport connecting the host to the device
    #[clap(short = 't', long, value_enum)]
    pub transport: Option<TransportKind>,
    /// Serial port connected to the device
    #[clap(short = 'p', long)]
    pub port: Option<String>,
    /// `host:port` of a remote resource manager
    #[clap(long)]
    pub remote: Option<String>,
    /// Baud rate for the serial transport
    #[clap(short = 'b', long)]
    pub baud: Option<u32>,
    /// Target identifier used for device enumeration
    #[clap(long)]
    pub target_id: Option<String>,
    /// Handshake policy: 0 skips it, N > 0 bounds the attempts, N < 0
    /// resends until cancelled
    #[clap(long)]
    pub sync: Option<i32>,
    /// Default overall test budget, in seconds
    #[clap(long)]
    pub timeout: Option<f64>,
    /// Supervisor to load instead of waiting for the device to name one
    #[clap(long)]
    pub supervisor: Option<String>,
    /// Flash capability to use
    #[clap(long)]
    pub copy_method: Option<String>,
    /// Reset capability to use
    #[clap(long)]
    pub reset_method: Option<String>,
    /// Flash retry budget
    #[clap(long)]
    pub max_attempts: Option<u32>,
    /// Run against an already-flashed device
    #[clap(long)]
    pub skip_flashing: bool,
    /// Configuration file to load instead of the default location
    #[clap(short = 'c', long, env = "DUTRUN_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Resolve the effective configuration: file first, flags on top.
fn resolve_config(args: &RunArgs) -> Result<DeviceConfig> {
    let mut config = match &args.config {
        Some(path) => DeviceConfig::load(path)?,
        None => match default_config_path() {
            Some(path) if path.exists() => DeviceConfig::load(&path)?,
            _ => DeviceConfig::default(),
        },
    };

    if let Some(image) = &args.image {
        config.image = Some(image.clone());
    }
    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    if let Some(port) = &args.port {
        config.serial_port = Some(port.clone());
    }
    if let Some(remote) = &args.remote {
        config.remote_addr = Some(remote.clone());
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    if let Some(target_id) = &args.target_id {
        config.target_id = target_id.clone();
    }
    if let Some(sync) = args.sync {
        config.sync_behavior = sync;
    }
    if let Some(timeout) = args.timeout {
        config.test_timeout = timeout;
    }
    if let Some(supervisor) = &args.supervisor {
        config.supervisor = Some(supervisor.clone());
    }
    if let Some(copy_method) = &args.copy_method {
        config.copy_method = copy_method.clone();
    }
    if let Some(reset_method) = &args.reset_method {
        config.reset_method = Some(reset_method.clone());
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_flash_attempts = max_attempts;
    }
    if args.skip_flashing {
        config.skip_flashing = true;
    }

    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "dutrun")
        .map(|dirs| dirs.config_dir().join("dutrun.toml"))
}

/// Execute a test run and return the verdict's exit code.
pub fn run(args: RunArgs) -> Result<i32> {
    let mut config = resolve_config(&args)?;

    let registry = Registry::with_builtin_capabilities();
    let supervisors = SupervisorRegistry::with_builtin_supervisors();
    let lookup = Arc::new(StaticLookup::from_config(&config.devices));

    // With no port given explicitly, fall back to whatever the enumeration
    // backend knows about the target.
    if config.serial_port.is_none() {
        if let Some(info) = lookup.lookup(&config.target_id) {
            config.serial_port = info.serial_port;
        }
    }
    debug!("Effective configuration: {:#?}", config);

    let mut orchestrator = TestOrchestrator::new(config, registry, supervisors, lookup);

    let cancel = orchestrator.cancel_flag();
    ctrlc::set_handler(move || cancel.store(true, Ordering::Relaxed)).into_diagnostic()?;

    let verdict = orchestrator.run();
    Ok(verdict.exit_code())
}

pub fn list_ports() -> Result<()> {
    let ports = available_ports().into_diagnostic()?;
    let ports: Vec<_> = ports
        .into_iter()
        .filter(|port_info| {
            matches!(
                &port_info.port_type,
                SerialPortType::UsbPort(..) | SerialPortType::Unknown
            )
        })
        .collect();

    if ports.is_empty() {
        println!("No serial ports detected");
        return Ok(());
    }

    for port in ports {
        match &port.port_type {
            SerialPortType::UsbPort(info) => {
                let product = info.product.as_deref().unwrap_or("unknown device");
                println!("{} - {}", port.port_name, product);
            }
            _ => println!("{}", port.port_name),
        }
    }

    Ok(())
}

pub fn list_plugins() {
    let registry = Registry::with_builtin_capabilities();

    println!("Flash capabilities:");
    for name in registry.capabilities_of(CapabilityKind::Flash) {
        println!("    {name}");
    }

    println!("Reset capabilities:");
    for name in registry.capabilities_of(CapabilityKind::Reset) {
        println!("    {name}");
    }
}

pub fn list_supervisors() {
    let supervisors = SupervisorRegistry::with_builtin_supervisors();

    println!("Test supervisors:");
    for name in supervisors.names() {
        println!("    {name}");
    }
}
