//! Run configuration
//!
//! A [DeviceConfig] is the immutable snapshot handed to the orchestrator
//! for one test run: transport selection, target identity, protocol
//! timing, and flashing policy. Values may come from a `dutrun.toml`
//! configuration file, with command-line flags taking precedence.

use std::{fs::read_to_string, path::Path, path::PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{error::Error, transport::TransportKind};

/// Immutable configuration snapshot for a single test run.
///
/// Owned by the orchestrator; the proxy and flasher only ever see it
/// read-only.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Which transport to open.
    pub transport: TransportKind,
    /// Identifier used to look the device up in the enumeration service.
    pub target_id: String,
    /// Serial port name, for the serial transport.
    pub serial_port: Option<String>,
    /// `host:port` of the remote resource manager, for the remote transport.
    pub remote_addr: Option<String>,
    /// Baud rate for the serial transport.
    pub baud_rate: u32,
    /// Test binary to flash.
    pub image: Option<PathBuf>,
    /// Handshake policy: `0` skips the handshake, `N > 0` allows that many
    /// sync attempts, `N < 0` resends until cancelled.
    pub sync_behavior: i32,
    /// Spacing between sync attempts, in seconds.
    pub sync_timeout: f64,
    /// How long to wait for the device to reappear after flashing, in
    /// seconds.
    pub polling_timeout: f64,
    /// Settle interval after a flash attempt, in seconds.
    pub program_cycle: f64,
    /// Default overall test budget, in seconds; the device usually
    /// replaces it via `__timeout`.
    pub test_timeout: f64,
    /// How long to wait for the proxy's "connection open" acknowledgment,
    /// in seconds.
    pub startup_timeout: f64,
    /// Idle window that ends a coverage drain, in seconds.
    pub idle_timeout: f64,
    /// Flash capability to use.
    pub copy_method: String,
    /// Reset capability to use; `None` resets through the transport.
    pub reset_method: Option<String>,
    /// Flash retry budget.
    pub max_flash_attempts: u32,
    /// Run against an already-flashed device.
    pub skip_flashing: bool,
    /// Supervisor to load immediately instead of waiting for
    /// `__host_test_name`.
    pub supervisor: Option<String>,
    /// Known devices for the static enumeration backend.
    pub devices: Vec<KnownDevice>,
}

/// A statically configured device, for hosts without an enumeration
/// service.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct KnownDevice {
    pub target_id: String,
    pub mount_point: Option<PathBuf>,
    pub serial_port: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Serial,
            target_id: String::new(),
            serial_port: None,
            remote_addr: None,
            baud_rate: 9600,
            image: None,
            sync_behavior: 5,
            sync_timeout: 5.0,
            polling_timeout: 60.0,
            program_cycle: 4.0,
            test_timeout: 600.0,
            startup_timeout: 30.0,
            idle_timeout: 2.0,
            copy_method: "copy".to_string(),
            reset_method: None,
            max_flash_attempts: 3,
            skip_flashing: false,
            supervisor: None,
            devices: Vec::new(),
        }
    }
}

impl DeviceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        debug!("Loading configuration from '{}'", path.display());

        let contents = read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&contents).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod test {
    use super::DeviceConfig;

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: DeviceConfig = toml::from_str(
            r#"
            transport = "sim"
            target_id = "K64F"
            "#,
        )
        .unwrap();

        assert_eq!(config.target_id, "K64F");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.sync_behavior, 5);
        assert_eq!(config.copy_method, "copy");
    }

    #[test]
    fn known_devices_parse() {
        let config: DeviceConfig = toml::from_str(
            r#"
            transport = "serial"
            target_id = "K64F"
            serial_port = "/dev/ttyACM0"

            [[devices]]
            target_id = "K64F"
            mount_point = "/media/DAPLINK"
            serial_port = "/dev/ttyACM0"
            vendor_id = 3368
            "#,
        )
        .unwrap();

        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].vendor_id, Some(3368));
    }
}
