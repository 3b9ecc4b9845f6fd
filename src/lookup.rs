//! Device enumeration
//!
//! Maps a target identifier to the resources a test run needs: the
//! mass-storage mount point and the serial port, plus USB identity when
//! known. The full OS-specific discovery service lives outside this crate;
//! the runtime consumes it through the [DeviceLookup] trait and ships a
//! static backend fed from the configuration file.

use std::{
    collections::HashMap,
    path::PathBuf,
    thread::sleep,
    time::{Duration, Instant},
};

use log::debug;

use crate::config::KnownDevice;

/// Interval between mount-readiness polls.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Resources associated with one target device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub mount_point: Option<PathBuf>,
    pub serial_port: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

/// Lookup service mapping a target identifier to its resources.
pub trait DeviceLookup: Send + Sync {
    fn lookup(&self, target_id: &str) -> Option<DeviceInfo>;
}

/// Lookup backed by the `[[devices]]` table of the configuration file.
#[derive(Debug, Default)]
pub struct StaticLookup {
    entries: HashMap<String, DeviceInfo>,
}

impl StaticLookup {
    pub fn from_config(devices: &[KnownDevice]) -> Self {
        let entries = devices
            .iter()
            .map(|device| {
                (
                    device.target_id.clone(),
                    DeviceInfo {
                        mount_point: device.mount_point.clone(),
                        serial_port: device.serial_port.clone(),
                        vendor_id: device.vendor_id,
                        product_id: device.product_id,
                    },
                )
            })
            .collect();

        Self { entries }
    }
}

impl DeviceLookup for StaticLookup {
    fn lookup(&self, target_id: &str) -> Option<DeviceInfo> {
        self.entries.get(target_id).cloned()
    }
}

/// Poll until the target's mount point exists on disk, bounded by
/// `timeout`. Returns the mount point, or `None` if it never appeared.
pub fn wait_for_mount(
    lookup: &dyn DeviceLookup,
    target_id: &str,
    timeout: Duration,
) -> Option<PathBuf> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(info) = lookup.lookup(target_id) {
            if let Some(mount) = info.mount_point {
                if mount.exists() {
                    return Some(mount);
                }
            }
        }

        if Instant::now() >= deadline {
            debug!("Mount point for '{}' did not appear in time", target_id);
            return None;
        }
        sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{wait_for_mount, DeviceLookup, StaticLookup};
    use crate::config::KnownDevice;

    #[test]
    fn static_lookup_resolves_configured_devices() {
        let lookup = StaticLookup::from_config(&[KnownDevice {
            target_id: "K64F".to_string(),
            serial_port: Some("/dev/ttyACM0".to_string()),
            ..KnownDevice::default()
        }]);

        let info = lookup.lookup("K64F").unwrap();
        assert_eq!(info.serial_port.as_deref(), Some("/dev/ttyACM0"));
        assert!(lookup.lookup("NUCLEO").is_none());
    }

    #[test]
    fn wait_for_mount_gives_up_on_unknown_target() {
        let lookup = StaticLookup::default();
        let mount = wait_for_mount(&lookup, "K64F", Duration::from_millis(10));
        assert!(mount.is_none());
    }

    #[test]
    fn wait_for_mount_finds_existing_mount() {
        let dir = tempfile::tempdir().unwrap();
        let lookup = StaticLookup::from_config(&[KnownDevice {
            target_id: "K64F".to_string(),
            mount_point: Some(dir.path().to_path_buf()),
            ..KnownDevice::default()
        }]);

        let mount = wait_for_mount(&lookup, "K64F", Duration::from_millis(10));
        assert_eq!(mount.as_deref(), Some(dir.path()));
    }
}
