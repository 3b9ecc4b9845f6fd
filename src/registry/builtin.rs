//! Capabilities that ship with the runtime
//!
//! Mass-storage dev boards (DAPLink and friends) are flashed by copying
//! the image onto the mount point their debug interface exposes, and reset
//! by pulsing the control lines of the live connection. These two
//! capabilities cover that common case; vendor programmers and probes plug
//! in through the same [Capability] contract from outside.

use std::{fs, fs::File, path::Path};

use log::{debug, warn};

use crate::registry::{Capability, CapabilityAction, CapabilityParams, Registry};

/// Parameter: path of the image to flash.
pub const PARAM_IMAGE_PATH: &str = "image_path";
/// Parameter: mount point of the device's mass-storage interface.
pub const PARAM_DESTINATION_DISK: &str = "destination_disk";

pub(crate) fn register_all(registry: &mut Registry) {
    // A fresh registry cannot already contain these names.
    let _ = registry.register(copy_flash());
    let _ = registry.register(serial_reset());
}

/// Flash by copying the image onto the device's mass-storage mount point.
fn copy_flash() -> Capability {
    Capability::new(
        "copy",
        [PARAM_IMAGE_PATH, PARAM_DESTINATION_DISK],
        CapabilityAction::Flash(Box::new(execute_copy)),
    )
}

fn execute_copy(params: &CapabilityParams) -> Result<bool, crate::error::Error> {
    // Presence is guaranteed by the registry's parameter check.
    let image = Path::new(&params[PARAM_IMAGE_PATH]);
    let disk = Path::new(&params[PARAM_DESTINATION_DISK]);

    let Some(file_name) = image.file_name() else {
        warn!("Image path '{}' has no file name", image.display());
        return Ok(false);
    };
    let destination = disk.join(file_name);

    debug!(
        "Copying '{}' to '{}'",
        image.display(),
        destination.display()
    );

    // I/O trouble during a copy is a failed attempt, not a hard error; the
    // flasher owns the retry policy.
    if let Err(e) = fs::copy(image, &destination) {
        warn!("Copy to '{}' failed: {}", destination.display(), e);
        return Ok(false);
    }

    // Force the data out so the debug interface starts programming before
    // the settle interval begins.
    match File::open(&destination) {
        Ok(file) => {
            if let Err(e) = file.sync_all() {
                warn!("Sync of '{}' failed: {}", destination.display(), e);
            }
        }
        Err(e) => {
            warn!("Reopening '{}' failed: {}", destination.display(), e);
            return Ok(false);
        }
    }

    Ok(true)
}

/// Reset by pulsing the control lines of the live transport.
fn serial_reset() -> Capability {
    Capability::new(
        "serial",
        [],
        CapabilityAction::Reset(Box::new(|_params, transport| {
            let Some(transport) = transport else {
                return Err(crate::error::Error::TransportRequired {
                    name: "serial".to_string(),
                });
            };

            match transport.reset() {
                Ok(()) => Ok(true),
                Err(e) => {
                    warn!("Reset over {} failed: {}", transport.describe(), e);
                    Ok(false)
                }
            }
        })),
    )
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;
    use crate::registry::Registry;

    #[test]
    fn copy_flash_places_image_on_disk() {
        let registry = Registry::with_builtin_capabilities();

        let source = tempfile::tempdir().unwrap();
        let mount = tempfile::tempdir().unwrap();
        let image = source.path().join("app.bin");
        fs::write(&image, b"firmware").unwrap();

        let mut params = CapabilityParams::new();
        params.insert(
            PARAM_IMAGE_PATH.to_string(),
            image.to_string_lossy().to_string(),
        );
        params.insert(
            PARAM_DESTINATION_DISK.to_string(),
            mount.path().to_string_lossy().to_string(),
        );

        assert!(registry.call_flash("copy", &params).unwrap());
        assert_eq!(fs::read(mount.path().join("app.bin")).unwrap(), b"firmware");
    }

    #[test]
    fn copy_flash_reports_failure_without_raising() {
        let registry = Registry::with_builtin_capabilities();

        let mut params = CapabilityParams::new();
        params.insert(
            PARAM_IMAGE_PATH.to_string(),
            "/nonexistent/app.bin".to_string(),
        );
        params.insert(
            PARAM_DESTINATION_DISK.to_string(),
            "/nonexistent/mount".to_string(),
        );

        assert!(!registry.call_flash("copy", &params).unwrap());
    }
}
