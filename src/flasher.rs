//! Write a test binary to a target device, with retries
//!
//! Flashing flaky hardware is a loop, not a single operation: the copy can
//! silently no-op when the device never remounts, the mount point can take
//! seconds to reappear, and the debug interface reports programming errors
//! by dropping a marker file on the re-exposed disk. [DeviceFlasher] runs
//! the whole cycle up to a bounded number of attempts and never raises for
//! recoverable I/O trouble; it accumulates and logs it instead.

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
    thread::sleep,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    lookup::DeviceLookup,
    registry::{
        builtin::{PARAM_DESTINATION_DISK, PARAM_IMAGE_PATH},
        CapabilityKind, CapabilityParams, Registry,
    },
};

/// Details file the debug interface exposes on its mass-storage mount.
pub const DETAILS_FILE: &str = "DETAILS.TXT";
/// Marker file the debug interface drops when programming failed.
pub const FAIL_FILE: &str = "FAIL.TXT";

const REMOUNT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One flashing job.
#[derive(Debug, Clone)]
pub struct FlashRequest {
    pub image: PathBuf,
    pub target_id: String,
    /// Flash capability to invoke.
    pub capability: String,
    pub max_attempts: u32,
    /// Settle interval after each attempt, letting the device re-enumerate.
    pub program_cycle: Duration,
    /// Budget for the device to reappear with a mount point.
    pub polling_timeout: Duration,
}

/// Why a flashing job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOutcome {
    /// The image is on the device and all post-flash checks passed.
    Flashed,
    /// The copy itself kept failing, or the device reported a programming
    /// error.
    CopyFailed,
    /// The mount point never became ready.
    DiskNotReady,
}

/// Performs image-copy with retry, remount detection, and post-flash
/// error-file checking.
pub struct DeviceFlasher<'a> {
    registry: &'a Registry,
    lookup: &'a dyn DeviceLookup,
}

impl<'a> DeviceFlasher<'a> {
    pub fn new(registry: &'a Registry, lookup: &'a dyn DeviceLookup) -> Self {
        Self { registry, lookup }
    }

    /// Flash the image, retrying up to `request.max_attempts` times.
    ///
    /// Returns the outcome of the last attempt when every attempt failed.
    pub fn flash(&self, request: &FlashRequest) -> FlashOutcome {
        let mut last_failure = FlashOutcome::CopyFailed;

        for attempt in 1..=request.max_attempts.max(1) {
            info!(
                "Flashing '{}' onto '{}' (attempt {}/{})",
                request.image.display(),
                request.target_id,
                attempt,
                request.max_attempts.max(1)
            );

            match self.attempt(request) {
                Ok(()) => return FlashOutcome::Flashed,
                Err(outcome) => {
                    warn!("Flash attempt {} failed: {:?}", attempt, outcome);
                    last_failure = outcome;
                }
            }
        }

        last_failure
    }

    fn attempt(&self, request: &FlashRequest) -> Result<(), FlashOutcome> {
        let mount_before = self.current_mount(&request.target_id);
        // Absence of the details file just means remount detection is
        // skipped for this attempt.
        let counter_before = mount_before.as_deref().and_then(read_remount_counter);
        if let Some(counter) = counter_before {
            debug!("Remount counter before flashing: {}", counter);
        }

        let mut params = CapabilityParams::new();
        params.insert(
            PARAM_IMAGE_PATH.to_string(),
            request.image.to_string_lossy().to_string(),
        );
        params.insert("target_id".to_string(), request.target_id.clone());

        if self.registry.requires_parameter(
            CapabilityKind::Flash,
            &request.capability,
            PARAM_DESTINATION_DISK,
        ) {
            let Some(mount) = mount_before.clone().or_else(|| {
                crate::lookup::wait_for_mount(
                    self.lookup,
                    &request.target_id,
                    request.polling_timeout,
                )
            }) else {
                return Err(FlashOutcome::DiskNotReady);
            };
            params.insert(
                PARAM_DESTINATION_DISK.to_string(),
                mount.to_string_lossy().to_string(),
            );
        }

        let copied = match self.registry.call_flash(&request.capability, &params) {
            Ok(copied) => copied,
            Err(e) => {
                warn!("Flash capability '{}' failed: {}", request.capability, e);
                false
            }
        };

        // Let the device drop off the bus and re-enumerate.
        sleep(request.program_cycle);

        if !copied {
            return Err(FlashOutcome::CopyFailed);
        }

        let mount = self.await_remount(request, counter_before)?;
        self.check_failure_marker(&mount)?;

        Ok(())
    }

    fn current_mount(&self, target_id: &str) -> Option<PathBuf> {
        self.lookup
            .lookup(target_id)?
            .mount_point
            .filter(|mount| mount.exists())
    }

    /// Wait for the device to reappear. When a remount counter was captured
    /// before the copy, the new counter must differ before the mount is
    /// accepted as really reflashed; a copy that never triggered a remount
    /// silently did nothing.
    fn await_remount(
        &self,
        request: &FlashRequest,
        counter_before: Option<u64>,
    ) -> Result<PathBuf, FlashOutcome> {
        let deadline = Instant::now() + request.polling_timeout;
        let mut seen_mount = false;

        loop {
            if let Some(mount) = self.current_mount(&request.target_id) {
                seen_mount = true;

                match (counter_before, read_remount_counter(&mount)) {
                    (None, _) => return Ok(mount),
                    (Some(before), Some(after)) if after != before => {
                        debug!("Remount counter advanced: {} -> {}", before, after);
                        return Ok(mount);
                    }
                    // Counter unchanged or unreadable: not remounted yet.
                    _ => {}
                }
            }

            if Instant::now() >= deadline {
                return Err(if seen_mount {
                    FlashOutcome::CopyFailed
                } else {
                    FlashOutcome::DiskNotReady
                });
            }
            sleep(REMOUNT_POLL_INTERVAL);
        }
    }

    fn check_failure_marker(&self, mount: &Path) -> Result<(), FlashOutcome> {
        let marker = mount.join(FAIL_FILE);
        if !marker.exists() {
            return Ok(());
        }

        match read_to_string(&marker) {
            Ok(contents) => warn!(
                "Device reported a programming failure: {}",
                contents.trim()
            ),
            Err(e) => warn!("Device dropped '{}' but it is unreadable: {}", FAIL_FILE, e),
        }

        Err(FlashOutcome::CopyFailed)
    }
}

/// Parse the remount counter out of the device's details file.
pub fn read_remount_counter(mount: &Path) -> Option<u64> {
    let contents = read_to_string(mount.join(DETAILS_FILE)).ok()?;

    contents.lines().find_map(|line| {
        line.strip_prefix("Remount count:")
            .and_then(|rest| rest.trim().parse().ok())
    })
}
