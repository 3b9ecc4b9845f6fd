//! Events exchanged between the connection proxy and the orchestrator
//!
//! Every decoded protocol frame, every raw log line, and every internal
//! control transition is represented as an [Event]. Keys starting with `__`
//! are reserved for the runtime and are never delivered to a test
//! supervisor.

use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved control keys consumed by the runtime.
pub mod key {
    /// Handshake frame carrying a sync token, in both directions.
    pub const SYNC: &str = "__sync";
    /// Emitted by the proxy once the transport has been opened.
    pub const CONN_OPEN: &str = "__conn_open";
    /// Device declares the remaining test budget, in seconds.
    pub const TIMEOUT: &str = "__timeout";
    /// Device names the test supervisor to load.
    pub const HOST_TEST_NAME: &str = "__host_test_name";
    /// Terminal: the handshake never completed.
    pub const NOTIFY_SYNC_FAILED: &str = "__notify_sync_failed";
    /// Terminal: the transport failed mid-run.
    pub const NOTIFY_CONN_LOST: &str = "__notify_conn_lost";
    /// Terminal: the proxy shut down on request.
    pub const NOTIFY_FINISHED: &str = "__notify_finished";
    /// Explicit verdict from a supervisor, or a request to consult its
    /// `result()`.
    pub const NOTIFY_COMPLETE: &str = "__notify_complete";
    /// Soft reset: pulse the live transport, keep the proxy running.
    pub const RESET: &str = "__reset";
    /// Hard reset: physical reset capability plus a proxy restart.
    pub const RESET_DUT: &str = "__reset_dut";
    /// Acknowledgment that a requested reset has been performed.
    pub const RESET_COMPLETE: &str = "__reset_complete";
    /// Replace the remaining test budget.
    pub const TIMEOUT_SET: &str = "__timeout_set";
    /// Adjust the remaining test budget by a (possibly negative) delta.
    pub const TIMEOUT_ADJUST: &str = "__timeout_adjust";
    /// Graceful shutdown signal from the device.
    pub const EXIT: &str = "__exit";
    /// Graceful shutdown signal from the supervisor side.
    pub const EXIT_EVENT_QUEUE: &str = "__exit_event_queue";
    /// Start of a code-coverage dump; triggers the idle drain.
    pub const COVERAGE_START: &str = "__coverage_start";
    /// Reports how many seconds the idle drain consumed.
    pub const COVERAGE_DRAINED: &str = "__coverage_drained";
    /// A raw, non-protocol line of device output.
    pub const RXD_LINE: &str = "__rxd_line";
}

/// One unit of device-originated output or internal control flow.
///
/// Ordered and immutable once created; the proxy is the single producer, so
/// consumers observe events in decode order.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub key: String,
    pub value: String,
    /// Host-side receive time, seconds since the UNIX epoch.
    pub timestamp: f64,
}

impl Event {
    /// Create an event stamped with the current host time.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp: unix_now(),
        }
    }

    /// Whether this event uses a runtime-reserved key.
    pub fn is_control(&self) -> bool {
        self.key.starts_with("__")
    }
}

/// Current host time as fractional seconds since the UNIX epoch.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
