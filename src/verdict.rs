//! Final classification of a test run's outcome

use strum::{Display, EnumIter, EnumString, VariantNames};

/// The single verdict produced by a test run.
///
/// The discriminants are the process exit codes reported to the surrounding
/// CI system and must never be renumbered; new verdicts are appended only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames)]
#[strum(serialize_all = "snake_case")]
#[repr(i32)]
pub enum Verdict {
    /// The supervisor reported a passing test.
    Success = 0,
    /// The supervisor reported a logical test failure.
    Failure = 1,
    /// A runtime or supervisor exception ended the run.
    Error = 2,
    /// The overall wall-clock budget elapsed with no terminal event.
    Timeout = 3,
    /// The handshake never completed.
    SyncFailed = 4,
    /// The connection was lost mid-run.
    IoSerial = 5,
    /// Flashing failed after exhausting its retry budget.
    IoerrCopy = 6,
    /// The device's mount point never became ready.
    IoerrDisk = 7,
    /// No binary was available to flash.
    NoImage = 8,
    /// The build that should have produced the binary failed.
    BuildFailed = 9,
    /// An exit path that assigned no other verdict. Treated as a bug signal.
    Undefined = 10,
}

impl Verdict {
    /// Stable process exit code for this verdict.
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}
