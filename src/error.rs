//! Error types for the zoned I/O engine
//!
//! Transient queue-full conditions are deliberately *not* represented here:
//! backpressure is a control-flow signal ([`SubmitOutcome::Busy`] /
//! [`SubmitOutcome::Retry`]) handled inside the submission loop, never an
//! error surfaced to callers.
//!
//! [`SubmitOutcome::Busy`]: crate::backend::SubmitOutcome::Busy
//! [`SubmitOutcome::Retry`]: crate::backend::SubmitOutcome::Retry

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the zoned I/O engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration detected at startup (bad geometry, zero queue
    /// depth, unknown device URI scheme, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Hard device fault reported via a completion status or a failed
    /// management command. Fatal to the current run; never retried.
    #[error("Device fault (status {status}): {context}")]
    DeviceFault { status: i32, context: String },

    /// The caller violated the engine protocol (unsupported operation,
    /// mismatched zone-report size, unknown raw zone state, ...)
    #[error("Protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// Request-level deadlines are not supported; the only recourse on a
    /// stall is device-level teardown.
    #[error("Completion deadlines are not supported")]
    DeadlineUnsupported,

    /// Device lookup by URI or ordinal failed
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No zone satisfied the requested criteria
    #[error("No zone found in state {state}")]
    NoZoneInState { state: crate::zone::ZoneState },

    /// A zone-report request returned an unexpected number of entries
    #[error("Zone report size mismatch: requested {requested}, got {returned}")]
    ReportSizeMismatch { requested: u32, returned: u32 },

    /// Resetting a zone's write pointer failed. Resets over a range stop at
    /// the first failing zone; `zslba` identifies it.
    #[error("Write-pointer reset failed at zone {zslba} (status {status})")]
    ZoneResetFailed { zslba: u64, status: i32 },
}
