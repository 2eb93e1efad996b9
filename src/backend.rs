//! Backend capability interface for block devices
//!
//! The engine never talks to a transport directly; everything it needs from
//! a backend (kernel async I/O, a user-space NVMe driver, a test double) is
//! expressed through the narrow [`Device`] trait: submit a command, reap
//! completions, query geometry, report and manage zones.
//!
//! Device attach and detach touch backend-global state, so [`open`] and
//! [`close`] serialize on a process-wide mutex. The hot path
//! ([`Device::submit`] / [`Device::reap`]) is never guarded by it.

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::mock::MockZonedDevice;
use crate::pool::ReqId;

/// Serializes device attach/detach and the cold zone-report/reset paths that
/// open throwaway handles. Never taken by `submit`/`reap`.
static ATTACH_LOCK: Mutex<()> = Mutex::new(());

pub(crate) fn attach_guard() -> parking_lot::MutexGuard<'static, ()> {
    ATTACH_LOCK.lock()
}

// =============================================================================
// Geometry
// =============================================================================

/// Kind of block device, as reported by its geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Conventional,
    Zoned,
    Unknown,
}

/// Geometry of an attached device.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// Bytes per logical block
    pub lba_nbytes: u32,

    /// Total addressable bytes
    pub tbytes: u64,

    /// Sectors per zone (zone size, not zone capacity)
    pub nsect: u64,

    /// Number of zones
    pub nzones: u64,

    /// Device kind
    pub kind: DeviceKind,
}

impl Geometry {
    /// Sector shift: log2 of the logical block size, used to convert byte
    /// offsets to LBAs.
    pub fn ssw(&self) -> u32 {
        self.lba_nbytes.trailing_zeros()
    }

    /// Validate invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.lba_nbytes == 0 || !self.lba_nbytes.is_power_of_two() {
            return Err(Error::Config(format!(
                "lba_nbytes {} must be a non-zero power of 2",
                self.lba_nbytes
            )));
        }
        if self.kind == DeviceKind::Zoned && (self.nsect == 0 || self.nzones == 0) {
            return Err(Error::Config(
                "zoned geometry requires nsect > 0 and nzones > 0".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Commands and completions
// =============================================================================

/// Logical I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    Append,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOp::Read => write!(f, "read"),
            IoOp::Write => write!(f, "write"),
            IoOp::Append => write!(f, "append"),
        }
    }
}

/// Command execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdMode {
    /// Completion delivered through the reap path like any other, but the
    /// backend executes the command before `submit` returns.
    Sync,
    /// Completion delivered whenever the backend finishes the command.
    Async,
}

/// One encoded I/O command.
///
/// For `Append`, `slba` is the *zone start* LBA; the device picks the actual
/// write offset from its write pointer and reports it in
/// [`Completion::result`].
#[derive(Debug)]
pub struct Command {
    pub op: IoOp,
    pub nsid: u32,
    pub slba: u64,
    pub nblocks: u32,
    /// Payload buffer; ownership travels with the command and comes back in
    /// the completion for reads.
    pub payload: BytesMut,
}

/// Status carried by a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// Device-reported status code (NVMe-style), fatal to the enclosing run.
    Fault(i32),
}

impl CompletionStatus {
    pub fn is_fault(&self) -> bool {
        matches!(self, CompletionStatus::Fault(_))
    }

    pub fn code(&self) -> i32 {
        match self {
            CompletionStatus::Success => 0,
            CompletionStatus::Fault(code) => *code,
        }
    }
}

/// A completed command, as delivered by [`Device::reap`].
#[derive(Debug)]
pub struct Completion {
    /// Request handle the command was submitted under; the context releases
    /// it back to the pool after the completion callback returns.
    pub req: ReqId,

    /// Caller-supplied token, echoed back untouched (the logical I/O unit id
    /// in the engine, the sector index in the drive loops).
    pub token: u64,

    pub op: IoOp,

    pub status: CompletionStatus,

    /// Operation result: the LBA actually written for appends, blocks
    /// transferred otherwise.
    pub result: u64,

    /// Payload buffer handed back to the caller (reads only).
    pub payload: Option<BytesMut>,
}

/// Outcome of a submission attempt.
///
/// `Busy`/`Retry` are transient backpressure signals, not errors: the caller
/// must poke the context to make room and retry the same command, which is
/// returned inside the variant so no payload is lost.
#[derive(Debug)]
pub enum SubmitOutcome {
    Submitted,
    Busy(Command),
    Retry(Command),
}

/// Outcome of a reap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Number of completions drained (possibly zero).
    Drained(u32),
    /// Transient condition; back off briefly and try again.
    Busy,
}

// =============================================================================
// Zone report plumbing
// =============================================================================

/// Raw zone-report entry, exactly as the device describes it. Normalization
/// into [`crate::zone::ZoneDescriptor`] happens in the zone directory.
#[derive(Debug, Clone, Copy)]
pub struct RawZone {
    /// Zone start LBA
    pub zslba: u64,
    /// Zone capacity in sectors (writable portion, <= zone size)
    pub zcap: u64,
    /// Current write pointer (absolute LBA)
    pub wp: u64,
    /// Raw zone state code (see `raw_state` constants)
    pub zs: u8,
    /// Raw zone type code (see `raw_type` constants)
    pub zt: u8,
}

/// Raw zone state codes, matching the NVMe ZNS values.
pub mod raw_state {
    pub const EMPTY: u8 = 0x1;
    pub const IOPEN: u8 = 0x2;
    pub const EOPEN: u8 = 0x3;
    pub const CLOSED: u8 = 0x4;
    pub const RONLY: u8 = 0xD;
    pub const FULL: u8 = 0xE;
    pub const OFFLINE: u8 = 0xF;
}

/// Raw zone type codes.
pub mod raw_type {
    pub const CONVENTIONAL: u8 = 0x1;
    pub const SEQWR: u8 = 0x2;
}

/// Zone management actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneAction {
    /// Reset the write pointer to the zone start, invalidating its data.
    Reset,
}

// =============================================================================
// The capability trait
// =============================================================================

/// Narrow interface every backend must provide.
///
/// One submission/poll thread per device is the supported pattern; `submit`
/// and `reap` are not reentrant across threads without external mutual
/// exclusion, which the owning [`AsyncContext`] provides by taking
/// `&mut self`.
///
/// [`AsyncContext`]: crate::ctx::AsyncContext
pub trait Device: Send + Sync + std::fmt::Debug {
    /// URI this device was opened from.
    fn uri(&self) -> &str;

    /// Device geometry; immutable after open.
    fn geometry(&self) -> Geometry;

    /// Default namespace id.
    fn nsid(&self) -> u32;

    /// Enqueue one command. Never blocks.
    ///
    /// Returns `Busy`/`Retry` (carrying the command back) when the queue is
    /// saturated, `Err` for malformed input or a device fault detected at
    /// submission time. Completion errors are reported through
    /// [`Completion::status`], not here.
    fn submit(&self, cmd: Command, mode: CmdMode, req: ReqId, token: u64)
        -> Result<SubmitOutcome>;

    /// Drain up to `max` ready completions into `out` (`max == 0` means
    /// unbounded). Never blocks; always returns.
    fn reap(&self, max: u32, out: &mut Vec<Completion>) -> Result<ReapOutcome>;

    /// Report `nzones` zones starting at `slba` (which must be
    /// zone-aligned). May return fewer entries than requested when the range
    /// runs past the last zone.
    fn zone_report(&self, slba: u64, nzones: u32) -> Result<Vec<RawZone>>;

    /// Issue one synchronous zone-management command.
    fn zone_mgmt(&self, nsid: u32, zslba: u64, action: ZoneAction) -> Result<()>;
}

// =============================================================================
// Open / close
// =============================================================================

/// Open a device by URI.
///
/// Attach touches backend-global state, so the call serializes on the
/// process-wide attach mutex. Currently understood schemes:
///
/// - `mock:<name>[?zones=N&nsect=N&zcap=N&lba=N&qcap=N&kind=conv]` — the
///   deterministic RAM-backed device used by tests and demo runs.
pub fn open(uri: &str) -> Result<Arc<dyn Device>> {
    let _guard = attach_guard();

    debug!(uri, "opening device");

    match uri.split_once(':') {
        Some(("mock", _)) => Ok(Arc::new(MockZonedDevice::open(uri)?)),
        Some((scheme, _)) => Err(Error::Config(format!(
            "unknown device URI scheme '{scheme}' in '{uri}'"
        ))),
        None => Err(Error::Config(format!(
            "device URI '{uri}' has no scheme (expected e.g. 'mock:{uri}')"
        ))),
    }
}

/// Close a device, serializing with other attach/detach activity.
///
/// The handle is reference-counted; the backend tears down when the last
/// clone drops, which this function forces under the attach mutex.
pub fn close(dev: Arc<dyn Device>) {
    let _guard = attach_guard();
    debug!(uri = dev.uri(), "closing device");
    drop(dev);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_open_unknown_scheme() {
        assert_matches!(open("nvme:/dev/nvme0n1"), Err(Error::Config(_)));
    }

    #[test]
    fn test_open_missing_scheme() {
        assert_matches!(open("/dev/nvme0n1"), Err(Error::Config(_)));
    }

    #[test]
    fn test_open_mock() {
        let dev = open("mock:t0?zones=4&nsect=64&lba=512").unwrap();
        let geo = dev.geometry();
        assert_eq!(geo.nzones, 4);
        assert_eq!(geo.nsect, 64);
        assert_eq!(geo.lba_nbytes, 512);
        assert_eq!(geo.kind, DeviceKind::Zoned);
        close(dev);
    }

    #[test]
    fn test_geometry_ssw() {
        let geo = Geometry {
            lba_nbytes: 512,
            tbytes: 0,
            nsect: 1,
            nzones: 1,
            kind: DeviceKind::Zoned,
        };
        assert_eq!(geo.ssw(), 9);
    }

    #[test]
    fn test_geometry_validate_rejects_non_pow2_lba() {
        let geo = Geometry {
            lba_nbytes: 500,
            tbytes: 0,
            nsect: 1,
            nzones: 1,
            kind: DeviceKind::Conventional,
        };
        assert_matches!(geo.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_completion_status() {
        assert!(!CompletionStatus::Success.is_fault());
        assert_eq!(CompletionStatus::Success.code(), 0);
        assert!(CompletionStatus::Fault(0xB9).is_fault());
        assert_eq!(CompletionStatus::Fault(0xB9).code(), 0xB9);
    }
}
