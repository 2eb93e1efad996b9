//! znsio — host-side asynchronous I/O engine for zoned block storage
//!
//! The crate is organized bottom-up:
//!
//! - [`backend`] — the narrow [`Device`](backend::Device) capability trait
//!   every transport implements, plus command/completion types and the
//!   URI-based `open`/`close` entry points.
//! - [`mock`] — deterministic RAM-backed zoned device for tests and demos.
//! - [`pool`] — fixed-capacity request pool; every in-flight command holds
//!   a slot from submission until its completion callback returns.
//! - [`ctx`] — per-device async context bounded by queue depth: `submit`,
//!   `poke`, `wait_all`, with backpressure surfaced as values.
//! - [`cmd`] — validating read/write/append submission wrappers.
//! - [`zone`] — normalized zone reports, state scans, write-pointer resets.
//! - [`drive`] — single-device, single-zone workload loops.
//! - [`engine`] — multi-device front end with round-robin completion
//!   harvesting.
//!
//! The sequential-write constraint of zoned namespaces shapes the whole
//! API: writes target the zone's write pointer, appends let the device pick
//! the offset and report it back, and the drive loops encode the safe
//! submission discipline for each.

pub mod backend;
pub mod buf;
pub mod cmd;
pub mod ctx;
pub mod drive;
pub mod engine;
pub mod error;
pub mod mock;
pub mod pool;
pub mod zone;

pub use backend::{
    Command, Completion, CompletionStatus, Device, DeviceKind, Geometry, IoOp, SubmitOutcome,
};
pub use ctx::{AsyncContext, ContextOpts};
pub use engine::{CompletedUnit, Engine, EngineConfig, IoUnit, QueueOutcome};
pub use error::{Error, Result};
pub use pool::{ReqId, RequestPool};
pub use zone::{ZoneDescriptor, ZoneDirectory, ZoneState, ZoneType};
