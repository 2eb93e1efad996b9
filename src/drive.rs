//! Single-device drive loops
//!
//! A drive loop runs one workload against one zone: pick the zone, fill the
//! payload buffer, then submit until the zone's capacity is covered and
//! drain what is left in flight. Reads and appends pipeline up to the queue
//! depth; writes are serialized (one outstanding per zone) because the next
//! write's target LBA is the pointer the previous write advances.
//!
//! The first completion error stops new submissions; commands already in
//! flight are still drained, and the summary counters report everything
//! that happened.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{self, Completion, Device, DeviceKind, IoOp, ReapOutcome, SubmitOutcome};
use crate::buf::{self, FillPattern};
use crate::cmd;
use crate::ctx::{AsyncContext, ContextOpts};
use crate::error::{Error, Result};
use crate::pool::RequestPool;
use crate::zone::{self, ZoneState};

const REAP_BACKOFF: Duration = Duration::from_micros(1);

/// Workload a drive loop runs against its zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    Read,
    Write,
    Append,
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Workload::Read => write!(f, "read"),
            Workload::Write => write!(f, "write"),
            Workload::Append => write!(f, "append"),
        }
    }
}

/// Drive loop configuration.
#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub uri: String,
    pub queue_depth: u32,
    /// Zone to target; when absent, read runs pick the first full zone and
    /// write/append runs pick the first empty one.
    pub slba: Option<u64>,
    /// Namespace override; defaults to the device's namespace.
    pub nsid: Option<u32>,
}

impl DriveConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            queue_depth: 8,
            slba: None,
            nsid: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(Error::Config("drive queue depth must be > 0".into()));
        }
        Ok(())
    }
}

/// Summary of one drive-loop run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub workload: Workload,
    pub uri: String,
    /// Start LBA of the zone the run targeted
    pub zslba: u64,
    pub submitted: u64,
    pub completed: u64,
    pub errors: u64,
    /// Payload bytes moved by successful completions
    pub bytes: u64,
    pub elapsed_secs: f64,
    /// Offsets the device assigned, in completion order (append runs only)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub append_offsets: Vec<u64>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.errors == 0
    }
}

/// Mutable run state threaded through the completion closures.
struct RunState {
    completed: u64,
    errors: u64,
    append_offsets: Vec<u64>,
    /// Read-back buffer, indexed by the sector token (read runs only)
    readback: Vec<u8>,
    lba_nbytes: usize,
}

impl RunState {
    fn on_completion(&mut self, cpl: &mut Completion) {
        self.completed += 1;
        if cpl.status.is_fault() {
            self.errors += 1;
            warn!(
                op = %cpl.op,
                token = cpl.token,
                status = cpl.status.code(),
                "command completed with fault"
            );
            return;
        }
        match cpl.op {
            IoOp::Append => self.append_offsets.push(cpl.result),
            IoOp::Read => {
                if let Some(payload) = cpl.payload.take() {
                    let at = cpl.token as usize * self.lba_nbytes;
                    self.readback[at..at + payload.len()].copy_from_slice(&payload);
                }
            }
            IoOp::Write => {}
        }
    }
}

/// Run `workload` over one zone of the device named by `cfg.uri`.
#[tracing::instrument(skip_all, fields(uri = %cfg.uri, %workload))]
pub fn run(cfg: &DriveConfig, workload: Workload) -> Result<RunReport> {
    let dev = backend::open(&cfg.uri)?;
    run_on(dev, cfg, workload)
}

/// Run `workload` against an already-open device.
pub fn run_on(dev: Arc<dyn Device>, cfg: &DriveConfig, workload: Workload) -> Result<RunReport> {
    cfg.validate()?;

    let geo = dev.geometry();
    if geo.kind != DeviceKind::Zoned {
        return Err(Error::ProtocolMisuse(format!(
            "drive loops need a zoned device, {} is not one",
            cfg.uri
        )));
    }
    let nsid = cfg.nsid.unwrap_or_else(|| dev.nsid());

    let zone = match cfg.slba {
        Some(slba) => zone::descriptor_at(&dev, slba)?,
        None => {
            let want = match workload {
                Workload::Read => ZoneState::Full,
                Workload::Write | Workload::Append => ZoneState::Empty,
            };
            zone::first_zone_in_state(&dev, want)?
        }
    };
    info!(
        zslba = zone.zslba,
        zcap = zone.zcap,
        state = %zone.state,
        qdepth = cfg.queue_depth,
        "zone selected"
    );

    let mut ctx = AsyncContext::new(dev.clone(), cfg.queue_depth, ContextOpts::default())?;
    let mut pool = RequestPool::for_queue_depth(cfg.queue_depth)?;

    let lba = geo.lba_nbytes as usize;
    let zone_bytes = zone.zcap as usize * lba;
    let pattern = match workload {
        Workload::Read => FillPattern::Zero,
        Workload::Write | Workload::Append => FillPattern::Alnum,
    };
    let fill_src = buf::alloc(zone_bytes, pattern);

    let mut state = RunState {
        completed: 0,
        errors: 0,
        append_offsets: Vec::new(),
        readback: if workload == Workload::Read {
            vec![0u8; zone_bytes]
        } else {
            Vec::new()
        },
        lba_nbytes: lba,
    };

    let start = Instant::now();
    let mut submitted = 0u64;

    for sect in 0..zone.zcap {
        if state.errors > 0 {
            break;
        }

        let req = loop {
            match pool.acquire() {
                Some(req) => break req,
                None => poke_once(&mut ctx, &mut pool, &mut state)?,
            }
        };

        let mut payload = match workload {
            Workload::Read => BytesMut::zeroed(lba),
            Workload::Write | Workload::Append => {
                buf::block_payload(&fill_src, sect, geo.lba_nbytes)
            }
        };

        loop {
            let outcome = match workload {
                Workload::Read => cmd::read(
                    &mut ctx,
                    &mut pool,
                    req,
                    nsid,
                    zone.zslba + sect,
                    1,
                    payload,
                    sect,
                )?,
                Workload::Write => cmd::write(
                    &mut ctx,
                    &mut pool,
                    req,
                    nsid,
                    zone.zslba + sect,
                    1,
                    payload,
                    sect,
                )?,
                Workload::Append => {
                    cmd::append(&mut ctx, &mut pool, req, nsid, zone.zslba, 1, payload, sect)?
                }
            };
            match outcome {
                SubmitOutcome::Submitted => {
                    submitted += 1;
                    break;
                }
                SubmitOutcome::Busy(cmd) | SubmitOutcome::Retry(cmd) => {
                    payload = cmd.payload;
                    poke_once(&mut ctx, &mut pool, &mut state)?;
                }
            }
        }

        // A write's successor targets the pointer this write advances, so
        // wait it out before computing the next LBA.
        if workload == Workload::Write {
            ctx.wait_all(&mut pool, |cpl| state.on_completion(cpl))?;
        }
    }

    ctx.wait_all(&mut pool, |cpl| state.on_completion(cpl))?;

    let report = RunReport {
        workload,
        uri: cfg.uri.clone(),
        zslba: zone.zslba,
        submitted,
        completed: state.completed,
        errors: state.errors,
        bytes: (state.completed - state.errors) * geo.lba_nbytes as u64,
        elapsed_secs: start.elapsed().as_secs_f64(),
        append_offsets: state.append_offsets,
    };
    info!(
        submitted = report.submitted,
        completed = report.completed,
        errors = report.errors,
        "drive loop finished"
    );
    Ok(report)
}

fn poke_once(ctx: &mut AsyncContext, pool: &mut RequestPool, state: &mut RunState) -> Result<()> {
    match ctx.poke(pool, 0, |cpl| state.on_completion(cpl))? {
        ReapOutcome::Busy => thread::sleep(REAP_BACKOFF),
        ReapOutcome::Drained(_) => {}
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::raw_state;
    use crate::mock::MockZonedDevice;
    use crate::zone::descriptor_at;
    use assert_matches::assert_matches;

    #[test]
    fn test_config_validation() {
        let mut cfg = DriveConfig::new("mock:d0");
        cfg.queue_depth = 0;
        assert_matches!(cfg.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_write_run_fills_the_zone() {
        let cfg = DriveConfig::new("mock:d1?zones=2&nsect=16&lba=512");
        let dev = Arc::new(MockZonedDevice::open(&cfg.uri).unwrap());
        let report = run_on(dev.clone(), &cfg, Workload::Write).unwrap();

        assert_eq!(report.zslba, 0);
        assert_eq!(report.submitted, 16);
        assert_eq!(report.completed, 16);
        assert_eq!(report.errors, 0);
        assert_eq!(report.bytes, 16 * 512);
        assert!(report.succeeded());

        let (wp, zs) = dev.zone_snapshot(0).unwrap();
        assert_eq!(wp, 16);
        assert_eq!(zs, raw_state::FULL);

        let dyn_dev: Arc<dyn Device> = dev;
        let zone = descriptor_at(&dyn_dev, 0).unwrap();
        assert_eq!(zone.state, ZoneState::Full);
    }

    #[test]
    fn test_append_run_covers_zone_with_distinct_offsets() {
        let mut cfg = DriveConfig::new("mock:d2?zones=1&nsect=8&lba=512");
        cfg.queue_depth = 4;
        let report = run(&cfg, Workload::Append).unwrap();

        assert_eq!(report.submitted, 8);
        assert_eq!(report.errors, 0);

        let mut offsets = report.append_offsets.clone();
        offsets.sort_unstable();
        assert_eq!(offsets, (0..8).collect::<Vec<u64>>());
    }

    #[test]
    fn test_read_run_picks_first_full_zone() {
        let uri = "mock:d3?zones=2&nsect=8&lba=512";
        let dev = Arc::new(MockZonedDevice::open(uri).unwrap());
        let mut cfg = DriveConfig::new(uri);
        cfg.queue_depth = 4;
        run_on(dev.clone(), &cfg, Workload::Write).unwrap();

        let report = run_on(dev, &cfg, Workload::Read).unwrap();
        assert_eq!(report.workload, Workload::Read);
        assert_eq!(report.zslba, 0);
        assert_eq!(report.completed, 8);
        assert_eq!(report.errors, 0);
    }

    #[test]
    fn test_no_candidate_zone_is_an_error() {
        // Fresh device has no full zone to read from.
        let cfg = DriveConfig::new("mock:d4?zones=2&nsect=8&lba=512");
        assert_matches!(
            run(&cfg, Workload::Read),
            Err(Error::NoZoneInState {
                state: ZoneState::Full
            })
        );
    }

    #[test]
    fn test_first_fault_stops_new_submissions() {
        let uri = "mock:d5?zones=1&nsect=8&lba=512";
        let dev = Arc::new(MockZonedDevice::open(uri).unwrap());
        // A read-only zone faults every write at completion time. Pin slba
        // so zone selection does not filter it out.
        dev.set_zone_state(0, raw_state::RONLY);

        let mut cfg = DriveConfig::new(uri);
        cfg.slba = Some(0);
        let report = run_on(dev, &cfg, Workload::Write).unwrap();

        // Serialized writes observe the first fault before submitting more:
        // one submission, one fault, seven sectors never attempted.
        assert_eq!(report.submitted, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.errors, 1);
        assert!(!report.succeeded());
    }
}
