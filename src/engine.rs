//! Multi-device engine with fair completion scheduling
//!
//! The engine front-ends one lane (device + context + request pool) per
//! configured URI. Callers address lanes by ordinal, hand in logical I/O
//! units with byte offsets, and harvest completed units in batches.
//! Harvesting sweeps the lanes round-robin starting *after* the lane served
//! last, so a single busy device cannot starve the others.
//!
//! Backpressure is a value, not an error: a saturated lane hands the unit
//! back inside [`QueueOutcome::Busy`] for the caller to retry after the
//! next harvest. Hard failures complete the unit immediately with an error
//! code and count toward [`Engine::error_count`].

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::backend::{self, Device, Geometry, IoOp, ReapOutcome, SubmitOutcome};
use crate::cmd;
use crate::ctx::{AsyncContext, ContextOpts};
use crate::error::{Error, Result};
use crate::pool::RequestPool;
use crate::zone::{self, ZoneDescriptor, ZoneDirectory};

const REAP_BACKOFF: Duration = Duration::from_micros(1);

/// Error codes recorded on units that fail before reaching a device.
const ERR_INVALID: i32 = 22; // EINVAL
const ERR_NO_RESOURCES: i32 = 12; // ENOMEM

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Per-lane queue depth
    pub queue_depth: u32,
    pub opts: ContextOpts,
}

impl EngineConfig {
    pub fn new(queue_depth: u32) -> Self {
        Self {
            queue_depth,
            opts: ContextOpts::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(Error::Config("engine queue depth must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// I/O units
// =============================================================================

/// One logical I/O unit addressed to a lane by ordinal. Offsets are in
/// bytes; for appends the offset names the zone start.
#[derive(Debug)]
pub struct IoUnit {
    /// Caller's identifier, echoed back on completion
    pub id: u64,
    /// Lane ordinal
    pub dev: usize,
    pub op: IoOp,
    pub offset: u64,
    /// Whole payload; must be a non-zero multiple of the lane's block size
    pub payload: BytesMut,
}

/// A finished unit.
#[derive(Debug)]
pub struct CompletedUnit {
    pub id: u64,
    pub op: IoOp,
    /// `None` on success, otherwise an error code (device status or an
    /// `ERR_*` value for units that never reached the device)
    pub error: Option<i32>,
    /// LBA written for appends, blocks transferred otherwise
    pub result: u64,
    /// Returned payload (reads)
    pub payload: Option<BytesMut>,
}

/// Outcome of [`Engine::queue`].
#[derive(Debug)]
pub enum QueueOutcome {
    /// Accepted; will surface through [`Engine::get_events`]
    Queued,
    /// Lane saturated; retry the returned unit after harvesting
    Busy(IoUnit),
    /// Failed before submission; counted in [`Engine::error_count`]
    Completed(CompletedUnit),
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug)]
struct Lane {
    dev: Arc<dyn Device>,
    ctx: AsyncContext,
    pool: RequestPool,
    geo: Geometry,
    ssw: u32,
    nsid: u32,
    open_units: u32,
}

/// Multi-device I/O front end. See the module docs.
#[derive(Debug)]
pub struct Engine {
    lanes: Vec<Lane>,
    /// Lane that served the previous harvest; the next sweep starts after it
    prev: Option<usize>,
    depth: u32,
    error_count: u64,
}

impl Engine {
    /// Open every URI and build one lane per device.
    pub fn init(uris: &[String], cfg: EngineConfig) -> Result<Self> {
        cfg.validate()?;
        if uris.is_empty() {
            return Err(Error::Config("engine needs at least one device URI".into()));
        }

        let mut lanes = Vec::with_capacity(uris.len());
        for uri in uris {
            let dev = backend::open(uri)?;
            let geo = dev.geometry();
            let nsid = dev.nsid();
            let ctx = AsyncContext::new(dev.clone(), cfg.queue_depth, cfg.opts)?;
            let pool = RequestPool::for_queue_depth(cfg.queue_depth)?;
            lanes.push(Lane {
                dev,
                ctx,
                pool,
                geo,
                ssw: geo.ssw(),
                nsid,
                open_units: 0,
            });
        }

        info!(lanes = lanes.len(), qdepth = cfg.queue_depth, "engine initialized");
        Ok(Self {
            lanes,
            prev: None,
            depth: cfg.queue_depth,
            error_count: 0,
        })
    }

    pub fn device_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn queue_depth(&self) -> u32 {
        self.depth
    }

    /// Units that failed (before or after reaching a device) so far.
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Commands in flight across every lane.
    pub fn outstanding(&self) -> u32 {
        self.lanes.iter().map(|l| l.ctx.outstanding()).sum()
    }

    /// Record a unit of work opened against a lane. Bookkeeping only; the
    /// device was opened at init.
    pub fn open_unit(&mut self, dev: usize) -> Result<()> {
        let lane = self.lane_mut(dev)?;
        lane.open_units += 1;
        Ok(())
    }

    /// Record a unit of work closed against a lane.
    pub fn close_unit(&mut self, dev: usize) -> Result<()> {
        let lane = self.lane_mut(dev)?;
        if lane.open_units == 0 {
            return Err(Error::ProtocolMisuse(format!(
                "close_unit on lane {dev} with no open units"
            )));
        }
        lane.open_units -= 1;
        Ok(())
    }

    fn lane_mut(&mut self, dev: usize) -> Result<&mut Lane> {
        let nlanes = self.lanes.len();
        self.lanes
            .get_mut(dev)
            .ok_or_else(|| Error::DeviceNotFound(format!("lane {dev} (engine has {nlanes})")))
    }

    /// Queue one unit. Non-blocking; see [`QueueOutcome`].
    pub fn queue(&mut self, unit: IoUnit) -> Result<QueueOutcome> {
        let nlanes = self.lanes.len();
        let lane = match self.lanes.get_mut(unit.dev) {
            Some(lane) => lane,
            None => {
                return Err(Error::DeviceNotFound(format!(
                    "lane {} (engine has {nlanes})",
                    unit.dev
                )))
            }
        };

        let id = unit.id;
        let op = unit.op;
        let lba = lane.geo.lba_nbytes as usize;

        if unit.payload.is_empty()
            || unit.payload.len() % lba != 0
            || unit.offset % lba as u64 != 0
        {
            warn!(
                id,
                %op,
                offset = unit.offset,
                len = unit.payload.len(),
                lba,
                "malformed unit"
            );
            self.error_count += 1;
            return Ok(QueueOutcome::Completed(CompletedUnit {
                id,
                op,
                error: Some(ERR_INVALID),
                result: 0,
                payload: Some(unit.payload),
            }));
        }

        let nblocks = (unit.payload.len() / lba) as u32;
        let slba = unit.offset >> lane.ssw;

        let req = match lane.pool.acquire() {
            Some(req) => req,
            None => {
                // Pool outlives the queue depth by one slot, so exhaustion
                // means slots leaked. Fatal for the unit, loud in the log.
                warn!(id, dev = unit.dev, "request pool exhausted");
                self.error_count += 1;
                return Ok(QueueOutcome::Completed(CompletedUnit {
                    id,
                    op,
                    error: Some(ERR_NO_RESOURCES),
                    result: 0,
                    payload: Some(unit.payload),
                }));
            }
        };

        let Lane {
            ctx, pool, nsid, ..
        } = lane;
        let nsid = *nsid;
        let outcome = match op {
            IoOp::Read => cmd::read(ctx, pool, req, nsid, slba, nblocks, unit.payload, id),
            IoOp::Write => cmd::write(ctx, pool, req, nsid, slba, nblocks, unit.payload, id),
            IoOp::Append => cmd::append(ctx, pool, req, nsid, slba, nblocks, unit.payload, id),
        };

        match outcome {
            Ok(SubmitOutcome::Submitted) => Ok(QueueOutcome::Queued),
            Ok(SubmitOutcome::Busy(cmd)) | Ok(SubmitOutcome::Retry(cmd)) => {
                pool.release(req);
                debug!(id, dev = unit.dev, "lane saturated, unit bounced");
                Ok(QueueOutcome::Busy(IoUnit {
                    id,
                    dev: unit.dev,
                    op,
                    offset: unit.offset,
                    payload: cmd.payload,
                }))
            }
            Err(err) => {
                pool.release(req);
                warn!(id, dev = unit.dev, %err, "unit rejected at submission");
                self.error_count += 1;
                Ok(QueueOutcome::Completed(CompletedUnit {
                    id,
                    op,
                    error: Some(ERR_INVALID),
                    result: 0,
                    payload: None,
                }))
            }
        }
    }

    /// Harvest completed units: at least `min` (or until no lane has
    /// anything left in flight), at most `max` (`max == 0` means unbounded).
    ///
    /// `deadline` must be `None`; per-call deadlines are not supported and
    /// the only recourse for a stalled device is tearing it down.
    pub fn get_events(
        &mut self,
        min: usize,
        max: usize,
        deadline: Option<Duration>,
    ) -> Result<Vec<CompletedUnit>> {
        if deadline.is_some() {
            return Err(Error::DeadlineUnsupported);
        }

        let nlanes = self.lanes.len();
        let start = self.prev.map(|p| (p + 1) % nlanes).unwrap_or(0);
        let mut last_served = None;
        let mut out = Vec::new();
        let mut errors = 0u64;

        loop {
            let mut anything_in_flight = false;

            for step in 0..nlanes {
                if max != 0 && out.len() >= max {
                    break;
                }
                let idx = (start + step) % nlanes;
                let lane = &mut self.lanes[idx];

                let budget = if max == 0 { 0 } else { (max - out.len()) as u32 };
                let reap = lane.ctx.poke(&mut lane.pool, budget, |cpl| {
                    let error = match cpl.status.code() {
                        0 => None,
                        code => {
                            errors += 1;
                            Some(code)
                        }
                    };
                    out.push(CompletedUnit {
                        id: cpl.token,
                        op: cpl.op,
                        error,
                        result: cpl.result,
                        payload: cpl.payload.take(),
                    });
                })?;

                match reap {
                    ReapOutcome::Busy => thread::sleep(REAP_BACKOFF),
                    ReapOutcome::Drained(n) if n > 0 => last_served = Some(idx),
                    ReapOutcome::Drained(_) => {}
                }
                if lane.ctx.outstanding() > 0 {
                    anything_in_flight = true;
                }
            }

            // Stop once satisfied, or when no lane can produce more.
            if out.len() >= min || !anything_in_flight {
                break;
            }
        }

        if last_served.is_some() {
            self.prev = last_served;
        }
        self.error_count += errors;
        Ok(out)
    }

    /// Drain every lane and close every device. Returns the number of
    /// completions drained during teardown.
    pub fn cleanup(mut self) -> Result<u64> {
        let mut drained = 0u64;
        for lane in &mut self.lanes {
            drained += u64::from(lane.ctx.wait_all(&mut lane.pool, |_| {})?);
        }
        for lane in self.lanes.drain(..) {
            backend::close(lane.dev);
        }
        info!(drained, "engine torn down");
        Ok(drained)
    }
}

// =============================================================================
// Zoned plumbing (fresh-handle helpers)
// =============================================================================

/// Zoned model of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZonedModel {
    /// Not zoned; flat LBA space
    None,
    /// Host-managed zoned namespace
    HostManaged,
}

/// Probe the zoned model of the device at `uri`.
pub fn zoned_model(uri: &str) -> Result<ZonedModel> {
    let dev = backend::open(uri)?;
    let model = match dev.geometry().kind {
        backend::DeviceKind::Zoned => ZonedModel::HostManaged,
        _ => ZonedModel::None,
    };
    backend::close(dev);
    Ok(model)
}

/// Report `nzones` zones covering the byte offset `offset`.
pub fn report_zones(uri: &str, offset: u64, nzones: u32) -> Result<Vec<ZoneDescriptor>> {
    let dev = backend::open(uri)?;
    let geo = dev.geometry();
    let slba = ((offset >> geo.ssw()) / geo.nsect) * geo.nsect;
    let result = ZoneDirectory::load(&dev, slba, nzones).map(|dir| dir.zones().to_vec());
    backend::close(dev);
    result
}

/// Reset the write pointer of every zone overlapping the byte range.
pub fn reset_write_pointer(uri: &str, offset: u64, length: u64) -> Result<()> {
    let dev = backend::open(uri)?;
    let result = zone::reset_write_pointer(&dev, offset, length);
    backend::close(dev);
    result
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn uris(n: usize, tag: &str) -> Vec<String> {
        (0..n)
            .map(|i| format!("mock:{tag}{i}?zones=2&nsect=16&lba=512"))
            .collect()
    }

    fn append_unit(id: u64, dev: usize) -> IoUnit {
        IoUnit {
            id,
            dev,
            op: IoOp::Append,
            offset: 0,
            payload: BytesMut::zeroed(512),
        }
    }

    #[test]
    fn test_init_validation() {
        assert_matches!(
            Engine::init(&[], EngineConfig::new(4)),
            Err(Error::Config(_))
        );
        assert_matches!(
            Engine::init(&uris(1, "ev"), EngineConfig::new(0)),
            Err(Error::Config(_))
        );
        assert_matches!(
            Engine::init(&["bogus:x".to_string()], EngineConfig::new(4)),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_queue_and_harvest_round_trip() {
        let mut engine = Engine::init(&uris(2, "rt"), EngineConfig::new(4)).unwrap();

        assert_matches!(engine.queue(append_unit(10, 0)).unwrap(), QueueOutcome::Queued);
        assert_matches!(engine.queue(append_unit(11, 1)).unwrap(), QueueOutcome::Queued);
        assert_eq!(engine.outstanding(), 2);

        let mut events = engine.get_events(2, 2, None).unwrap();
        assert_eq!(events.len(), 2);
        events.sort_by_key(|e| e.id);
        assert_eq!(events[0].id, 10);
        assert_eq!(events[1].id, 11);
        assert!(events.iter().all(|e| e.error.is_none()));
        assert_eq!(engine.error_count(), 0);
        assert_eq!(engine.outstanding(), 0);
    }

    #[test]
    fn test_deadline_is_unsupported() {
        let mut engine = Engine::init(&uris(1, "dl"), EngineConfig::new(2)).unwrap();
        assert_matches!(
            engine.get_events(0, 0, Some(Duration::from_millis(5))),
            Err(Error::DeadlineUnsupported)
        );
    }

    #[test]
    fn test_unknown_lane_is_an_error() {
        let mut engine = Engine::init(&uris(1, "ul"), EngineConfig::new(2)).unwrap();
        assert_matches!(
            engine.queue(append_unit(0, 7)),
            Err(Error::DeviceNotFound(_))
        );
    }

    #[test]
    fn test_malformed_unit_completes_with_error() {
        let mut engine = Engine::init(&uris(1, "mf"), EngineConfig::new(2)).unwrap();
        let unit = IoUnit {
            id: 5,
            dev: 0,
            op: IoOp::Write,
            offset: 0,
            payload: BytesMut::zeroed(100), // not a block multiple
        };
        let outcome = engine.queue(unit).unwrap();
        let completed = match outcome {
            QueueOutcome::Completed(c) => c,
            other => panic!("expected Completed, got {other:?}"),
        };
        assert_eq!(completed.id, 5);
        assert_eq!(completed.error, Some(ERR_INVALID));
        assert_eq!(engine.error_count(), 1);
    }

    #[test]
    fn test_saturated_lane_bounces_the_unit() {
        let mut engine = Engine::init(&uris(1, "sat"), EngineConfig::new(1)).unwrap();

        assert_matches!(engine.queue(append_unit(0, 0)).unwrap(), QueueOutcome::Queued);
        let bounced = match engine.queue(append_unit(1, 0)).unwrap() {
            QueueOutcome::Busy(unit) => unit,
            other => panic!("expected Busy, got {other:?}"),
        };
        assert_eq!(bounced.id, 1);
        assert_eq!(bounced.payload.len(), 512);

        // Harvest makes room; the bounced unit goes through afterwards.
        assert_eq!(engine.get_events(1, 1, None).unwrap().len(), 1);
        assert_matches!(engine.queue(bounced).unwrap(), QueueOutcome::Queued);
        engine.cleanup().unwrap();
    }

    #[test]
    fn test_round_robin_resumes_after_last_served_lane() {
        let mut engine = Engine::init(&uris(3, "rr"), EngineConfig::new(2)).unwrap();

        for lane in 0..3 {
            assert_matches!(
                engine.queue(append_unit(100 + lane as u64, lane)).unwrap(),
                QueueOutcome::Queued
            );
        }

        // One event per harvest; the sweep must advance one lane each time
        // instead of re-serving lane 0.
        for expected in [100u64, 101, 102] {
            let events = engine.get_events(1, 1, None).unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].id, expected);
        }
    }

    #[test]
    fn test_open_close_unit_bookkeeping() {
        let mut engine = Engine::init(&uris(1, "oc"), EngineConfig::new(2)).unwrap();
        assert_matches!(
            engine.close_unit(0),
            Err(Error::ProtocolMisuse(_))
        );
        engine.open_unit(0).unwrap();
        engine.close_unit(0).unwrap();
    }

    #[test]
    fn test_cleanup_drains_in_flight_units() {
        let mut engine = Engine::init(&uris(2, "cu"), EngineConfig::new(4)).unwrap();
        for id in 0..3 {
            assert_matches!(
                engine.queue(append_unit(id, (id % 2) as usize)).unwrap(),
                QueueOutcome::Queued
            );
        }
        assert_eq!(engine.cleanup().unwrap(), 3);
    }

    #[test]
    fn test_zoned_model_probe() {
        assert_eq!(
            zoned_model("mock:zm0?zones=2&nsect=8&lba=512").unwrap(),
            ZonedModel::HostManaged
        );
        assert_eq!(
            zoned_model("mock:zm1?zones=2&nsect=8&lba=512&kind=conv").unwrap(),
            ZonedModel::None
        );
    }

    #[test]
    fn test_report_zones_by_byte_offset() {
        // Offset inside zone 1 aligns down to zone 1's start.
        let zones = report_zones("mock:rz0?zones=4&nsect=8&lba=512", 9 * 512, 2).unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].zslba, 8);
        assert_eq!(zones[1].zslba, 16);
    }
}
