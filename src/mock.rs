//! Deterministic RAM-backed zoned device
//!
//! Implements [`Device`] over an in-memory sector array with real zone
//! bookkeeping: write pointers advance, appends get their offset assigned by
//! the device, zones transition to `Full` at capacity, resets rewind and
//! zero the zone. Commands execute at submission time; completions land in a
//! bounded lock-free queue and are delivered through `reap`, so the async
//! contract (submit, poke, backpressure) is exercised for real.
//!
//! Failure injection hooks (`fail_reset`, `inject_submit_busy`,
//! `inject_reap_busy`, `set_zone_state`) let tests drive the error and
//! backoff paths deterministically.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::trace;

use crate::backend::{
    raw_state, raw_type, CmdMode, Command, Completion, CompletionStatus, Device, DeviceKind,
    Geometry, IoOp, RawZone, ReapOutcome, SubmitOutcome, ZoneAction,
};
use crate::error::{Error, Result};
use crate::pool::ReqId;

/// NVMe-style status codes the mock reports in fault completions.
pub mod status {
    pub const SC_INTERNAL: i32 = 0x06;
    pub const SC_LBA_OUT_OF_RANGE: i32 = 0x80;
    pub const SC_ZONE_BOUNDARY: i32 = 0xB8;
    pub const SC_ZONE_IS_FULL: i32 = 0xB9;
    pub const SC_ZONE_IS_READ_ONLY: i32 = 0xBA;
    pub const SC_ZONE_IS_OFFLINE: i32 = 0xBB;
    pub const SC_ZONE_INVALID_WRITE: i32 = 0xBC;
}

/// Mock device shape, parsed from the open URI.
#[derive(Debug, Clone, Copy)]
pub struct MockConfig {
    pub lba_nbytes: u32,
    pub nzones: u64,
    /// Sectors per zone (zone size)
    pub nsect: u64,
    /// Writable sectors per zone (<= nsect)
    pub zcap: u64,
    /// Completion queue bound; submissions bounce with `Busy` when it fills
    pub queue_capacity: usize,
    pub kind: DeviceKind,
    pub nsid: u32,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            lba_nbytes: 512,
            nzones: 4,
            nsect: 64,
            zcap: 64,
            queue_capacity: 64,
            kind: DeviceKind::Zoned,
            nsid: 1,
        }
    }
}

impl MockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lba_nbytes == 0 || !self.lba_nbytes.is_power_of_two() {
            return Err(Error::Config(format!(
                "mock lba size {} must be a non-zero power of 2",
                self.lba_nbytes
            )));
        }
        if self.nzones == 0 || self.nsect == 0 {
            return Err(Error::Config("mock needs zones > 0 and nsect > 0".into()));
        }
        if self.zcap == 0 || self.zcap > self.nsect {
            return Err(Error::Config(format!(
                "mock zcap {} must be in 1..={}",
                self.zcap, self.nsect
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("mock completion queue capacity must be > 0".into()));
        }
        Ok(())
    }

    fn total_sectors(&self) -> u64 {
        self.nzones * self.nsect
    }
}

#[derive(Debug, Clone, Copy)]
struct MockZone {
    zslba: u64,
    zcap: u64,
    /// Absolute LBA of the next writable sector
    wp: u64,
    /// Raw zone state code
    zs: u8,
}

impl MockZone {
    fn end(&self) -> u64 {
        self.zslba + self.zcap
    }

    fn is_writable(&self) -> bool {
        matches!(
            self.zs,
            raw_state::EMPTY | raw_state::IOPEN | raw_state::EOPEN | raw_state::CLOSED
        )
    }
}

#[derive(Debug)]
struct MockState {
    zones: Vec<MockZone>,
    data: Vec<u8>,
    failing_resets: HashSet<u64>,
}

/// In-memory zoned device. See the module docs.
#[derive(Debug)]
pub struct MockZonedDevice {
    uri: String,
    cfg: MockConfig,
    state: Mutex<MockState>,
    cq: ArrayQueue<Completion>,
    submit_busy_budget: AtomicU32,
    reap_busy_budget: AtomicU32,
}

impl MockZonedDevice {
    /// Open from a `mock:` URI, e.g.
    /// `mock:t0?zones=8&nsect=128&zcap=96&lba=4096&qcap=32&kind=conv`.
    pub fn open(uri: &str) -> Result<Self> {
        let cfg = parse_uri(uri)?;
        Self::with_config(uri, cfg)
    }

    pub fn with_config(uri: &str, cfg: MockConfig) -> Result<Self> {
        cfg.validate()?;

        let zones = (0..cfg.nzones)
            .map(|i| {
                let zslba = i * cfg.nsect;
                MockZone {
                    zslba,
                    zcap: cfg.zcap,
                    wp: zslba,
                    zs: raw_state::EMPTY,
                }
            })
            .collect();

        let nbytes = cfg.total_sectors() as usize * cfg.lba_nbytes as usize;

        Ok(Self {
            uri: uri.to_string(),
            cfg,
            state: Mutex::new(MockState {
                zones,
                data: vec![0u8; nbytes],
                failing_resets: HashSet::new(),
            }),
            cq: ArrayQueue::new(cfg.queue_capacity),
            submit_busy_budget: AtomicU32::new(0),
            reap_busy_budget: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> MockConfig {
        self.cfg
    }

    // -------------------------------------------------------------------------
    // Failure injection / test introspection
    // -------------------------------------------------------------------------

    /// Make the next `n` submissions bounce with `Busy`.
    pub fn inject_submit_busy(&self, n: u32) {
        self.submit_busy_budget.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reap calls report a transient stall.
    pub fn inject_reap_busy(&self, n: u32) {
        self.reap_busy_budget.store(n, Ordering::SeqCst);
    }

    /// Make write-pointer resets of the zone at `zslba` fail.
    pub fn fail_reset(&self, zslba: u64) {
        self.state.lock().failing_resets.insert(zslba);
    }

    /// Force a zone into a raw state (any code, including undefined ones,
    /// so normalization rejection paths can be exercised).
    pub fn set_zone_state(&self, zslba: u64, zs: u8) {
        let mut state = self.state.lock();
        if let Some(zone) = state.zones.iter_mut().find(|z| z.zslba == zslba) {
            zone.zs = zs;
        }
    }

    /// Current `(write pointer, raw state)` of the zone at `zslba`.
    pub fn zone_snapshot(&self, zslba: u64) -> Option<(u64, u8)> {
        let state = self.state.lock();
        state
            .zones
            .iter()
            .find(|z| z.zslba == zslba)
            .map(|z| (z.wp, z.zs))
    }

    // -------------------------------------------------------------------------
    // Command execution
    // -------------------------------------------------------------------------

    fn take_budget(budget: &AtomicU32) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Execute a command against device state, producing its completion.
    fn execute(&self, cmd: Command, req: ReqId, token: u64) -> Result<Completion> {
        let lba = self.cfg.lba_nbytes as usize;
        let expected = cmd.nblocks as usize * lba;
        if cmd.nblocks == 0 || cmd.payload.len() != expected {
            return Err(Error::ProtocolMisuse(format!(
                "payload of {} bytes does not match nblocks {} x lba {}",
                cmd.payload.len(),
                cmd.nblocks,
                lba
            )));
        }
        if cmd.nsid != self.cfg.nsid {
            return Err(Error::ProtocolMisuse(format!(
                "namespace {} not provided by this device (nsid {})",
                cmd.nsid, self.cfg.nsid
            )));
        }

        let fault = |code: i32| Completion {
            req,
            token,
            op: cmd.op,
            status: CompletionStatus::Fault(code),
            result: 0,
            payload: None,
        };

        if cmd.slba + cmd.nblocks as u64 > self.cfg.total_sectors() {
            return Ok(fault(status::SC_LBA_OUT_OF_RANGE));
        }

        let mut state = self.state.lock();
        match cmd.op {
            IoOp::Read => {
                let zone_offline = self.cfg.kind == DeviceKind::Zoned
                    && zone_of(&state.zones, cmd.slba, self.cfg.nsect)
                        .map(|z| z.zs == raw_state::OFFLINE)
                        .unwrap_or(false);
                if zone_offline {
                    return Ok(fault(status::SC_ZONE_IS_OFFLINE));
                }

                let mut payload = cmd.payload;
                let at = cmd.slba as usize * lba;
                payload[..expected].copy_from_slice(&state.data[at..at + expected]);
                Ok(Completion {
                    req,
                    token,
                    op: IoOp::Read,
                    status: CompletionStatus::Success,
                    result: cmd.nblocks as u64,
                    payload: Some(payload),
                })
            }

            IoOp::Write if self.cfg.kind != DeviceKind::Zoned => {
                let at = cmd.slba as usize * lba;
                state.data[at..at + expected].copy_from_slice(&cmd.payload);
                Ok(Completion {
                    req,
                    token,
                    op: IoOp::Write,
                    status: CompletionStatus::Success,
                    result: cmd.nblocks as u64,
                    payload: None,
                })
            }

            IoOp::Write | IoOp::Append => {
                let nsect = self.cfg.nsect;
                let zone = match zone_of(&state.zones, cmd.slba, nsect) {
                    Some(z) => z,
                    None => return Ok(fault(status::SC_LBA_OUT_OF_RANGE)),
                };

                match zone.zs {
                    raw_state::RONLY => return Ok(fault(status::SC_ZONE_IS_READ_ONLY)),
                    raw_state::OFFLINE => return Ok(fault(status::SC_ZONE_IS_OFFLINE)),
                    raw_state::FULL => return Ok(fault(status::SC_ZONE_IS_FULL)),
                    _ if !zone.is_writable() => return Ok(fault(status::SC_INTERNAL)),
                    _ => {}
                }

                if cmd.op == IoOp::Append && cmd.slba != zone.zslba {
                    return Err(Error::ProtocolMisuse(format!(
                        "append slba {} is not the start of zone {}",
                        cmd.slba, zone.zslba
                    )));
                }
                if cmd.op == IoOp::Write && cmd.slba != zone.wp {
                    return Ok(fault(status::SC_ZONE_INVALID_WRITE));
                }

                let target = zone.wp;
                if target + cmd.nblocks as u64 > zone.end() {
                    return Ok(fault(status::SC_ZONE_BOUNDARY));
                }

                let zidx = (zone.zslba / nsect) as usize;
                let at = target as usize * lba;
                state.data[at..at + expected].copy_from_slice(&cmd.payload);

                let zone = &mut state.zones[zidx];
                zone.wp = target + cmd.nblocks as u64;
                zone.zs = if zone.wp == zone.end() {
                    raw_state::FULL
                } else {
                    raw_state::IOPEN
                };

                Ok(Completion {
                    req,
                    token,
                    op: cmd.op,
                    status: CompletionStatus::Success,
                    result: if cmd.op == IoOp::Append {
                        target
                    } else {
                        cmd.nblocks as u64
                    },
                    payload: None,
                })
            }
        }
    }
}

fn zone_of(zones: &[MockZone], slba: u64, nsect: u64) -> Option<MockZone> {
    zones.get((slba / nsect) as usize).copied()
}

impl Device for MockZonedDevice {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn geometry(&self) -> Geometry {
        Geometry {
            lba_nbytes: self.cfg.lba_nbytes,
            tbytes: self.cfg.total_sectors() * self.cfg.lba_nbytes as u64,
            nsect: self.cfg.nsect,
            nzones: self.cfg.nzones,
            kind: self.cfg.kind,
        }
    }

    fn nsid(&self) -> u32 {
        self.cfg.nsid
    }

    fn submit(
        &self,
        cmd: Command,
        _mode: CmdMode,
        req: ReqId,
        token: u64,
    ) -> Result<SubmitOutcome> {
        if Self::take_budget(&self.submit_busy_budget) {
            trace!(uri = %self.uri, "injected submit busy");
            return Ok(SubmitOutcome::Busy(cmd));
        }
        // Completion queue is the capacity bound; check before executing so
        // device state never mutates for a bounced command.
        if self.cq.len() >= self.cq.capacity() {
            return Ok(SubmitOutcome::Busy(cmd));
        }

        let cpl = self.execute(cmd, req, token)?;
        if let Err(cpl) = self.cq.push(cpl) {
            // Lost the race for the last queue slot; the command already
            // executed, so this would drop a completion. Single-submitter
            // contexts never get here.
            return Err(Error::DeviceFault {
                status: status::SC_INTERNAL,
                context: format!("completion queue overflow (req {:?})", cpl.req),
            });
        }
        Ok(SubmitOutcome::Submitted)
    }

    fn reap(&self, max: u32, out: &mut Vec<Completion>) -> Result<ReapOutcome> {
        if Self::take_budget(&self.reap_busy_budget) {
            return Ok(ReapOutcome::Busy);
        }

        let mut drained = 0u32;
        while max == 0 || drained < max {
            match self.cq.pop() {
                Some(cpl) => {
                    out.push(cpl);
                    drained += 1;
                }
                None => break,
            }
        }
        Ok(ReapOutcome::Drained(drained))
    }

    fn zone_report(&self, slba: u64, nzones: u32) -> Result<Vec<RawZone>> {
        if self.cfg.kind != DeviceKind::Zoned {
            return Err(Error::ProtocolMisuse(format!(
                "zone report on non-zoned device {}",
                self.uri
            )));
        }
        if slba % self.cfg.nsect != 0 {
            return Err(Error::ProtocolMisuse(format!(
                "zone report slba {slba} is not zone-aligned (nsect {})",
                self.cfg.nsect
            )));
        }

        let first = (slba / self.cfg.nsect) as usize;
        let state = self.state.lock();
        Ok(state
            .zones
            .iter()
            .skip(first)
            .take(nzones as usize)
            .map(|z| RawZone {
                zslba: z.zslba,
                zcap: z.zcap,
                wp: z.wp,
                zs: z.zs,
                zt: raw_type::SEQWR,
            })
            .collect())
    }

    fn zone_mgmt(&self, nsid: u32, zslba: u64, action: ZoneAction) -> Result<()> {
        if nsid != self.cfg.nsid {
            return Err(Error::ProtocolMisuse(format!(
                "namespace {} not provided by this device (nsid {})",
                nsid, self.cfg.nsid
            )));
        }

        let mut state = self.state.lock();
        let nsect = self.cfg.nsect;
        let lba = self.cfg.lba_nbytes as usize;

        let zidx = state
            .zones
            .iter()
            .position(|z| z.zslba == zslba)
            .ok_or_else(|| Error::ProtocolMisuse(format!("no zone starts at LBA {zslba}")))?;

        match action {
            ZoneAction::Reset => {
                if state.failing_resets.contains(&zslba) {
                    return Err(Error::DeviceFault {
                        status: status::SC_INTERNAL,
                        context: format!("injected reset failure at zone {zslba}"),
                    });
                }
                let zs = state.zones[zidx].zs;
                if zs == raw_state::RONLY {
                    return Err(Error::DeviceFault {
                        status: status::SC_ZONE_IS_READ_ONLY,
                        context: format!("cannot reset read-only zone {zslba}"),
                    });
                }
                if zs == raw_state::OFFLINE {
                    return Err(Error::DeviceFault {
                        status: status::SC_ZONE_IS_OFFLINE,
                        context: format!("cannot reset offline zone {zslba}"),
                    });
                }

                let zone = &mut state.zones[zidx];
                zone.wp = zone.zslba;
                zone.zs = raw_state::EMPTY;

                let at = zslba as usize * lba;
                let len = nsect as usize * lba;
                state.data[at..at + len].fill(0);
                Ok(())
            }
        }
    }
}

// =============================================================================
// URI parsing
// =============================================================================

fn parse_uri(uri: &str) -> Result<MockConfig> {
    let rest = uri
        .strip_prefix("mock:")
        .ok_or_else(|| Error::Config(format!("not a mock URI: '{uri}'")))?;

    let mut cfg = MockConfig::default();
    let mut zcap_given = false;

    if let Some((_name, query)) = rest.split_once('?') {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("malformed mock URI parameter '{pair}'")))?;
            match key {
                "zones" => cfg.nzones = parse_num(key, value)?,
                "nsect" => cfg.nsect = parse_num(key, value)?,
                "zcap" => {
                    cfg.zcap = parse_num(key, value)?;
                    zcap_given = true;
                }
                "lba" => cfg.lba_nbytes = parse_num::<u32>(key, value)?,
                "qcap" => cfg.queue_capacity = parse_num::<u64>(key, value)? as usize,
                "nsid" => cfg.nsid = parse_num::<u32>(key, value)?,
                "kind" => {
                    cfg.kind = match value {
                        "zoned" => DeviceKind::Zoned,
                        "conv" => DeviceKind::Conventional,
                        other => {
                            return Err(Error::Config(format!("unknown mock kind '{other}'")))
                        }
                    }
                }
                other => {
                    return Err(Error::Config(format!("unknown mock URI parameter '{other}'")))
                }
            }
        }
    }

    if !zcap_given {
        cfg.zcap = cfg.nsect;
    }
    Ok(cfg)
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("mock URI parameter {key}='{value}' is not a number")))
}

// =============================================================================
// Tests
// =============================================================================
