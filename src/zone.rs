//! Zone directory: normalized zone reports and write-pointer management
//!
//! Raw zone-report entries carry device-defined state and type codes; this
//! module normalizes them into [`ZoneDescriptor`] values the rest of the
//! engine works with. Mapping is conservative: the raw read-only state folds
//! into [`ZoneState::Offline`] (both mean "stop writing here"), and any code
//! outside the defined set is rejected outright rather than guessed at.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{raw_state, raw_type, Device, DeviceKind, RawZone, ZoneAction};
use crate::error::{Error, Result};

// =============================================================================
// Normalized states and types
// =============================================================================

/// Normalized zone state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneState {
    Empty,
    ImplicitOpen,
    ExplicitOpen,
    Closed,
    Full,
    /// Kept for completeness; report normalization folds the raw read-only
    /// state into `Offline`.
    ReadOnly,
    Offline,
}

impl ZoneState {
    /// Map a raw device state code. Unknown codes are an error, never a
    /// default.
    pub fn from_raw(zs: u8) -> Result<Self> {
        match zs {
            raw_state::EMPTY => Ok(ZoneState::Empty),
            raw_state::IOPEN => Ok(ZoneState::ImplicitOpen),
            raw_state::EOPEN => Ok(ZoneState::ExplicitOpen),
            raw_state::CLOSED => Ok(ZoneState::Closed),
            raw_state::FULL => Ok(ZoneState::Full),
            raw_state::RONLY | raw_state::OFFLINE => Ok(ZoneState::Offline),
            other => Err(Error::ProtocolMisuse(format!(
                "unknown raw zone state {other:#x}"
            ))),
        }
    }

    /// Whether a zone in this state accepts writes or appends.
    pub fn can_write(&self) -> bool {
        matches!(
            self,
            ZoneState::Empty | ZoneState::ImplicitOpen | ZoneState::ExplicitOpen | ZoneState::Closed
        )
    }
}

impl fmt::Display for ZoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ZoneState::Empty => "empty",
            ZoneState::ImplicitOpen => "implicit-open",
            ZoneState::ExplicitOpen => "explicit-open",
            ZoneState::Closed => "closed",
            ZoneState::Full => "full",
            ZoneState::ReadOnly => "read-only",
            ZoneState::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

/// Normalized zone type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    Conventional,
    SequentialWrite,
}

impl ZoneType {
    pub fn from_raw(zt: u8) -> Result<Self> {
        match zt {
            raw_type::CONVENTIONAL => Ok(ZoneType::Conventional),
            raw_type::SEQWR => Ok(ZoneType::SequentialWrite),
            other => Err(Error::ProtocolMisuse(format!(
                "unknown raw zone type {other:#x}"
            ))),
        }
    }
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneType::Conventional => write!(f, "conventional"),
            ZoneType::SequentialWrite => write!(f, "sequential-write"),
        }
    }
}

// =============================================================================
// Descriptors and the directory
// =============================================================================

/// One normalized zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneDescriptor {
    /// Zone start LBA
    pub zslba: u64,
    /// Writable capacity in sectors
    pub zcap: u64,
    /// Current write pointer (absolute LBA)
    pub wp: u64,
    pub state: ZoneState,
    pub ztype: ZoneType,
}

impl ZoneDescriptor {
    pub fn from_raw(raw: &RawZone) -> Result<Self> {
        Ok(Self {
            zslba: raw.zslba,
            zcap: raw.zcap,
            wp: raw.wp,
            state: ZoneState::from_raw(raw.zs)?,
            ztype: ZoneType::from_raw(raw.zt)?,
        })
    }

    /// Sectors still writable before the zone fills.
    pub fn remaining(&self) -> u64 {
        (self.zslba + self.zcap).saturating_sub(self.wp)
    }

    pub fn is_writable(&self) -> bool {
        self.state.can_write() && self.ztype == ZoneType::SequentialWrite
    }
}

/// Snapshot of a contiguous run of zones, ordered by start LBA.
#[derive(Debug, Clone)]
pub struct ZoneDirectory {
    zones: Vec<ZoneDescriptor>,
}

impl ZoneDirectory {
    /// Load `count` zones starting at the zone-aligned LBA `slba`. A report
    /// shorter or longer than requested is an error; a partial snapshot
    /// silently standing in for the requested range has bitten before.
    pub fn load(dev: &Arc<dyn Device>, slba: u64, count: u32) -> Result<Self> {
        let raw = dev.zone_report(slba, count)?;
        if raw.len() != count as usize {
            return Err(Error::ReportSizeMismatch {
                requested: count,
                returned: raw.len() as u32,
            });
        }

        let mut zones = raw
            .iter()
            .map(ZoneDescriptor::from_raw)
            .collect::<Result<Vec<_>>>()?;
        zones.sort_unstable_by_key(|z| z.zslba);
        Ok(Self { zones })
    }

    /// Load every zone on the device.
    pub fn load_all(dev: &Arc<dyn Device>) -> Result<Self> {
        let geo = dev.geometry();
        if geo.kind != DeviceKind::Zoned {
            return Err(Error::ProtocolMisuse(format!(
                "device {} is not zoned",
                dev.uri()
            )));
        }
        Self::load(dev, 0, geo.nzones as u32)
    }

    /// Zone whose start LBA is exactly `zslba`.
    pub fn find_by_lba(&self, zslba: u64) -> Option<&ZoneDescriptor> {
        self.zones
            .binary_search_by_key(&zslba, |z| z.zslba)
            .ok()
            .map(|i| &self.zones[i])
    }

    /// Lowest-LBA zone currently in `state`.
    pub fn find_first_in_state(&self, state: ZoneState) -> Option<&ZoneDescriptor> {
        self.zones.iter().find(|z| z.state == state)
    }

    pub fn zones(&self) -> &[ZoneDescriptor] {
        &self.zones
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

// =============================================================================
// Convenience lookups and write-pointer management
// =============================================================================

/// Descriptor of the zone containing the sector `slba`.
pub fn descriptor_at(dev: &Arc<dyn Device>, slba: u64) -> Result<ZoneDescriptor> {
    let geo = dev.geometry();
    if geo.kind != DeviceKind::Zoned {
        return Err(Error::ProtocolMisuse(format!(
            "device {} is not zoned",
            dev.uri()
        )));
    }
    let zslba = (slba / geo.nsect) * geo.nsect;
    let dir = ZoneDirectory::load(dev, zslba, 1)?;
    dir.find_by_lba(zslba)
        .copied()
        .ok_or_else(|| Error::ProtocolMisuse(format!("no zone starts at LBA {zslba}")))
}

/// Lowest-LBA zone in `state`, scanning the whole device.
pub fn first_zone_in_state(dev: &Arc<dyn Device>, state: ZoneState) -> Result<ZoneDescriptor> {
    let dir = ZoneDirectory::load_all(dev)?;
    dir.find_first_in_state(state)
        .copied()
        .ok_or(Error::NoZoneInState { state })
}

/// Reset the write pointer of every zone overlapping the byte range
/// `[offset, offset + length]`.
///
/// Resets run zone by zone in ascending order and stop at the first
/// failure, which is reported with the failing zone's start LBA; zones
/// before it stay reset, zones after it stay untouched.
pub fn reset_write_pointer(dev: &Arc<dyn Device>, offset: u64, length: u64) -> Result<()> {
    let geo = dev.geometry();
    if geo.kind != DeviceKind::Zoned {
        return Err(Error::ProtocolMisuse(format!(
            "device {} is not zoned",
            dev.uri()
        )));
    }

    let ssw = geo.ssw();
    let first = ((offset >> ssw) / geo.nsect) * geo.nsect;
    let last = (((offset + length) >> ssw) / geo.nsect) * geo.nsect;
    let nsid = dev.nsid();

    let mut zslba = first;
    while zslba <= last {
        debug!(uri = dev.uri(), zslba, "resetting zone write pointer");
        dev.zone_mgmt(nsid, zslba, ZoneAction::Reset)
            .map_err(|err| match err {
                Error::DeviceFault { status, .. } => Error::ZoneResetFailed { zslba, status },
                other => other,
            })?;
        zslba += geo.nsect;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockZonedDevice;
    use assert_matches::assert_matches;

    fn mock(uri: &str) -> Arc<dyn Device> {
        Arc::new(MockZonedDevice::open(uri).unwrap())
    }

    #[test]
    fn test_raw_state_mapping() {
        let cases = [
            (raw_state::EMPTY, ZoneState::Empty),
            (raw_state::IOPEN, ZoneState::ImplicitOpen),
            (raw_state::EOPEN, ZoneState::ExplicitOpen),
            (raw_state::CLOSED, ZoneState::Closed),
            (raw_state::FULL, ZoneState::Full),
            // Conservative: both degraded states normalize to offline.
            (raw_state::RONLY, ZoneState::Offline),
            (raw_state::OFFLINE, ZoneState::Offline),
        ];
        for (raw, expected) in cases {
            assert_eq!(ZoneState::from_raw(raw).unwrap(), expected, "raw {raw:#x}");
        }
    }

    #[test]
    fn test_unknown_raw_codes_rejected() {
        assert_matches!(ZoneState::from_raw(0x0), Err(Error::ProtocolMisuse(_)));
        assert_matches!(ZoneState::from_raw(0x5), Err(Error::ProtocolMisuse(_)));
        assert_matches!(ZoneType::from_raw(0x3), Err(Error::ProtocolMisuse(_)));
    }

    #[test]
    fn test_descriptor_from_raw() {
        let raw = RawZone {
            zslba: 128,
            zcap: 96,
            wp: 130,
            zs: raw_state::IOPEN,
            zt: raw_type::SEQWR,
        };
        let desc = ZoneDescriptor::from_raw(&raw).unwrap();
        assert_eq!(desc.zslba, 128);
        assert_eq!(desc.remaining(), 94);
        assert!(desc.is_writable());
    }

    #[test]
    fn test_directory_load_validates_count() {
        let dev = mock("mock:zd0?zones=2&nsect=4&lba=512");
        assert_matches!(
            ZoneDirectory::load(&dev, 0, 8),
            Err(Error::ReportSizeMismatch {
                requested: 8,
                returned: 2
            })
        );
        assert_eq!(ZoneDirectory::load(&dev, 0, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_find_first_in_state_lowest_lba_wins() {
        let dev = MockZonedDevice::open("mock:zd1?zones=4&nsect=4&lba=512").unwrap();
        dev.set_zone_state(4, raw_state::FULL);
        dev.set_zone_state(8, raw_state::FULL);
        let dev: Arc<dyn Device> = Arc::new(dev);

        let dir = ZoneDirectory::load_all(&dev).unwrap();
        assert_eq!(dir.find_first_in_state(ZoneState::Full).unwrap().zslba, 4);
        assert_eq!(dir.find_first_in_state(ZoneState::Empty).unwrap().zslba, 0);
        assert!(dir.find_first_in_state(ZoneState::Closed).is_none());

        assert_matches!(
            first_zone_in_state(&dev, ZoneState::Closed),
            Err(Error::NoZoneInState {
                state: ZoneState::Closed
            })
        );
    }

    #[test]
    fn test_directory_load_rejects_unknown_state() {
        let dev = MockZonedDevice::open("mock:zd2?zones=2&nsect=4&lba=512").unwrap();
        dev.set_zone_state(4, 0x7);
        let dev: Arc<dyn Device> = Arc::new(dev);
        assert_matches!(ZoneDirectory::load_all(&dev), Err(Error::ProtocolMisuse(_)));
    }

    #[test]
    fn test_descriptor_at_aligns_down() {
        let dev = mock("mock:zd3?zones=3&nsect=8&lba=512");
        let desc = descriptor_at(&dev, 13).unwrap();
        assert_eq!(desc.zslba, 8);
    }

    #[test]
    fn test_reset_range_covers_inclusive_end() {
        let dev = mock("mock:zd4?zones=4&nsect=8&lba=512");
        // Bytes [0, 2 zones worth]: end lands exactly on zone 2's start,
        // which is included.
        let zone_bytes = 8 * 512;
        reset_write_pointer(&dev, 0, 2 * zone_bytes).unwrap();
    }

    #[test]
    fn test_reset_stops_at_first_failure() {
        let raw = MockZonedDevice::open("mock:zd5?zones=3&nsect=2&lba=512").unwrap();
        // Mark all three zones full so a successful reset is observable.
        for zslba in [0u64, 2, 4] {
            raw.set_zone_state(zslba, raw_state::FULL);
        }
        raw.fail_reset(2);
        let dev: Arc<dyn Device> = Arc::new(raw);

        let zone_bytes = 2 * 512u64;
        let err = reset_write_pointer(&dev, 0, 3 * zone_bytes - 1).unwrap_err();
        assert_matches!(err, Error::ZoneResetFailed { zslba: 2, .. });

        let dir = ZoneDirectory::load_all(&dev).unwrap();
        // Zone 0 reset, zone 1 failed in place, zone 2 untouched.
        assert_eq!(dir.find_by_lba(0).unwrap().state, ZoneState::Empty);
        assert_eq!(dir.find_by_lba(2).unwrap().state, ZoneState::Full);
        assert_eq!(dir.find_by_lba(4).unwrap().state, ZoneState::Full);
    }
}
