//! Fixed-capacity request pool
//!
//! Every in-flight command is tracked by a request slot acquired here before
//! submission and released by the completion path after the callback returns.
//! Slots live in a pre-allocated arena; free slots are tracked by an index
//! stack, so acquire and release are O(1) pushes/pops and a [`ReqId`] is a
//! plain index rather than a pointer into pool memory.
//!
//! A pool serving a context of queue depth `qd` is sized `qd + 1`: one spare
//! slot lets the submission loop stage the next command while the queue
//! itself is at capacity.

use crate::backend::IoOp;
use crate::error::{Error, Result};

/// Handle to a request slot. Valid from [`RequestPool::acquire`] until the
/// matching [`RequestPool::release`]; the pool never hands out the same id
/// twice while it is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqId(u16);

impl ReqId {
    /// Slot index within the owning pool.
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Fabricate an id for tests that drive a [`Device`] directly, without a
    /// pool in the loop.
    ///
    /// [`Device`]: crate::backend::Device
    #[cfg(test)]
    pub(crate) fn test_id(idx: u16) -> Self {
        ReqId(idx)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    in_flight: bool,
    /// Command descriptor recorded at submission, for introspection while
    /// the slot is outstanding.
    op: Option<IoOp>,
    token: u64,
}

impl Slot {
    const IDLE: Slot = Slot {
        in_flight: false,
        op: None,
        token: 0,
    };
}

/// Pre-allocated pool of request slots.
#[derive(Debug)]
pub struct RequestPool {
    slots: Vec<Slot>,
    /// Free slot indices; acquire pops, release pushes (LIFO, so recently
    /// released slots are reused first while their bookkeeping is cache-hot).
    free: Vec<u16>,
}

impl RequestPool {
    /// Create a pool with `capacity` slots.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("request pool capacity must be > 0".into()));
        }
        if capacity > u16::MAX as usize {
            return Err(Error::Config(format!(
                "request pool capacity {capacity} exceeds {}",
                u16::MAX
            )));
        }
        // Reverse so slot 0 is on top of the stack and ids are handed out in
        // ascending order initially.
        let free: Vec<u16> = (0..capacity as u16).rev().collect();
        Ok(Self {
            slots: vec![Slot::IDLE; capacity],
            free,
        })
    }

    /// Create a pool sized for a context of the given queue depth
    /// (`queue_depth + 1` slots).
    pub fn for_queue_depth(queue_depth: u32) -> Result<Self> {
        if queue_depth == 0 {
            return Err(Error::Config("queue depth must be > 0".into()));
        }
        Self::new(queue_depth as usize + 1)
    }

    /// Acquire a free slot. `None` means every slot is outstanding; that is
    /// not an error here — callers poll for completions and retry, or treat
    /// it as fatal at their own layer.
    pub fn acquire(&mut self) -> Option<ReqId> {
        let idx = self.free.pop()?;
        let slot = &mut self.slots[idx as usize];
        debug_assert!(!slot.in_flight, "free list handed out an in-flight slot");
        slot.in_flight = true;
        Some(ReqId(idx))
    }

    /// Release a slot back to the pool. Must be called exactly once per
    /// acquired id, after the completion callback (if any) has returned.
    pub fn release(&mut self, id: ReqId) {
        let slot = &mut self.slots[id.index()];
        debug_assert!(slot.in_flight, "releasing a slot that is not in flight");
        *slot = Slot::IDLE;
        self.free.push(id.0);
    }

    /// Record the command a slot was submitted under.
    pub(crate) fn note_submitted(&mut self, id: ReqId, op: IoOp, token: u64) {
        let slot = &mut self.slots[id.index()];
        debug_assert!(slot.in_flight);
        slot.op = Some(op);
        slot.token = token;
    }

    /// Whether the given slot is currently outstanding.
    pub fn is_in_flight(&self, id: ReqId) -> bool {
        self.slots[id.index()].in_flight
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_rejects_zero_capacity() {
        assert_matches!(RequestPool::new(0), Err(Error::Config(_)));
        assert_matches!(RequestPool::for_queue_depth(0), Err(Error::Config(_)));
    }

    #[test]
    fn test_sized_one_above_queue_depth() {
        let pool = RequestPool::for_queue_depth(8).unwrap();
        assert_eq!(pool.capacity(), 9);
        assert_eq!(pool.available(), 9);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut pool = RequestPool::new(2).unwrap();
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_flight(), 2);
    }

    #[test]
    fn test_release_makes_slot_reusable() {
        let mut pool = RequestPool::new(1).unwrap();
        let a = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        pool.release(a);
        let b = pool.acquire().unwrap();
        assert_eq!(a, b); // LIFO reuse
    }

    #[test]
    fn test_distinct_ids_while_outstanding() {
        let mut pool = RequestPool::new(16).unwrap();
        let mut seen = HashSet::new();
        while let Some(id) = pool.acquire() {
            assert!(seen.insert(id), "duplicate outstanding id {id:?}");
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn test_note_submitted_tracks_op() {
        let mut pool = RequestPool::new(4).unwrap();
        let id = pool.acquire().unwrap();
        pool.note_submitted(id, IoOp::Append, 42);
        assert!(pool.is_in_flight(id));
        pool.release(id);
        assert!(!pool.is_in_flight(id));
    }

    proptest! {
        /// Under any interleaving of acquires and releases, no id is ever
        /// handed out twice while outstanding, and accounting stays exact.
        #[test]
        fn prop_no_double_acquire(ops in proptest::collection::vec(any::<bool>(), 0..200)) {
            let mut pool = RequestPool::new(8).unwrap();
            let mut held: Vec<ReqId> = Vec::new();

            for acquire in ops {
                if acquire {
                    if let Some(id) = pool.acquire() {
                        prop_assert!(!held.contains(&id));
                        held.push(id);
                    } else {
                        prop_assert_eq!(held.len(), pool.capacity());
                    }
                } else if let Some(id) = held.pop() {
                    pool.release(id);
                }
                prop_assert_eq!(pool.in_flight(), held.len());
                prop_assert_eq!(pool.available(), pool.capacity() - held.len());
            }
        }
    }
}
