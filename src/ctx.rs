//! Per-device asynchronous command context
//!
//! An [`AsyncContext`] wraps one device queue pair: it enforces the queue
//! depth bound on submissions, drains completions through [`poke`], and
//! blocks out the tail of a run with [`wait_all`]. Completion delivery is a
//! synchronous call into the closure the caller hands to `poke`/`wait_all`;
//! the request slot is released back to the pool immediately after the
//! closure returns, so a slot is never reused before its completion has been
//! observed.
//!
//! One submission/poll thread per context: the hot paths take `&mut self`,
//! which rules out concurrent submission by construction.
//!
//! [`poke`]: AsyncContext::poke
//! [`wait_all`]: AsyncContext::wait_all

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::backend::{CmdMode, Command, Completion, Device, ReapOutcome, SubmitOutcome};
use crate::error::{Error, Result};
use crate::pool::{ReqId, RequestPool};

/// Backoff applied when the backend reports a transient reap stall.
const REAP_BACKOFF: Duration = Duration::from_micros(1);

/// Submission flags for a context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextOpts {
    /// Busy-poll for completions instead of waiting on interrupts, where the
    /// backend distinguishes the two.
    pub polled: bool,
    /// Offload submission to a backend worker rather than the caller's
    /// thread, where the backend supports it.
    pub offload: bool,
}

/// Per-device async context, bounded by its queue depth.
#[derive(Debug)]
pub struct AsyncContext {
    dev: Arc<dyn Device>,
    depth: u32,
    opts: ContextOpts,
    outstanding: u32,
    /// Scratch buffer reused across poke calls to avoid per-call allocation.
    scratch: Vec<Completion>,
}

impl AsyncContext {
    /// Create a context over `dev` bounded to `depth` in-flight commands.
    pub fn new(dev: Arc<dyn Device>, depth: u32, opts: ContextOpts) -> Result<Self> {
        if depth == 0 {
            return Err(Error::Config("context queue depth must be > 0".into()));
        }
        dev.geometry().validate()?;
        Ok(Self {
            dev,
            depth,
            opts,
            outstanding: 0,
            scratch: Vec::with_capacity(depth as usize),
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.dev
    }

    pub fn queue_depth(&self) -> u32 {
        self.depth
    }

    /// Commands submitted but not yet drained. Always `<= queue_depth()`.
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn opts(&self) -> ContextOpts {
        self.opts
    }

    /// Submit one command under an acquired request slot. Non-blocking.
    ///
    /// When the context is at depth, or the backend queue is saturated, the
    /// command comes back inside [`SubmitOutcome::Busy`] /
    /// [`SubmitOutcome::Retry`] and the caller is expected to [`poke`] and
    /// resubmit. The request slot stays acquired across a busy round trip.
    ///
    /// [`poke`]: AsyncContext::poke
    pub fn submit(
        &mut self,
        pool: &mut RequestPool,
        req: ReqId,
        cmd: Command,
        token: u64,
    ) -> Result<SubmitOutcome> {
        if self.outstanding >= self.depth {
            trace!(outstanding = self.outstanding, depth = self.depth, "context at depth");
            return Ok(SubmitOutcome::Busy(cmd));
        }

        let op = cmd.op;
        match self.dev.submit(cmd, CmdMode::Async, req, token)? {
            SubmitOutcome::Submitted => {
                pool.note_submitted(req, op, token);
                self.outstanding += 1;
                Ok(SubmitOutcome::Submitted)
            }
            backpressure => Ok(backpressure),
        }
    }

    /// Drain up to `max` ready completions (`max == 0` means unbounded),
    /// calling `on_cpl` synchronously for each and releasing its request
    /// slot once the call returns.
    ///
    /// Returns the number drained, or [`ReapOutcome::Busy`] when the backend
    /// reports a transient stall the caller should back off from.
    pub fn poke(
        &mut self,
        pool: &mut RequestPool,
        max: u32,
        mut on_cpl: impl FnMut(&mut Completion),
    ) -> Result<ReapOutcome> {
        let mut batch = std::mem::take(&mut self.scratch);
        batch.clear();

        let outcome = self.dev.reap(max, &mut batch)?;
        let drained = batch.len() as u32;

        for mut cpl in batch.drain(..) {
            let req = cpl.req;
            on_cpl(&mut cpl);
            pool.release(req);
            self.outstanding = self.outstanding.saturating_sub(1);
        }
        self.scratch = batch;

        match outcome {
            ReapOutcome::Busy => Ok(ReapOutcome::Busy),
            ReapOutcome::Drained(_) => Ok(ReapOutcome::Drained(drained)),
        }
    }

    /// Poke until nothing is outstanding, backing off briefly on transient
    /// stalls. Returns the total number of completions drained.
    pub fn wait_all(
        &mut self,
        pool: &mut RequestPool,
        mut on_cpl: impl FnMut(&mut Completion),
    ) -> Result<u32> {
        let mut total = 0;
        while self.outstanding > 0 {
            match self.poke(pool, 0, &mut on_cpl)? {
                ReapOutcome::Busy => std::thread::sleep(REAP_BACKOFF),
                ReapOutcome::Drained(0) => std::hint::spin_loop(),
                ReapOutcome::Drained(n) => total += n,
            }
        }
        Ok(total)
    }
}

// =============================================================================
// Tests
// =============================================================================
