//! Command submission layer
//!
//! Thin, validating wrappers that turn `(nsid, slba, nblocks, payload)` into
//! an encoded [`Command`] and hand it to the context. Validation failures
//! are [`Error::ProtocolMisuse`]; queue saturation comes back as
//! [`SubmitOutcome::Busy`] / [`SubmitOutcome::Retry`] with the command's
//! payload recoverable from the returned value.
//!
//! [`append`] takes the *zone start* LBA; the device assigns the actual
//! write offset and reports it in the completion's `result` field.

use bytes::BytesMut;

use crate::backend::{Command, DeviceKind, IoOp, SubmitOutcome};
use crate::ctx::AsyncContext;
use crate::error::{Error, Result};
use crate::pool::{ReqId, RequestPool};

/// Submit an asynchronous read of `nblocks` blocks starting at `slba`.
/// The filled payload comes back in the completion.
pub fn read(
    ctx: &mut AsyncContext,
    pool: &mut RequestPool,
    req: ReqId,
    nsid: u32,
    slba: u64,
    nblocks: u32,
    payload: BytesMut,
    token: u64,
) -> Result<SubmitOutcome> {
    validate(ctx, IoOp::Read, nblocks, &payload)?;
    ctx.submit(
        pool,
        req,
        Command {
            op: IoOp::Read,
            nsid,
            slba,
            nblocks,
            payload,
        },
        token,
    )
}

/// Submit an asynchronous write of `nblocks` blocks at `slba`.
///
/// On a zoned device `slba` must equal the target zone's write pointer;
/// violations surface as a fault completion, not a submission error.
pub fn write(
    ctx: &mut AsyncContext,
    pool: &mut RequestPool,
    req: ReqId,
    nsid: u32,
    slba: u64,
    nblocks: u32,
    payload: BytesMut,
    token: u64,
) -> Result<SubmitOutcome> {
    validate(ctx, IoOp::Write, nblocks, &payload)?;
    ctx.submit(
        pool,
        req,
        Command {
            op: IoOp::Write,
            nsid,
            slba,
            nblocks,
            payload,
        },
        token,
    )
}

/// Submit an asynchronous zone append to the zone starting at `zslba`.
pub fn append(
    ctx: &mut AsyncContext,
    pool: &mut RequestPool,
    req: ReqId,
    nsid: u32,
    zslba: u64,
    nblocks: u32,
    payload: BytesMut,
    token: u64,
) -> Result<SubmitOutcome> {
    validate(ctx, IoOp::Append, nblocks, &payload)?;
    ctx.submit(
        pool,
        req,
        Command {
            op: IoOp::Append,
            nsid,
            slba: zslba,
            nblocks,
            payload,
        },
        token,
    )
}

fn validate(ctx: &AsyncContext, op: IoOp, nblocks: u32, payload: &BytesMut) -> Result<()> {
    let geo = ctx.device().geometry();

    if nblocks == 0 {
        return Err(Error::ProtocolMisuse(format!("{op} of zero blocks")));
    }
    let expected = nblocks as usize * geo.lba_nbytes as usize;
    if payload.len() != expected {
        return Err(Error::ProtocolMisuse(format!(
            "{op} payload is {} bytes, expected {} (nblocks {} x lba {})",
            payload.len(),
            expected,
            nblocks,
            geo.lba_nbytes
        )));
    }
    if op == IoOp::Append && geo.kind != DeviceKind::Zoned {
        return Err(Error::ProtocolMisuse(
            "zone append on a non-zoned device".into(),
        ));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::ContextOpts;
    use crate::mock::MockZonedDevice;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn setup(uri: &str, depth: u32) -> (AsyncContext, RequestPool) {
        let dev = Arc::new(MockZonedDevice::open(uri).unwrap());
        let ctx = AsyncContext::new(dev, depth, ContextOpts::default()).unwrap();
        let pool = RequestPool::for_queue_depth(depth).unwrap();
        (ctx, pool)
    }

    #[test]
    fn test_rejects_zero_blocks() {
        let (mut ctx, mut pool) = setup("mock:c0?zones=1&nsect=8&lba=512", 2);
        let req = pool.acquire().unwrap();
        let err = read(&mut ctx, &mut pool, req, 1, 0, 0, BytesMut::new(), 0).unwrap_err();
        assert_matches!(err, Error::ProtocolMisuse(_));
        pool.release(req);
    }

    #[test]
    fn test_rejects_payload_size_mismatch() {
        let (mut ctx, mut pool) = setup("mock:c1?zones=1&nsect=8&lba=512", 2);
        let req = pool.acquire().unwrap();
        let err = write(&mut ctx, &mut pool, req, 1, 0, 2, BytesMut::zeroed(512), 0).unwrap_err();
        assert_matches!(err, Error::ProtocolMisuse(_));
        pool.release(req);
    }

    #[test]
    fn test_rejects_append_on_conventional_device() {
        let (mut ctx, mut pool) = setup("mock:c2?zones=1&nsect=8&lba=512&kind=conv", 2);
        let req = pool.acquire().unwrap();
        let err = append(&mut ctx, &mut pool, req, 1, 0, 1, BytesMut::zeroed(512), 0).unwrap_err();
        assert_matches!(err, Error::ProtocolMisuse(_));
        pool.release(req);
    }

    #[test]
    fn test_append_offset_comes_from_completion() {
        let (mut ctx, mut pool) = setup("mock:c3?zones=1&nsect=8&lba=512", 4);

        for token in 0..2u64 {
            let req = pool.acquire().unwrap();
            assert_matches!(
                append(&mut ctx, &mut pool, req, 1, 0, 1, BytesMut::zeroed(512), token).unwrap(),
                SubmitOutcome::Submitted
            );
        }

        let mut offsets = Vec::new();
        ctx.wait_all(&mut pool, |cpl| offsets.push(cpl.result)).unwrap();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 1]);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let (mut ctx, mut pool) = setup("mock:c4?zones=1&nsect=8&lba=512", 2);

        let mut payload = BytesMut::zeroed(512);
        payload.fill(0x42);
        let req = pool.acquire().unwrap();
        assert_matches!(
            write(&mut ctx, &mut pool, req, 1, 0, 1, payload, 0).unwrap(),
            SubmitOutcome::Submitted
        );
        ctx.wait_all(&mut pool, |_| {}).unwrap();

        let req = pool.acquire().unwrap();
        assert_matches!(
            read(&mut ctx, &mut pool, req, 1, 0, 1, BytesMut::zeroed(512), 1).unwrap(),
            SubmitOutcome::Submitted
        );
        let mut data = None;
        ctx.wait_all(&mut pool, |cpl| data = cpl.payload.take()).unwrap();
        assert!(data.unwrap().iter().all(|&b| b == 0x42));
    }
}
