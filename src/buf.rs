//! Payload buffer helpers
//!
//! Drive loops allocate one buffer covering the whole zone, fill it with a
//! deterministic pattern, and carve per-command payloads out of it. Write
//! and append runs use the alphanumeric pattern so corruption is visible in
//! a hex dump; read runs start from zeros.

use bytes::BytesMut;

/// Deterministic fill patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPattern {
    Zero,
    /// Repeating `a..z A..Z 0..9` cycle.
    Alnum,
}

const ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Fill `buf` in place.
pub fn fill(buf: &mut [u8], pattern: FillPattern) {
    match pattern {
        FillPattern::Zero => buf.fill(0),
        FillPattern::Alnum => {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = ALNUM[i % ALNUM.len()];
            }
        }
    }
}

/// Allocate a filled buffer of `nbytes`.
pub fn alloc(nbytes: usize, pattern: FillPattern) -> Vec<u8> {
    let mut buf = vec![0u8; nbytes];
    fill(&mut buf, pattern);
    buf
}

/// Copy the `sect`-th block of `src` into an owned payload.
pub fn block_payload(src: &[u8], sect: u64, lba_nbytes: u32) -> BytesMut {
    let lba = lba_nbytes as usize;
    let at = sect as usize * lba;
    BytesMut::from(&src[at..at + lba])
}
