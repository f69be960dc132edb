//! Write-queue and completed-write-queue records.
//!
//! A pending write carries its payload in the same record, either as
//! owned bytes with a cursor or as a file region for `sendfile`. The
//! original request length is kept separately so the completion
//! callback always reports what the caller submitted, even after the
//! entry was split across several partial writes.

use crate::dev::DevId;
use crate::skad::Skad;
use crate::tmr::Tmridx;

pub(crate) enum WqPayload {
    Bytes { buf: Box<[u8]>, pos: usize },
    Sendfile { fd: std::os::fd::RawFd, foff: u64, rem: usize },
}

/// One pending write on a device's write queue.
pub(crate) struct Wq {
    /// Identifies this entry to its write-timeout timer job.
    pub seq: u64,
    pub payload: WqPayload,
    /// Original request length, reported to `on_write`.
    pub olen: usize,
    pub ctx: usize,
    pub dst: Option<Skad>,
    pub tmridx: Tmridx,
}

impl Wq {
    pub fn remaining(&self) -> usize {
        match &self.payload {
            WqPayload::Bytes { buf, pos } => buf.len() - pos,
            WqPayload::Sendfile { rem, .. } => *rem,
        }
    }

    /// A zero-length entry on a stream closes the write half.
    pub fn is_eof(&self) -> bool {
        self.olen == 0 && matches!(&self.payload, WqPayload::Bytes { buf, .. } if buf.is_empty())
    }

    pub fn advance(&mut self, n: usize) {
        match &mut self.payload {
            WqPayload::Bytes { pos, .. } => *pos += n,
            WqPayload::Sendfile { foff, rem, .. } => {
                *foff += n as u64;
                *rem -= n;
            }
        }
    }
}

/// A satisfied write waiting for its completion callback to run at the
/// next callback point of the loop.
pub(crate) struct Cwq {
    pub dev: DevId,
    pub olen: usize,
    pub ctx: usize,
    pub dst: Option<Skad>,
}
