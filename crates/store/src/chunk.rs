// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Cache-resident chunk and key types.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use uuid::Uuid;

use framecast_core::{Frame, FrameSlice};

/// Cache key for one chunk of one stream.
///
/// `index` is `floor((seq - min_seq) / chunk_frames)`. Because it is derived
/// from the stream's `min_seq`, the keying assumes `min_seq` is immutable
/// for a stored stream; deleting early frames would renumber every chunk of
/// that stream and is not supported while sessions run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub stream: Uuid,
    pub index: i64,
}

/// A contiguous, sequence-sorted window of frames for one stream.
///
/// Chunks are shared between the cache and any number of replay sessions.
/// `refs` counts live holders; `evicted` flips once when the chunk leaves
/// the LRU; `freed` flips once when the byte accounting has been dropped.
/// The only legal flag progression is
/// `(evicted=0, freed=0) -> (1, 0) -> (1, 1)`.
///
/// A new chunk is born holding one reference for its publisher (the load
/// that inserts it into the cache), so it can never be finalized out from
/// under the in-flight load that produced it.
#[derive(Debug)]
pub struct Chunk {
    start_seq: i64,
    frames: FrameSlice,
    bytes_len: u64,
    bytes_cap: u64,

    refs: AtomicI32,
    evicted: AtomicBool,
    freed: AtomicBool,
}

impl Chunk {
    pub(crate) fn new(start_seq: i64, frames: FrameSlice, bytes_len: u64, bytes_cap: u64) -> Self {
        Self {
            start_seq,
            frames,
            bytes_len,
            bytes_cap,
            refs: AtomicI32::new(1),
            evicted: AtomicBool::new(false),
            freed: AtomicBool::new(false),
        }
    }

    /// First sequence slot covered by this chunk (the chunk may be sparse,
    /// so the first frame's sequence can be greater).
    #[must_use]
    pub const fn start_seq(&self) -> i64 {
        self.start_seq
    }

    /// Frames in strictly ascending sequence order.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        self.frames.as_slice()
    }

    /// Sum of payload lengths; reported for observability.
    #[must_use]
    pub const fn bytes_len(&self) -> u64 {
        self.bytes_len
    }

    /// Sum of buffer storage sizes; what the budget charges.
    #[must_use]
    pub const fn bytes_cap(&self) -> u64 {
        self.bytes_cap
    }

    #[must_use]
    pub fn ref_count(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement `refs`, returning the remaining count.
    pub(crate) fn release(&self) -> i32 {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    pub(crate) fn mark_freed(&self) {
        self.freed.store(true, Ordering::Release);
    }
}
