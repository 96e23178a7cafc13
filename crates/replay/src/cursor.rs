// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Forward-only cursor over one stream's sequence range.
//!
//! The cursor owns at most one chunk reference at a time and walks the
//! snapshot range `[min_seq, max_seq]` strictly forward. Cache failures are
//! deliberately absorbed as "no frame right now": each playback slot is an
//! independent opportunity and the session's timeline keeps moving either
//! way.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use framecast_core::{Frame, StreamMeta};
use framecast_store::{ChunkRef, ChunkStore};

/// Per-session iterator state. `seq` is monotonically non-decreasing for
/// the cursor's whole lifetime.
pub struct ChunkCursor {
    store: ChunkStore,
    meta: StreamMeta,
    chunk: Option<ChunkRef>,
    pos: usize,
    seq: i64,
    empty_runs: u32,
}

impl ChunkCursor {
    #[must_use]
    pub fn new(store: ChunkStore, meta: StreamMeta) -> Self {
        let seq = meta.min_seq;
        Self { store, meta, chunk: None, pos: 0, seq, empty_runs: 0 }
    }

    /// Next sequence slot the cursor wants.
    #[must_use]
    pub const fn seq(&self) -> i64 {
        self.seq
    }

    /// Consecutive chunks that held nothing at or after the cursor. The
    /// session uses this to recognize an exhausted sparse tail.
    #[must_use]
    pub const fn empty_runs(&self) -> u32 {
        self.empty_runs
    }

    /// Return the next frame with `seq >= self.seq()`, if one exists.
    ///
    /// Acquires the chunk containing the cursor position when needed,
    /// skipping over chunks whose frames all precede it (each skip bumps
    /// `empty_runs`). Returns `None` past `max_seq`, and on cache errors
    /// with the cursor unchanged.
    pub async fn peek(&mut self, cancel: &CancellationToken) -> Option<&Frame> {
        loop {
            if self.seq > self.meta.max_seq {
                return None;
            }

            let exhausted = match &self.chunk {
                None => true,
                Some(chunk) => chunk.frames().last().is_none_or(|last| self.seq > last.seq),
            };

            if exhausted {
                self.chunk = None;
                let chunk = match self
                    .store
                    .get_chunk(cancel, self.meta.id, self.meta.min_seq, self.seq)
                    .await
                {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        debug!(
                            stream = %self.meta.id,
                            seq = self.seq,
                            error = %err,
                            "no chunk for this slot"
                        );
                        return None;
                    },
                };

                let pos = chunk.frames().partition_point(|frame| frame.seq < self.seq);
                if pos >= chunk.frames().len() {
                    // Sparse window: nothing here at or after the cursor.
                    // Jump to the next chunk's first slot and try again.
                    self.seq = chunk.start_seq() + self.store.chunk_frames();
                    self.pos = 0;
                    self.empty_runs += 1;
                    continue;
                }
                self.chunk = Some(chunk);
                self.pos = pos;
                self.empty_runs = 0;
            }

            return self.chunk.as_ref().and_then(|chunk| chunk.frames().get(self.pos));
        }
    }

    /// Step past the frame the last successful `peek` returned.
    pub fn advance(&mut self) {
        let Some(chunk) = &self.chunk else { return };
        if let Some(frame) = chunk.frames().get(self.pos) {
            self.seq = frame.seq + 1;
            self.pos += 1;
        }
    }

    /// Drop the held chunk reference, if any.
    pub fn release(&mut self) {
        self.chunk = None;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testutil::{meta_for, store_with_frames};

    #[tokio::test]
    async fn sequential_playback_across_chunk_boundary() {
        // Two frames per chunk: chunk 0 holds (10, 11), chunk 1 holds (12, 13).
        let (store, repo) = store_with_frames(2, &[10, 11, 12, 13]);
        let meta = meta_for(&repo, 10, 13);
        let cancel = CancellationToken::new();
        let mut cursor = ChunkCursor::new(store, meta);

        let mut seen = Vec::new();
        for _ in 0..4 {
            let frame = cursor.peek(&cancel).await.unwrap();
            seen.push(frame.seq);
            cursor.advance();
        }
        assert_eq!(seen, vec![10, 11, 12, 13]);

        // Cursor now wants 14 > max_seq 13.
        assert_eq!(cursor.seq(), 14);
        assert!(cursor.peek(&cancel).await.is_none());
        cursor.release();
    }

    #[tokio::test]
    async fn peek_never_goes_backwards() {
        let (store, repo) = store_with_frames(2, &[0, 1, 5, 6]);
        let meta = meta_for(&repo, 0, 6);
        let cancel = CancellationToken::new();
        let mut cursor = ChunkCursor::new(store, meta);

        let mut last = -1;
        loop {
            let Some(frame) = cursor.peek(&cancel).await else { break };
            assert!(frame.seq > last);
            last = frame.seq;
            cursor.advance();
        }
        assert_eq!(last, 6);
    }

    #[tokio::test]
    async fn sparse_tail_bumps_empty_runs() {
        // Frames end at 1 but the snapshot claims max_seq 7: chunks 1..3 are
        // empty windows the cursor must walk through.
        let (store, repo) = store_with_frames(2, &[0, 1]);
        let mut meta = meta_for(&repo, 0, 1);
        meta.max_seq = 7;
        let cancel = CancellationToken::new();
        let mut cursor = ChunkCursor::new(store, meta);

        assert_eq!(cursor.peek(&cancel).await.unwrap().seq, 0);
        cursor.advance();
        assert_eq!(cursor.peek(&cancel).await.unwrap().seq, 1);
        cursor.advance();

        // seq 2: windows [2,4), [4,6), [6,8) all turn up empty.
        assert!(cursor.peek(&cancel).await.is_none());
        assert_eq!(cursor.empty_runs(), 3);
        assert!(cursor.seq() > 7);
    }

    #[tokio::test]
    async fn cache_error_leaves_cursor_unchanged() {
        let (store, repo) = store_with_frames(2, &[0, 1]);
        repo.fail_fetches();
        let meta = meta_for(&repo, 0, 1);
        let cancel = CancellationToken::new();
        let mut cursor = ChunkCursor::new(store, meta);

        assert!(cursor.peek(&cancel).await.is_none());
        assert_eq!(cursor.seq(), 0);
        assert_eq!(cursor.empty_runs(), 0);
    }
}
