// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Wall-clock replay loop for one client.
//!
//! Playback is timeline-driven, not content-driven: progress is anchored to
//! fixed 40 ms slots measured from the session start, and at most one frame
//! is transmitted per slot. When the clock has moved past slots the session
//! has not served (slow client, slow database), the cursor is advanced
//! without transmitting; the client rejoins the stream further along the
//! timeline instead of accumulating lag. There is deliberately no queue
//! between fetching and sending, so latency debt shows up as skips rather
//! than hiding in a buffer.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use framecast_core::{FramecastError, Result, StreamMeta};
use framecast_store::ChunkStore;

use crate::cursor::ChunkCursor;

/// Where the session writes frames. The WebSocket transport implements
/// this; tests plug in recorders.
#[async_trait]
pub trait FrameSink: Send {
    /// Deliver one frame payload as a single binary message.
    async fn send_frame(&mut self, payload: Bytes) -> Result<()>;
}

/// Pacing parameters for a replay session.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Slot width. 40 ms yields the product-mandated 25 fps regardless of
    /// the stream's native interval.
    pub interval: Duration,
    /// Consecutive empty chunks after which the tail counts as exhausted.
    pub empty_chunk_guard: u32,
    /// Upper bound on a single frame write.
    pub write_deadline: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(40),
            empty_chunk_guard: 3,
            write_deadline: Duration::from_secs(2),
        }
    }
}

/// One client's replay of one stream snapshot.
pub struct ReplaySession<S> {
    sink: S,
    cursor: ChunkCursor,
    cfg: PlaybackConfig,
    cancel: CancellationToken,
    max_seq: i64,
    base: Instant,
    slots_elapsed: u64,
    delivered: u64,
}

impl<S: FrameSink> ReplaySession<S> {
    #[must_use]
    pub fn new(
        store: ChunkStore,
        meta: StreamMeta,
        sink: S,
        cfg: PlaybackConfig,
        cancel: CancellationToken,
    ) -> Self {
        let max_seq = meta.max_seq;
        Self {
            sink,
            cursor: ChunkCursor::new(store, meta),
            cfg,
            cancel,
            max_seq,
            base: Instant::now(),
            slots_elapsed: 0,
            delivered: 0,
        }
    }

    /// Frames actually transmitted.
    #[must_use]
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Timeline slots consumed, skips included.
    #[must_use]
    pub const fn slots_elapsed(&self) -> u64 {
        self.slots_elapsed
    }

    /// Tear the session apart, handing the sink back for the closing
    /// handshake.
    #[must_use]
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Run the session to completion.
    ///
    /// Returns `Ok` at end-of-stream (including an exhausted sparse tail).
    ///
    /// # Errors
    ///
    /// `Network` when a frame write fails or outlives the write deadline,
    /// `Cancelled` when the token fires during the inter-slot sleep. The
    /// cursor's chunk reference is released on every exit path.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_loop().await;
        self.cursor.release();
        debug!(
            delivered = self.delivered,
            slots = self.slots_elapsed,
            ok = result.is_ok(),
            "replay session finished"
        );
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        let interval_nanos = u64::try_from(self.cfg.interval.as_nanos().max(1)).unwrap_or(u64::MAX);

        loop {
            if self.cursor.seq() > self.max_seq {
                return Ok(());
            }

            let elapsed = Instant::now().saturating_duration_since(self.base);
            let target_slots =
                u64::try_from(elapsed.as_nanos() / u128::from(interval_nanos)).unwrap_or(u64::MAX);

            // Catch up to the wall clock by advancing without transmitting.
            while self.slots_elapsed < target_slots && self.cursor.seq() <= self.max_seq {
                if self.cursor.peek(&self.cancel).await.is_some() {
                    self.cursor.advance();
                    self.slots_elapsed += 1;
                } else {
                    if self.cursor.empty_runs() >= self.cfg.empty_chunk_guard {
                        return Ok(());
                    }
                    // Nothing available for this step; retry next slot.
                    break;
                }
            }

            if self.cursor.seq() > self.max_seq {
                return Ok(());
            }

            // Current slot: transmit at most one frame, if one is there.
            let payload = self
                .cursor
                .peek(&self.cancel)
                .await
                .map(|frame| Bytes::copy_from_slice(frame.data.as_slice()));
            if let Some(payload) = payload {
                match tokio::time::timeout(self.cfg.write_deadline, self.sink.send_frame(payload))
                    .await
                {
                    Err(_elapsed) => {
                        return Err(FramecastError::Network(
                            "frame write exceeded deadline".to_string(),
                        ));
                    },
                    Ok(Err(err)) => return Err(err),
                    Ok(Ok(())) => {
                        self.cursor.advance();
                        self.delivered += 1;
                    },
                }
            } else if self.cursor.empty_runs() >= self.cfg.empty_chunk_guard {
                return Ok(());
            }

            // The slot is closed whether it was a skip, a send or a gap.
            self.slots_elapsed += 1;

            let deadline = self.base
                + Duration::from_nanos(interval_nanos.saturating_mul(self.slots_elapsed));
            tokio::select! {
                () = self.cancel.cancelled() => return Err(FramecastError::Cancelled),
                () = tokio::time::sleep_until(deadline) => {},
            }
        }
    }
}
