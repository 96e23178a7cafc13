// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Frame and stream-metadata types shared across the replay pipeline.

use serde::Serialize;
use uuid::Uuid;

use crate::bucket_pool::PooledBuf;

/// One recorded JPEG frame.
///
/// `data` is drawn from the bucket pool: its logical length is the payload
/// size, its storage length the pool bucket it came from.
#[derive(Debug)]
pub struct Frame {
    /// Sequence number, unique within a stream.
    pub seq: i64,
    pub data: PooledBuf,
    pub mime: String,
}

/// Metadata snapshot for one stream, fixed at session start.
///
/// `max_seq == -1` with `count == 0` denotes an empty stream (the metadata
/// query produces that shape via its left join).
#[derive(Debug, Clone, Serialize)]
pub struct StreamMeta {
    pub id: Uuid,
    pub interval_ms: i32,
    pub min_seq: i64,
    pub max_seq: i64,
    pub count: i64,
}

impl StreamMeta {
    /// True when the stream holds no frames at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0 || self.max_seq < self.min_seq
    }
}
