// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Database-provider contract.
//!
//! The chunk cache never talks to a driver directly; it goes through this
//! trait so the cache, cursor and session logic are testable against an
//! in-memory repository. Row payloads are handed over as owned buffers, and
//! the cache still copies them into pool-owned storage before they become
//! reachable from any session.

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use uuid::Uuid;

use framecast_core::Result;

/// One frame row from the range fetch, ascending by `sequence`.
#[derive(Debug, Clone)]
pub struct FrameRow {
    pub sequence: i64,
    pub payload: Bytes,
    pub mime: String,
}

/// Aggregated metadata row for one stream.
///
/// An empty stream aggregates to `min_seq = 0`, `max_seq = -1`, `count = 0`.
#[derive(Debug, Clone, Copy)]
pub struct StreamMetaRow {
    pub interval_ms: i32,
    pub min_seq: i64,
    pub max_seq: i64,
    pub count: i64,
}

/// One stream record, as exposed over the administration API.
#[derive(Debug, Clone)]
pub struct StreamRow {
    pub id: Uuid,
    pub name: String,
    pub frame_interval_ms: i32,
    pub created_at: OffsetDateTime,
}

/// Partial update for a stream record; `None` fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct UpdateStreamParams {
    pub name: Option<String>,
    pub frame_interval_ms: Option<i32>,
}

/// Queries the replay core and the administration API need.
#[async_trait]
pub trait FrameRepo: Send + Sync {
    /// Aggregate `(frame_interval_ms, min, max, count)` over one stream's
    /// frames. `None` means the stream itself does not exist.
    async fn stream_meta(&self, id: Uuid) -> Result<Option<StreamMetaRow>>;

    /// Fetch up to `limit` frames with `sequence >= start_seq`, ascending.
    async fn fetch_frames(&self, id: Uuid, start_seq: i64, limit: i64) -> Result<Vec<FrameRow>>;

    async fn list_streams(&self) -> Result<Vec<StreamRow>>;

    async fn get_stream(&self, id: Uuid) -> Result<Option<StreamRow>>;

    /// Apply a partial update; `None` means the stream does not exist.
    async fn update_stream(&self, id: Uuid, params: UpdateStreamParams)
        -> Result<Option<StreamRow>>;

    /// Connectivity probe for readiness checks.
    async fn ping(&self) -> Result<()>;
}
