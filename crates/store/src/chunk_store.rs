// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The process-wide chunk cache.
//!
//! Chunks are loaded from the database in windows of `chunk_frames`
//! consecutive sequence slots, kept in an LRU budgeted by buffer storage
//! bytes (`used_cap_bytes` vs `cache_cap_bytes`), and shared across sessions
//! through counted [`ChunkRef`] handles. Misses for the same key are
//! coalesced so at most one load is in flight per chunk process-wide.
//!
//! Eviction unlinks a chunk from the LRU but finalizes it (drops its byte
//! accounting) only once no session holds it; held chunks keep their memory
//! charged to the budget because the memory is genuinely still resident.
//! When the budget is exceeded beyond `pressure_guard_factor` even after
//! eviction, new loads are refused outright; sessions treat that as an empty
//! slot and keep their timeline moving.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use framecast_core::bucket_pool::PoolStats;
use framecast_core::{
    ByteBucketPool, Frame, FrameSlicePool, FramecastError, Result, StreamMeta,
    DEFAULT_BUCKET_SIZES,
};

use crate::chunk::{Chunk, ChunkKey};
use crate::repo::FrameRepo;

/// Tuning knobs for the chunk cache. Defaults match production sizing.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Frames per cached chunk.
    pub chunk_frames: i64,
    /// Byte budget over chunk storage capacities.
    pub cache_cap_bytes: u64,
    /// Frames with payloads larger than this are dropped at load time.
    pub max_frame_bytes: usize,
    /// Multiplier over the budget at which loads refuse outright.
    pub pressure_guard_factor: u64,
    /// Per-chunk database deadline.
    pub load_chunk_timeout: Duration,
    /// Bucket storage sizes for the payload pool, ascending.
    pub bucket_sizes: Vec<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_frames: 256,
            cache_cap_bytes: 512 << 20,
            max_frame_bytes: 4 << 20,
            pressure_guard_factor: 2,
            load_chunk_timeout: Duration::from_millis(500),
            bucket_sizes: DEFAULT_BUCKET_SIZES.to_vec(),
        }
    }
}

/// Point-in-time cache counters, exposed for observability.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub resident_chunks: usize,
    pub used_len_bytes: u64,
    pub used_cap_bytes: u64,
    pub limit_cap_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub pressure_refusals: u64,
}

/// Failure of a coalesced load, shared verbatim with every flight waiter.
#[derive(Debug, Clone)]
enum LoadFailure {
    Pressure(String),
    Timeout,
    Load(String),
    Cancelled,
}

impl From<LoadFailure> for FramecastError {
    fn from(failure: LoadFailure) -> Self {
        match failure {
            LoadFailure::Pressure(msg) => Self::CachePressure(msg),
            LoadFailure::Timeout => Self::LoadTimeout,
            LoadFailure::Load(msg) => Self::Load(msg),
            LoadFailure::Cancelled => Self::Cancelled,
        }
    }
}

type FlightResult = std::result::Result<Arc<Chunk>, LoadFailure>;

/// One coalesced load: the cell resolves once, `waiters` tracks how many
/// callers still reference it so the publisher reference is released exactly
/// once, by the last one out.
struct Flight {
    cell: Arc<OnceCell<FlightResult>>,
    waiters: usize,
}

struct CacheState {
    lru: LruCache<ChunkKey, Arc<Chunk>>,
    used_len_bytes: u64,
    used_cap_bytes: u64,
    limit_cap_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    pressure_refusals: u64,
}

struct StoreInner {
    repo: Arc<dyn FrameRepo>,
    cfg: StoreConfig,
    state: Mutex<CacheState>,
    flights: Mutex<HashMap<ChunkKey, Flight>>,
    pool: ByteBucketPool,
    slices: FrameSlicePool,
}

/// Shared handle to the chunk cache. Cheap to clone.
pub struct ChunkStore {
    inner: Arc<StoreInner>,
}

impl Clone for ChunkStore {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl ChunkStore {
    #[must_use]
    pub fn new(repo: Arc<dyn FrameRepo>, cfg: StoreConfig) -> Self {
        let mut cfg = cfg;
        cfg.chunk_frames = cfg.chunk_frames.max(1);
        let pool = ByteBucketPool::new(cfg.bucket_sizes.clone());
        let slices = FrameSlicePool::new(usize::try_from(cfg.chunk_frames).unwrap_or(256));
        let state = CacheState {
            lru: LruCache::unbounded(),
            used_len_bytes: 0,
            used_cap_bytes: 0,
            limit_cap_bytes: cfg.cache_cap_bytes,
            hits: 0,
            misses: 0,
            evictions: 0,
            pressure_refusals: 0,
        };
        Self {
            inner: Arc::new(StoreInner {
                repo,
                cfg,
                state: Mutex::new(state),
                flights: Mutex::new(HashMap::new()),
                pool,
                slices,
            }),
        }
    }

    /// Frames per chunk, as configured.
    #[must_use]
    pub fn chunk_frames(&self) -> i64 {
        self.inner.cfg.chunk_frames
    }

    /// Snapshot the stream's `(interval_ms, min, max, count)` aggregate.
    ///
    /// # Errors
    ///
    /// `StreamNotFound` when the stream does not exist, `Cancelled` when the
    /// caller's token fires first, otherwise whatever the provider reports.
    pub async fn load_metadata(&self, cancel: &CancellationToken, id: Uuid) -> Result<StreamMeta> {
        let fetch = self.inner.repo.stream_meta(id);
        let row = tokio::select! {
            () = cancel.cancelled() => return Err(FramecastError::Cancelled),
            row = fetch => row?,
        };
        row.map(|meta| StreamMeta {
            id,
            interval_ms: meta.interval_ms,
            min_seq: meta.min_seq,
            max_seq: meta.max_seq,
            count: meta.count,
        })
        .ok_or(FramecastError::StreamNotFound)
    }

    /// Return a counted reference to the chunk whose sequence window
    /// contains `want_seq` (clamped up to `min_seq`).
    ///
    /// Concurrent misses for the same chunk are coalesced into one load.
    ///
    /// # Errors
    ///
    /// `CachePressure` when the budget is exceeded beyond the guard factor
    /// before or after eviction, `LoadTimeout`/`Load` from the bounded
    /// database fetch, `Cancelled` from the caller's token.
    pub async fn get_chunk(
        &self,
        cancel: &CancellationToken,
        stream: Uuid,
        min_seq: i64,
        want_seq: i64,
    ) -> Result<ChunkRef> {
        let want = want_seq.max(min_seq);
        let index = (want - min_seq) / self.inner.cfg.chunk_frames;
        let key = ChunkKey { stream, index };

        loop {
            if cancel.is_cancelled() {
                return Err(FramecastError::Cancelled);
            }

            if let Some(chunk) = self.lookup(&key) {
                return Ok(ChunkRef { store: self.clone(), chunk });
            }

            let cell = self.join_flight(key);
            let guard = FlightGuard { store: self, key, cell: Arc::clone(&cell) };
            let result = cell.get_or_init(|| self.run_flight(cancel, key, stream, min_seq)).await;
            match result {
                Ok(chunk) => {
                    if self.try_acquire(chunk) {
                        let chunk = Arc::clone(chunk);
                        drop(guard);
                        return Ok(ChunkRef { store: self.clone(), chunk });
                    }
                    // The publisher reference was already drained and the
                    // chunk finalized before we could take a reference;
                    // treat as a fresh miss.
                    drop(guard);
                },
                Err(failure) => {
                    let failure = failure.clone();
                    drop(guard);
                    return Err(failure.into());
                },
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            resident_chunks: state.lru.len(),
            used_len_bytes: state.used_len_bytes,
            used_cap_bytes: state.used_cap_bytes,
            limit_cap_bytes: state.limit_cap_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            pressure_refusals: state.pressure_refusals,
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    // ---- internals ----

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flights(&self) -> MutexGuard<'_, HashMap<ChunkKey, Flight>> {
        self.inner.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// O(1) hit path: promote to MRU and take a reference under the lock.
    fn lookup(&self, key: &ChunkKey) -> Option<Arc<Chunk>> {
        let mut state = self.state();
        let chunk = Arc::clone(state.lru.get(key)?);
        chunk.acquire();
        state.hits += 1;
        Some(chunk)
    }

    /// Take a reference iff the chunk has not been finalized. Serialized
    /// with finalization through the cache lock.
    fn try_acquire(&self, chunk: &Arc<Chunk>) -> bool {
        let _state = self.state();
        if chunk.is_freed() {
            return false;
        }
        chunk.acquire();
        true
    }

    fn join_flight(&self, key: ChunkKey) -> Arc<OnceCell<FlightResult>> {
        let mut flights = self.flights();
        let flight = flights
            .entry(key)
            .or_insert_with(|| Flight { cell: Arc::new(OnceCell::new()), waiters: 0 });
        flight.waiters += 1;
        Arc::clone(&flight.cell)
    }

    /// Leave a flight; the last participant removes it and releases the
    /// publisher reference a successful load holds.
    fn leave_flight(&self, key: &ChunkKey, cell: &Arc<OnceCell<FlightResult>>) {
        let drained = {
            let mut flights = self.flights();
            let last_out = match flights.get_mut(key) {
                Some(flight) if Arc::ptr_eq(&flight.cell, cell) => {
                    flight.waiters -= 1;
                    flight.waiters == 0
                },
                _ => false,
            };
            if last_out {
                flights.remove(key);
            }
            last_out
        };
        if drained {
            if let Some(Ok(chunk)) = cell.get() {
                self.release_entry(chunk);
            }
        }
    }

    /// The single-flight critical section: recheck, guard, load, insert,
    /// evict, and roll back if the budget is still blown.
    async fn run_flight(
        &self,
        cancel: &CancellationToken,
        key: ChunkKey,
        stream: Uuid,
        min_seq: i64,
    ) -> FlightResult {
        let guard_limit = {
            let mut state = self.state();
            // A concurrent hit may have filled the key while we joined.
            if let Some(chunk) = state.lru.get(&key) {
                let chunk = Arc::clone(chunk);
                // Publisher reference, dropped when the flight drains.
                chunk.acquire();
                state.hits += 1;
                return Ok(chunk);
            }
            let guard_limit =
                state.limit_cap_bytes.saturating_mul(self.inner.cfg.pressure_guard_factor);
            if state.used_cap_bytes > guard_limit {
                state.pressure_refusals += 1;
                return Err(LoadFailure::Pressure("cap budget exceeded".to_string()));
            }
            state.misses += 1;
            guard_limit
        };

        let start_seq = min_seq + key.index * self.inner.cfg.chunk_frames;
        let chunk = match self.load_chunk(cancel, stream, start_seq).await {
            Ok(chunk) => Arc::new(chunk),
            Err(failure) => return Err(failure),
        };

        let mut state = self.state();
        state.lru.push(key, Arc::clone(&chunk));
        state.used_len_bytes += chunk.bytes_len();
        state.used_cap_bytes += chunk.bytes_cap();
        Self::evict_locked(&mut state);

        if state.used_cap_bytes > guard_limit {
            // Roll the insertion back. The chunk still carries its publisher
            // reference, so eviction above can only have deferred it and its
            // bytes are still counted.
            state.lru.pop(&key);
            state.used_len_bytes = state.used_len_bytes.saturating_sub(chunk.bytes_len());
            state.used_cap_bytes = state.used_cap_bytes.saturating_sub(chunk.bytes_cap());
            state.pressure_refusals += 1;
            chunk.mark_evicted();
            chunk.mark_freed();
            drop(state);
            // Buffers go back to the pools when the last Arc drops.
            return Err(LoadFailure::Pressure("over budget after eviction".to_string()));
        }
        drop(state);
        Ok(chunk)
    }

    /// Bounded load of one chunk window, copying every row payload into
    /// pool-owned storage. Oversized frames are skipped.
    async fn load_chunk(
        &self,
        cancel: &CancellationToken,
        stream: Uuid,
        start_seq: i64,
    ) -> std::result::Result<Chunk, LoadFailure> {
        let cfg = &self.inner.cfg;
        let fetch = self.inner.repo.fetch_frames(stream, start_seq, cfg.chunk_frames);
        let rows = tokio::select! {
            () = cancel.cancelled() => return Err(LoadFailure::Cancelled),
            outcome = tokio::time::timeout(cfg.load_chunk_timeout, fetch) => match outcome {
                Err(_elapsed) => return Err(LoadFailure::Timeout),
                Ok(Err(err)) => return Err(LoadFailure::Load(err.to_string())),
                Ok(Ok(rows)) => rows,
            },
        };

        let mut frames = self.inner.slices.get();
        let mut bytes_len = 0u64;
        let mut bytes_cap = 0u64;
        for row in rows {
            if row.payload.len() > cfg.max_frame_bytes {
                debug!(
                    stream = %stream,
                    seq = row.sequence,
                    len = row.payload.len(),
                    "skipping oversized frame"
                );
                continue;
            }
            let mut data = self.inner.pool.get(row.payload.len());
            data.copy_from(&row.payload);
            bytes_len += row.payload.len() as u64;
            bytes_cap += data.storage_len() as u64;
            frames.push(Frame { seq: row.sequence, data, mime: row.mime });
        }
        Ok(Chunk::new(start_seq, frames, bytes_len, bytes_cap))
    }

    /// Pop LRU tails until the budget holds or the LRU is empty. Held
    /// chunks are unlinked and marked, but stay counted until their last
    /// holder releases them.
    fn evict_locked(state: &mut CacheState) {
        while state.used_cap_bytes > state.limit_cap_bytes {
            let Some((_key, chunk)) = state.lru.pop_lru() else { break };
            chunk.mark_evicted();
            state.evictions += 1;
            Self::finalize_locked(state, &chunk);
        }
    }

    /// Drop a chunk's byte accounting. Idempotent; requires the chunk to be
    /// evicted with no holders left. Counter arithmetic floors at zero.
    fn finalize_locked(state: &mut CacheState, chunk: &Chunk) {
        if chunk.is_freed() {
            return;
        }
        if !chunk.is_evicted() || chunk.ref_count() != 0 {
            return;
        }
        state.used_len_bytes = state.used_len_bytes.saturating_sub(chunk.bytes_len());
        state.used_cap_bytes = state.used_cap_bytes.saturating_sub(chunk.bytes_cap());
        chunk.mark_freed();
    }

    /// Drop one reference; the last holder of an evicted chunk finalizes it.
    fn release_entry(&self, chunk: &Arc<Chunk>) {
        if chunk.release() == 0 && chunk.is_evicted() && !chunk.is_freed() {
            let mut state = self.state();
            Self::finalize_locked(&mut state, chunk);
        }
    }
}

/// Removes a flight participant even if the owning future is dropped
/// mid-await, so the waiter accounting can never leak.
struct FlightGuard<'a> {
    store: &'a ChunkStore,
    key: ChunkKey,
    cell: Arc<OnceCell<FlightResult>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.store.leave_flight(&self.key, &self.cell);
    }
}

/// Counted reference to a cache-resident chunk.
///
/// The cache guarantees the frames stay valid for as long as the handle
/// lives, even across eviction. Dropping the handle releases the reference;
/// the last release of an evicted chunk finalizes it.
pub struct ChunkRef {
    store: ChunkStore,
    chunk: Arc<Chunk>,
}

impl ChunkRef {
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        self.chunk.frames()
    }

    #[must_use]
    pub fn start_seq(&self) -> i64 {
        self.chunk.start_seq()
    }
}

impl std::ops::Deref for ChunkRef {
    type Target = Chunk;

    fn deref(&self) -> &Self::Target {
        &self.chunk
    }
}

impl std::fmt::Debug for ChunkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkRef")
            .field("start_seq", &self.chunk.start_seq())
            .field("frames", &self.chunk.frames().len())
            .finish_non_exhaustive()
    }
}

impl Drop for ChunkRef {
    fn drop(&mut self) {
        self.store.release_entry(&self.chunk);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::repo::{FrameRow, StreamMetaRow, StreamRow, UpdateStreamParams};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockRepo {
        exists: bool,
        interval_ms: i32,
        // (sequence, payload size)
        frames: Vec<(i64, usize)>,
        fetches: AtomicUsize,
        fetch_delay: Option<Duration>,
    }

    impl MockRepo {
        fn with_frames(frames: Vec<(i64, usize)>) -> Self {
            Self {
                exists: true,
                interval_ms: 40,
                frames,
                fetches: AtomicUsize::new(0),
                fetch_delay: None,
            }
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FrameRepo for MockRepo {
        async fn stream_meta(&self, _id: Uuid) -> Result<Option<StreamMetaRow>> {
            if !self.exists {
                return Ok(None);
            }
            let min_seq = self.frames.iter().map(|&(seq, _)| seq).min().unwrap_or(0);
            let max_seq = self.frames.iter().map(|&(seq, _)| seq).max().unwrap_or(-1);
            Ok(Some(StreamMetaRow {
                interval_ms: self.interval_ms,
                min_seq,
                max_seq,
                count: self.frames.len() as i64,
            }))
        }

        async fn fetch_frames(
            &self,
            _id: Uuid,
            start_seq: i64,
            limit: i64,
        ) -> Result<Vec<FrameRow>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self
                .frames
                .iter()
                .filter(|&&(seq, _)| seq >= start_seq)
                .take(usize::try_from(limit).unwrap())
                .map(|&(seq, size)| FrameRow {
                    sequence: seq,
                    payload: Bytes::from(vec![0xAB; size]),
                    mime: "image/jpeg".to_string(),
                })
                .collect())
        }

        async fn list_streams(&self) -> Result<Vec<StreamRow>> {
            Ok(Vec::new())
        }

        async fn get_stream(&self, _id: Uuid) -> Result<Option<StreamRow>> {
            Ok(None)
        }

        async fn update_stream(
            &self,
            _id: Uuid,
            _params: UpdateStreamParams,
        ) -> Result<Option<StreamRow>> {
            Ok(None)
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_config() -> StoreConfig {
        StoreConfig {
            chunk_frames: 4,
            cache_cap_bytes: 1 << 20,
            max_frame_bytes: 4 << 20,
            pressure_guard_factor: 2,
            load_chunk_timeout: Duration::from_millis(500),
            bucket_sizes: vec![64, 256, 1024],
        }
    }

    fn store_with(repo: Arc<MockRepo>, cfg: StoreConfig) -> ChunkStore {
        ChunkStore::new(repo, cfg)
    }

    #[tokio::test]
    async fn hit_path_shares_chunk_and_counts_refs() {
        let repo = Arc::new(MockRepo::with_frames(vec![(0, 10), (1, 20), (2, 30)]));
        let store = store_with(Arc::clone(&repo), test_config());
        let cancel = CancellationToken::new();
        let stream = Uuid::new_v4();

        let (a, b) = tokio::join!(
            store.get_chunk(&cancel, stream, 0, 0),
            store.get_chunk(&cancel, stream, 0, 1),
        );
        let a = a.unwrap();
        let b = b.unwrap();

        // Same resident chunk, one database fetch, two live references.
        assert!(Arc::ptr_eq(&a.chunk, &b.chunk));
        assert_eq!(repo.fetch_count(), 1);
        assert_eq!(a.ref_count(), 2);

        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn second_get_is_a_pure_hit() {
        let repo = Arc::new(MockRepo::with_frames(vec![(0, 10)]));
        let store = store_with(Arc::clone(&repo), test_config());
        let cancel = CancellationToken::new();
        let stream = Uuid::new_v4();

        let first = store.get_chunk(&cancel, stream, 0, 0).await.unwrap();
        drop(first);
        let second = store.get_chunk(&cancel, stream, 0, 0).await.unwrap();
        assert_eq!(repo.fetch_count(), 1);
        assert_eq!(store.stats().hits, 1);
        drop(second);
    }

    #[tokio::test]
    async fn eviction_defers_finalization_until_release() {
        let repo = Arc::new(MockRepo::with_frames(vec![(0, 100), (4, 100)]));
        let store = store_with(Arc::clone(&repo), test_config());
        let cancel = CancellationToken::new();
        let stream = Uuid::new_v4();

        let c0 = store.get_chunk(&cancel, stream, 0, 0).await.unwrap();
        let c1 = store.get_chunk(&cancel, stream, 0, 4).await.unwrap();
        assert_eq!(c0.ref_count(), 1);
        assert_eq!(c1.ref_count(), 1);

        {
            let mut state = store.state();
            state.limit_cap_bytes = 0;
            ChunkStore::evict_locked(&mut state);
        }

        // Unlinked but pinned: marked evicted, bytes still charged.
        assert!(c0.is_evicted() && c1.is_evicted());
        assert!(!c0.is_freed() && !c1.is_freed());
        let stats = store.stats();
        assert_eq!(stats.resident_chunks, 0);
        assert!(stats.used_cap_bytes > 0);

        drop(c0);
        drop(c1);
        let stats = store.stats();
        assert_eq!(stats.used_cap_bytes, 0);
        assert_eq!(stats.used_len_bytes, 0);
    }

    #[tokio::test]
    async fn pressure_guard_refuses_without_io() {
        let repo = Arc::new(MockRepo::with_frames(vec![(0, 10)]));
        let store = store_with(Arc::clone(&repo), test_config());
        let cancel = CancellationToken::new();
        let stream = Uuid::new_v4();

        {
            let mut state = store.state();
            state.used_cap_bytes =
                state.limit_cap_bytes * store.inner.cfg.pressure_guard_factor + 1;
        }

        let err = store.get_chunk(&cancel, stream, 0, 0).await.unwrap_err();
        assert!(matches!(err, FramecastError::CachePressure(_)));
        assert_eq!(repo.fetch_count(), 0);
        assert_eq!(store.stats().pressure_refusals, 1);
    }

    #[tokio::test]
    async fn insertion_rolls_back_when_held_chunks_blow_the_guard() {
        // Budget 100, guard 200. A held 192-byte chunk (3 x 64-byte buckets)
        // passes the pre-check but cannot be reclaimed by eviction, so a new
        // 64-byte chunk pushes past the guard and must roll back.
        let repo = Arc::new(MockRepo::with_frames(vec![(0, 60), (1, 60), (2, 60), (4, 60)]));
        let mut cfg = test_config();
        cfg.chunk_frames = 3;
        cfg.cache_cap_bytes = 100;
        let store = store_with(Arc::clone(&repo), cfg);
        let cancel = CancellationToken::new();
        let stream = Uuid::new_v4();

        let held = store.get_chunk(&cancel, stream, 0, 0).await.unwrap();
        assert_eq!(held.bytes_cap(), 192);

        let err = store.get_chunk(&cancel, stream, 0, 4).await.unwrap_err();
        assert!(matches!(err, FramecastError::CachePressure(_)));
        assert_eq!(repo.fetch_count(), 2);

        // Only the held chunk's bytes remain charged; releasing it zeroes
        // the counters (it was evicted during the failed insertion's sweep).
        assert_eq!(store.stats().used_cap_bytes, 192);
        drop(held);
        assert_eq!(store.stats().used_cap_bytes, 0);
    }

    #[tokio::test]
    async fn want_seq_below_min_is_clamped() {
        let repo = Arc::new(MockRepo::with_frames(vec![(10, 10), (11, 10)]));
        let store = store_with(Arc::clone(&repo), test_config());
        let cancel = CancellationToken::new();
        let stream = Uuid::new_v4();

        let chunk = store.get_chunk(&cancel, stream, 10, 3).await.unwrap();
        assert_eq!(chunk.start_seq(), 10);
        assert_eq!(chunk.frames()[0].seq, 10);
    }

    #[tokio::test]
    async fn oversized_frames_are_omitted() {
        let repo = Arc::new(MockRepo::with_frames(vec![(0, 50), (1, 2000), (2, 60)]));
        let mut cfg = test_config();
        cfg.max_frame_bytes = 100;
        let store = store_with(Arc::clone(&repo), cfg);
        let cancel = CancellationToken::new();
        let stream = Uuid::new_v4();

        let chunk = store.get_chunk(&cancel, stream, 0, 0).await.unwrap();
        let seqs: Vec<i64> = chunk.frames().iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![0, 2]);
        assert_eq!(chunk.bytes_len(), 110);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_database_times_out() {
        let mut repo = MockRepo::with_frames(vec![(0, 10)]);
        repo.fetch_delay = Some(Duration::from_millis(700));
        let store = store_with(Arc::new(repo), test_config());
        let cancel = CancellationToken::new();

        let err = store.get_chunk(&cancel, Uuid::new_v4(), 0, 0).await.unwrap_err();
        assert!(matches!(err, FramecastError::LoadTimeout));
    }

    #[tokio::test]
    async fn metadata_snapshot_and_not_found() {
        let repo = Arc::new(MockRepo::with_frames(vec![(5, 10), (9, 10)]));
        let store = store_with(Arc::clone(&repo), test_config());
        let cancel = CancellationToken::new();

        let meta = store.load_metadata(&cancel, Uuid::new_v4()).await.unwrap();
        assert_eq!((meta.min_seq, meta.max_seq, meta.count), (5, 9, 2));

        let missing = MockRepo { exists: false, ..MockRepo::with_frames(Vec::new()) };
        let store = store_with(Arc::new(missing), test_config());
        let err = store.load_metadata(&cancel, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, FramecastError::StreamNotFound));
    }

    #[tokio::test]
    async fn empty_stream_aggregates_to_sentinel() {
        let repo = Arc::new(MockRepo::with_frames(Vec::new()));
        let store = store_with(repo, test_config());
        let cancel = CancellationToken::new();

        let meta = store.load_metadata(&cancel, Uuid::new_v4()).await.unwrap();
        assert!(meta.is_empty());
        assert_eq!((meta.min_seq, meta.max_seq, meta.count), (0, -1, 0));
    }

    #[tokio::test]
    async fn buffers_return_to_pool_after_finalization() {
        let repo = Arc::new(MockRepo::with_frames(vec![(0, 10), (1, 20), (2, 30)]));
        let store = store_with(Arc::clone(&repo), test_config());
        let cancel = CancellationToken::new();
        let stream = Uuid::new_v4();

        let chunk = store.get_chunk(&cancel, stream, 0, 0).await.unwrap();
        {
            let mut state = store.state();
            state.limit_cap_bytes = 0;
            ChunkStore::evict_locked(&mut state);
        }
        drop(chunk);

        let available: usize =
            store.pool_stats().buckets.iter().map(|bucket| bucket.available).sum();
        assert_eq!(available, 3);
    }

    #[tokio::test]
    async fn cancelled_token_is_terminal() {
        let repo = Arc::new(MockRepo::with_frames(vec![(0, 10)]));
        let store = store_with(repo, test_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store.get_chunk(&cancel, Uuid::new_v4(), 0, 0).await.unwrap_err();
        assert!(matches!(err, FramecastError::Cancelled));
    }

    #[tokio::test]
    async fn frames_are_strictly_ascending() {
        let repo = Arc::new(MockRepo::with_frames(vec![(3, 10), (5, 10), (6, 10)]));
        let store = store_with(repo, test_config());
        let cancel = CancellationToken::new();

        let chunk = store.get_chunk(&cancel, Uuid::new_v4(), 3, 3).await.unwrap();
        for pair in chunk.frames().windows(2) {
            assert!(pair[1].seq > pair[0].seq);
        }
    }
}
