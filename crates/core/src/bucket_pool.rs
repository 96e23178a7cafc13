// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bucketed byte-buffer pool for JPEG payloads.
//!
//! JPEG frames vary wildly in size; handing every one its own allocation
//! hammers the allocator under load. The pool keeps free lists for a fixed
//! ascending set of storage sizes (32 KiB .. 4 MiB by default) and serves a
//! request for `n` bytes from the smallest bucket that fits. Requests larger
//! than the biggest bucket get a one-off allocation that is never pooled.
//!
//! Buffers are NOT zeroed when they re-enter a free list: payloads are JPEG
//! images, not secrets, and a fresh `get` overwrites the logical range
//! before it is ever read.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

/// Default bucket storage sizes, ascending.
pub const DEFAULT_BUCKET_SIZES: &[usize] = &[
    32 << 10,
    64 << 10,
    128 << 10,
    256 << 10,
    512 << 10,
    1 << 20,
    2 << 20,
    4 << 20,
];

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub buckets: Vec<BucketStats>,
}

#[derive(Debug, Clone)]
pub struct BucketStats {
    pub bucket_size: usize,
    pub available: usize,
}

#[derive(Clone)]
pub struct PoolHandle(Weak<Mutex<PoolInner>>);

impl PoolHandle {
    fn upgrade(&self) -> Option<Arc<Mutex<PoolInner>>> {
        self.0.upgrade()
    }
}

struct PoolInner {
    bucket_sizes: Vec<usize>,
    buckets: Vec<Vec<Vec<u8>>>,
    hits: u64,
    misses: u64,
}

impl PoolInner {
    /// Smallest bucket whose storage size is >= `min_len`.
    fn bucket_index_for_min_len(&self, min_len: usize) -> Option<usize> {
        let idx = self.bucket_sizes.partition_point(|&size| size < min_len);
        (idx < self.bucket_sizes.len()).then_some(idx)
    }

    fn bucket_index_for_storage_len(&self, storage_len: usize) -> Option<usize> {
        self.bucket_sizes.binary_search(&storage_len).ok()
    }
}

/// Thread-safe pool of byte buffers with fixed storage-size buckets.
pub struct ByteBucketPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl Clone for ByteBucketPool {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl ByteBucketPool {
    /// Create a pool with the given bucket sizes.
    ///
    /// `bucket_sizes` should be sorted ascending; this sorts/dedups anyway.
    #[must_use]
    pub fn new(mut bucket_sizes: Vec<usize>) -> Self {
        bucket_sizes.retain(|&size| size > 0);
        bucket_sizes.sort_unstable();
        bucket_sizes.dedup();
        let buckets = (0..bucket_sizes.len()).map(|_| Vec::new()).collect();
        Self {
            inner: Arc::new(Mutex::new(PoolInner { bucket_sizes, buckets, hits: 0, misses: 0 })),
        }
    }

    #[must_use]
    pub fn with_default_buckets() -> Self {
        Self::new(DEFAULT_BUCKET_SIZES.to_vec())
    }

    fn handle(&self) -> PoolHandle {
        PoolHandle(Arc::downgrade(&self.inner))
    }

    /// Storage size of the bucket that would serve a request of `n` bytes,
    /// or `None` when `n` exceeds the largest bucket.
    #[must_use]
    pub fn bucket_size(&self, n: usize) -> Option<usize> {
        let Ok(guard) = self.inner.lock() else { return None };
        guard.bucket_index_for_min_len(n).map(|idx| guard.bucket_sizes[idx])
    }

    /// Get a buffer with logical length `n`.
    ///
    /// `n == 0` yields an empty detached buffer. When `n` fits a bucket, the
    /// returned buffer's storage is exactly that bucket's size and the
    /// buffer goes back onto the free list on drop; otherwise the storage is
    /// exactly `n` and the buffer is never pooled.
    #[must_use]
    pub fn get(&self, n: usize) -> PooledBuf {
        if n == 0 {
            return PooledBuf::detached(Vec::new());
        }

        let (handle, bucket_idx, bucket_size, maybe_buf) = {
            let Ok(mut guard) = self.inner.lock() else {
                return PooledBuf::detached(vec![0u8; n]);
            };
            let Some(bucket_idx) = guard.bucket_index_for_min_len(n) else {
                guard.misses += 1;
                return PooledBuf::detached(vec![0u8; n]);
            };
            let bucket_size = guard.bucket_sizes[bucket_idx];
            let buf = guard.buckets[bucket_idx].pop();
            if buf.is_some() {
                guard.hits += 1;
            } else {
                guard.misses += 1;
            }
            (self.handle(), bucket_idx, bucket_size, buf)
        };

        let data = maybe_buf.unwrap_or_else(|| vec![0u8; bucket_size]);
        PooledBuf::pooled(data, n, handle, bucket_idx)
    }

    pub fn stats(&self) -> PoolStats {
        let Ok(guard) = self.inner.lock() else {
            return PoolStats { hits: 0, misses: 0, buckets: Vec::new() };
        };
        PoolStats {
            hits: guard.hits,
            misses: guard.misses,
            buckets: guard
                .bucket_sizes
                .iter()
                .enumerate()
                .map(|(idx, &bucket_size)| BucketStats {
                    bucket_size,
                    available: guard.buckets[idx].len(),
                })
                .collect(),
        }
    }
}

/// A byte buffer with a logical length over fixed-size storage.
///
/// For pooled instances `storage_len()` is the bucket size and `len()` the
/// payload length; the capacity budget charges `storage_len()`. Dropping a
/// pooled instance pushes its storage back onto the owning bucket's free
/// list (without zeroing).
pub struct PooledBuf {
    data: Vec<u8>,
    len: usize,
    pool: Option<PoolHandle>,
    bucket_idx: usize,
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.len)
            .field("storage_len", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

impl PooledBuf {
    /// A buffer outside any pool; storage and logical length coincide.
    #[must_use]
    pub const fn detached(data: Vec<u8>) -> Self {
        let len = data.len();
        Self { data, len, pool: None, bucket_idx: 0 }
    }

    fn pooled(data: Vec<u8>, len: usize, pool: PoolHandle, bucket_idx: usize) -> Self {
        let len = len.min(data.len());
        Self { data, len, pool: Some(pool), bucket_idx }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing storage; what the cache charges to its budget.
    #[must_use]
    pub const fn storage_len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Fill the logical range from `src` (lengths must match).
    pub fn copy_from(&mut self, src: &[u8]) {
        self.as_mut_slice().copy_from_slice(src);
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else { return };
        let Some(inner) = pool.upgrade() else { return };
        let Ok(mut guard) = inner.lock() else { return };

        // Only return storage that still matches an existing bucket exactly.
        let Some(expected_idx) = guard.bucket_index_for_storage_len(self.data.len()) else {
            return;
        };
        if expected_idx != self.bucket_idx {
            return;
        }

        guard.buckets[self.bucket_idx].push(std::mem::take(&mut self.data));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn smallest_fitting_bucket() {
        let pool = ByteBucketPool::new(vec![32 << 10, 64 << 10, 128 << 10]);
        assert_eq!(pool.bucket_size(1), Some(32 << 10));
        assert_eq!(pool.bucket_size((32 << 10) - 1), Some(32 << 10));
        assert_eq!(pool.bucket_size(32 << 10), Some(32 << 10));
        assert_eq!(pool.bucket_size((32 << 10) + 1), Some(64 << 10));
        assert_eq!(pool.bucket_size((64 << 10) + 1), Some(128 << 10));
        assert_eq!(pool.bucket_size(129 << 10), None);
    }

    #[test]
    fn get_put_round_trip() {
        let pool = ByteBucketPool::new(vec![32 << 10, 64 << 10]);
        let mut buf = pool.get(100);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.storage_len(), 32 << 10);
        for (i, b) in buf.as_mut_slice().iter_mut().enumerate() {
            *b = u8::try_from(i % 251).unwrap();
        }
        drop(buf);

        // Second get of a comparable size reuses the same bucket storage.
        let buf2 = pool.get(200);
        assert_eq!(buf2.len(), 200);
        assert_eq!(buf2.storage_len(), 32 << 10);
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn zero_len_is_empty_and_detached() {
        let pool = ByteBucketPool::new(vec![32 << 10]);
        let buf = pool.get(0);
        assert!(buf.is_empty());
        assert_eq!(buf.storage_len(), 0);
        drop(buf);
        assert_eq!(pool.stats().buckets[0].available, 0);
    }

    #[test]
    fn huge_request_bypasses_pool() {
        let pool = ByteBucketPool::new(vec![32 << 10]);
        let buf = pool.get((1 << 20) + 123);
        assert_eq!(buf.len(), (1 << 20) + 123);
        assert_eq!(buf.storage_len(), buf.len());
        drop(buf); // must not land on any free list
        assert_eq!(pool.stats().buckets[0].available, 0);
    }

    #[test]
    fn drop_returns_full_storage() {
        let pool = ByteBucketPool::new(vec![64]);
        {
            let _a = pool.get(10);
            let _b = pool.get(20);
        }
        let stats = pool.stats();
        assert_eq!(stats.buckets[0].available, 2);
    }

    #[test]
    fn concurrent_get_and_drop() {
        let pool = ByteBucketPool::new(vec![1 << 10, 4 << 10]);
        let mut handles = Vec::new();
        for t in 0..8 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let n = 1 + (t * 37 + i * 13) % (4 << 10);
                    let buf = pool.get(n);
                    assert_eq!(buf.len(), n);
                    assert!(buf.storage_len() >= n);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
