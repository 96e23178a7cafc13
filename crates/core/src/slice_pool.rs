// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Recycling pool for chunk frame containers.
//!
//! Every chunk load needs a `Vec<Frame>` sized for `chunk_frames` entries.
//! Rather than allocating one per load, finalized chunks hand their (now
//! empty) container back here and the next load picks it up.

use std::sync::{Arc, Mutex, Weak};

use crate::types::Frame;

struct SliceInner {
    chunk_frames: usize,
    free: Vec<Vec<Frame>>,
}

/// Free list of empty frame containers, all with capacity >= `chunk_frames`.
pub struct FrameSlicePool {
    inner: Arc<Mutex<SliceInner>>,
}

impl Clone for FrameSlicePool {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl FrameSlicePool {
    #[must_use]
    pub fn new(chunk_frames: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(SliceInner { chunk_frames, free: Vec::new() })) }
    }

    /// Get an empty container, recycled if one is available.
    #[must_use]
    pub fn get(&self) -> FrameSlice {
        let frames = {
            let Ok(mut guard) = self.inner.lock() else {
                return FrameSlice { frames: Vec::new(), pool: Weak::new() };
            };
            guard.free.pop().unwrap_or_else(|| Vec::with_capacity(guard.chunk_frames))
        };
        FrameSlice { frames, pool: Arc::downgrade(&self.inner) }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.lock().map_or(0, |guard| guard.free.len())
    }
}

/// A frame container that returns itself to its pool on drop.
///
/// Dropping also drops the contained frames, which sends their payload
/// buffers back to the byte pool.
pub struct FrameSlice {
    frames: Vec<Frame>,
    pool: Weak<Mutex<SliceInner>>,
}

impl FrameSlice {
    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Frame] {
        &self.frames
    }

    #[must_use]
    pub fn last(&self) -> Option<&Frame> {
        self.frames.last()
    }
}

impl std::ops::Deref for FrameSlice {
    type Target = [Frame];

    fn deref(&self) -> &Self::Target {
        &self.frames
    }
}

impl std::fmt::Debug for FrameSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlice").field("len", &self.frames.len()).finish_non_exhaustive()
    }
}

impl Drop for FrameSlice {
    fn drop(&mut self) {
        let Some(inner) = self.pool.upgrade() else { return };
        let Ok(mut guard) = inner.lock() else { return };
        let mut frames = std::mem::take(&mut self.frames);
        frames.clear();
        if frames.capacity() >= guard.chunk_frames {
            guard.free.push(frames);
        }
    }
}
