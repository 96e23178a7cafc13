// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared fixtures for cursor and session tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use framecast_core::{FramecastError, Result, StreamMeta};
use framecast_store::{
    ChunkStore, FrameRepo, FrameRow, StoreConfig, StreamMetaRow, StreamRow, UpdateStreamParams,
};

/// In-memory repository whose frame payloads encode their sequence number,
/// so sinks can assert exactly what was delivered.
pub struct SeqRepo {
    pub stream_id: Uuid,
    seqs: Vec<i64>,
    fetches: AtomicUsize,
    failing: AtomicBool,
}

impl SeqRepo {
    pub fn new(seqs: &[i64]) -> Self {
        Self {
            stream_id: Uuid::new_v4(),
            seqs: seqs.to_vec(),
            fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fail_fetches(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

pub fn payload_for(seq: i64) -> Bytes {
    Bytes::copy_from_slice(&seq.to_be_bytes())
}

pub fn seq_of(payload: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(payload);
    i64::from_be_bytes(raw)
}

#[async_trait]
impl FrameRepo for SeqRepo {
    async fn stream_meta(&self, _id: Uuid) -> Result<Option<StreamMetaRow>> {
        Ok(Some(StreamMetaRow {
            interval_ms: 40,
            min_seq: self.seqs.iter().copied().min().unwrap_or(0),
            max_seq: self.seqs.iter().copied().max().unwrap_or(-1),
            count: self.seqs.len() as i64,
        }))
    }

    async fn fetch_frames(&self, _id: Uuid, start_seq: i64, limit: i64) -> Result<Vec<FrameRow>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(FramecastError::Load("injected failure".to_string()));
        }
        Ok(self
            .seqs
            .iter()
            .copied()
            .filter(|&seq| seq >= start_seq)
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|seq| FrameRow {
                sequence: seq,
                payload: payload_for(seq),
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

/// Store over a [`SeqRepo`] with small chunks for boundary-heavy tests.
pub fn store_with_frames(chunk_frames: i64, seqs: &[i64]) -> (ChunkStore, Arc<SeqRepo>) {
    let repo = Arc::new(SeqRepo::new(seqs));
    let cfg = StoreConfig { chunk_frames, bucket_sizes: vec![64, 256], ..StoreConfig::default() };
    (ChunkStore::new(Arc::clone(&repo) as Arc<dyn FrameRepo>, cfg), repo)
}

pub fn meta_for(repo: &SeqRepo, min_seq: i64, max_seq: i64) -> StreamMeta {
    StreamMeta {
        id: repo.stream_id,
        interval_ms: 40,
        min_seq,
        max_seq,
        count: max_seq - min_seq + 1,
    }
}
