// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Framecast Core - Shared types and buffer pools for the replay server.
//!
//! This crate holds the pieces every other Framecast crate builds on:
//!
//! - [`error`]: the `FramecastError` taxonomy and `Result` alias
//! - [`types`]: frame and stream-metadata types
//! - [`bucket_pool`]: bucketed byte-buffer pool for JPEG payloads
//! - [`slice_pool`]: recycling pool for chunk frame containers

pub mod bucket_pool;
pub mod error;
pub mod slice_pool;
pub mod types;

pub use bucket_pool::{ByteBucketPool, PooledBuf, DEFAULT_BUCKET_SIZES};
pub use error::{FramecastError, Result};
pub use slice_pool::{FrameSlice, FrameSlicePool};
pub use types::{Frame, StreamMeta};
