// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Framecast Replay - drives one client's playback of one recorded stream.
//!
//! - [`cursor`]: strictly-forward iterator over a stream's sequence range,
//!   built on the shared chunk cache
//! - [`session`]: the wall-clock slot loop that paces frames at a fixed
//!   rate, skipping instead of lagging

pub mod cursor;
pub mod session;

pub use cursor::ChunkCursor;
pub use session::{FrameSink, PlaybackConfig, ReplaySession};

#[cfg(test)]
pub(crate) mod testutil;
