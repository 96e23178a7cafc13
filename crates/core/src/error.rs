// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for Framecast.
//!
//! The chunk-cache failure modes are first-class variants so callers can
//! match on them: a replay session treats `CachePressure`, `LoadTimeout` and
//! `Load` as "no frame this slot" and keeps going, while `Cancelled` is
//! terminal for the session and `StreamNotFound` maps to a 404 before the
//! WebSocket upgrade.

use thiserror::Error;

/// Main error type for Framecast operations.
#[derive(Debug, Error)]
pub enum FramecastError {
    /// The metadata query matched no stream.
    #[error("stream not found")]
    StreamNotFound,

    /// The cache refused a load because the capacity budget is exceeded
    /// beyond the pressure guard, either before or after eviction.
    #[error("cache pressure: {0}")]
    CachePressure(String),

    /// The database did not return a chunk within the per-chunk deadline.
    #[error("chunk load timed out")]
    LoadTimeout,

    /// Driver or row-scan failure while loading frames.
    #[error("chunk load failed: {0}")]
    Load(String),

    /// The caller's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration or parameter validation error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network-related error (sockets, HTTP, WebSocket).
    #[error("network error: {0}")]
    Network(String),

    /// I/O error (file operations, TLS material).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using `FramecastError`.
pub type Result<T> = std::result::Result<T, FramecastError>;

impl FramecastError {
    /// True for cache failures a replay session should absorb as an empty
    /// slot rather than terminate on.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::CachePressure(_) | Self::LoadTimeout | Self::Load(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = FramecastError::CachePressure("cap budget exceeded".to_string());
        assert_eq!(err.to_string(), "cache pressure: cap budget exceeded");

        let err = FramecastError::StreamNotFound;
        assert_eq!(err.to_string(), "stream not found");
    }

    #[test]
    fn transient_classification() {
        assert!(FramecastError::LoadTimeout.is_transient());
        assert!(FramecastError::Load("boom".to_string()).is_transient());
        assert!(!FramecastError::Cancelled.is_transient());
        assert!(!FramecastError::StreamNotFound.is_transient());
    }
}
