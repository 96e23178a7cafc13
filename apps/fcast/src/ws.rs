// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! WebSocket replay endpoint: `GET /v1/streams/{id}/ws`.
//!
//! Pre-upgrade the handler validates the id (400), snapshots the stream's
//! metadata (404 when unknown) and answers 204 for empty streams without
//! upgrading at all. After the upgrade the server only ever sends binary
//! frames; an auxiliary reader consumes whatever the client sends so
//! control frames are processed and liveness is observed, but inbound data
//! is otherwise ignored.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use opentelemetry::{global, KeyValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use framecast_core::{FramecastError, Result, StreamMeta};
use framecast_replay::{FrameSink, ReplaySession};

use crate::state::AppState;

static ACTIVE_SESSIONS: AtomicU64 = AtomicU64::new(0);

/// Inbound messages are capped; clients are not expected to send data.
const MAX_INBOUND_MESSAGE_BYTES: usize = 64 << 10;

const READER_TEARDOWN_GRACE: Duration = Duration::from_millis(100);
const CLOSE_WRITE_DEADLINE: Duration = Duration::from_secs(1);

/// Metrics for replay session handling.
#[derive(Clone)]
struct ReplayMetrics {
    sessions_gauge: opentelemetry::metrics::Gauge<u64>,
    frames_counter: opentelemetry::metrics::Counter<u64>,
    sessions_counter: opentelemetry::metrics::Counter<u64>,
}

impl ReplayMetrics {
    fn shared() -> Self {
        static METRICS: OnceLock<ReplayMetrics> = OnceLock::new();
        METRICS
            .get_or_init(|| {
                let meter = global::meter("fcast_replay");
                Self {
                    sessions_gauge: meter
                        .u64_gauge("replay.sessions.active")
                        .with_description("Number of active replay sessions")
                        .build(),
                    frames_counter: meter
                        .u64_counter("replay.frames.delivered")
                        .with_description("Frames transmitted to clients")
                        .build(),
                    sessions_counter: meter
                        .u64_counter("replay.sessions.finished")
                        .with_description("Replay sessions by outcome")
                        .build(),
                }
            })
            .clone()
    }
}

/// The write half of the client connection, as seen by the replay engine.
struct WsFrameSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait::async_trait]
impl FrameSink for WsFrameSink {
    async fn send_frame(&mut self, payload: Bytes) -> Result<()> {
        self.sender
            .send(Message::Binary(payload))
            .await
            .map_err(|err| FramecastError::Network(err.to_string()))
    }
}

/// HTTP handler for the replay endpoint.
pub async fn stream_ws_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(stream_id) = Uuid::parse_str(&id) else {
        return (StatusCode::BAD_REQUEST, "bad stream id").into_response();
    };

    // Snapshot the metadata before upgrading; the session plays this
    // snapshot even if frames are appended concurrently.
    let cancel = CancellationToken::new();
    let meta = match app_state.store.load_metadata(&cancel, stream_id).await {
        Ok(meta) => meta,
        Err(FramecastError::StreamNotFound) => {
            return (StatusCode::NOT_FOUND, "stream not found").into_response();
        },
        Err(err) => {
            warn!(stream = %stream_id, error = %err, "Metadata snapshot failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "metadata query failed").into_response();
        },
    };
    if meta.is_empty() {
        // Nothing to play; answer before the upgrade.
        return StatusCode::NO_CONTENT.into_response();
    }

    // JPEG payloads are already compressed; axum never negotiates
    // per-message compression, so frames go out verbatim.
    ws.max_message_size(MAX_INBOUND_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_stream_socket(socket, app_state, meta, cancel))
}

/// Consume inbound traffic under a rolling read deadline.
///
/// The client is not expected to send anything, but without a read loop the
/// transport would never process control frames. Any inbound message (pongs
/// included) extends the deadline; silence past it means the peer is gone.
async fn reader_pump(
    mut receiver: SplitStream<WebSocket>,
    read_deadline: Duration,
    cancel: CancellationToken,
) {
    loop {
        match tokio::time::timeout(read_deadline, receiver.next()).await {
            Err(_elapsed) => {
                debug!("read deadline expired, marking client gone");
                break;
            },
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(_))) => {},
        }
    }
    // The replay loop observes this at its next slot sleep.
    cancel.cancel();
}

async fn handle_stream_socket(
    socket: WebSocket,
    app_state: Arc<AppState>,
    meta: StreamMeta,
    cancel: CancellationToken,
) {
    let stream_id = meta.id;
    info!(stream = %stream_id, min_seq = meta.min_seq, max_seq = meta.max_seq, "replay session starting");

    let metrics = ReplayMetrics::shared();
    let active = ACTIVE_SESSIONS.fetch_add(1, Ordering::Relaxed) + 1;
    metrics.sessions_gauge.record(active, &[]);

    let (sender, receiver) = socket.split();
    let reader = tokio::spawn(reader_pump(
        receiver,
        app_state.config.playback.read_deadline(),
        cancel.clone(),
    ));

    let mut session = ReplaySession::new(
        app_state.store.clone(),
        meta,
        WsFrameSink { sender },
        app_state.config.playback.session_config(),
        cancel.clone(),
    );
    let outcome = session.run().await;
    let delivered = session.delivered();
    metrics.frames_counter.add(delivered, &[]);

    match outcome {
        Ok(()) => {
            metrics.sessions_counter.add(1, &[KeyValue::new("outcome", "completed")]);
            info!(stream = %stream_id, delivered, "replay session completed");
            finish_clean(session, reader).await;
        },
        Err(err) => {
            let outcome_label = match &err {
                FramecastError::Cancelled => "cancelled",
                _ => "error",
            };
            metrics.sessions_counter.add(1, &[KeyValue::new("outcome", outcome_label)]);
            info!(stream = %stream_id, delivered, error = %err, "replay session ended");
            finish_broken(session, reader).await;
        },
    }

    let prev = ACTIVE_SESSIONS.fetch_sub(1, Ordering::Relaxed);
    metrics.sessions_gauge.record(prev.saturating_sub(1), &[]);
}

/// End-of-stream: send a normal close and give the reader a moment to see
/// the client's close reply.
async fn finish_clean(session: ReplaySession<WsFrameSink>, reader: tokio::task::JoinHandle<()>) {
    let mut sink = session.into_sink();
    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "end of stream".into(),
    }));
    let _ = tokio::time::timeout(CLOSE_WRITE_DEADLINE, sink.sender.send(close)).await;
    drop(sink);
    await_reader(reader).await;
}

/// Error path: drop the socket outright, which also unblocks the reader.
async fn finish_broken(session: ReplaySession<WsFrameSink>, reader: tokio::task::JoinHandle<()>) {
    drop(session.into_sink());
    await_reader(reader).await;
}

async fn await_reader(mut reader: tokio::task::JoinHandle<()>) {
    if tokio::time::timeout(READER_TEARDOWN_GRACE, &mut reader).await.is_err() {
        // Not critical; don't leave the task behind.
        reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_validation() {
        assert!(Uuid::parse_str("b5d0c9a2-7f0e-4ef1-9a63-13d6d0f6c013").is_ok());
        assert!(Uuid::parse_str("not-a-uuid").is_err());
        assert!(Uuid::parse_str("").is_err());
    }

    #[test]
    fn inbound_cap_is_64k() {
        assert_eq!(MAX_INBOUND_MESSAGE_BYTES, 65_536);
    }
}
