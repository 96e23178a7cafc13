// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Stream administration over HTTP: list, fetch and update stream records.
//!
//! Frame ingest is handled out-of-band by the recording pipeline; this API
//! only manages the metadata the replay endpoint serves from.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};
use uuid::Uuid;

use framecast_store::{StreamRow, UpdateStreamParams};

use crate::state::AppState;

/// One stream record as exposed over the API.
#[derive(Debug, Serialize)]
pub struct StreamInfo {
    pub id: Uuid,
    pub name: String,
    pub frame_interval_ms: i32,
    pub created_at: String,
}

impl From<StreamRow> for StreamInfo {
    fn from(row: StreamRow) -> Self {
        let created_at =
            row.created_at.format(&Rfc3339).unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string());
        Self { id: row.id, name: row.name, frame_interval_ms: row.frame_interval_ms, created_at }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateStreamRequest {
    pub name: Option<String>,
    pub frame_interval_ms: Option<i32>,
}

fn parse_stream_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw)
        .map_err(|_| (StatusCode::BAD_REQUEST, "bad stream id".to_string()).into_response())
}

pub async fn list_streams_handler(State(app_state): State<Arc<AppState>>) -> Response {
    match app_state.repo.list_streams().await {
        Ok(rows) => {
            let streams: Vec<StreamInfo> = rows.into_iter().map(StreamInfo::from).collect();
            info!("Listed {} streams via HTTP", streams.len());
            Json(streams).into_response()
        },
        Err(err) => {
            warn!(error = %err, "Failed to list streams");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to list streams").into_response()
        },
    }
}

pub async fn get_stream_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_stream_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match app_state.repo.get_stream(id).await {
        Ok(Some(row)) => Json(StreamInfo::from(row)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "stream not found").into_response(),
        Err(err) => {
            warn!(stream = %id, error = %err, "Failed to fetch stream");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to fetch stream").into_response()
        },
    }
}

pub async fn update_stream_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateStreamRequest>,
) -> Response {
    let id = match parse_stream_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    if let Some(interval) = req.frame_interval_ms {
        if interval <= 0 {
            return (StatusCode::BAD_REQUEST, "frame_interval_ms must be positive")
                .into_response();
        }
    }
    if req.name.as_deref().is_some_and(str::is_empty) {
        return (StatusCode::BAD_REQUEST, "name must not be empty").into_response();
    }

    let params = UpdateStreamParams { name: req.name, frame_interval_ms: req.frame_interval_ms };
    match app_state.repo.update_stream(id, params).await {
        Ok(Some(row)) => {
            info!(stream = %id, "Stream updated via HTTP");
            Json(StreamInfo::from(row)).into_response()
        },
        Ok(None) => (StatusCode::NOT_FOUND, "stream not found").into_response(),
        Err(err) => {
            warn!(stream = %id, error = %err, "Failed to update stream");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to update stream").into_response()
        },
    }
}
