// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Postgres implementation of the database-provider contract.
//!
//! Schema: `streams(id uuid, name text, frame_interval_ms int4,
//! created_at timestamptz)` and `frames(stream_id uuid, sequence int8,
//! payload bytea, mime_type text)` keyed on `(stream_id, sequence)`.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use uuid::Uuid;

use framecast_core::{FramecastError, Result};

use crate::repo::{FrameRepo, FrameRow, StreamMetaRow, StreamRow, UpdateStreamParams};

/// sqlx-backed repository over a shared connection pool.
#[derive(Clone)]
pub struct PgFrameRepo {
    pool: PgPool,
}

fn db_err(err: sqlx::Error) -> FramecastError {
    FramecastError::Load(err.to_string())
}

impl PgFrameRepo {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with bounded pool sizing.
    ///
    /// # Errors
    ///
    /// Returns `Load` when the pool cannot be established.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }
}

fn stream_row(row: &sqlx::postgres::PgRow) -> std::result::Result<StreamRow, sqlx::Error> {
    Ok(StreamRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        frame_interval_ms: row.try_get("frame_interval_ms")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl FrameRepo for PgFrameRepo {
    async fn stream_meta(&self, id: Uuid) -> Result<Option<StreamMetaRow>> {
        // The left join keeps the stream row even when it has no frames,
        // aggregating to the (0, -1, 0) empty-stream shape.
        let row = sqlx::query(
            r"SELECT
                  s.frame_interval_ms,
                  COALESCE(MIN(f.sequence), 0)  AS min_seq,
                  COALESCE(MAX(f.sequence), -1) AS max_seq,
                  COUNT(f.sequence)             AS frame_count
              FROM streams s
              LEFT JOIN frames f ON f.stream_id = s.id
              WHERE s.id = $1
              GROUP BY s.id, s.frame_interval_ms",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| -> std::result::Result<StreamMetaRow, sqlx::Error> {
            Ok(StreamMetaRow {
                interval_ms: row.try_get("frame_interval_ms")?,
                min_seq: row.try_get("min_seq")?,
                max_seq: row.try_get("max_seq")?,
                count: row.try_get("frame_count")?,
            })
        })
        .transpose()
        .map_err(db_err)
    }

    async fn fetch_frames(&self, id: Uuid, start_seq: i64, limit: i64) -> Result<Vec<FrameRow>> {
        let rows = sqlx::query(
            r"SELECT sequence, payload, mime_type
              FROM frames
              WHERE stream_id = $1 AND sequence >= $2
              ORDER BY sequence
              LIMIT $3",
        )
        .bind(id)
        .bind(start_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| -> std::result::Result<FrameRow, sqlx::Error> {
                let payload: Vec<u8> = row.try_get("payload")?;
                Ok(FrameRow {
                    sequence: row.try_get("sequence")?,
                    payload: Bytes::from(payload),
                    mime: row.try_get("mime_type")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    async fn list_streams(&self) -> Result<Vec<StreamRow>> {
        let rows = sqlx::query(
            r"SELECT id, name, frame_interval_ms, created_at
              FROM streams
              ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(stream_row).collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    async fn get_stream(&self, id: Uuid) -> Result<Option<StreamRow>> {
        let row = sqlx::query(
            r"SELECT id, name, frame_interval_ms, created_at
              FROM streams
              WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(stream_row).transpose().map_err(db_err)
    }

    async fn update_stream(
        &self,
        id: Uuid,
        params: UpdateStreamParams,
    ) -> Result<Option<StreamRow>> {
        let row = sqlx::query(
            r"UPDATE streams
              SET name = COALESCE($2, name),
                  frame_interval_ms = COALESCE($3, frame_interval_ms)
              WHERE id = $1
              RETURNING id, name, frame_interval_ms, created_at",
        )
        .bind(id)
        .bind(params.name)
        .bind(params.frame_interval_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(stream_row).transpose().map_err(db_err)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }
}
