// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use framecast_store::{ChunkStore, FrameRepo};

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub store: ChunkStore,
    pub repo: Arc<dyn FrameRepo>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: ChunkStore, repo: Arc<dyn FrameRepo>, config: Arc<Config>) -> Self {
        Self { store, repo, config }
    }
}
