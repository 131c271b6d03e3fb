//! sfu-relay server library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod sfu;
pub mod state;
pub mod ws;

use anyhow::{Context, Result};
use engine::MediaEngine;
use sfu::WorkerPool;
use std::sync::Arc;

/// Starts the worker pool and installs the router every connection shares
pub async fn init_media(state: &state::AppState, engine: &dyn MediaEngine) -> Result<Arc<WorkerPool>> {
    let config = &state.config;
    let pool = WorkerPool::start(engine, config.num_workers, &config.worker.settings())
        .await
        .context("failed to start media workers")?;
    let router = pool
        .create_router(&config.router.media_codecs)
        .await
        .context("failed to create media router")?;
    state.registry.install_router(router);
    Ok(Arc::new(pool))
}

/// Create and configure the server application
pub async fn create_app(
    config: config::Config,
    engine: &dyn MediaEngine,
) -> Result<(axum::Router, Arc<WorkerPool>)> {
    let app_state = state::AppState::new(config);
    let pool = init_media(&app_state, engine).await?;
    let router = api::create_router(app_state);
    Ok((router, pool))
}
