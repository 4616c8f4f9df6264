//! Observation-post video ingestion.
//!
//! Decodes videos into frames, tags each frame with threat and viewing
//! geometry metadata, stores videos and frame images in object storage and
//! records them in Postgres. The HTTP API exposes storage paths, raw
//! downloads and a zip of threat frames.

pub mod analysis;
pub mod catalog;
pub mod config;
pub mod constants;
pub mod decoder;
pub mod domain;
pub mod error;
pub mod ingest;
pub mod models;
pub mod retrieval;
pub mod routes;
pub mod storage;

#[cfg(test)]
mod testing;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;

use ingest::Ingestor;
use retrieval::Retrieval;

pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub retrieval: Retrieval,
    /// Cancelled on server shutdown; running ingests drain and stop.
    pub shutdown: CancellationToken,
    /// Detached ingest tasks, awaited after the server stops accepting requests.
    pub ingests: TaskTracker,
}

/// Router with all routes and middleware
pub fn app(state: Arc<AppState>, max_request_body_bytes: usize) -> Router {
    routes::build_routes()
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(max_request_body_bytes))
        .with_state(state)
}
