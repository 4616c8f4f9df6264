//! Video endpoints (/video/*)

use axum::{
    Json, Router,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;

use crate::AppState;
use crate::error::{Error, Result};
use crate::models::Video;
use crate::retrieval::Download;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/video", post(upload_video))
        .route("/video/paths", get(list_video_paths))
        .route("/video/incomplete", get(list_incomplete_videos))
        .route("/video/{id}", get(get_video))
        .route("/video/{id}/path", get(get_video_path))
        .route("/video/{id}/frames/path", get(get_frame_paths))
        .route("/video/{id}/frames/{index}/path", get(get_frame_path))
        .route("/video/{id}/download", get(download_video))
        .route(
            "/video/{id}/download_threat_frames",
            get(download_threat_frames),
        )
}

#[derive(Debug, Deserialize)]
struct UploadVideoRequest {
    path: Option<String>,
}

/// POST /video - Ingest a video from a path on the server's filesystem
async fn upload_video(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UploadVideoRequest>,
) -> Result<impl IntoResponse> {
    let path = req
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| Error::Validation("request body must carry a \"path\"".to_string()))?;

    // Detached so a client disconnect cannot abort frame writes mid-flight.
    // Server shutdown cancels the token instead, which drains the workers.
    let ingestor = state.ingestor.clone();
    let cancel = state.shutdown.child_token();
    let report = state.ingests.spawn(async move {
        ingestor
            .ingest(std::path::Path::new(&path), cancel)
            .await
    })
    .await
    .map_err(|e| Error::Internal(format!("ingest task failed: {}", e)))??;

    Ok((
        [
            ("x-video-id", report.video_id.to_string()),
            ("x-frames-persisted", report.persisted.to_string()),
            ("x-frames-failed", report.failed.to_string()),
        ],
        "Success",
    ))
}

/// GET /video/paths - Storage paths of all finalized videos
async fn list_video_paths(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>> {
    Ok(Json(state.retrieval.list_video_paths().await?))
}

/// GET /video/incomplete - Ids of videos that were never finalized
async fn list_incomplete_videos(State(state): State<Arc<AppState>>) -> Result<Json<Vec<i64>>> {
    Ok(Json(state.retrieval.list_incomplete_videos().await?))
}

/// GET /video/:id
async fn get_video(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<i64>,
) -> Result<Json<Video>> {
    Ok(Json(state.retrieval.get_video(video_id).await?))
}

/// GET /video/:id/path
async fn get_video_path(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<i64>,
) -> Result<String> {
    state.retrieval.get_video_path(video_id).await
}

/// GET /video/:id/frames/path
async fn get_frame_paths(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<i64>,
) -> Result<Json<Vec<String>>> {
    Ok(Json(state.retrieval.get_frame_paths(video_id).await?))
}

/// GET /video/:id/frames/:index/path
async fn get_frame_path(
    State(state): State<Arc<AppState>>,
    Path((video_id, frame_index)): Path<(i64, i64)>,
) -> Result<String> {
    state.retrieval.get_frame_path(video_id, frame_index).await
}

/// GET /video/:id/download
async fn download_video(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(attachment(state.retrieval.download_video(video_id).await?))
}

/// GET /video/:id/download_threat_frames - Zip of all threat-tagged frames
async fn download_threat_frames(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(attachment(
        state.retrieval.download_threat_frames(video_id).await?,
    ))
}

fn attachment(download: Download) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, download.content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!(
                    "attachment; filename=\"{}\"",
                    sanitize_filename(&download.filename)
                ),
            ),
        ],
        download.data,
    )
}

/// Keep the filename inside its quoted header parameter.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == '"' || c == '\\' || c.is_control() || !c.is_ascii() {
                '_'
            } else {
                c
            }
        })
        .collect()
}
