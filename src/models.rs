//! Shared data models used across modules

use serde::Serialize;

/// A video record from the database.
///
/// `os_filepath` and `frame_count` stay `None` until ingestion finalizes the
/// video. A row with a null path is either still ingesting or was left
/// behind by a failed pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Video {
    pub id: i64,
    pub observation_post_name: String,
    #[sqlx(rename = "OS_filepath")]
    pub os_filepath: Option<String>,
    pub frame_count: Option<i32>,
}

impl Video {
    pub fn is_finalized(&self) -> bool {
        self.os_filepath.is_some()
    }
}

/// A frame record from the database
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Frame {
    pub id: i64,
    pub video_id: i64,
    pub metadata_id: i64,
    #[sqlx(rename = "OS_filepath")]
    pub os_filepath: String,
    pub frame_index: i32,
}

/// Per-frame metadata, owned one-to-one by its frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub id: i64,
    pub is_threat: bool,
    pub fov: f64,
    pub azimuth: f64,
    pub elevation: f64,
}

/// Output of the frame analyzer: threat flag plus viewing geometry in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameAnalysis {
    pub is_threat: bool,
    pub fov: f64,
    pub azimuth: f64,
    pub elevation: f64,
}

/// Everything needed to insert one frame and its metadata row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFrame {
    pub video_id: i64,
    pub frame_index: i32,
    pub os_filepath: String,
    pub analysis: FrameAnalysis,
}
