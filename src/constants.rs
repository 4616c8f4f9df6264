//! Application constants

/// Default GCS bucket for videos and frames
pub const DEFAULT_BUCKET_NAME: &str = "bionic";

/// Image format extension used for stored frames
pub const FRAME_EXTENSION: &str = "jpg";

/// JPEG quality for encoded frames
pub const FRAME_JPEG_QUALITY: u8 = 90;

/// Attachment filename of the threat-frame archive
pub const THREAT_ARCHIVE_FILENAME: &str = "threat_frames.zip";

/// Default number of frames processed concurrently per ingest
pub const DEFAULT_INGEST_CONCURRENCY: usize = 16;

/// Default time to let in-flight frames finish after cancellation
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Default Postgres pool size; must stay above the worker count
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 24;

pub const DEFAULT_FFMPEG_THREADS: usize = 1;

/// Default horizontal field of view of observation-post cameras, in degrees
pub const DEFAULT_CAMERA_FOV_DEGREES: f64 = 60.0;

/// Request body limit; uploads reference a local path, so bodies are tiny
pub const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
