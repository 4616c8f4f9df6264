//! Read path: storage paths, raw downloads and the threat-frame archive.

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::sync::Arc;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::catalog::Catalog;
use crate::constants::THREAT_ARCHIVE_FILENAME;
use crate::error::{Error, Result};
use crate::models::{Frame, Video};
use crate::storage::{ObjectStore, key_basename};

/// Objects fetched concurrently while assembling an archive
const ARCHIVE_FETCH_CONCURRENCY: usize = 8;

/// A file ready to be sent as an attachment
#[derive(Debug, Clone)]
pub struct Download {
    pub filename: String,
    pub content_type: &'static str,
    pub data: Bytes,
}

#[derive(Clone)]
pub struct Retrieval {
    catalog: Arc<dyn Catalog>,
    store: ObjectStore,
}

impl Retrieval {
    pub fn new(catalog: Arc<dyn Catalog>, store: ObjectStore) -> Self {
        Self { catalog, store }
    }

    pub async fn list_video_paths(&self) -> Result<Vec<String>> {
        Ok(self.catalog.list_video_paths().await?)
    }

    pub async fn list_incomplete_videos(&self) -> Result<Vec<i64>> {
        Ok(self.catalog.list_incomplete_videos().await?)
    }

    pub async fn get_video(&self, video_id: i64) -> Result<Video> {
        self.catalog
            .get_video(video_id)
            .await?
            .ok_or_else(|| Error::not_found("video", video_id))
    }

    /// Storage path of a finalized video. Unfinalized videos are not found.
    pub async fn get_video_path(&self, video_id: i64) -> Result<String> {
        self.get_video(video_id)
            .await?
            .os_filepath
            .ok_or_else(|| Error::not_found("video", video_id))
    }

    pub async fn get_frame_paths(&self, video_id: i64) -> Result<Vec<String>> {
        // Distinguish an unknown video from one without frames.
        self.get_video(video_id).await?;
        let frames = self.catalog.list_frames(video_id).await?;
        Ok(frames.into_iter().map(|f| f.os_filepath).collect())
    }

    pub async fn get_frame_path(&self, video_id: i64, frame_index: i64) -> Result<String> {
        let not_found = || Error::not_found("frame", format!("{}/{}", video_id, frame_index));
        let index = i32::try_from(frame_index).map_err(|_| not_found())?;
        self.catalog
            .get_frame_by_index(video_id, index)
            .await?
            .map(|f| f.os_filepath)
            .ok_or_else(not_found)
    }

    pub async fn download_video(&self, video_id: i64) -> Result<Download> {
        let key = self.get_video_path(video_id).await?;
        let data = self.store.get(&key).await?;
        Ok(Download {
            filename: key_basename(&key).to_string(),
            content_type: content_type_for(&key),
            data,
        })
    }

    /// Zip every threat frame of a video. Not found when there are none.
    pub async fn download_threat_frames(&self, video_id: i64) -> Result<Download> {
        let frames = self.catalog.list_threat_frames(video_id).await?;
        if frames.is_empty() {
            return Err(Error::not_found("threat frames for video", video_id));
        }

        let names = archive_entry_names(&frames);
        let keys: Vec<String> = frames.iter().map(|f| f.os_filepath.clone()).collect();
        let contents: Vec<Bytes> = stream::iter(keys)
            .map(|key| {
                let store = self.store.clone();
                async move { store.get(&key).await }
            })
            .buffered(ARCHIVE_FETCH_CONCURRENCY)
            .try_collect()
            .await?;
        let entries: Vec<(String, Bytes)> = names.into_iter().zip(contents).collect();

        let data = tokio::task::spawn_blocking(move || build_zip(entries))
            .await
            .map_err(|e| Error::Internal(format!("archive task panicked: {}", e)))?
            .map_err(|e| Error::Internal(format!("archive build failed: {}", e)))?;

        tracing::info!(
            video_id,
            entries = frames.len(),
            bytes = data.len(),
            "Built threat archive"
        );

        Ok(Download {
            filename: THREAT_ARCHIVE_FILENAME.to_string(),
            content_type: "application/zip",
            data: Bytes::from(data),
        })
    }
}

/// Entry names are storage basenames. A repeated basename is prefixed with
/// the frame id until it is unique.
fn archive_entry_names(frames: &[Frame]) -> Vec<String> {
    let mut seen = HashSet::new();
    frames
        .iter()
        .map(|frame| {
            let mut name = key_basename(&frame.os_filepath).to_string();
            while !seen.insert(name.clone()) {
                name = format!("{}_{}", frame.id, name);
            }
            name
        })
        .collect()
}

fn build_zip(entries: Vec<(String, Bytes)>) -> zip::result::ZipResult<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, data) in entries {
        writer.start_file(name, options)?;
        writer.write_all(&data)?;
    }
    Ok(writer.finish()?.into_inner())
}

fn content_type_for(key: &str) -> &'static str {
    let lower = key.to_ascii_lowercase();
    if lower.ends_with(".mp4") {
        "video/mp4"
    } else if lower.ends_with(".webm") {
        "video/webm"
    } else if lower.ends_with(".mov") {
        "video/quicktime"
    } else if lower.ends_with(".avi") {
        "video/x-msvideo"
    } else if lower.ends_with(".mkv") {
        "video/x-matroska"
    } else {
        "application/octet-stream"
    }
}
