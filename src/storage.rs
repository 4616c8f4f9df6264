//! Object storage for raw videos and frame images.
//!
//! Keys are path-like strings (`/videos/..`, `/frames/..`). Two backends share
//! one type: a local directory for development and tests, and Google Cloud
//! Storage for deployments.

use bytes::Bytes;
use google_cloud_storage::client::Storage;
use std::path::{Component, Path, PathBuf};

use crate::constants::FRAME_EXTENSION;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object {key} does not exist")]
    Missing { key: String },

    #[error("invalid object key {key:?}")]
    InvalidKey { key: String },

    #[error("I/O error on object {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage backend error on object {key}: {message}")]
    Backend { key: String, message: String },
}

/// Object store handle. Cheap to clone.
#[derive(Clone)]
pub enum ObjectStore {
    Local { root: PathBuf },
    Gcs { client: Storage, bucket: String },
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectStore::Local { root } => f.debug_struct("Local").field("root", root).finish(),
            ObjectStore::Gcs { bucket, .. } => {
                f.debug_struct("Gcs").field("bucket", bucket).finish()
            }
        }
    }
}

impl ObjectStore {
    pub fn local(root: impl Into<PathBuf>) -> Self {
        ObjectStore::Local { root: root.into() }
    }

    pub fn gcs(client: Storage, bucket: impl Into<String>) -> Self {
        ObjectStore::Gcs {
            client,
            bucket: bucket.into(),
        }
    }

    /// Upload `data` under `key`, replacing any existing object.
    pub async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        match self {
            ObjectStore::Local { root } => {
                let full_path = local_path(root, key)?;
                if let Some(parent) = full_path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| io_error(key, e))?;
                }
                tokio::fs::write(&full_path, &data)
                    .await
                    .map_err(|e| io_error(key, e))?;
            }
            ObjectStore::Gcs { client, bucket } => {
                let bucket = bucket_path(bucket);
                client
                    .write_object(&bucket, key, data)
                    .send_buffered()
                    .await
                    .map_err(|e| backend_error(key, e))?;
            }
        }
        tracing::debug!(key, "Stored object");
        Ok(())
    }

    /// Upload a local file under `key`.
    pub async fn put_file(&self, key: &str, source: &Path) -> Result<(), StorageError> {
        match self {
            ObjectStore::Local { root } => {
                let full_path = local_path(root, key)?;
                if let Some(parent) = full_path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| io_error(key, e))?;
                }
                tokio::fs::copy(source, &full_path)
                    .await
                    .map_err(|e| io_error(key, e))?;
                tracing::debug!(key, source = %source.display(), "Stored file");
                Ok(())
            }
            ObjectStore::Gcs { .. } => {
                let data = tokio::fs::read(source)
                    .await
                    .map_err(|e| io_error(key, e))?;
                self.put(key, Bytes::from(data)).await
            }
        }
    }

    /// Fetch the object stored under `key`.
    pub async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        match self {
            ObjectStore::Local { root } => {
                let full_path = local_path(root, key)?;
                match tokio::fs::read(&full_path).await {
                    Ok(data) => Ok(Bytes::from(data)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Err(StorageError::Missing {
                            key: key.to_string(),
                        })
                    }
                    Err(e) => Err(io_error(key, e)),
                }
            }
            ObjectStore::Gcs { client, bucket } => {
                let bucket = bucket_path(bucket);
                let mut resp = client
                    .read_object(&bucket, key)
                    .send()
                    .await
                    .map_err(|e| backend_error(key, e))?;
                let mut data = Vec::new();
                while let Some(chunk) = resp.next().await {
                    data.extend_from_slice(&chunk.map_err(|e| backend_error(key, e))?);
                }
                Ok(Bytes::from(data))
            }
        }
    }
}

/// Key of a raw video: `/videos/{video_id}_{filename}`
pub fn video_key(video_id: i64, filename: &str) -> String {
    format!("/videos/{}_{}", video_id, filename)
}

/// Directory holding all frames of one video: `/frames/{video_id}_{filename}`
pub fn frames_dir(video_id: i64, filename: &str) -> String {
    format!("/frames/{}_{}", video_id, filename)
}

/// Key of a single frame image inside a frames directory
pub fn frame_key(frames_dir: &str, frame_index: i32) -> String {
    format!("{}/frame_{}.{}", frames_dir, frame_index, FRAME_EXTENSION)
}

/// Last path segment of a key, used for download filenames and archive entries
pub fn key_basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

fn bucket_path(bucket: &str) -> String {
    format!("projects/_/buckets/{}", bucket)
}

/// Resolve a key under the local root. Leading slashes are relative to the
/// root; parent-directory components are rejected.
fn local_path(root: &Path, key: &str) -> Result<PathBuf, StorageError> {
    let relative = Path::new(key.trim_start_matches('/'));
    let valid = !key.contains('\0')
        && relative.components().next().is_some()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(root.join(relative))
}

fn io_error(key: &str, source: std::io::Error) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        source,
    }
}

fn backend_error(key: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend {
        key: key.to_string(),
        message: e.to_string(),
    }
}
