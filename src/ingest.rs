//! Video ingestion pipeline.
//!
//! Registers the video, uploads the raw file, then decodes frames on the
//! calling task and fans each one out to a bounded set of workers. A worker
//! analyzes the frame, uploads it as JPEG and records frame + metadata in one
//! transaction. Per-frame failures are counted, not fatal; the video's
//! storage path and frame count are only written once every dispatched unit
//! has finished.

use bytes::Bytes;
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::analysis::FrameAnalyzer;
use crate::catalog::Catalog;
use crate::constants::FRAME_JPEG_QUALITY;
use crate::decoder::FrameDecoder;
use crate::error::{Error, Result};
use crate::models::NewFrame;
use crate::storage::{self, ObjectStore};

/// Pipeline states. `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Received,
    VideoRegistered,
    VideoUploaded,
    FramesDecoding,
    FramesProcessing,
    Finalized,
    Failed,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestStage::Received => "RECEIVED",
            IngestStage::VideoRegistered => "VIDEO_REGISTERED",
            IngestStage::VideoUploaded => "VIDEO_UPLOADED",
            IngestStage::FramesDecoding => "FRAMES_DECODING",
            IngestStage::FramesProcessing => "FRAMES_PROCESSING",
            IngestStage::Finalized => "FINALIZED",
            IngestStage::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Outcome of a finalized ingest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub video_id: i64,
    pub dispatched: usize,
    pub persisted: usize,
    pub failed: usize,
}

pub struct Ingestor {
    catalog: Arc<dyn Catalog>,
    store: ObjectStore,
    decoder: Arc<dyn FrameDecoder>,
    analyzer: Arc<dyn FrameAnalyzer>,
    concurrency: usize,
    drain_timeout: Duration,
}

/// Observation post: the file name up to its first underscore, or the whole
/// name when there is none.
pub fn observation_post_name(filename: &str) -> &str {
    filename
        .split_once('_')
        .map(|(post, _)| post)
        .unwrap_or(filename)
}

impl Ingestor {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: ObjectStore,
        decoder: Arc<dyn FrameDecoder>,
        analyzer: Arc<dyn FrameAnalyzer>,
    ) -> Self {
        Self {
            catalog,
            store,
            decoder,
            analyzer,
            concurrency: crate::constants::DEFAULT_INGEST_CONCURRENCY,
            drain_timeout: Duration::from_secs(crate::constants::DEFAULT_DRAIN_TIMEOUT_SECS),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Run the whole pipeline for a local video file.
    ///
    /// Cancelling `cancel` stops decoding; in-flight frames get up to the
    /// drain timeout to finish and the video is left unfinalized.
    pub async fn ingest(&self, path: &Path, cancel: CancellationToken) -> Result<IngestReport> {
        let started = Instant::now();
        let mut stage = IngestStage::Received;
        tracing::info!(path = %path.display(), "Ingesting video");

        match self.run(path, &cancel, &mut stage).await {
            Ok(report) => {
                tracing::info!(
                    video_id = report.video_id,
                    persisted = report.persisted,
                    failed = report.failed,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "Ingested video"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    stage = %stage,
                    error = %e,
                    "Ingest failed"
                );
                advance(&mut stage, IngestStage::Failed, None);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        path: &Path,
        cancel: &CancellationToken,
        stage: &mut IngestStage,
    ) -> Result<IngestReport> {
        let filename = validate_source(path).await?;

        let video_id = self
            .catalog
            .create_video(observation_post_name(&filename))
            .await?;
        advance(stage, IngestStage::VideoRegistered, Some(video_id));

        // The row stays incomplete (null path) if anything below fails.
        let video_key = storage::video_key(video_id, &filename);
        self.store.put_file(&video_key, path).await?;
        advance(stage, IngestStage::VideoUploaded, Some(video_id));

        let mut frames = self.decoder.open(path).await?;
        advance(stage, IngestStage::FramesDecoding, Some(video_id));

        let ctx = FrameContext {
            catalog: self.catalog.clone(),
            store: self.store.clone(),
            analyzer: self.analyzer.clone(),
            video_id,
            frames_dir: storage::frames_dir(video_id, &filename).into(),
        };
        let mut tasks: JoinSet<(i32, Result<i64>)> = JoinSet::new();
        let mut tally = Tally::new(video_id);
        let mut stop = Stop::Exhausted;

        'decode: loop {
            while tasks.len() >= self.concurrency {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        stop = Stop::Cancelled;
                        break 'decode;
                    }
                    joined = tasks.join_next() => {
                        if let Some(joined) = joined {
                            tally.record(joined);
                        }
                    }
                }
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stop = Stop::Cancelled;
                    break;
                }
                next = frames.next() => next,
            };

            let (index, image) = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    stop = Stop::Failed(e.into());
                    break;
                }
            };
            let Ok(frame_index) = i32::try_from(index) else {
                stop = Stop::Failed(Error::Internal(format!(
                    "frame index {} exceeds the supported range",
                    index
                )));
                break;
            };

            if tally.dispatched == 0 {
                advance(stage, IngestStage::FramesProcessing, Some(video_id));
            }
            tally.dispatched += 1;
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let result = process_frame(ctx, frame_index, image).await;
                (frame_index, result)
            });
        }

        tracing::debug!(
            video_id,
            decoded = frames.yielded(),
            in_flight = tasks.len(),
            "Decoding stopped"
        );
        // Release the decoder before waiting on workers.
        drop(frames);

        match stop {
            Stop::Exhausted => tally.drain(&mut tasks).await,
            Stop::Failed(e) => {
                tally.drain(&mut tasks).await;
                return Err(e);
            }
            Stop::Cancelled => {
                if tokio::time::timeout(self.drain_timeout, tally.drain(&mut tasks))
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        video_id,
                        abandoned = tasks.len(),
                        "Drain timeout elapsed, abandoning in-flight frames"
                    );
                    tasks.shutdown().await;
                }
                return Err(Error::Cancelled { video_id });
            }
        }

        let frame_count = i32::try_from(tally.persisted).map_err(|_| {
            Error::Internal(format!("{} frames overflow frame_count", tally.persisted))
        })?;
        self.catalog
            .finalize_video(video_id, &video_key, frame_count)
            .await?;
        advance(stage, IngestStage::Finalized, Some(video_id));

        Ok(IngestReport {
            video_id,
            dispatched: tally.dispatched,
            persisted: tally.persisted,
            failed: tally.failed,
        })
    }
}

fn advance(stage: &mut IngestStage, next: IngestStage, video_id: Option<i64>) {
    tracing::debug!(video_id, from = %stage, to = %next, "Ingest stage");
    *stage = next;
}

enum Stop {
    Exhausted,
    Cancelled,
    Failed(Error),
}

/// Check the request path names a readable regular file; returns its name.
async fn validate_source(path: &Path) -> Result<String> {
    if path.as_os_str().is_empty() {
        return Err(Error::Validation("path is empty".to_string()));
    }

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::Validation(format!("cannot read {}: {}", path.display(), e)))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|e| Error::Validation(format!("cannot stat {}: {}", path.display(), e)))?;
    if !metadata.is_file() {
        return Err(Error::Validation(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Validation(format!("{} has no UTF-8 file name", path.display()))
        })
}

#[derive(Clone)]
struct FrameContext {
    catalog: Arc<dyn Catalog>,
    store: ObjectStore,
    analyzer: Arc<dyn FrameAnalyzer>,
    video_id: i64,
    frames_dir: Arc<str>,
}

/// Analyze, encode, upload and record a single frame.
async fn process_frame(ctx: FrameContext, frame_index: i32, image: RgbImage) -> Result<i64> {
    let analyzer = ctx.analyzer.clone();
    let (analysis, jpeg) = tokio::task::spawn_blocking(move || {
        let analysis = analyzer.analyze(&image);
        encode_jpeg(&image).map(|jpeg| (analysis, jpeg))
    })
    .await
    .map_err(|e| Error::Internal(format!("frame worker panicked: {}", e)))?
    .map_err(|e| Error::Internal(format!("frame {} encode failed: {}", frame_index, e)))?;

    let key = storage::frame_key(&ctx.frames_dir, frame_index);
    ctx.store.put(&key, Bytes::from(jpeg)).await?;

    let frame = NewFrame {
        video_id: ctx.video_id,
        frame_index,
        os_filepath: key,
        analysis,
    };
    ctx.catalog
        .create_frame_with_metadata(&frame)
        .await
        .map_err(|e| {
            tracing::warn!(
                video_id = ctx.video_id,
                frame_index,
                key = %frame.os_filepath,
                "Frame image stored without a frame record"
            );
            Error::from(e)
        })
}

pub(crate) fn encode_jpeg(image: &RgbImage) -> image::ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, FRAME_JPEG_QUALITY).encode_image(image)?;
    Ok(buf)
}

/// Running count of frame units for one ingest
struct Tally {
    video_id: i64,
    dispatched: usize,
    persisted: usize,
    failed: usize,
}

impl Tally {
    fn new(video_id: i64) -> Self {
        Self {
            video_id,
            dispatched: 0,
            persisted: 0,
            failed: 0,
        }
    }

    fn record(&mut self, joined: std::result::Result<(i32, Result<i64>), JoinError>) {
        match joined {
            Ok((_, Ok(_))) => self.persisted += 1,
            Ok((frame_index, Err(e))) => {
                self.failed += 1;
                tracing::warn!(
                    video_id = self.video_id,
                    frame_index,
                    error = %e,
                    "Frame failed"
                );
            }
            Err(e) => {
                self.failed += 1;
                tracing::error!(video_id = self.video_id, error = %e, "Frame task panicked");
            }
        }
    }

    async fn drain(&mut self, tasks: &mut JoinSet<(i32, Result<i64>)>) {
        while let Some(joined) = tasks.join_next().await {
            self.record(joined);
        }
    }
}
