//! In-memory doubles for the catalog, decoder and analyzer.

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::analysis::FrameAnalyzer;
use crate::catalog::{Catalog, CatalogError};
use crate::decoder::{DecodeError, FrameDecoder, FrameSource, Frames};
use crate::models::{Frame, FrameAnalysis, FrameMetadata, NewFrame, Video};

#[derive(Default)]
struct MemoryState {
    videos: Vec<Video>,
    metadata: Vec<FrameMetadata>,
    frames: Vec<Frame>,
}

/// Catalog kept in a mutex, with optional failure injection for one frame index.
#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<MemoryState>,
    fail_frame_index: Option<i32>,
}

impl MemoryCatalog {
    pub fn failing_at(frame_index: i32) -> Self {
        Self {
            fail_frame_index: Some(frame_index),
            ..Self::default()
        }
    }

    pub fn metadata(&self, metadata_id: i64) -> Option<FrameMetadata> {
        let state = self.state.lock().unwrap();
        state.metadata.iter().find(|m| m.id == metadata_id).cloned()
    }

    pub fn metadata_count(&self) -> usize {
        self.state.lock().unwrap().metadata.len()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn create_video(&self, observation_post_name: &str) -> Result<i64, CatalogError> {
        let mut state = self.state.lock().unwrap();
        let id = state.videos.len() as i64 + 1;
        state.videos.push(Video {
            id,
            observation_post_name: observation_post_name.to_string(),
            os_filepath: None,
            frame_count: None,
        });
        Ok(id)
    }

    async fn finalize_video(
        &self,
        video_id: i64,
        os_filepath: &str,
        frame_count: i32,
    ) -> Result<(), CatalogError> {
        let mut state = self.state.lock().unwrap();
        let video = state
            .videos
            .iter_mut()
            .find(|v| v.id == video_id)
            .ok_or(CatalogError::NotFound {
                entity: "video",
                id: video_id,
            })?;
        video.os_filepath = Some(os_filepath.to_string());
        video.frame_count = Some(frame_count);
        Ok(())
    }

    async fn create_frame_with_metadata(&self, frame: &NewFrame) -> Result<i64, CatalogError> {
        if self.fail_frame_index == Some(frame.frame_index) {
            return Err(CatalogError::Database(sqlx::Error::Protocol(
                "injected failure".to_string(),
            )));
        }

        let mut state = self.state.lock().unwrap();
        if !state.videos.iter().any(|v| v.id == frame.video_id) {
            return Err(CatalogError::ForeignKey {
                video_id: frame.video_id,
            });
        }
        if state
            .frames
            .iter()
            .any(|f| f.video_id == frame.video_id && f.frame_index == frame.frame_index)
        {
            return Err(CatalogError::DuplicateFrame {
                video_id: frame.video_id,
                frame_index: frame.frame_index,
            });
        }

        let metadata_id = state.metadata.len() as i64 + 1;
        state.metadata.push(FrameMetadata {
            id: metadata_id,
            is_threat: frame.analysis.is_threat,
            fov: frame.analysis.fov,
            azimuth: frame.analysis.azimuth,
            elevation: frame.analysis.elevation,
        });
        let frame_id = state.frames.len() as i64 + 1;
        state.frames.push(Frame {
            id: frame_id,
            video_id: frame.video_id,
            metadata_id,
            os_filepath: frame.os_filepath.clone(),
            frame_index: frame.frame_index,
        });
        Ok(frame_id)
    }

    async fn list_video_paths(&self) -> Result<Vec<String>, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .videos
            .iter()
            .filter_map(|v| v.os_filepath.clone())
            .collect())
    }

    async fn list_incomplete_videos(&self) -> Result<Vec<i64>, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .videos
            .iter()
            .filter(|v| v.os_filepath.is_none())
            .map(|v| v.id)
            .collect())
    }

    async fn get_video(&self, video_id: i64) -> Result<Option<Video>, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state.videos.iter().find(|v| v.id == video_id).cloned())
    }

    async fn list_frames(&self, video_id: i64) -> Result<Vec<Frame>, CatalogError> {
        let state = self.state.lock().unwrap();
        let mut frames: Vec<Frame> = state
            .frames
            .iter()
            .filter(|f| f.video_id == video_id)
            .cloned()
            .collect();
        frames.sort_by_key(|f| f.frame_index);
        Ok(frames)
    }

    async fn get_frame_by_index(
        &self,
        video_id: i64,
        frame_index: i32,
    ) -> Result<Option<Frame>, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .frames
            .iter()
            .find(|f| f.video_id == video_id && f.frame_index == frame_index)
            .cloned())
    }

    async fn list_threat_frames(&self, video_id: i64) -> Result<Vec<Frame>, CatalogError> {
        let state = self.state.lock().unwrap();
        let mut frames: Vec<Frame> = state
            .frames
            .iter()
            .filter(|f| f.video_id == video_id)
            .filter(|f| {
                state
                    .metadata
                    .iter()
                    .any(|m| m.id == f.metadata_id && m.is_threat)
            })
            .cloned()
            .collect();
        frames.sort_by_key(|f| f.frame_index);
        Ok(frames)
    }
}

/// Decoder producing `frames` synthetic frames. Each frame's top-left red
/// channel carries its index so analyzers can tell frames apart.
#[derive(Debug, Clone)]
pub struct StubDecoder {
    pub frames: usize,
    pub width: u32,
    pub height: u32,
    pub fail_at: Option<usize>,
}

impl StubDecoder {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            width: 16,
            height: 9,
            fail_at: None,
        }
    }
}

#[async_trait]
impl FrameDecoder for StubDecoder {
    async fn open(&self, _path: &Path) -> Result<Frames, DecodeError> {
        Ok(Frames::new(Box::new(StubSource {
            decoder: self.clone(),
            position: 0,
        })))
    }
}

struct StubSource {
    decoder: StubDecoder,
    position: usize,
}

#[async_trait]
impl FrameSource for StubSource {
    async fn next_frame(&mut self) -> Result<Option<RgbImage>, DecodeError> {
        if self.decoder.fail_at == Some(self.position) {
            return Err(DecodeError::Truncated {
                index: self.position,
                got: 0,
                expected: 1,
            });
        }
        if self.position >= self.decoder.frames {
            return Ok(None);
        }
        let (width, height) = (self.decoder.width, self.decoder.height);
        let mut image = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
        image.put_pixel(0, 0, Rgb([self.position as u8, 0, 0]));
        self.position += 1;
        Ok(Some(image))
    }
}

/// Tags frames whose encoded index (see [`StubDecoder`]) is odd.
pub struct OddFrameAnalyzer;

impl FrameAnalyzer for OddFrameAnalyzer {
    fn analyze(&self, frame: &RgbImage) -> FrameAnalysis {
        let index = frame.get_pixel(0, 0).0[0];
        FrameAnalysis {
            is_threat: index % 2 == 1,
            fov: 60.0,
            azimuth: f64::from(index),
            elevation: -f64::from(index),
        }
    }
}

/// Wraps [`OddFrameAnalyzer`] with a per-frame delay and a gate that holds
/// every call until opened. Counts calls and the peak number running at once.
pub struct GatedAnalyzer {
    delay: Duration,
    open: AtomicBool,
    started: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl GatedAnalyzer {
    /// Gate open; each call sleeps for `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self::new(delay, true)
    }

    /// Gate closed; calls block until [`GatedAnalyzer::open`].
    pub fn closed() -> Self {
        Self::new(Duration::ZERO, false)
    }

    fn new(delay: Duration, open: bool) -> Self {
        Self {
            delay,
            open: AtomicBool::new(open),
            started: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Resolve once at least `count` calls have begun.
    pub async fn wait_started(&self, count: usize) {
        while self.started() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl FrameAnalyzer for GatedAnalyzer {
    fn analyze(&self, frame: &RgbImage) -> FrameAnalysis {
        self.started.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        std::thread::sleep(self.delay);
        while !self.open.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        OddFrameAnalyzer.analyze(frame)
    }
}
