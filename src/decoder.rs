//! Video decoding.
//!
//! Frames are pulled one at a time from a single owner. `FfmpegDecoder` runs
//! `ffprobe` for the stream dimensions, then streams raw RGB24 frames from an
//! `ffmpeg` child process. The child is killed when the stream is dropped, so
//! the video handle is released whether iteration finishes or is abandoned.

use async_trait::async_trait;
use image::RgbImage;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("cannot open video {path:?}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("no decodable video stream in {path:?}")]
    NoVideoStream { path: PathBuf },

    #[error("frame {index} truncated: got {got} of {expected} bytes")]
    Truncated {
        index: usize,
        got: usize,
        expected: usize,
    },

    #[error("decoder exited with {status}: {stderr}")]
    Exit { status: ExitStatus, stderr: String },

    #[error("decoder I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens a video resource for sequential decoding.
#[async_trait]
pub trait FrameDecoder: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Frames, DecodeError>;
}

/// Source of raw frames in presentation order.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the resource reports no further frames.
    async fn next_frame(&mut self) -> Result<Option<RgbImage>, DecodeError>;
}

/// Decoded frame sequence paired with zero-based indices.
///
/// Fused: after the end of the stream or the first error it keeps returning
/// `None`. Not restartable; open the video again to re-read it.
pub struct Frames {
    source: Box<dyn FrameSource>,
    next_index: usize,
    done: bool,
}

impl Frames {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self {
            source,
            next_index: 0,
            done: false,
        }
    }

    pub async fn next(&mut self) -> Result<Option<(usize, RgbImage)>, DecodeError> {
        if self.done {
            return Ok(None);
        }
        match self.source.next_frame().await {
            Ok(Some(frame)) => {
                let index = self.next_index;
                self.next_index += 1;
                Ok(Some((index, frame)))
            }
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    /// Number of frames yielded so far.
    pub fn yielded(&self) -> usize {
        self.next_index
    }
}

/// ffmpeg-backed decoder
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    threads: usize,
}

impl FfmpegDecoder {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }
}

#[async_trait]
impl FrameDecoder for FfmpegDecoder {
    async fn open(&self, path: &Path) -> Result<Frames, DecodeError> {
        let is_file = tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(DecodeError::Open {
                path: path.to_path_buf(),
                reason: "not a readable file".to_string(),
            });
        }

        let (width, height) = probe_dimensions(path).await?;

        let mut child = Command::new("ffmpeg")
            .args(decode_args(path, self.threads))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DecodeError::Open {
                path: path.to_path_buf(),
                reason: format!("failed to start ffmpeg: {}", e),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| DecodeError::Open {
            path: path.to_path_buf(),
            reason: "ffmpeg stdout unavailable".to_string(),
        })?;
        let stderr = child.stderr.take().map(collect_stderr);

        tracing::debug!(path = %path.display(), width, height, "Opened video");

        Ok(Frames::new(Box::new(FfmpegFrames {
            child,
            stdout: BufReader::new(stdout),
            stderr,
            width,
            height,
            frame_len: width as usize * height as usize * 3,
            index: 0,
        })))
    }
}

struct FfmpegFrames {
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    frame_len: usize,
    index: usize,
}

impl FfmpegFrames {
    async fn finish(&mut self) -> Result<(), DecodeError> {
        let status = self.child.wait().await?;
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            return Err(DecodeError::Exit {
                status,
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSource for FfmpegFrames {
    async fn next_frame(&mut self) -> Result<Option<RgbImage>, DecodeError> {
        let mut buf = vec![0u8; self.frame_len];
        let filled = read_full(&mut self.stdout, &mut buf).await?;

        if filled == 0 {
            self.finish().await?;
            return Ok(None);
        }
        if filled < self.frame_len {
            return Err(DecodeError::Truncated {
                index: self.index,
                got: filled,
                expected: self.frame_len,
            });
        }

        self.index += 1;
        // Buffer length equals width * height * 3, so from_raw cannot fail.
        Ok(RgbImage::from_raw(self.width, self.height, buf))
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// ffmpeg arguments streaming raw RGB24 frames to stdout.
///
/// Display-matrix rotation is disabled so frames keep the coded dimensions
/// that ffprobe reports.
fn decode_args(path: &Path, threads: usize) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push("-threads".into());
    args.push(threads.to_string().into());
    args.push("-noautorotate".into());
    args.push("-i".into());
    args.push(path.as_os_str().to_owned());
    args.extend(
        ["-an", "-sn", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"]
            .into_iter()
            .map(OsString::from),
    );
    args
}

fn collect_stderr(mut stderr: tokio::process::ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut out = String::new();
        let _ = stderr.read_to_string(&mut out).await;
        out
    })
}

async fn probe_dimensions(path: &Path) -> Result<(u32, u32), DecodeError> {
    let output = Command::new("ffprobe")
        .args(["-v", "error"])
        .args(["-select_streams", "v:0"])
        .args(["-show_entries", "stream=width,height"])
        .args(["-of", "csv=s=x:p=0"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| DecodeError::Open {
            path: path.to_path_buf(),
            reason: format!("failed to run ffprobe: {}", e),
        })?;

    if !output.status.success() {
        return Err(DecodeError::Open {
            path: path.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_dimensions(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        DecodeError::NoVideoStream {
            path: path.to_path_buf(),
        }
    })
}

/// Parse ffprobe `csv=s=x:p=0` output such as `1920x1080`.
fn parse_dimensions(output: &str) -> Option<(u32, u32)> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut parts = line.split('x').filter(|p| !p.is_empty());
    let width: u32 = parts.next()?.trim().parse().ok()?;
    let height: u32 = parts.next()?.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn test_parse_dimensions() {
        assert_eq!(parse_dimensions("1920x1080\n"), Some((1920, 1080)));
        assert_eq!(parse_dimensions("640x480x\n"), Some((640, 480)));
        assert_eq!(parse_dimensions("\n  320x240  \n"), Some((320, 240)));
        assert_eq!(parse_dimensions(""), None);
        assert_eq!(parse_dimensions("0x0"), None);
        assert_eq!(parse_dimensions("N/AxN/A"), None);
    }

    #[test]
    fn test_decode_args_keep_coded_orientation() {
        let args = decode_args(Path::new("/data/outpostA_phone.mp4"), 2);
        let position = |flag: &str| args.iter().position(|a| a == flag).unwrap();

        // Input options only apply when they precede -i.
        assert!(position("-noautorotate") < position("-i"));
        assert_eq!(args[position("-i") + 1], "/data/outpostA_phone.mp4");
        assert_eq!(args[position("-threads") + 1], "2");
        assert_eq!(args[position("-pix_fmt") + 1], "rgb24");
        assert_eq!(args.last().unwrap(), "-");
    }

    #[tokio::test]
    async fn test_read_full_stops_at_eof() {
        let data: &[u8] = &[1, 2, 3, 4, 5];
        let mut reader = data;
        let mut buf = [0u8; 4];
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 4);
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 1);
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let decoder = FfmpegDecoder::new(1);
        let err = decoder
            .open(Path::new("/definitely/not/here.mp4"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DecodeError::Open { .. }));
    }

    struct Scripted(VecDeque<Result<Option<RgbImage>, DecodeError>>);

    #[async_trait]
    impl FrameSource for Scripted {
        async fn next_frame(&mut self) -> Result<Option<RgbImage>, DecodeError> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    #[tokio::test]
    async fn test_frames_indexes_and_fuses() {
        let frame = RgbImage::new(2, 2);
        let mut frames = Frames::new(Box::new(Scripted(VecDeque::from(vec![
            Ok(Some(frame.clone())),
            Ok(Some(frame.clone())),
            Err(DecodeError::Truncated {
                index: 2,
                got: 1,
                expected: 12,
            }),
            Ok(Some(frame)),
        ]))));

        assert_eq!(frames.next().await.unwrap().unwrap().0, 0);
        assert_eq!(frames.next().await.unwrap().unwrap().0, 1);
        assert!(frames.next().await.is_err());
        assert!(frames.next().await.unwrap().is_none());
        assert_eq!(frames.yielded(), 2);
    }
}
