//! Sampled frame decoding.
//!
//! Frames are decoded by an FFmpeg child process that resamples the source to
//! the requested rate and resolution and writes packed `rgb24` to stdout.
//! A `FrameReader` owns its process exclusively, so concurrent shot workers
//! each open their own reader.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use image::RgbImage;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use reframe_models::TimeRange;

use crate::command::{check_ffmpeg, filter_stderr, FfmpegCommand};
use crate::error::{MediaError, MediaResult};

/// One decoded, downscaled frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Source timestamp in seconds
    pub time: f64,
    /// Sample index within the reader
    pub index: u64,
    pub image: RgbImage,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Decode size for a source, scaled to `target_height` with even dimensions.
///
/// Sources smaller than the target are not upscaled.
pub fn analysis_size(src_width: u32, src_height: u32, target_height: u32) -> (u32, u32) {
    let height = (target_height.min(src_height) / 2 * 2).max(2);
    let half_width = src_width as f64 * height as f64 / src_height.max(1) as f64 / 2.0;
    let width = (half_width.round() as u32 * 2).max(2);
    (width, height)
}

/// Streaming reader of sampled frames over a time range.
pub struct FrameReader {
    path: PathBuf,
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr_task: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    sample_rate: f64,
    range: TimeRange,
    next_index: u64,
}

impl FrameReader {
    /// Start decoding `range` of `path` at `sample_rate` frames per second.
    pub async fn open(
        path: impl AsRef<Path>,
        range: TimeRange,
        sample_rate: f64,
        width: u32,
        height: u32,
    ) -> MediaResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(MediaError::video_open(path, "file not found"));
        }
        if sample_rate <= 0.0 || range.duration() <= 0.0 {
            return Err(MediaError::internal(format!(
                "invalid frame sampling: rate {} over {:.3}s",
                sample_rate,
                range.duration()
            )));
        }
        check_ffmpeg()?;

        let args = FfmpegCommand::new(path, "pipe:1")
            .log_level("error")
            .seek(range.start)
            .duration(range.duration())
            .output_args(["-an", "-sn"])
            .video_filter(format!(
                "fps={},scale={}:{}:flags=area",
                sample_rate, width, height
            ))
            .output_args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .build_args();

        debug!(path = %path.display(), start = range.start, end = range.end, sample_rate, width, height, "Opening frame reader");

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MediaError::video_open(path, format!("failed to spawn ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::internal("ffmpeg stdout not captured"))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut raw = String::new();
                let _ = stderr.read_to_string(&mut raw).await;
                raw
            })
        });

        Ok(Self {
            path: path.to_path_buf(),
            child,
            stdout: BufReader::with_capacity(1 << 20, stdout),
            stderr_task,
            width,
            height,
            sample_rate,
            range,
            next_index: 0,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Read the next frame, `Ok(None)` at the end of the range.
    ///
    /// If the decoder exits with an error before producing any frame the
    /// source is considered unreadable.
    pub async fn next_frame(&mut self) -> MediaResult<Option<Frame>> {
        let time = self.range.start + self.next_index as f64 / self.sample_rate;
        if time >= self.range.end {
            return Ok(None);
        }

        let frame_bytes = self.width as usize * self.height as usize * 3;
        let mut buf = vec![0u8; frame_bytes];
        match self.stdout.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return self.finish_stream().await;
            }
            Err(e) => return Err(e.into()),
        }

        let image = RgbImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| MediaError::internal("decoded frame has unexpected size"))?;
        let index = self.next_index;
        self.next_index += 1;

        Ok(Some(Frame { time, index, image }))
    }

    async fn finish_stream(&mut self) -> MediaResult<Option<Frame>> {
        let status = self.child.wait().await?;
        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() && self.next_index == 0 {
            return Err(MediaError::video_open(
                &self.path,
                format!("decoder exited with {:?}: {}", status.code(), filter_stderr(&stderr)),
            ));
        }
        Ok(None)
    }

    /// Stop decoding and reap the child process.
    pub async fn close(mut self) {
        let _ = self.child.kill().await;
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}
