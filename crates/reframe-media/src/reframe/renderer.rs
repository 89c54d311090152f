//! FFmpeg-based rendering of reframed videos.
//!
//! Converts crop windows into FFmpeg commands. Near-constant crops render as
//! one static crop; otherwise windows are grouped into fixed-crop segments
//! that are encoded independently and concatenated with stream copy.

use std::path::Path;
use std::sync::Arc;

use metrics::counter;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use reframe_models::{AspectRatio, CropWindow, TimeRange};

use super::config::ReframeConfig;
use super::filters::{crop_scale_filter, letterbox_filter, letterbox_size, output_size, segment_filter, LETTERBOX_OUTPUT};
use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};

/// Crop ranges below this fraction of the average width count as static.
const STATIC_TOLERANCE: f64 = 0.05;

/// How an aspect ratio was rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStrategy {
    /// One crop for the whole range
    Static,
    /// Fixed-crop segments concatenated together
    Segmented { segments: usize },
}

impl RenderStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            RenderStrategy::Static => "static",
            RenderStrategy::Segmented { segments: 1 } => "single_segment",
            RenderStrategy::Segmented { .. } => "segmented",
        }
    }
}

/// A time range rendered with one fixed crop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropSegment {
    /// Start time in source seconds
    pub start: f64,
    /// End time in source seconds
    pub end: f64,
    pub crop: CropWindow,
}

impl CropSegment {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Renderer for reframed videos.
#[derive(Debug, Clone)]
pub struct Renderer {
    preset: String,
    crf: u8,
    audio_bitrate: String,
    group_threshold: f64,
    letterbox_blur: bool,
    letterbox_blur_sigma: f64,
    output_even_dims: bool,
    runner: FfmpegRunner,
    encode_limit: Option<Arc<Semaphore>>,
}

impl Renderer {
    pub fn new(config: &ReframeConfig) -> Self {
        Self {
            preset: config.render_preset.clone(),
            crf: config.render_crf,
            audio_bitrate: config.audio_bitrate.clone(),
            group_threshold: config.group_threshold,
            letterbox_blur: config.letterbox_blur,
            letterbox_blur_sigma: config.letterbox_blur_sigma,
            output_even_dims: config.output_even_dims,
            runner: FfmpegRunner::new(),
            encode_limit: None,
        }
    }

    /// Bound concurrent FFmpeg encodes; a permit is held for each invocation.
    pub fn with_encode_limit(mut self, limit: Arc<Semaphore>) -> Self {
        self.encode_limit = Some(limit);
        self
    }

    /// Render one aspect ratio's crop windows over `range` into `output`.
    ///
    /// Failures are reported as [`MediaError::Render`] tagged with `aspect`.
    pub async fn render(
        &self,
        input: &Path,
        output: &Path,
        aspect: AspectRatio,
        windows: &[CropWindow],
        range: TimeRange,
        resolution: Option<(u32, u32)>,
    ) -> MediaResult<RenderStrategy> {
        self.render_inner(input, output, aspect, windows, range, resolution)
            .await
            .map_err(|e| e.for_aspect(aspect))
    }

    async fn render_inner(
        &self,
        input: &Path,
        output: &Path,
        aspect: AspectRatio,
        windows: &[CropWindow],
        range: TimeRange,
        resolution: Option<(u32, u32)>,
    ) -> MediaResult<RenderStrategy> {
        if windows.is_empty() {
            return Err(MediaError::InvalidVideo("No crop windows to render".to_string()));
        }
        if range.duration() <= 0.0 {
            return Err(MediaError::InvalidVideo(format!(
                "Empty render range {:.3}-{:.3}",
                range.start, range.end
            )));
        }

        let overall = median_crop(windows);
        let (out_w, out_h) = self.output_dimensions(aspect, &overall, resolution);

        let strategy = if is_static_crop(windows) {
            debug!(crop = ?overall, "Using static crop rendering");
            let segment = CropSegment {
                start: range.start,
                end: range.end,
                crop: overall,
            };
            self.encode(input, output, &segment, out_w, out_h, false, "static crop encode")
                .await?;
            RenderStrategy::Static
        } else {
            let segments = group_segments(windows, self.group_threshold, range);
            if segments.len() == 1 {
                debug!("Crop windows form a single segment");
                self.encode(input, output, &segments[0], out_w, out_h, false, "segment encode")
                    .await?;
            } else {
                info!(
                    segments = segments.len(),
                    duration = range.duration(),
                    "Rendering {} crop segments",
                    segments.len()
                );
                self.render_and_concat(input, output, &segments, out_w, out_h).await?;
            }
            RenderStrategy::Segmented {
                segments: segments.len(),
            }
        };

        counter!("reframe_renders_total", "strategy" => strategy.label()).increment(1);
        Ok(strategy)
    }

    /// Output frame size; letterboxed renders use a canvas of the target aspect.
    pub fn output_dimensions(&self, aspect: AspectRatio, crop: &CropWindow, resolution: Option<(u32, u32)>) -> (u32, u32) {
        if self.letterbox_blur {
            letterbox_size(crop, aspect, resolution, self.output_even_dims)
        } else {
            output_size(crop, resolution, self.output_even_dims)
        }
    }

    /// Encode each segment separately, then stream-copy them together.
    async fn render_and_concat(
        &self,
        input: &Path,
        output: &Path,
        segments: &[CropSegment],
        out_w: u32,
        out_h: u32,
    ) -> MediaResult<()> {
        let temp_dir = TempDir::new()?;
        let mut segment_files = Vec::with_capacity(segments.len());

        for (i, segment) in segments.iter().enumerate() {
            let seg_path = temp_dir.path().join(format!("segment_{:04}.mp4", i));
            let context = format!("segment {} encode ({:.3}-{:.3})", i, segment.start, segment.end);
            self.encode(input, &seg_path, segment, out_w, out_h, true, &context)
                .await?;
            segment_files.push(seg_path);
        }

        let concat_list_path = temp_dir.path().join("concat.txt");
        tokio::fs::write(&concat_list_path, concat_list(&segment_files)).await?;

        let cmd = FfmpegCommand::concat(&concat_list_path, output)
            .output_args(["-c", "copy", "-movflags", "+faststart"]);
        self.run(&cmd, "segment concat").await
    }

    #[allow(clippy::too_many_arguments)]
    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        segment: &CropSegment,
        out_w: u32,
        out_h: u32,
        for_concat: bool,
        context: &str,
    ) -> MediaResult<()> {
        let mut cmd = FfmpegCommand::new(input, output)
            .seek(segment.start)
            .duration(segment.duration());

        cmd = if self.letterbox_blur {
            cmd.filter_complex(letterbox_filter(
                &segment.crop,
                out_w,
                out_h,
                self.letterbox_blur_sigma,
                for_concat,
            ))
            .map(LETTERBOX_OUTPUT)
            .map("0:a?")
        } else if for_concat {
            cmd.video_filter(segment_filter(&segment.crop, out_w, out_h))
        } else {
            cmd.video_filter(crop_scale_filter(&segment.crop, out_w, out_h))
        };

        if for_concat {
            cmd = cmd.output_args(["-af", "aresample=async=1:first_pts=0"]);
        }

        cmd = cmd
            .video_codec("libx264")
            .preset(self.preset.clone())
            .crf(self.crf)
            .output_args(["-pix_fmt", "yuv420p"])
            .audio_codec("aac")
            .audio_bitrate(self.audio_bitrate.clone());

        if !for_concat {
            cmd = cmd.output_args(["-movflags", "+faststart"]);
        }

        self.run(&cmd, context).await
    }

    async fn run(&self, cmd: &FfmpegCommand, context: &str) -> MediaResult<()> {
        let _permit = match &self.encode_limit {
            Some(limit) => Some(
                limit
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| MediaError::internal(format!("encode limiter closed: {}", e)))?,
            ),
            None => None,
        };
        self.runner.run(cmd, context).await.map(|_| ())
    }
}

/// Concat-demuxer list for the given files.
fn concat_list(files: &[impl AsRef<Path>]) -> String {
    files
        .iter()
        .map(|p| format!("file '{}'\n", p.as_ref().display().to_string().replace('\'', "'\\''")))
        .collect()
}

/// True when x, y and width each vary by less than 5% of the average width.
pub fn is_static_crop(windows: &[CropWindow]) -> bool {
    if windows.len() <= 1 {
        return true;
    }

    let range = |f: fn(&CropWindow) -> i32| {
        let values = windows.iter().map(f);
        let (min, max) = values.fold((i32::MAX, i32::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
        (max - min) as f64
    };
    let avg_width = windows.iter().map(|w| w.width as f64).sum::<f64>() / windows.len() as f64;
    let threshold = avg_width * STATIC_TOLERANCE;

    range(|w| w.x) < threshold && range(|w| w.y) < threshold && range(|w| w.width) < threshold
}

/// Per-field median crop.
pub fn median_crop(windows: &[CropWindow]) -> CropWindow {
    let median = |f: fn(&CropWindow) -> i32| {
        let mut values: Vec<i32> = windows.iter().map(f).collect();
        values.sort_unstable();
        values.get(values.len() / 2).copied().unwrap_or(0)
    };
    let time = windows.first().map(|w| w.time).unwrap_or(0.0);
    CropWindow::new(time, median(|w| w.x), median(|w| w.y), median(|w| w.width), median(|w| w.height))
}

fn crops_differ(a: &CropWindow, b: &CropWindow, threshold: f64) -> bool {
    let limit = a.width as f64 * threshold;
    (a.x - b.x).abs() as f64 >= limit || (a.y - b.y).abs() as f64 >= limit || (a.width - b.width).abs() as f64 >= limit
}

/// Group time-ordered windows into fixed-crop segments tiling `range`.
///
/// A new segment starts when a window differs from its predecessor or from
/// the first window of the current run by `threshold` of the width or more.
/// Each segment uses the median crop of its run.
pub fn group_segments(windows: &[CropWindow], threshold: f64, range: TimeRange) -> Vec<CropSegment> {
    let mut runs: Vec<Vec<CropWindow>> = Vec::new();
    for window in windows {
        match runs.last_mut() {
            Some(run) => {
                let anchor = run[0];
                let previous = run[run.len() - 1];
                if crops_differ(&previous, window, threshold) || crops_differ(&anchor, window, threshold) {
                    runs.push(vec![*window]);
                } else {
                    run.push(*window);
                }
            }
            None => runs.push(vec![*window]),
        }
    }

    let starts: Vec<f64> = runs
        .iter()
        .enumerate()
        .map(|(i, run)| if i == 0 { range.start } else { run[0].time.clamp(range.start, range.end) })
        .collect();

    let mut segments: Vec<CropSegment> = Vec::with_capacity(runs.len());
    for (i, run) in runs.iter().enumerate() {
        let start = starts[i];
        let end = starts.get(i + 1).copied().unwrap_or(range.end);
        let crop = median_crop(run);
        if end - start <= 1e-6 {
            continue;
        }
        segments.push(CropSegment { start, end, crop });
    }

    // Windows all outside the range still need one segment
    if segments.is_empty() {
        segments.push(CropSegment {
            start: range.start,
            end: range.end,
            crop: median_crop(windows),
        });
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_crop_detection() {
        let static_windows = vec![
            CropWindow::new(0.0, 100, 100, 500, 500),
            CropWindow::new(1.0, 102, 101, 500, 500),
            CropWindow::new(2.0, 101, 100, 500, 500),
        ];
        assert!(is_static_crop(&static_windows));

        let moving_windows = vec![
            CropWindow::new(0.0, 100, 100, 500, 500),
            CropWindow::new(1.0, 200, 200, 500, 500),
            CropWindow::new(2.0, 300, 300, 500, 500),
        ];
        assert!(!is_static_crop(&moving_windows));
    }

    #[test]
    fn test_letterbox_output_on_target_canvas() {
        let crop = CropWindow::new(0.0, 640, 0, 640, 1080);

        let plain = Renderer::new(&ReframeConfig::default());
        assert_eq!(plain.output_dimensions(AspectRatio::PORTRAIT, &crop, None), (640, 1080));

        let letterboxed = Renderer::new(&ReframeConfig {
            letterbox_blur: true,
            ..Default::default()
        });
        let (w, h) = letterboxed.output_dimensions(AspectRatio::PORTRAIT, &crop, None);
        assert_eq!((w, h), (608, 1080));
        assert_eq!(w % 2, 0);
        assert!((w as f64 / h as f64 - 9.0 / 16.0).abs() < 1e-2);
    }

    #[test]
    fn test_group_segments_static() {
        let windows = vec![
            CropWindow::new(0.0, 100, 100, 500, 500),
            CropWindow::new(1.0, 102, 101, 500, 500),
            CropWindow::new(2.0, 101, 100, 500, 500),
        ];
        let segments = group_segments(&windows, 0.1, TimeRange::new(0.0, 3.0));
        assert_eq!(segments.len(), 1);
        assert_eq!((segments[0].start, segments[0].end), (0.0, 3.0));
    }

    #[test]
    fn test_group_segments_tile_range() {
        let windows = vec![
            CropWindow::new(10.0, 100, 100, 500, 500),
            CropWindow::new(11.0, 100, 100, 500, 500),
            CropWindow::new(12.0, 300, 300, 500, 500),
            CropWindow::new(13.0, 300, 300, 500, 500),
        ];
        let segments = group_segments(&windows, 0.1, TimeRange::new(10.0, 14.0));
        assert_eq!(segments.len(), 2);
        assert_eq!((segments[0].start, segments[0].end), (10.0, 12.0));
        assert_eq!((segments[1].start, segments[1].end), (12.0, 14.0));
        assert_eq!(segments[1].crop.x, 300);
    }

    #[test]
    fn test_slow_drift_still_splits() {
        // Every step is under 10% of the width, the accumulated drift is not
        let windows: Vec<_> = (0..10).map(|i| CropWindow::new(i as f64, 100 + i * 20, 0, 500, 500)).collect();
        let segments = group_segments(&windows, 0.1, TimeRange::new(0.0, 10.0));
        assert!(segments.len() > 1);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_median_crop() {
        let windows = vec![
            CropWindow::new(0.0, 100, 100, 500, 500),
            CropWindow::new(1.0, 200, 200, 600, 600),
            CropWindow::new(2.0, 150, 150, 550, 550),
        ];
        let median = median_crop(&windows);
        assert_eq!(median.x, 150);
        assert_eq!(median.y, 150);
        assert_eq!(median.width, 550);
    }

    #[test]
    fn test_concat_list_escapes_quotes() {
        let list = concat_list(&["/tmp/a.mp4", "/tmp/it's.mp4"]);
        assert_eq!(list, "file '/tmp/a.mp4'\nfile '/tmp/it'\\''s.mp4'\n");
    }

    #[test]
    fn test_strategy_labels() {
        assert_eq!(RenderStrategy::Static.label(), "static");
        assert_eq!(RenderStrategy::Segmented { segments: 1 }.label(), "single_segment");
        assert_eq!(RenderStrategy::Segmented { segments: 4 }.label(), "segmented");
    }

    #[tokio::test]
    async fn test_render_rejects_empty_windows() {
        let renderer = Renderer::new(&ReframeConfig::default());
        let err = renderer
            .render(
                Path::new("in.mp4"),
                Path::new("out.mp4"),
                AspectRatio::PORTRAIT,
                &[],
                TimeRange::new(0.0, 1.0),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Render { aspect, .. } if aspect == AspectRatio::PORTRAIT));
    }
}
