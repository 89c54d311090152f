//! Histogram-based shot boundary detection.
//!
//! Frames are sampled at a low rate and resolution, reduced to a normalized
//! 16x16 hue/saturation histogram, and consecutive histograms are compared
//! with a symmetric chi-square distance mapped to `1 - e^(-d/2)`. A score
//! above the threshold marks a cut at the later sample.

use std::path::Path;

use image::RgbImage;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use reframe_models::{Shot, TimeRange, VideoMeta};
use reframe_storage::{CacheLookup, ShotCacheKey, ShotDetectionCache, ShotDetectionParams};

use super::config::ReframeConfig;
use crate::error::{MediaError, MediaResult};
use crate::frames::{analysis_size, Frame, FrameReader};

const HUE_BINS: usize = 16;
const SAT_BINS: usize = 16;
const HISTOGRAM_BATCH: usize = 64;

/// Normalized 2D hue/saturation histogram (sums to 1).
pub fn hs_histogram(image: &RgbImage) -> Vec<f64> {
    let mut bins = vec![0f64; HUE_BINS * SAT_BINS];
    let mut total = 0f64;

    for p in image.pixels() {
        let (h, s) = hue_saturation(p[0], p[1], p[2]);
        let hb = ((h / 360.0 * HUE_BINS as f64) as usize).min(HUE_BINS - 1);
        let sb = ((s * SAT_BINS as f64) as usize).min(SAT_BINS - 1);
        bins[hb * SAT_BINS + sb] += 1.0;
        total += 1.0;
    }

    if total > 0.0 {
        bins.iter_mut().for_each(|b| *b /= total);
    }
    bins
}

/// Hue in degrees `[0, 360)` and saturation in `[0, 1]`.
fn hue_saturation(r: u8, g: u8, b: u8) -> (f64, f64) {
    let (r, g, b) = (r as f64 / 255.0, g as f64 / 255.0, b as f64 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let saturation = if max > 0.0 { delta / max } else { 0.0 };
    if delta <= f64::EPSILON {
        return (0.0, saturation);
    }

    let hue = if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    (hue.rem_euclid(360.0), saturation)
}

/// Symmetric chi-square distance between two histograms.
pub fn chi_square(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let sum = x + y;
            if sum > 1e-12 {
                (x - y) * (x - y) / sum
            } else {
                0.0
            }
        })
        .sum()
}

/// Bounded difference score in `[0, 1)`.
pub fn difference_score(a: &[f64], b: &[f64]) -> f64 {
    1.0 - (-chi_square(a, b) / 2.0).exp()
}

/// Sample times where the score against the previous sample exceeds `threshold`.
pub fn find_boundaries(samples: &[(f64, Vec<f64>)], threshold: f64) -> Vec<f64> {
    samples
        .windows(2)
        .filter_map(|pair| {
            let score = difference_score(&pair[0].1, &pair[1].1);
            (score > threshold).then_some(pair[1].0)
        })
        .collect()
}

/// Build shots that tile `range` exactly from the given cut times.
///
/// Shots shorter than `min_duration` merge into the following shot; a short
/// final shot merges into the one before it.
pub fn build_shots(range: TimeRange, boundaries: &[f64], min_duration: f64) -> Vec<Shot> {
    let mut cuts: Vec<f64> = boundaries
        .iter()
        .copied()
        .filter(|t| *t > range.start && *t < range.end)
        .collect();
    cuts.sort_by(f64::total_cmp);
    cuts.dedup();

    let mut edges = Vec::with_capacity(cuts.len() + 2);
    edges.push(range.start);
    edges.extend(cuts);
    edges.push(range.end);

    let segments = edges.len() - 1;
    let mut merged: Vec<(f64, f64)> = Vec::with_capacity(segments);
    let mut pending_start: Option<f64> = None;

    for (i, pair) in edges.windows(2).enumerate() {
        let start = pending_start.take().unwrap_or(pair[0]);
        let end = pair[1];
        if end - start < min_duration && i + 1 < segments {
            pending_start = Some(start);
            continue;
        }
        merged.push((start, end));
    }

    if merged.len() > 1 {
        let (last_start, last_end) = merged[merged.len() - 1];
        if last_end - last_start < min_duration {
            merged.pop();
            if let Some(prev) = merged.last_mut() {
                prev.1 = last_end;
            }
        }
    }

    merged
        .into_iter()
        .enumerate()
        .map(|(id, (start, end))| Shot::new(id as u32, start, end))
        .collect()
}

/// Segments a video into shots.
#[derive(Debug, Clone)]
pub struct ShotDetector {
    params: ShotDetectionParams,
    resolution: u32,
}

impl ShotDetector {
    pub fn new(config: &ReframeConfig) -> Self {
        Self {
            params: ShotDetectionParams {
                sample_rate: config.shot_sample_rate,
                shot_threshold: config.shot_threshold,
                min_shot_duration: config.min_shot_duration,
            },
            resolution: config.shot_detection_resolution,
        }
    }

    pub fn params(&self) -> &ShotDetectionParams {
        &self.params
    }

    /// Detect shots over `range`, or the whole video when `None`.
    ///
    /// Fails with [`MediaError::VideoOpen`] when the source cannot be decoded.
    pub async fn detect(&self, video: &VideoMeta, range: Option<TimeRange>) -> MediaResult<Vec<Shot>> {
        let range = range.unwrap_or_else(|| TimeRange::new(0.0, video.duration));
        if range.duration() <= 0.0 {
            return Err(MediaError::InvalidVideo(format!(
                "empty time range {:.3}-{:.3}",
                range.start, range.end
            )));
        }

        let (width, height) = analysis_size(video.width, video.height, self.resolution);
        let mut reader = FrameReader::open(&video.path, range, self.params.sample_rate, width, height).await?;

        let mut samples: Vec<(f64, Vec<f64>)> = Vec::new();
        let mut batch: Vec<Frame> = Vec::with_capacity(HISTOGRAM_BATCH);
        let result = loop {
            match reader.next_frame().await {
                Ok(Some(frame)) => {
                    batch.push(frame);
                    if batch.len() == HISTOGRAM_BATCH {
                        samples.extend(histogram_batch(std::mem::take(&mut batch)).await?);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        reader.close().await;
        result?;
        if !batch.is_empty() {
            samples.extend(histogram_batch(batch).await?);
        }

        let boundaries = find_boundaries(&samples, self.params.shot_threshold);
        let shots = build_shots(range, &boundaries, self.params.min_shot_duration);

        info!(
            path = %video.path.display(),
            samples = samples.len(),
            boundaries = boundaries.len(),
            shots = shots.len(),
            "Shot detection complete"
        );
        Ok(shots)
    }

    /// Detect shots, consulting `cache` for full-video runs.
    ///
    /// Ranged detections are never cached. Cache failures only cost a re-detect.
    pub async fn detect_cached(
        &self,
        video: &VideoMeta,
        range: Option<TimeRange>,
        cache: Option<&ShotDetectionCache>,
    ) -> MediaResult<(Vec<Shot>, CacheLookup)> {
        let cache = match (cache, range) {
            (Some(cache), None) => cache,
            _ => return Ok((self.detect(video, range).await?, CacheLookup::Miss)),
        };

        let key = match ShotCacheKey::for_source(Path::new(&video.path), &self.params).await {
            Ok(key) => key,
            Err(e) => {
                warn!(path = %video.path.display(), error = %e, "Cannot derive shot cache key, detecting directly");
                return Ok((self.detect(video, None).await?, CacheLookup::Miss));
            }
        };

        let (shots, lookup) = cache.get_or_detect(&key, || self.detect(video, None)).await?;
        debug!(key = %key, ?lookup, shots = shots.len(), "Shot lookup");
        Ok((shots, lookup))
    }
}

async fn histogram_batch(frames: Vec<Frame>) -> MediaResult<Vec<(f64, Vec<f64>)>> {
    tokio::task::spawn_blocking(move || {
        frames
            .par_iter()
            .map(|f| (f.time, hs_histogram(&f.image)))
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| MediaError::internal(format!("histogram task failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(32, 18, Rgb(color))
    }

    fn assert_tiles(shots: &[Shot], range: TimeRange) {
        assert_eq!(shots.first().unwrap().start_time, range.start);
        assert_eq!(shots.last().unwrap().end_time, range.end);
        for pair in shots.windows(2) {
            assert_eq!(pair[0].end_time, pair[1].start_time);
        }
        for (i, shot) in shots.iter().enumerate() {
            assert_eq!(shot.id, i as u32);
            assert!(shot.end_time > shot.start_time);
        }
    }

    #[test]
    fn test_histogram_is_normalized() {
        let mut img = solid([200, 30, 30]);
        img.put_pixel(0, 0, Rgb([10, 200, 10]));
        let hist = hs_histogram(&img);
        assert_eq!(hist.len(), 256);
        assert!((hist.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_difference_score_bounds() {
        let red = hs_histogram(&solid([220, 20, 20]));
        let blue = hs_histogram(&solid([20, 20, 220]));
        assert_eq!(difference_score(&red, &red), 0.0);
        let cut = difference_score(&red, &blue);
        assert!(cut > 0.3 && cut < 1.0, "score {cut}");
        assert!((difference_score(&red, &blue) - difference_score(&blue, &red)).abs() < 1e-12);
    }

    #[test]
    fn test_boundaries_at_color_change() {
        let red = hs_histogram(&solid([220, 20, 20]));
        let blue = hs_histogram(&solid([20, 20, 220]));
        let samples: Vec<(f64, Vec<f64>)> = (0..20)
            .map(|i| {
                let t = i as f64 * 0.25;
                (t, if t < 2.0 { red.clone() } else { blue.clone() })
            })
            .collect();
        assert_eq!(find_boundaries(&samples, 0.3), vec![2.0]);
    }

    #[test]
    fn test_no_boundaries_single_shot() {
        let range = TimeRange::new(0.0, 60.0);
        let shots = build_shots(range, &[], 1.0);
        assert_eq!(shots, vec![Shot::new(0, 0.0, 60.0)]);
    }

    #[test]
    fn test_short_shots_merge_forward() {
        let range = TimeRange::new(10.0, 20.0);
        // 10-12, 12-12.5 (short), 12.5-15, 15-19.6, 19.6-20 (short tail)
        let shots = build_shots(range, &[12.0, 12.5, 15.0, 19.6], 1.0);
        assert_tiles(&shots, range);
        assert_eq!(shots.len(), 3);
        assert_eq!((shots[1].start_time, shots[1].end_time), (12.0, 15.0));
        assert_eq!(shots[2].end_time, 20.0);
    }

    #[test]
    fn test_boundaries_outside_range_ignored() {
        let range = TimeRange::new(5.0, 10.0);
        let shots = build_shots(range, &[1.0, 5.0, 7.5, 7.5, 10.0, 12.0], 0.5);
        assert_tiles(&shots, range);
        assert_eq!(shots.len(), 2);
    }

    #[test]
    fn test_many_short_cuts_tile_range() {
        let range = TimeRange::new(0.0, 7.3);
        let cuts: Vec<f64> = (1..29).map(|i| i as f64 * 0.25).collect();
        let shots = build_shots(range, &cuts, 1.0);
        assert_tiles(&shots, range);
        assert!(shots.iter().all(|s| s.duration() >= 1.0 - 1e-9));
    }

    #[tokio::test]
    async fn test_detect_missing_video_is_open_error() {
        let detector = ShotDetector::new(&ReframeConfig::default());
        let video = VideoMeta {
            path: "/no/such/source.mp4".into(),
            duration: 10.0,
            width: 1920,
            height: 1080,
            fps: 30.0,
        };
        let result = detector.detect(&video, None).await;
        assert!(matches!(result, Err(MediaError::VideoOpen { .. })));
    }
}
