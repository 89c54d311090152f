//! Assembles pipeline configuration from command-line arguments.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use reframe_media::ReframeConfig;
use reframe_models::{AspectRatio, TimeRange};
use reframe_storage::{FsBlobStore, ShotDetectionCache};
use tracing::info;

/// Parse a `WxH` output resolution such as `1080x1920`.
pub fn parse_resolution(s: &str) -> Result<(u32, u32), String> {
    let lower = s.trim().to_ascii_lowercase();
    let (w, h) = lower
        .split_once('x')
        .ok_or_else(|| format!("invalid resolution '{}', expected WxH", s))?;
    let width: u32 = w.parse().map_err(|_| format!("invalid width '{}'", w))?;
    let height: u32 = h.parse().map_err(|_| format!("invalid height '{}'", h))?;
    if width == 0 || height == 0 {
        return Err(format!("resolution '{}' must be non-zero", s));
    }
    Ok((width, height))
}

/// Build the requested time range; both bounds are given together or not at all.
pub fn time_range(start: Option<f64>, end: Option<f64>) -> anyhow::Result<Option<TimeRange>> {
    match (start, end) {
        (None, None) => Ok(None),
        (Some(start), Some(end)) => {
            if !start.is_finite() || !end.is_finite() || start < 0.0 {
                bail!("time range {}-{} must be finite and non-negative", start, end);
            }
            if end <= start {
                bail!("end ({}) must be after start ({})", end, start);
            }
            Ok(Some(TimeRange::new(start, end)))
        }
        _ => bail!("--start and --end must be given together"),
    }
}

/// Preset, then `REFRAME_*` environment overrides, then explicit flags.
pub fn build_config(
    preset: &str,
    aspects: &[AspectRatio],
    workers: Option<usize>,
) -> anyhow::Result<ReframeConfig> {
    let mut config = ReframeConfig::preset(preset)?.with_env_overrides();

    if !aspects.is_empty() {
        let mut unique = Vec::with_capacity(aspects.len());
        for aspect in aspects {
            if !unique.contains(aspect) {
                unique.push(*aspect);
            }
        }
        config.aspect_ratios = unique;
    }
    if let Some(workers) = workers {
        config.analysis_workers = workers;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Shot cache backed by `dir` when given, process-local otherwise.
pub async fn open_cache(dir: Option<&Path>) -> anyhow::Result<Arc<ShotDetectionCache>> {
    let cache = match dir {
        Some(dir) => {
            let store = FsBlobStore::open(dir)
                .await
                .with_context(|| format!("failed to open cache directory {}", dir.display()))?;
            info!(dir = %dir.display(), "Using durable shot cache");
            ShotDetectionCache::with_store(Arc::new(store))
        }
        None => ShotDetectionCache::in_memory(),
    };
    Ok(Arc::new(cache))
}
