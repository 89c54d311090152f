//! Pipeline orchestration: analyze a source into a [`CropPlan`], render a
//! plan into one output per aspect ratio, or both.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use metrics::counter;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use reframe_models::{AspectRatio, CropPlan, Shot, SubjectKind, TimeRange, VideoMeta};
use reframe_storage::ShotDetectionCache;

use super::config::ReframeConfig;
use super::content_analyzer::{ContentAnalyzer, NoSubjectReason, ShotContent};
use super::crop_planner::CropPlanner;
use super::detector::{create_detector, DetectorBackend, RawDetection, SubjectDetector};
use super::renderer::{RenderStrategy, Renderer};
use super::shot_detector::ShotDetector;
use super::smoother::CameraSmoother;
use crate::error::{MediaError, MediaResult};
use crate::frames::Frame;
use crate::probe::probe_video;

/// Result of rendering every aspect ratio of a plan.
///
/// A failed aspect does not stop its siblings.
#[derive(Debug, Default)]
pub struct RenderOutcome {
    pub outputs: BTreeMap<AspectRatio, PathBuf>,
    pub strategies: BTreeMap<AspectRatio, RenderStrategy>,
    pub failures: BTreeMap<AspectRatio, MediaError>,
}

impl RenderOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Output paths, or the first failure.
    pub fn into_result(self) -> MediaResult<BTreeMap<AspectRatio, PathBuf>> {
        match self.failures.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(self.outputs),
        }
    }
}

/// Output file for one aspect ratio: `<prefix>_<W>x<H>.mp4`.
pub fn output_path_for(prefix: &Path, aspect: AspectRatio) -> PathBuf {
    let stem = prefix
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "reframed".to_string());
    prefix.with_file_name(format!("{}_{}.mp4", stem, aspect.slug()))
}

/// Automatic reframing pipeline.
pub struct Reframer {
    config: ReframeConfig,
    cache: Option<Arc<ShotDetectionCache>>,
    encode_limit: Option<Arc<Semaphore>>,
}

impl Reframer {
    /// Create a reframer; the configuration is validated up front.
    pub fn new(config: ReframeConfig) -> MediaResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cache: None,
            encode_limit: None,
        })
    }

    /// Share a shot detection cache with other reframers.
    pub fn with_cache(mut self, cache: Arc<ShotDetectionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Bound concurrent FFmpeg encodes across aspects and segments.
    pub fn with_encode_limit(mut self, limit: Arc<Semaphore>) -> Self {
        self.encode_limit = Some(limit);
        self
    }

    pub fn config(&self) -> &ReframeConfig {
        &self.config
    }

    /// Run shot detection, content analysis, camera smoothing and crop planning.
    pub async fn analyze(&self, path: &Path, time_range: Option<TimeRange>) -> MediaResult<CropPlan> {
        let started = Instant::now();

        info!("Step 1/4: Probing video metadata...");
        let video = probe_video(path).await?;
        let range = resolve_range(&video, time_range)?;
        info!(
            "Step 1/4 DONE - {}x{} @ {:.2}fps, {:.2}s",
            video.width, video.height, video.fps, video.duration
        );

        info!("Step 2/4: Detecting shots (cache: {})...", self.cache.is_some());
        let detector = ShotDetector::new(&self.config);
        let (shots, lookup) = detector
            .detect_cached(&video, range, self.cache.as_deref())
            .await?;
        info!("Step 2/4 DONE - {} shots ({:?})", shots.len(), lookup);

        info!(
            "Step 3/4: Analyzing shot content ({} workers, {} backend)...",
            self.config.analysis_workers,
            self.config.detector.name()
        );
        let contents = self.analyze_shots(&video, &shots).await?;
        let with_subjects = contents.iter().filter(|c| c.has_subjects()).count();
        info!("Step 3/4 DONE - {}/{} shots with subjects", with_subjects, shots.len());

        info!("Step 4/4: Planning camera paths and crops...");
        let plan = self.build_plan(video, range, shots, contents)?;
        info!(
            elapsed_secs = started.elapsed().as_secs_f64(),
            aspects = plan.aspect_ratios.len(),
            "Step 4/4 DONE - analysis complete"
        );
        Ok(plan)
    }

    /// Analyze shots on `analysis_workers` independent workers.
    ///
    /// Each worker owns its detector and decoders; results come back in shot order.
    async fn analyze_shots(&self, video: &VideoMeta, shots: &[Shot]) -> MediaResult<Vec<ShotContent>> {
        let analyzer = ContentAnalyzer::new(&self.config, video);
        let backend = self.config.detector.clone();
        run_workers(shots, self.config.analysis_workers, |assigned| {
            analyze_worker(analyzer.clone(), backend.clone(), assigned)
        })
        .await
    }

    /// Turn per-shot content into camera paths and crop windows.
    pub fn build_plan(
        &self,
        video: VideoMeta,
        time_range: Option<TimeRange>,
        shots: Vec<Shot>,
        contents: Vec<ShotContent>,
    ) -> MediaResult<CropPlan> {
        let smoother = CameraSmoother::new(&self.config);
        let planner = CropPlanner::new(&self.config, video.width, video.height);
        let mut plan = CropPlan::new(video, time_range, self.config.aspect_ratios.clone());

        for content in contents {
            if let ShotContent::NoSubjects { shot_id, reason, .. } = &content {
                match reason {
                    NoSubjectReason::BackendFailed(_) => {}
                    _ => warn!(shot_id, reason = ?reason, policy = ?self.config.fallback_policy, "No subject found, using fallback framing"),
                }
            }
            plan.detections.push(content.into_detections());
        }

        for shot in &shots {
            let detections = match plan.detections.iter().find(|d| d.shot_id == shot.id) {
                Some(d) => d,
                None => {
                    return Err(MediaError::internal(format!("no analysis result for shot {}", shot.id)));
                }
            };
            let camera = smoother.plan_shot(shot, detections, plan.video.width, plan.video.height);
            for &aspect in &self.config.aspect_ratios {
                plan.crop_plans.push(planner.plan_shot(&camera, aspect));
            }
            plan.camera_plans.push(camera);
        }
        plan.shots = shots;

        plan.validate()?;
        Ok(plan)
    }

    /// Render every aspect ratio in `plan` to `<output_prefix>_<W>x<H>.mp4`.
    ///
    /// Aspects render concurrently; a failure is recorded per aspect.
    pub async fn render(
        &self,
        path: &Path,
        plan: &CropPlan,
        output_prefix: &Path,
        resolution: Option<(u32, u32)>,
    ) -> MediaResult<RenderOutcome> {
        plan.validate()?;
        if let Some(parent) = output_prefix.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut renderer = Renderer::new(&self.config);
        if let Some(limit) = &self.encode_limit {
            renderer = renderer.with_encode_limit(limit.clone());
        }
        let range = plan.range();

        let jobs = plan.aspect_ratios.iter().map(|&aspect| {
            let renderer = &renderer;
            let output = output_path_for(output_prefix, aspect);
            let windows = plan.windows_for(aspect);
            async move {
                let started = Instant::now();
                let result = renderer
                    .render(path, &output, aspect, &windows, range, resolution)
                    .await;
                debug!(aspect = %aspect, elapsed_secs = started.elapsed().as_secs_f64(), "Aspect render finished");
                (aspect, output, result)
            }
        });

        let mut outcome = RenderOutcome::default();
        for (aspect, output, result) in join_all(jobs).await {
            match result {
                Ok(strategy) => {
                    info!(aspect = %aspect, output = %output.display(), strategy = strategy.label(), "Rendered");
                    outcome.outputs.insert(aspect, output);
                    outcome.strategies.insert(aspect, strategy);
                }
                Err(e) => {
                    warn!(aspect = %aspect, error = %e, "Render failed");
                    outcome.failures.insert(aspect, e);
                }
            }
        }
        Ok(outcome)
    }

    /// Analyze (or reuse a persisted plan) and render.
    ///
    /// With `plan_path` set, a stored plan for the same source, range and
    /// aspects is reused; a fresh plan is written there otherwise.
    pub async fn analyze_and_render(
        &self,
        path: &Path,
        time_range: Option<TimeRange>,
        output_prefix: &Path,
        resolution: Option<(u32, u32)>,
        plan_path: Option<&Path>,
    ) -> MediaResult<(CropPlan, RenderOutcome)> {
        let reusable = plan_path.and_then(|p| self.load_reusable_plan(p, path, time_range));

        let plan = match reusable {
            Some(plan) => {
                info!(plan_id = %plan.plan_id, "Reusing persisted crop plan");
                plan
            }
            None => {
                let plan = self.analyze(path, time_range).await?;
                if let Some(p) = plan_path {
                    if let Err(e) = plan.save(p) {
                        warn!(path = %p.display(), error = %e, "Failed to persist crop plan");
                    }
                }
                plan
            }
        };

        let outcome = self.render(path, &plan, output_prefix, resolution).await?;
        Ok((plan, outcome))
    }

    fn load_reusable_plan(&self, plan_path: &Path, source: &Path, time_range: Option<TimeRange>) -> Option<CropPlan> {
        if !plan_path.exists() {
            return None;
        }
        match CropPlan::load(plan_path) {
            Ok(plan)
                if plan.matches_source(source, &self.config.aspect_ratios)
                    && plan.time_range == resolve_range(&plan.video, time_range).ok().flatten() =>
            {
                Some(plan)
            }
            Ok(_) => {
                debug!(path = %plan_path.display(), "Persisted plan is for a different source or range");
                None
            }
            Err(e) => {
                warn!(path = %plan_path.display(), error = %e, "Ignoring unreadable crop plan");
                None
            }
        }
    }
}

/// Clamp a requested range to the video; `None` stays `None`.
fn resolve_range(video: &VideoMeta, time_range: Option<TimeRange>) -> MediaResult<Option<TimeRange>> {
    let Some(range) = time_range else {
        return Ok(None);
    };
    let start = range.start.max(0.0);
    let end = range.end.min(video.duration);
    if end <= start {
        return Err(MediaError::InvalidVideo(format!(
            "time range {:.3}-{:.3} is outside the {:.3}s video",
            range.start, range.end, video.duration
        )));
    }
    Ok(Some(TimeRange::new(start, end)))
}

/// Analyze `shots` sequentially with one detector, releasing it afterwards.
async fn analyze_worker(
    analyzer: ContentAnalyzer,
    backend: DetectorBackend,
    shots: Vec<Shot>,
) -> MediaResult<Vec<ShotContent>> {
    let mut detector: Box<dyn SubjectDetector> = match create_detector(&backend) {
        Ok(detector) => detector,
        Err(e) => {
            counter!("reframe_detector_failures_total", "backend" => backend.name()).increment(1);
            warn!(backend = backend.name(), error = %e, "Detector unavailable, shots fall back to saliency framing");
            Box::new(UnavailableDetector {
                backend: backend.name(),
                message: e.to_string(),
            })
        }
    };

    let mut contents = Vec::with_capacity(shots.len());
    for shot in &shots {
        let (content, returned) = analyzer.analyze_shot(detector, shot).await?;
        contents.push(content);
        detector = returned;
    }
    detector.close();
    Ok(contents)
}

/// Split `shots` round-robin over `workers` tasks and collect their contents
/// in shot order. The first failure aborts the remaining workers.
async fn run_workers<F, Fut>(shots: &[Shot], workers: usize, mut work: F) -> MediaResult<Vec<ShotContent>>
where
    F: FnMut(Vec<Shot>) -> Fut,
    Fut: Future<Output = MediaResult<Vec<ShotContent>>> + Send + 'static,
{
    let workers = workers.clamp(1, shots.len().max(1));
    let mut set = JoinSet::new();
    for w in 0..workers {
        let assigned: Vec<Shot> = shots.iter().skip(w).step_by(workers).copied().collect();
        set.spawn(work(assigned));
    }

    let mut contents = Vec::with_capacity(shots.len());
    while let Some(joined) = set.join_next().await {
        let result = joined.map_err(|e| MediaError::internal(format!("analysis worker panicked: {}", e)));
        match result.and_then(|r| r) {
            Ok(worker_contents) => contents.extend(worker_contents),
            Err(e) => {
                set.shutdown().await;
                return Err(e);
            }
        }
    }
    contents.sort_by_key(|c| c.shot_id());
    Ok(contents)
}

/// Stands in for a backend that failed to initialize.
struct UnavailableDetector {
    backend: &'static str,
    message: String,
}

impl SubjectDetector for UnavailableDetector {
    fn name(&self) -> &'static str {
        self.backend
    }

    fn kind(&self) -> SubjectKind {
        SubjectKind::Face
    }

    fn detect(&mut self, _frame: &Frame) -> MediaResult<Vec<RawDetection>> {
        Err(MediaError::detection_backend(self.message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reframe_models::{BoundingBox, CameraMode, Detection, ShotDetections};

    fn video() -> VideoMeta {
        VideoMeta {
            path: PathBuf::from("/videos/talk.mp4"),
            duration: 60.0,
            width: 1920,
            height: 1080,
            fps: 30.0,
        }
    }

    #[test]
    fn test_output_path_for() {
        assert_eq!(
            output_path_for(Path::new("out/clip"), AspectRatio::PORTRAIT),
            PathBuf::from("out/clip_9x16.mp4")
        );
        assert_eq!(
            output_path_for(Path::new("clip"), AspectRatio::SQUARE),
            PathBuf::from("clip_1x1.mp4")
        );
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = ReframeConfig {
            fps_sample: 0.0,
            ..Default::default()
        };
        assert!(matches!(Reframer::new(config), Err(MediaError::InvalidConfig(_))));
    }

    #[test]
    fn test_resolve_range() {
        let v = video();
        assert_eq!(resolve_range(&v, None).unwrap(), None);
        assert_eq!(
            resolve_range(&v, Some(TimeRange::new(-1.0, 90.0))).unwrap(),
            Some(TimeRange::new(0.0, 60.0))
        );
        assert!(resolve_range(&v, Some(TimeRange::new(70.0, 80.0))).is_err());
    }

    #[tokio::test]
    async fn test_analyze_missing_file_is_video_open() {
        let reframer = Reframer::new(ReframeConfig::default()).unwrap();
        let err = reframer
            .analyze(Path::new("/nonexistent/input.mp4"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::VideoOpen { .. }));
    }

    #[test]
    fn test_static_talking_head_plan() {
        let reframer = Reframer::new(ReframeConfig::default()).unwrap();
        let shot = Shot::new(0, 0.0, 60.0);
        let mut detections = ShotDetections::new(0);
        for i in 0..480 {
            detections.detections.push(Detection::new(
                i as f64 / 8.0,
                BoundingBox::new(860.0, 300.0, 200.0, 260.0),
                0.9,
                0,
                SubjectKind::Face,
            ));
        }

        let plan = reframer
            .build_plan(video(), None, vec![shot], vec![ShotContent::Subjects(detections)])
            .unwrap();

        assert_eq!(plan.camera_plans.len(), 1);
        assert_eq!(plan.camera_plans[0].mode, CameraMode::Static);
        let windows = plan.windows_for(AspectRatio::PORTRAIT);
        assert!(!windows.is_empty());
        // Zoom limit caps the crop at 1920 / 3 = 640 wide, clamped to full height
        for w in &windows {
            assert_eq!((w.width, w.height), (640, 1080));
            assert_eq!(w.x, 640);
        }
        assert!(super::super::renderer::is_static_crop(&windows));
    }

    #[test]
    fn test_subjectless_shot_uses_fallback_focus() {
        let reframer = Reframer::new(ReframeConfig::default()).unwrap();
        let shots = vec![Shot::new(0, 0.0, 30.0), Shot::new(1, 30.0, 60.0)];
        let contents = vec![
            ShotContent::NoSubjects {
                shot_id: 1,
                reason: NoSubjectReason::EarlyExit,
                fallback_focus: BoundingBox::new(480.0, 162.0, 960.0, 540.0),
            },
            ShotContent::NoSubjects {
                shot_id: 0,
                reason: NoSubjectReason::NoneFound,
                fallback_focus: BoundingBox::new(0.0, 0.0, 400.0, 400.0),
            },
        ];

        let plan = reframer.build_plan(video(), None, shots, contents).unwrap();
        assert_eq!(plan.detections.len(), 2);
        assert!(plan.detections.iter().all(|d| d.is_empty() && d.fallback_focus.is_some()));

        let second = plan.crop_plans.iter().find(|c| c.shot_id == 1).unwrap();
        assert!(second.crop_windows.iter().all(|w| w.x == 640));
        let first = plan.crop_plans.iter().find(|c| c.shot_id == 0).unwrap();
        assert!(first.crop_windows.iter().all(|w| w.x == 0));

        let restored = CropPlan::from_json(&plan.to_json().unwrap()).unwrap();
        assert_eq!(restored, plan);
    }

    #[test]
    fn test_build_plan_requires_every_shot() {
        let reframer = Reframer::new(ReframeConfig::default()).unwrap();
        let err = reframer
            .build_plan(video(), None, vec![Shot::new(0, 0.0, 60.0)], Vec::new())
            .unwrap_err();
        assert!(matches!(err, MediaError::Internal(_)));
    }

    #[tokio::test]
    async fn test_render_isolates_aspect_failures() {
        let dir = tempfile::TempDir::new().unwrap();
        let reframer = Reframer::new(ReframeConfig::default()).unwrap();
        // Plan with no crop windows: every aspect fails before any encode starts
        let plan = CropPlan::new(video(), None, vec![AspectRatio::PORTRAIT, AspectRatio::SQUARE]);

        let outcome = reframer
            .render(Path::new("/videos/talk.mp4"), &plan, &dir.path().join("clip"), None)
            .await
            .unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.failures.len(), 2);
        assert!(matches!(
            outcome.failures.get(&AspectRatio::SQUARE),
            Some(MediaError::Render { aspect, .. }) if *aspect == AspectRatio::SQUARE
        ));
        assert!(outcome.into_result().is_err());
    }

    fn subjectless(shot_id: u32) -> ShotContent {
        ShotContent::NoSubjects {
            shot_id,
            reason: NoSubjectReason::NoneFound,
            fallback_focus: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
        }
    }

    #[tokio::test]
    async fn test_workers_return_contents_in_shot_order() {
        let shots: Vec<Shot> = (0..5).map(|i| Shot::new(i, i as f64, i as f64 + 1.0)).collect();
        let contents = run_workers(&shots, 3, |assigned| async move {
            let contents: Vec<ShotContent> = assigned.iter().rev().map(|s| subjectless(s.id)).collect();
            Ok(contents)
        })
        .await
        .unwrap();
        let ids: Vec<u32> = contents.iter().map(|c| c.shot_id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failed_worker_aborts_siblings() {
        let shots: Vec<Shot> = (0..4).map(|i| Shot::new(i, i as f64, i as f64 + 1.0)).collect();
        let (held_tx, mut held_rx) = tokio::sync::oneshot::channel::<()>();
        let mut held = Some(held_tx);

        let result = run_workers(&shots, 2, |assigned| {
            let guard = held.take();
            async move {
                match guard {
                    // Never finishes on its own
                    Some(tx) => {
                        std::future::pending::<()>().await;
                        drop(tx);
                        Ok(Vec::<ShotContent>::new())
                    }
                    None => Err(MediaError::internal(format!("decoder died at shot {}", assigned[0].id))),
                }
            }
        })
        .await;

        match result {
            Err(MediaError::Internal(message)) => assert!(message.contains("shot 1")),
            other => panic!("unexpected {other:?}"),
        }
        // The stalled worker was dropped along with its sender
        assert_eq!(held_rx.try_recv(), Err(tokio::sync::oneshot::error::TryRecvError::Closed));
    }

    #[test]
    fn test_plan_reuse_compares_resolved_range() {
        let dir = tempfile::tempdir().unwrap();
        let plan_path = dir.path().join("talk.plan.json");
        let reframer = Reframer::new(ReframeConfig::default()).unwrap();
        // Saved from a request for 10-90s on a 60s video
        CropPlan::new(video(), Some(TimeRange::new(10.0, 60.0)), vec![AspectRatio::PORTRAIT])
            .save(&plan_path)
            .unwrap();

        let source = Path::new("/videos/talk.mp4");
        let reused = reframer.load_reusable_plan(&plan_path, source, Some(TimeRange::new(10.0, 90.0)));
        assert_eq!(reused.unwrap().time_range, Some(TimeRange::new(10.0, 60.0)));

        assert!(reframer
            .load_reusable_plan(&plan_path, source, Some(TimeRange::new(5.0, 90.0)))
            .is_none());
        assert!(reframer.load_reusable_plan(&plan_path, source, None).is_none());
        assert!(reframer
            .load_reusable_plan(&plan_path, Path::new("/videos/other.mp4"), Some(TimeRange::new(10.0, 90.0)))
            .is_none());
    }

    #[tokio::test]
    async fn test_unavailable_backend_degrades_to_fallback() {
        let mut detector = UnavailableDetector {
            backend: "onnx",
            message: "model missing".to_string(),
        };
        let frame = Frame {
            time: 0.0,
            index: 0,
            image: image::RgbImage::new(16, 9),
        };
        let err = detector.detect(&frame).unwrap_err();
        assert!(matches!(err, MediaError::DetectionBackend { .. }));
        assert_eq!(detector.name(), "onnx");
    }
}
