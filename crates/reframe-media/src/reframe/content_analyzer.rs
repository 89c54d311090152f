//! Per-shot subject detection and tracking.
//!
//! A shot is sampled at `fps_sample`; every sample runs the detector, maps
//! boxes to source pixels, assigns track ids and, when several subjects
//! share the frame, scores which one is active. Shots without a reliable
//! subject come back as [`ShotContent::NoSubjects`] together with the
//! fallback framing to use instead.

use std::ops::ControlFlow;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use reframe_models::{
    ActiveTrackSample, BoundingBox, Detection, Shot, ShotDetections, SubjectKind, TimeRange, VideoMeta,
};

use super::activity::{ActivityAnalyzer, ActivityConfig, TemporalActivityTracker};
use super::config::{EarlyExitPolicy, ReframeConfig};
use super::detector::SubjectDetector;
use super::saliency::SaliencyEstimator;
use super::tracker::SimpleTracker;
use crate::error::{MediaError, MediaResult};
use crate::frames::{analysis_size, Frame, FrameReader};

/// Decoded frames buffered ahead of the analysis thread.
const FRAME_QUEUE: usize = 4;

/// Why a shot has no subject to frame.
#[derive(Debug, Clone, PartialEq)]
pub enum NoSubjectReason {
    /// Nothing found in the opening samples, analysis stopped early
    EarlyExit,
    /// The whole shot was sampled without a usable detection
    NoneFound,
    /// The detector failed; the message is kept for diagnostics
    BackendFailed(String),
}

/// Outcome of analyzing one shot.
#[derive(Debug, Clone, PartialEq)]
pub enum ShotContent {
    Subjects(ShotDetections),
    NoSubjects {
        shot_id: u32,
        reason: NoSubjectReason,
        fallback_focus: BoundingBox,
    },
}

impl ShotContent {
    pub fn shot_id(&self) -> u32 {
        match self {
            Self::Subjects(d) => d.shot_id,
            Self::NoSubjects { shot_id, .. } => *shot_id,
        }
    }

    pub fn has_subjects(&self) -> bool {
        matches!(self, Self::Subjects(_))
    }

    /// Plan form: empty detections plus the fallback focus for subject-less shots.
    pub fn into_detections(self) -> ShotDetections {
        match self {
            Self::Subjects(d) => d,
            Self::NoSubjects {
                shot_id,
                fallback_focus,
                ..
            } => ShotDetections {
                fallback_focus: Some(fallback_focus),
                ..ShotDetections::new(shot_id)
            },
        }
    }
}

/// Analyzes shots of one source video.
#[derive(Debug, Clone)]
pub struct ContentAnalyzer {
    config: ReframeConfig,
    video: VideoMeta,
    analysis_width: u32,
    analysis_height: u32,
    saliency: SaliencyEstimator,
}

impl ContentAnalyzer {
    pub fn new(config: &ReframeConfig, video: &VideoMeta) -> Self {
        let (analysis_width, analysis_height) =
            analysis_size(video.width, video.height, config.analysis_resolution);
        Self {
            config: config.clone(),
            video: video.clone(),
            analysis_width,
            analysis_height,
            saliency: SaliencyEstimator::new(config.fallback_policy),
        }
    }

    /// Start the per-sample state for `shot`.
    pub fn begin_shot(&self, shot: &Shot, kind: SubjectKind) -> ShotAnalysis {
        ShotAnalysis::new(self, shot, kind)
    }

    /// Start a blocking analysis thread for `shot` fed with sampled frames.
    ///
    /// Detection and activity scoring run off the async workers. Dropping
    /// the sender ends the analysis; the thread also stops, closing the
    /// channel, once the shot needs no more samples.
    pub fn spawn_analysis(
        &self,
        shot: &Shot,
        mut detector: Box<dyn SubjectDetector>,
    ) -> (mpsc::Sender<Frame>, JoinHandle<(ShotAnalysis, Box<dyn SubjectDetector>)>) {
        detector.reset();
        let mut state = self.begin_shot(shot, detector.kind());
        let (tx, mut rx) = mpsc::channel::<Frame>(FRAME_QUEUE);

        let handle = tokio::task::spawn_blocking(move || {
            while let Some(frame) = rx.blocking_recv() {
                if state.process(detector.as_mut(), &frame).is_break() {
                    break;
                }
            }
            (state, detector)
        });
        (tx, handle)
    }

    /// Decode and analyze one shot, handing the detector back for the next.
    ///
    /// Detector failures degrade the shot to fallback framing; only decode
    /// failures are returned as errors, after the detector is closed.
    pub async fn analyze_shot(
        &self,
        mut detector: Box<dyn SubjectDetector>,
        shot: &Shot,
    ) -> MediaResult<(ShotContent, Box<dyn SubjectDetector>)> {
        let range = TimeRange::new(shot.start_time, shot.end_time);
        let mut reader = match FrameReader::open(
            &self.video.path,
            range,
            self.config.fps_sample,
            self.analysis_width,
            self.analysis_height,
        )
        .await
        {
            Ok(reader) => reader,
            Err(e) => {
                detector.close();
                return Err(e);
            }
        };

        let (frames, analysis) = self.spawn_analysis(shot, detector);
        let decoded = loop {
            match reader.next_frame().await {
                Ok(Some(frame)) => {
                    if frames.send(frame).await.is_err() {
                        break Ok(());
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        drop(frames);
        reader.close().await;

        let (state, mut detector) = analysis
            .await
            .map_err(|e| MediaError::internal(format!("analysis of shot {} failed: {}", shot.id, e)))?;
        if let Err(e) = decoded {
            detector.close();
            return Err(e);
        }

        if let Some(message) = state.failure() {
            counter!("reframe_detector_failures_total", "backend" => detector.name()).increment(1);
            warn!(shot_id = shot.id, backend = detector.name(), error = %message, "Detector failed, using fallback framing");
        }

        Ok((state.finish(), detector))
    }
}

/// Sample-by-sample analysis of one shot.
pub struct ShotAnalysis {
    shot: Shot,
    kind: SubjectKind,
    source_width: u32,
    source_height: u32,
    scale: (f64, f64),
    min_confidence: f64,
    min_area: f64,
    face_expand_ratio: f64,
    early_exit: EarlyExitPolicy,
    tracker: SimpleTracker,
    activity: ActivityAnalyzer,
    temporal: TemporalActivityTracker,
    activity_enabled: bool,
    saliency: SaliencyEstimator,
    detections: ShotDetections,
    empty_samples: u32,
    samples: u32,
    fallback_frame: Option<Frame>,
    stopped_early: bool,
    failure: Option<String>,
}

impl ShotAnalysis {
    fn new(analyzer: &ContentAnalyzer, shot: &Shot, kind: SubjectKind) -> Self {
        let config = &analyzer.config;
        let activity_config = ActivityConfig::from_config(config);
        Self {
            shot: shot.clone(),
            kind,
            source_width: analyzer.video.width,
            source_height: analyzer.video.height,
            scale: (
                analyzer.video.width as f64 / analyzer.analysis_width as f64,
                analyzer.video.height as f64 / analyzer.analysis_height as f64,
            ),
            min_confidence: config.min_detection_confidence,
            min_area: config.min_face_size * analyzer.video.width as f64 * analyzer.video.height as f64,
            face_expand_ratio: config.face_expand_ratio,
            early_exit: config.early_exit,
            tracker: SimpleTracker::new(config.iou_threshold, config.max_track_gap),
            temporal: TemporalActivityTracker::new(&activity_config),
            activity_enabled: config.enable_mouth_cue || config.enable_motion_cue || config.enable_size_cue,
            activity: ActivityAnalyzer::new(activity_config),
            saliency: analyzer.saliency,
            detections: ShotDetections::new(shot.id),
            empty_samples: 0,
            samples: 0,
            fallback_frame: None,
            stopped_early: false,
            failure: None,
        }
    }

    /// Feed one sampled frame. `Break` means the shot needs no more samples.
    pub fn process(&mut self, detector: &mut dyn SubjectDetector, frame: &Frame) -> ControlFlow<()> {
        self.samples += 1;
        if self.fallback_frame.is_none() {
            self.fallback_frame = Some(frame.clone());
        }
        if self.activity_enabled {
            self.activity.begin_frame(frame);
        }

        let raw = match detector.detect(frame) {
            Ok(raw) => raw,
            Err(e) => {
                self.failure = Some(e.in_shot(self.shot.id).to_string());
                return ControlFlow::Break(());
            }
        };

        // (source box, score, analysis box)
        let candidates: Vec<(BoundingBox, f64, BoundingBox)> = raw
            .into_iter()
            .filter(|(_, score)| *score >= self.min_confidence)
            .map(|(bbox, score)| {
                let mut source = bbox.scale(self.scale.0, self.scale.1);
                if self.kind == SubjectKind::Face {
                    source = source.expand(self.face_expand_ratio);
                }
                (source.clamp(self.source_width, self.source_height), score, bbox)
            })
            .collect();

        let boxes: Vec<(BoundingBox, f64)> = candidates.iter().map(|(b, s, _)| (*b, *s)).collect();
        let tracked = self.tracker.update(frame.time, &boxes);
        for track_id in self.tracker.take_expired() {
            self.activity.cleanup_track(track_id);
            self.temporal.cleanup_track(track_id);
        }

        let kept: Vec<(u32, BoundingBox, f64, BoundingBox)> = tracked
            .into_iter()
            .zip(candidates.iter())
            .filter(|((_, bbox, _), _)| bbox.area() >= self.min_area)
            .map(|((id, bbox, score), (_, _, analysis))| (id, bbox, score, *analysis))
            .collect();

        if kept.is_empty() {
            self.empty_samples += 1;
            let elapsed = frame.time - self.shot.start_time + 1e-9;
            if self.detections.is_empty()
                && self
                    .early_exit
                    .should_stop(self.empty_samples, elapsed, self.shot.duration())
            {
                debug!(shot_id = self.shot.id, samples = self.samples, "No subjects in opening samples, stopping early");
                self.stopped_early = true;
                return ControlFlow::Break(());
            }
            return ControlFlow::Continue(());
        }

        let multi = kept.len() >= 2 && self.activity_enabled;
        let mut active_candidates = Vec::with_capacity(kept.len());
        for (track_id, bbox, score, analysis_box) in kept {
            let mut det = Detection::new(frame.time, bbox, score, track_id, self.kind);
            if multi {
                let activity = self.activity.score(frame, track_id, &analysis_box, score, frame.time);
                self.temporal.update(track_id, activity, frame.time);
                det.activity = Some(activity);
                active_candidates.push(track_id);
            }
            self.detections.detections.push(det);
        }

        if multi {
            if let Some(track_id) = self.temporal.select(&active_candidates, frame.time) {
                self.detections.active_tracks.push(ActiveTrackSample {
                    time: frame.time,
                    track_id,
                });
            }
        }

        ControlFlow::Continue(())
    }

    /// Detector failure recorded for this shot, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn finish(self) -> ShotContent {
        let fallback_focus = self.saliency.focus(
            self.source_width,
            self.source_height,
            self.fallback_frame.as_ref(),
        );

        let reason = if let Some(message) = self.failure {
            Some(NoSubjectReason::BackendFailed(message))
        } else if self.detections.is_empty() {
            Some(if self.stopped_early {
                NoSubjectReason::EarlyExit
            } else {
                NoSubjectReason::NoneFound
            })
        } else {
            None
        };

        match reason {
            Some(reason) => ShotContent::NoSubjects {
                shot_id: self.shot.id,
                reason,
                fallback_focus,
            },
            None => {
                let mut detections = self.detections;
                detections.fallback_focus = Some(fallback_focus);
                ShotContent::Subjects(detections)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reframe::detector::RawDetection;
    use image::RgbImage;

    /// Replays scripted detections in analysis-frame pixels, one entry per sample.
    struct Scripted {
        frames: Vec<MediaResult<Vec<RawDetection>>>,
        next: usize,
    }

    impl Scripted {
        fn new(frames: Vec<MediaResult<Vec<RawDetection>>>) -> Self {
            Self { frames, next: 0 }
        }
    }

    impl SubjectDetector for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn kind(&self) -> SubjectKind {
            SubjectKind::Face
        }

        fn detect(&mut self, _frame: &Frame) -> MediaResult<Vec<RawDetection>> {
            let idx = self.next;
            self.next += 1;
            match self.frames.get_mut(idx) {
                Some(result) => std::mem::replace(result, Ok(Vec::new())),
                None => Ok(Vec::new()),
            }
        }
    }

    fn video() -> VideoMeta {
        VideoMeta {
            path: "/tmp/source.mp4".into(),
            duration: 20.0,
            width: 1920,
            height: 1080,
            fps: 30.0,
        }
    }

    fn frame(i: u32, fps: f64) -> Frame {
        Frame {
            time: i as f64 / fps,
            index: i as u64,
            image: RgbImage::new(64, 36),
        }
    }

    fn run(config: &ReframeConfig, shot: &Shot, detector: &mut Scripted, samples: u32) -> ShotContent {
        let analyzer = ContentAnalyzer::new(config, &video());
        let mut state = analyzer.begin_shot(shot, detector.kind());
        for i in 0..samples {
            let mut f = frame(i, config.fps_sample);
            f.time += shot.start_time;
            if state.process(detector, &f).is_break() {
                break;
            }
        }
        state.finish()
    }

    fn face() -> (BoundingBox, f64) {
        // 854x480 analysis frame for 1080p at the default resolution
        (BoundingBox::new(400.0, 100.0, 60.0, 80.0), 0.9)
    }

    #[test]
    fn test_single_subject_tracked_in_source_pixels() {
        let config = ReframeConfig::default();
        let mut det = Scripted::new((0..16).map(|_| Ok(vec![face()])).collect());
        let content = run(&config, &Shot::new(0, 0.0, 2.0), &mut det, 16);

        let ShotContent::Subjects(shot) = content else {
            panic!("expected subjects");
        };
        assert_eq!(shot.detections.len(), 16);
        assert!(shot.detections.iter().all(|d| d.track_id == 0));
        assert!(shot.active_tracks.is_empty());

        // Scaled by 1920/854 and expanded 30% around the center
        let first = &shot.detections[0].bbox;
        let sx = 1920.0 / 854.0;
        assert!((first.width - 60.0 * sx * 1.3).abs() < 1e-6);
        assert!((first.cx() - 430.0 * sx).abs() < 1e-6);
        assert!(shot.fallback_focus.is_some());
    }

    #[test]
    fn test_empty_shot_exits_early() {
        let config = ReframeConfig::default();
        let mut det = Scripted::new(Vec::new());
        let analyzer = ContentAnalyzer::new(&config, &video());
        let shot = Shot::new(3, 10.0, 20.0);
        let mut state = analyzer.begin_shot(&shot, SubjectKind::Face);

        let mut processed = 0;
        for i in 0..80 {
            let mut f = frame(i, config.fps_sample);
            f.time += shot.start_time;
            processed += 1;
            if state.process(&mut det, &f).is_break() {
                break;
            }
        }
        // 10% of a 10s shot at 8 fps: stop at the sample at t+1.0s
        assert_eq!(processed, 9);
        match state.finish() {
            ShotContent::NoSubjects { shot_id, reason, .. } => {
                assert_eq!(shot_id, 3);
                assert_eq!(reason, NoSubjectReason::EarlyExit);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_early_exit_can_be_disabled() {
        let config = ReframeConfig {
            early_exit: EarlyExitPolicy::disabled(),
            ..Default::default()
        };
        // Subject appears late in the shot
        let mut frames: Vec<MediaResult<Vec<RawDetection>>> = (0..40).map(|_| Ok(Vec::new())).collect();
        frames.push(Ok(vec![face()]));
        let mut det = Scripted::new(frames);
        let content = run(&config, &Shot::new(0, 0.0, 10.0), &mut det, 80);
        assert!(content.has_subjects());

        let mut det = Scripted::new(Vec::new());
        let content = run(&config, &Shot::new(1, 0.0, 2.0), &mut det, 16);
        assert!(matches!(
            content,
            ShotContent::NoSubjects { reason: NoSubjectReason::NoneFound, .. }
        ));
    }

    #[test]
    fn test_small_and_low_confidence_boxes_dropped() {
        let config = ReframeConfig::default();
        let tiny = (BoundingBox::new(10.0, 10.0, 4.0, 4.0), 0.95);
        let weak = (BoundingBox::new(400.0, 100.0, 60.0, 80.0), 0.2);
        let mut det = Scripted::new((0..16).map(|_| Ok(vec![tiny, weak])).collect());
        let content = run(&config, &Shot::new(0, 0.0, 2.0), &mut det, 16);
        assert!(!content.has_subjects());
    }

    #[test]
    fn test_backend_failure_falls_back() {
        let config = ReframeConfig::default();
        let mut det = Scripted::new(vec![
            Ok(vec![face()]),
            Err(MediaError::detection_backend("session lost")),
        ]);
        let content = run(&config, &Shot::new(5, 0.0, 2.0), &mut det, 16);
        match content {
            ShotContent::NoSubjects {
                reason: NoSubjectReason::BackendFailed(message),
                ..
            } => {
                assert!(message.contains("shot 5"));
                assert!(message.contains("session lost"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_two_subjects_get_active_track() {
        let config = ReframeConfig::default();
        let left = (BoundingBox::new(100.0, 100.0, 60.0, 80.0), 0.9);
        let right = (BoundingBox::new(600.0, 100.0, 60.0, 80.0), 0.9);
        let mut det = Scripted::new((0..16).map(|_| Ok(vec![left, right])).collect());
        let content = run(&config, &Shot::new(0, 0.0, 2.0), &mut det, 16);

        let ShotContent::Subjects(shot) = content else {
            panic!("expected subjects");
        };
        assert_eq!(shot.max_simultaneous(), 2);
        assert_eq!(shot.active_tracks.len(), 16);
        assert!(shot.detections.iter().all(|d| d.activity.is_some()));
    }

    /// Records which thread each detection ran on.
    struct ThreadRecorder {
        threads: std::sync::Arc<std::sync::Mutex<Vec<std::thread::ThreadId>>>,
    }

    impl SubjectDetector for ThreadRecorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn kind(&self) -> SubjectKind {
            SubjectKind::Face
        }

        fn detect(&mut self, _frame: &Frame) -> MediaResult<Vec<RawDetection>> {
            self.threads.lock().unwrap().push(std::thread::current().id());
            Ok(vec![face()])
        }
    }

    #[tokio::test]
    async fn test_frames_analyzed_off_the_runtime_thread() {
        let config = ReframeConfig::default();
        let analyzer = ContentAnalyzer::new(&config, &video());
        let threads = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let detector = Box::new(ThreadRecorder {
            threads: threads.clone(),
        });

        let (frames, analysis) = analyzer.spawn_analysis(&Shot::new(0, 0.0, 2.0), detector);
        for i in 0..16 {
            frames.send(frame(i, config.fps_sample)).await.unwrap();
        }
        drop(frames);
        let (state, detector) = analysis.await.unwrap();

        assert_eq!(state.samples(), 16);
        assert_eq!(detector.name(), "recorder");
        assert!(state.finish().has_subjects());

        let runtime_thread = std::thread::current().id();
        let threads = threads.lock().unwrap();
        assert_eq!(threads.len(), 16);
        assert!(threads.iter().all(|id| *id != runtime_thread));
    }

    #[tokio::test]
    async fn test_analysis_thread_closes_channel_on_early_exit() {
        let config = ReframeConfig::default();
        let analyzer = ContentAnalyzer::new(&config, &video());
        let shot = Shot::new(0, 10.0, 20.0);

        let (frames, analysis) = analyzer.spawn_analysis(&shot, Box::new(Scripted::new(Vec::new())));
        let mut sent = 0;
        for i in 0..80 {
            let mut f = frame(i, config.fps_sample);
            f.time += shot.start_time;
            if frames.send(f).await.is_err() {
                break;
            }
            sent += 1;
        }
        assert!(sent < 80);

        let (state, _) = analysis.await.unwrap();
        assert_eq!(state.samples(), 9);
        assert!(matches!(
            state.finish(),
            ShotContent::NoSubjects { reason: NoSubjectReason::EarlyExit, .. }
        ));
    }

    #[test]
    fn test_expired_track_leaves_active_selection() {
        let config = ReframeConfig::default();
        let analyzer = ContentAnalyzer::new(&config, &video());
        let shot = Shot::new(0, 0.0, 4.0);
        let left = (BoundingBox::new(100.0, 100.0, 60.0, 80.0), 0.9);
        let right = (BoundingBox::new(600.0, 100.0, 60.0, 80.0), 0.9);

        let mut script: Vec<MediaResult<Vec<RawDetection>>> = (0..4).map(|_| Ok(vec![left, right])).collect();
        script.extend((0..11).map(|_| Ok(Vec::new())));
        let mut det = Scripted::new(script);
        let mut state = analyzer.begin_shot(&shot, SubjectKind::Face);

        for i in 0..14 {
            assert!(state.process(&mut det, &frame(i, config.fps_sample)).is_continue());
        }
        // Ten misses: both tracks still alive
        assert!(state.temporal.current().is_some());

        assert!(state.process(&mut det, &frame(14, config.fps_sample)).is_continue());
        assert_eq!(state.tracker.track_count(), 0);
        assert!(state.temporal.current().is_none());
        assert_eq!(state.temporal.average(0, 14.0 / 8.0), 0.0);
    }

    #[test]
    fn test_into_detections_carries_fallback() {
        let content = ShotContent::NoSubjects {
            shot_id: 2,
            reason: NoSubjectReason::NoneFound,
            fallback_focus: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
        };
        let dets = content.into_detections();
        assert_eq!(dets.shot_id, 2);
        assert!(dets.is_empty());
        assert_eq!(dets.fallback_focus, Some(BoundingBox::new(1.0, 2.0, 3.0, 4.0)));
    }
}
