//! FFmpeg-backed automatic video reframing.
//!
//! This crate provides:
//! - FFmpeg command building with benign-warning stderr filtering
//! - ffprobe metadata and raw frame decoding
//! - The reframing pipeline: shot detection, subject tracking, camera
//!   smoothing, crop planning and rendering

pub mod command;
pub mod error;
pub mod frames;
pub mod probe;
pub mod reframe;

pub use command::{check_ffmpeg, check_ffprobe, filter_stderr, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use frames::{Frame, FrameReader};
pub use probe::probe_video;
pub use reframe::{RenderOutcome, ReframeConfig, Reframer};
