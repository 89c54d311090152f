//! FFmpeg command builder and runner.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};

/// Stderr fragments FFmpeg prints for conditions that do not affect output.
///
/// These come from hardware decode probing, colorspace negotiation and
/// slightly broken source timestamps, and would otherwise bury real errors.
const BENIGN_STDERR_PATTERNS: &[&str] = &[
    "deprecated pixel format used",
    "No accelerated colorspace conversion found",
    "Last message repeated",
    "co located POCs unavailable",
    "non monotonically increasing dts",
    "mmco: unref short failure",
    "Guessed Channel Layout",
    "Failed setup for format vaapi",
    "Failed to initialise VAAPI",
    "hwaccel initialisation returned error",
    "Could not find ref with POC",
    "VDPAU",
    "libva info",
    "Timestamps are unset in a packet",
    "Application provided invalid, non monotonically increasing",
];

/// Drop known-benign warning lines, keeping everything else verbatim.
pub fn filter_stderr(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !BENIGN_STDERR_PATTERNS.iter().any(|p| line.contains(p)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    /// Input file path
    input: PathBuf,
    /// Output file path (or `pipe:1`)
    output: PathBuf,
    /// Input arguments (before -i)
    input_args: Vec<String>,
    /// Output arguments (after -i)
    output_args: Vec<String>,
    /// Whether to overwrite output
    overwrite: bool,
    /// Log level
    log_level: String,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "warning".to_string(),
        }
    }

    /// Command reading a concat-demuxer list file.
    pub fn concat(list_file: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self::new(list_file, output).input_args(["-f", "concat", "-safe", "0"])
    }

    /// Add input arguments (before -i).
    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    pub fn input_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add output arguments (after -i).
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set seek position (before input).
    pub fn seek(self, seconds: f64) -> Self {
        self.input_arg("-ss").input_arg(format!("{:.3}", seconds))
    }

    /// Limit the amount of input read.
    pub fn duration(self, seconds: f64) -> Self {
        self.input_arg("-t").input_arg(format!("{:.3}", seconds))
    }

    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    pub fn filter_complex(self, filter: impl Into<String>) -> Self {
        self.output_arg("-filter_complex").output_arg(filter)
    }

    pub fn map(self, stream: impl Into<String>) -> Self {
        self.output_arg("-map").output_arg(stream)
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    pub fn crf(self, crf: u8) -> Self {
        self.output_arg("-crf").output_arg(crf.to_string())
    }

    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    pub fn audio_bitrate(self, bitrate: impl Into<String>) -> Self {
        self.output_arg("-b:a").output_arg(bitrate)
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }
        args.push("-hide_banner".to_string());
        args.push("-nostdin".to_string());
        args.push("-v".to_string());
        args.push(self.log_level.clone());

        args.extend(self.input_args.clone());
        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());

        args.extend(self.output_args.clone());
        args.push(self.output.to_string_lossy().to_string());

        args
    }
}

/// Runs FFmpeg commands to completion, capturing and filtering stderr.
#[derive(Debug, Default, Clone)]
pub struct FfmpegRunner;

impl FfmpegRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a command; on success returns the filtered stderr (usually empty).
    ///
    /// A non-zero exit yields [`MediaError::FfmpegFailed`] carrying `context`
    /// and the filtered stderr.
    pub async fn run(&self, cmd: &FfmpegCommand, context: &str) -> MediaResult<String> {
        check_ffmpeg()?;

        let args = cmd.build_args();
        debug!("Running FFmpeg: ffmpeg {}", args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut raw = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            stderr.read_to_string(&mut raw).await?;
        }
        let status = child.wait().await?;
        let filtered = filter_stderr(&raw);

        if status.success() {
            if !filtered.is_empty() {
                warn!(context = %context, "FFmpeg reported: {}", filtered);
            }
            Ok(filtered)
        } else {
            Err(MediaError::ffmpeg_failed(
                context,
                Some(filtered),
                status.code(),
            ))
        }
    }
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}

/// Check if FFprobe is available.
pub fn check_ffprobe() -> MediaResult<PathBuf> {
    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let cmd = FfmpegCommand::new("input.mp4", "output.mp4")
            .seek(10.0)
            .duration(30.0)
            .video_codec("libx264")
            .crf(18);

        let args = cmd.build_args();
        let i = args.iter().position(|a| a == "-i").unwrap();
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        assert!(ss < i, "seek must precede the input");
        assert_eq!(args[ss + 1], "10.000");
        assert!(args.contains(&"libx264".to_string()));
        assert_eq!(args.last().unwrap(), "output.mp4");
    }

    #[test]
    fn test_concat_command() {
        let args = FfmpegCommand::concat("list.txt", "out.mp4")
            .output_args(["-c", "copy"])
            .build_args();
        let joined = args.join(" ");
        assert!(joined.contains("-f concat -safe 0 -i list.txt -c copy out.mp4"));
    }

    #[test]
    fn test_filter_stderr_drops_benign_lines() {
        let raw = "\
[swscaler @ 0x55d] deprecated pixel format used, make sure you did set range correctly
[h264 @ 0x1] co located POCs unavailable

[libx264 @ 0x2] Error: width not divisible by 2 (607x1080)
    Last message repeated 3 times
Conversion failed!";
        let filtered = filter_stderr(raw);
        assert_eq!(
            filtered,
            "[libx264 @ 0x2] Error: width not divisible by 2 (607x1080)\nConversion failed!"
        );
    }

    #[test]
    fn test_filter_stderr_all_benign_is_empty() {
        assert!(filter_stderr("Guessed Channel Layout for Input Stream #0.1 : mono\n").is_empty());
    }
}
