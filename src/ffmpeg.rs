//! Thin wrapper around the system `ffmpeg` binary

use std::path::Path;
use std::process::{Command, Output, Stdio};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FfmpegError {
    #[error("FFmpeg not found in system PATH")]
    NotInstalled,

    #[error("FFmpeg execution failed: {0}")]
    ExecutionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pixel layout of raw frames fed to ffmpeg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray,
    Bgr24,
    Bgra,
}

impl PixelFormat {
    pub fn as_str(&self) -> &str {
        match self {
            PixelFormat::Gray => "gray",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Bgra => "bgra",
        }
    }

    pub fn for_channels(channels: usize) -> Option<Self> {
        match channels {
            1 => Some(PixelFormat::Gray),
            3 => Some(PixelFormat::Bgr24),
            4 => Some(PixelFormat::Bgra),
            _ => None,
        }
    }
}

pub struct FfmpegCommand {
    args: Vec<String>,
}

impl FfmpegCommand {
    pub fn new() -> Self {
        Self {
            args: vec!["-hide_banner".to_string(), "-loglevel".to_string(), "error".to_string()],
        }
    }

    /// Overwrite the output file if it exists.
    pub fn overwrite(mut self) -> Self {
        self.args.push("-y".to_string());
        self
    }

    /// Read headerless frames of the given geometry from `path`.
    pub fn raw_video_input(
        mut self,
        path: impl AsRef<Path>,
        pixel_format: PixelFormat,
        width: usize,
        height: usize,
        fps: u32,
    ) -> Self {
        self = self.args(&[
            "-f", "rawvideo",
            "-pix_fmt", pixel_format.as_str(),
            "-s", &format!("{}x{}", width, height),
            "-r", &fps.to_string(),
        ]);
        self.args.push("-i".to_string());
        self.args.push(path.as_ref().display().to_string());
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    pub fn output(mut self, path: impl AsRef<Path>) -> Self {
        self.args.push(path.as_ref().display().to_string());
        self
    }

    pub fn execute(self) -> Result<Output, FfmpegError> {
        if !is_ffmpeg_installed() {
            return Err(FfmpegError::NotInstalled);
        }

        debug!("ffmpeg {}", self.args.join(" "));
        let output = Command::new("ffmpeg")
            .args(&self.args)
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FfmpegError::ExecutionFailed(stderr.trim().to_string()));
        }

        Ok(output)
    }
}

impl Default for FfmpegCommand {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_ffmpeg_installed() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
