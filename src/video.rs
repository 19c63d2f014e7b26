//! Frame-sequence preparation and MP4 encoding

use std::fs;

use ndarray::{Array3, Array4, ArrayViewD, Axis, Ix4, IxDyn};
use tracing::debug;

use crate::encoder::BackendError;
use crate::ffmpeg::{FfmpegCommand, PixelFormat};
use crate::tensor::{first_item, to_u8_samples};

pub const MP4_CONTENT_TYPE: &str = "video/mp4";
pub const MP4_FILENAME: &str = "tensor_upload.mp4";
pub const DEFAULT_FPS: u32 = 30;

const CHANNEL_COUNTS: [usize; 3] = [1, 3, 4];

/// Video encoder capability. Deployments without a codec return
/// [`BackendError::Unsupported`] and the encoder falls back to a still frame.
pub trait VideoBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Encode `[F, H, W, C]` frames in RGB(A) or grayscale order.
    fn encode_mp4(&self, frames: &Array4<u8>, fps: u32) -> Result<Vec<u8>, BackendError>;
}

/// Writes MP4 through the system `ffmpeg` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegVideoBackend;

impl VideoBackend for FfmpegVideoBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn encode_mp4(&self, frames: &Array4<u8>, fps: u32) -> Result<Vec<u8>, BackendError> {
        let (frame_count, height, width, channels) = frames.dim();
        let pixel_format = PixelFormat::for_channels(channels).ok_or_else(|| {
            BackendError::Failed(format!("unsupported channel count {}", channels))
        })?;

        let scratch = tempfile::tempdir().map_err(|e| BackendError::Failed(e.to_string()))?;
        let input = scratch.path().join("frames.raw");
        let output = scratch.path().join("tensor_upload.mp4");
        fs::write(&input, to_encoder_order(frames)).map_err(|e| BackendError::Failed(e.to_string()))?;

        debug!("Encoding {} frames ({}x{}, {}) at {} fps", frame_count, width, height, pixel_format.as_str(), fps);
        FfmpegCommand::new()
            .overwrite()
            .raw_video_input(&input, pixel_format, width, height, fps)
            .args(&[
                // yuv420p needs even dimensions
                "-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2",
                "-c:v", "mpeg4",
                "-q:v", "2",
                "-pix_fmt", "yuv420p",
                "-movflags", "+faststart",
            ])
            .output(&output)
            .execute()?;

        fs::read(&output).map_err(|e| BackendError::Failed(e.to_string()))
    }
}

/// Backend for deployments without any video codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVideoBackend;

impl VideoBackend for NoVideoBackend {
    fn name(&self) -> &str {
        "none"
    }

    fn encode_mp4(&self, _frames: &Array4<u8>, _fps: u32) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::Unsupported("no video encoder configured".to_string()))
    }
}

/// Bring a video tensor to `[F, H, W, C]` bytes.
///
/// Accepts `[B, F, H, W, C]` (first item taken), `[F, H, W, C]` and
/// channels-first `[F, C, H, W]`.
pub fn prepare_frames(view: ArrayViewD<'_, f32>) -> Result<Array4<u8>, BackendError> {
    let view = if view.ndim() == 5 {
        first_item(view).ok_or_else(|| BackendError::Failed("empty video batch".to_string()))?
    } else {
        view
    };

    if view.ndim() != 4 {
        return Err(BackendError::Failed(format!(
            "unsupported video shape {:?}",
            view.shape()
        )));
    }

    let view = if CHANNEL_COUNTS.contains(&view.shape()[3]) {
        view
    } else if CHANNEL_COUNTS.contains(&view.shape()[1]) {
        view.permuted_axes(IxDyn(&[0, 2, 3, 1]))
    } else {
        return Err(BackendError::Failed(format!(
            "unsupported video shape {:?}",
            view.shape()
        )));
    };

    if view.is_empty() {
        return Err(BackendError::Failed("video has no frames".to_string()));
    }

    to_u8_samples(&view)
        .into_dimensionality::<Ix4>()
        .map_err(|e| BackendError::Failed(e.to_string()))
}

/// First frame of a prepared sequence, used when no codec is available.
pub fn first_frame(frames: &Array4<u8>) -> Array3<u8> {
    frames.index_axis(Axis(0), 0).to_owned()
}

/// Flatten frames row-major, swapping RGB(A) to the BGR(A) order the raw
/// ffmpeg input expects.
pub fn to_encoder_order(frames: &Array4<u8>) -> Vec<u8> {
    let channels = frames.dim().3;
    let mut raw: Vec<u8> = frames.iter().copied().collect();
    if channels >= 3 {
        for pixel in raw.chunks_exact_mut(channels) {
            pixel.swap(0, 2);
        }
    }
    raw
}
