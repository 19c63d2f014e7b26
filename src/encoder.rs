//! Tensor to transmittable bytes
//!
//! [`MediaEncoder`] turns a [`MediaTensor`] into a PNG, MP4 or WAV payload
//! with a filename and content type ready for upload. Video and audio codecs
//! are injected capabilities so a deployment without them degrades the way
//! each kind requires: video falls back to its first frame as a still image,
//! audio fails with a typed error.

use thiserror::Error;
use tracing::{debug, warn};

use crate::audio::{self, AudioBackend, AudioClip, HoundWavBackend, DEFAULT_SAMPLE_RATE};
use crate::error::{PipelineError, Result};
use crate::ffmpeg::FfmpegError;
use crate::image;
use crate::tensor::{MediaKind, MediaTensor};
use crate::video::{self, FfmpegVideoBackend, VideoBackend};

/// Failure reported by an encoding backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Failed(String),
}

impl From<FfmpegError> for BackendError {
    fn from(err: FfmpegError) -> Self {
        match err {
            FfmpegError::NotInstalled => BackendError::Unsupported(err.to_string()),
            other => BackendError::Failed(other.to_string()),
        }
    }
}

/// Encoded media ready for the upload gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMedia {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub content_type: String,
    pub kind: MediaKind,
}

impl EncodedMedia {
    fn new(bytes: Vec<u8>, filename: &str, content_type: &str, kind: MediaKind) -> Self {
        Self {
            bytes,
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            kind,
        }
    }
}

/// Kind to force for a field, overriding shape classification.
///
/// Image and mask fields are always encoded as stills so that a masked frame
/// batch is never mistaken for a video; names mentioning video or audio are
/// left to the classifier.
pub fn forced_kind_for_field(name: &str) -> Option<MediaKind> {
    let lower = name.to_ascii_lowercase();
    if lower.contains("video") || lower.contains("audio") {
        return None;
    }
    if lower.contains("image") || lower.contains("mask") {
        return Some(MediaKind::Image);
    }
    None
}

pub struct MediaEncoder {
    video: Box<dyn VideoBackend>,
    audio: Box<dyn AudioBackend>,
}

impl MediaEncoder {
    pub fn new(video: Box<dyn VideoBackend>, audio: Box<dyn AudioBackend>) -> Self {
        Self { video, audio }
    }

    /// Encode `tensor` for `field`. A forced kind wins over classification.
    pub fn encode(
        &self,
        field: &str,
        tensor: &MediaTensor,
        forced: Option<MediaKind>,
    ) -> Result<EncodedMedia> {
        let kind = forced.unwrap_or_else(|| tensor.kind());
        debug!(
            "Encoding '{}' shape {:?} as {}{}",
            field,
            tensor.shape(),
            kind,
            if forced.is_some() { " (forced)" } else { "" }
        );

        let encoded = match kind {
            MediaKind::Image => self.encode_image(tensor),
            MediaKind::Video => self.encode_video(tensor),
            MediaKind::Audio => self
                .encode_waveform(tensor, DEFAULT_SAMPLE_RATE)
                .map(|bytes| EncodedMedia::new(bytes, audio::WAV_FILENAME, audio::WAV_CONTENT_TYPE, MediaKind::Audio)),
        };
        encoded.map_err(|e| PipelineError::encode(field, kind, e))
    }

    /// Encode a waveform structure at its own sample rate.
    pub fn encode_audio_clip(&self, field: &str, clip: &AudioClip) -> Result<EncodedMedia> {
        let sample_rate = if clip.sample_rate == 0 {
            DEFAULT_SAMPLE_RATE
        } else {
            clip.sample_rate
        };
        self.encode_waveform(&clip.waveform, sample_rate)
            .map(|bytes| EncodedMedia::new(bytes, "audio_upload.wav", audio::WAV_CONTENT_TYPE, MediaKind::Audio))
            .map_err(|e| PipelineError::encode(field, MediaKind::Audio, e))
    }

    fn encode_image(&self, tensor: &MediaTensor) -> std::result::Result<EncodedMedia, BackendError> {
        let frame = image::prepare_frame(tensor.view())?;
        let png = image::encode_png(&frame)?;
        Ok(EncodedMedia::new(png, image::PNG_FILENAME, image::PNG_CONTENT_TYPE, MediaKind::Image))
    }

    fn encode_video(&self, tensor: &MediaTensor) -> std::result::Result<EncodedMedia, BackendError> {
        let frames = video::prepare_frames(tensor.view())?;
        match self.video.encode_mp4(&frames, video::DEFAULT_FPS) {
            Ok(mp4) => Ok(EncodedMedia::new(mp4, video::MP4_FILENAME, video::MP4_CONTENT_TYPE, MediaKind::Video)),
            Err(BackendError::Unsupported(reason)) => {
                warn!("Video encoder '{}' unavailable ({}), sending first frame as image", self.video.name(), reason);
                let png = image::encode_png(&video::first_frame(&frames))?;
                Ok(EncodedMedia::new(png, image::PNG_FILENAME, image::PNG_CONTENT_TYPE, MediaKind::Image))
            }
            Err(e) => Err(e),
        }
    }

    fn encode_waveform(&self, waveform: &MediaTensor, sample_rate: u32) -> std::result::Result<Vec<u8>, BackendError> {
        let mono = audio::mono_samples(waveform.view())?;
        let pcm = audio::quantize(&mono);
        self.audio.encode_wav(&pcm, sample_rate)
    }
}

impl Default for MediaEncoder {
    fn default() -> Self {
        Self::new(Box::new(FfmpegVideoBackend), Box::new(HoundWavBackend))
    }
}
