//! Waveform preparation and WAV encoding

use std::io::Cursor;

use ndarray::{ArrayViewD, Axis};

use crate::encoder::BackendError;
use crate::tensor::{first_item, MediaTensor};

pub const WAV_CONTENT_TYPE: &str = "audio/wav";
pub const WAV_FILENAME: &str = "tensor_upload.wav";
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Channel axes no longer than this are treated as channels, not time.
const MAX_CHANNELS: usize = 8;

/// A waveform handed over together with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub waveform: MediaTensor,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn new(waveform: MediaTensor, sample_rate: u32) -> Self {
        Self {
            waveform,
            sample_rate,
        }
    }
}

/// Waveform encoder capability.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Write mono 16-bit PCM samples into a WAV container.
    fn encode_wav(&self, samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, BackendError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HoundWavBackend;

impl AudioBackend for HoundWavBackend {
    fn name(&self) -> &str {
        "hound"
    }

    fn encode_wav(&self, samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, BackendError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| BackendError::Failed(format!("WAV header: {}", e)))?;
            for sample in samples {
                writer
                    .write_sample(*sample)
                    .map_err(|e| BackendError::Failed(format!("WAV write: {}", e)))?;
            }
            writer
                .finalize()
                .map_err(|e| BackendError::Failed(format!("WAV finalize: {}", e)))?;
        }
        Ok(cursor.into_inner())
    }
}

/// Backend for deployments without a waveform writer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAudioBackend;

impl AudioBackend for NoAudioBackend {
    fn name(&self) -> &str {
        "none"
    }

    fn encode_wav(&self, _samples: &[i16], _sample_rate: u32) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::Unsupported("no waveform encoder configured".to_string()))
    }
}

/// Reduce `[B, C, T]`, `[C, T]`, `[T, C]` or `[T]` to mono samples.
///
/// A batch axis is dropped by taking the first item. Of the two remaining
/// axes, a short one (up to 8) facing a longer one is the channel axis and
/// gets averaged away; otherwise the first axis is.
pub fn mono_samples(view: ArrayViewD<'_, f32>) -> Result<Vec<f32>, BackendError> {
    let view = match view.ndim() {
        3 => first_item(view).ok_or_else(|| BackendError::Failed("empty audio batch".to_string()))?,
        1 | 2 => view,
        _ => {
            return Err(BackendError::Failed(format!(
                "unsupported audio waveform shape {:?}",
                view.shape()
            )))
        }
    };

    if view.is_empty() {
        return Err(BackendError::Failed("audio waveform is empty".to_string()));
    }

    if view.ndim() == 1 {
        return Ok(view.iter().copied().collect());
    }

    let (rows, cols) = (view.shape()[0], view.shape()[1]);
    let channel_axis = if cols <= MAX_CHANNELS && rows > cols {
        Axis(1)
    } else {
        Axis(0)
    };
    view.mean_axis(channel_axis)
        .map(|mono| mono.iter().copied().collect())
        .ok_or_else(|| BackendError::Failed("audio waveform is empty".to_string()))
}

/// Scale into `[-1, 1]` only when samples leave that range, then quantize to
/// 16-bit PCM.
pub fn quantize(samples: &[f32]) -> Vec<i16> {
    let peak = samples
        .iter()
        .filter(|v| v.is_finite())
        .fold(0.0f32, |acc, v| acc.max(v.abs()));
    let scale = if peak > 1.0 { 1.0 / peak } else { 1.0 };
    samples
        .iter()
        .map(|v| (v * scale * i16::MAX as f32) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_collapses_to_mono() {
        let tensor = MediaTensor::from_shape_vec(&[2, 3], vec![0.0, 0.2, 0.4, 1.0, 0.8, 0.6]).unwrap();
        let mono = mono_samples(tensor.view()).unwrap();
        assert_eq!(mono.len(), 3);
        assert!((mono[0] - 0.5).abs() < 1e-6);
        assert!((mono[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_transposed_channels_detected() {
        let tensor = MediaTensor::zeros(&[1000, 2]);
        assert_eq!(mono_samples(tensor.view()).unwrap().len(), 1000);
    }

    #[test]
    fn test_batch_takes_first_item() {
        let tensor = MediaTensor::zeros(&[3, 1, 500]);
        assert_eq!(mono_samples(tensor.view()).unwrap().len(), 500);
    }

    #[test]
    fn test_rank_four_and_empty_rejected() {
        assert!(mono_samples(MediaTensor::zeros(&[1, 1, 1, 10]).view()).is_err());
        assert!(mono_samples(MediaTensor::zeros(&[0]).view()).is_err());
    }

    #[test]
    fn test_quantize_only_normalizes_out_of_range() {
        assert_eq!(quantize(&[0.5, -1.0]), vec![16383, -32767]);
        assert_eq!(quantize(&[2.0, -4.0]), vec![16383, -32767]);
    }

    #[test]
    fn test_hound_writes_riff_header() {
        let wav = HoundWavBackend.encode_wav(&[0, 100, -100], DEFAULT_SAMPLE_RATE).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert!(wav.len() >= 44 + 6);
    }
}
