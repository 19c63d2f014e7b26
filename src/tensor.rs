//! Media tensors and shape-based kind classification
//!
//! Tensors carry no type tag. Whether an array is a still image, a frame
//! sequence or a waveform is inferred from its rank and axis sizes. The
//! thresholds below are heuristics and overlap for some shapes (a `(3, 64, 64)`
//! array is an image here but could be a short 3-channel audio burst), so
//! callers that know better should pass a forced kind to the encoder.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            other => Err(format!("unknown media kind: {}", other)),
        }
    }
}

const IMAGE_CHANNELS: [usize; 3] = [1, 3, 4];

/// Guess the media kind of an array from its shape. Never fails; ambiguous
/// shapes resolve to [`MediaKind::Image`].
pub fn classify(shape: &[usize]) -> MediaKind {
    match shape.len() {
        1 => MediaKind::Audio,
        2 => {
            let (a, b) = (shape[0], shape[1]);
            // [C, T] or transposed [T, C]
            if (a < 10 && b > 1000) || (b < 10 && a > 1000) {
                MediaKind::Audio
            } else {
                MediaKind::Image
            }
        }
        3 => {
            let (a, b, c) = (shape[0], shape[1], shape[2]);
            if IMAGE_CHANNELS.contains(&c) && a > 10 && b > 10 {
                MediaKind::Image
            } else if IMAGE_CHANNELS.contains(&a) && b > 10 && c > 10 {
                MediaKind::Image
            } else if a < 10 && c > 1000 {
                MediaKind::Audio
            } else {
                MediaKind::Image
            }
        }
        // A leading axis longer than a typical batch is a frame count.
        4 if shape[0] > 10 => MediaKind::Video,
        4 => MediaKind::Image,
        5 => MediaKind::Video,
        _ => MediaKind::Image,
    }
}

/// Owned n-dimensional sample array handed over by a workflow step.
///
/// Layouts follow the usual conventions (`[B, F, H, W, C]` and subsets) with
/// values either normalized to `0..=1` or already in `0..=255`.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaTensor {
    data: ArrayD<f32>,
}

impl MediaTensor {
    pub fn new(data: ArrayD<f32>) -> Self {
        Self { data }
    }

    pub fn from_shape_vec(shape: &[usize], values: Vec<f32>) -> Result<Self, String> {
        ArrayD::from_shape_vec(IxDyn(shape), values)
            .map(Self::new)
            .map_err(|e| format!("invalid tensor shape {:?}: {}", shape, e))
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::new(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    pub fn view(&self) -> ArrayViewD<'_, f32> {
        self.data.view()
    }

    pub fn kind(&self) -> MediaKind {
        classify(self.shape())
    }

    pub fn into_inner(self) -> ArrayD<f32> {
        self.data
    }
}

impl From<ArrayD<f32>> for MediaTensor {
    fn from(data: ArrayD<f32>) -> Self {
        Self::new(data)
    }
}

/// Largest finite value in the view, or `0.0` for an empty array.
pub(crate) fn max_value(view: &ArrayViewD<'_, f32>) -> f32 {
    view.iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(None, |acc: Option<f32>, v| Some(acc.map_or(v, |m| m.max(v))))
        .unwrap_or(0.0)
}

/// Convert to 8-bit samples: values are scaled by 255 when the array looks
/// normalized (max <= 1.0), otherwise taken as already in byte range.
pub(crate) fn to_u8_samples(view: &ArrayViewD<'_, f32>) -> ArrayD<u8> {
    let scale = if max_value(view) <= 1.0 { 255.0 } else { 1.0 };
    // `as` saturates and maps NaN to 0
    view.mapv(|v| (v * scale) as u8)
}

/// Drop a leading batch axis by taking its first item. `None` when the batch
/// is empty.
pub(crate) fn first_item<'a>(view: ArrayViewD<'a, f32>) -> Option<ArrayViewD<'a, f32>> {
    if view.ndim() == 0 || view.len_of(Axis(0)) == 0 {
        return None;
    }
    Some(view.index_axis_move(Axis(0), 0))
}
