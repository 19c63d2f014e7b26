//! Still-image preparation and PNG encoding

use std::io::Cursor;

use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, Rgb, Rgba};
use ndarray::{Array3, ArrayViewD, Axis, Ix3, IxDyn};

use crate::encoder::BackendError;
use crate::tensor::{first_item, to_u8_samples};

pub const PNG_CONTENT_TYPE: &str = "image/png";
pub const PNG_FILENAME: &str = "tensor_upload.png";

const CHANNEL_COUNTS: [usize; 3] = [1, 3, 4];

/// Bring an image tensor to an `[H, W, C]` byte frame.
///
/// Accepts `[B, H, W, C]` (first item taken), `[H, W, C]`, `[C, H, W]` and
/// grayscale `[H, W]`.
pub fn prepare_frame(view: ArrayViewD<'_, f32>) -> Result<Array3<u8>, BackendError> {
    let view = if view.ndim() == 4 {
        first_item(view).ok_or_else(|| BackendError::Failed("empty image batch".to_string()))?
    } else {
        view
    };

    let view = match view.ndim() {
        2 => view.insert_axis(Axis(2)),
        3 if CHANNEL_COUNTS.contains(&view.shape()[2]) => view,
        3 if CHANNEL_COUNTS.contains(&view.shape()[0]) => view.permuted_axes(IxDyn(&[1, 2, 0])),
        _ => {
            return Err(BackendError::Failed(format!(
                "unsupported image shape {:?}",
                view.shape()
            )))
        }
    };

    if view.is_empty() {
        return Err(BackendError::Failed("image has no pixels".to_string()));
    }

    to_u8_samples(&view)
        .into_dimensionality::<Ix3>()
        .map_err(|e| BackendError::Failed(e.to_string()))
}

/// Encode an `[H, W, C]` frame as PNG. Channel counts 1, 3 and 4 map to
/// grayscale, RGB and RGBA.
pub fn encode_png(frame: &Array3<u8>) -> Result<Vec<u8>, BackendError> {
    let (height, width, channels) = frame.dim();
    let (width, height) = (width as u32, height as u32);
    let raw: Vec<u8> = frame.iter().copied().collect();

    let image = match channels {
        1 => ImageBuffer::<Luma<u8>, _>::from_raw(width, height, raw).map(DynamicImage::ImageLuma8),
        3 => ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, raw).map(DynamicImage::ImageRgb8),
        4 => ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, raw).map(DynamicImage::ImageRgba8),
        n => {
            return Err(BackendError::Failed(format!(
                "unsupported channel count {}",
                n
            )))
        }
    }
    .ok_or_else(|| BackendError::Failed("pixel buffer does not match dimensions".to_string()))?;

    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| BackendError::Failed(format!("PNG encoding failed: {}", e)))?;
    Ok(buffer.into_inner())
}
