use std::path::Path;

use image::{imageops, imageops::FilterType, DynamicImage, Rgb, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;

use crate::errors::{FundusSegError, Result};

/// `[H, W, 3]` RGB image with values in `[0, 1]`.
pub type ImageTensor = Array3<f32>;

/// Decodes fundus images into fixed-size, normalized RGB tensors.
///
/// Resizing uses bilinear interpolation, which blends neighbouring pixels and
/// is only valid for continuous imagery. Masks go through `MaskEncoder`.
#[derive(Debug, Clone, Copy)]
pub struct ImageCodec {
    target_resolution: u32,
}

impl ImageCodec {
    pub const fn new(target_resolution: u32) -> Self {
        Self { target_resolution }
    }

    pub const fn target_resolution(&self) -> u32 {
        self.target_resolution
    }

    pub fn encode(&self, path: &Path) -> Result<ImageTensor> {
        let image = image::open(path).map_err(|source| FundusSegError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        self.encode_image(&image).map_err(|e| match e {
            FundusSegError::Shape { reason, .. } => FundusSegError::Shape {
                subject: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn encode_image(&self, image: &DynamicImage) -> Result<ImageTensor> {
        if image.width() == 0 || image.height() == 0 {
            return Err(FundusSegError::Shape {
                subject: "image".to_string(),
                reason: format!(
                    "has an empty pixel grid ({}x{})",
                    image.width(),
                    image.height()
                ),
            });
        }

        let rgb = image.to_rgb8();
        let resized = imageops::resize(
            &rgb,
            self.target_resolution,
            self.target_resolution,
            FilterType::Triangle,
        );

        // (C, H, W) -> (H, W, C) に並び替え
        let tensor = resized
            .as_ndarray3()
            .permuted_axes([1, 2, 0])
            .mapv(|v| f32::from(v) / 255.0);
        Ok(tensor.as_standard_layout().into_owned())
    }
}

/// Converts a `[H, W, 3]` tensor in `[0, 1]` back to 8-bit RGB.
pub fn tensor_to_rgb(tensor: ArrayView3<f32>) -> Result<RgbImage> {
    let (height, width, channels) = tensor.dim();
    if channels != 3 {
        return Err(FundusSegError::Shape {
            subject: "image tensor".to_string(),
            reason: format!("has {channels} channels, expected 3"),
        });
    }
    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            to_u8(tensor[[y, x, 0]]),
            to_u8(tensor[[y, x, 1]]),
            to_u8(tensor[[y, x, 2]]),
        ])
    }))
}
