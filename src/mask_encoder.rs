use std::path::Path;

use image::{DynamicImage, GrayImage, Luma};
use ndarray::prelude::*;
use nshare::AsNdarray3;

use crate::errors::{FundusSegError, Result};
use crate::imageops_ai::resize_nearest;

/// `[H, W, C]` binary lesion mask stored as 0.0 / 1.0.
pub type MaskTensor = Array3<f32>;

/// Expands a single-channel label mask into `class_count` binary channels.
///
/// The source data only labels "lesion present", so the same binary mask is
/// broadcast to every class channel. Channels are therefore identical and do
/// not discriminate MA/HE/SE/EX; models trained on these archives learn the
/// union of lesion types in every slot.
#[derive(Debug, Clone, Copy)]
pub struct MaskEncoder {
    target_resolution: u32,
    class_count: usize,
}

impl MaskEncoder {
    pub const fn new(target_resolution: u32, class_count: usize) -> Self {
        Self {
            target_resolution,
            class_count,
        }
    }

    pub const fn target_resolution(&self) -> u32 {
        self.target_resolution
    }

    pub const fn class_count(&self) -> usize {
        self.class_count
    }

    pub fn encode(&self, path: &Path) -> Result<MaskTensor> {
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

    pub fn encode_image(&self, image: &DynamicImage) -> Result<MaskTensor> {
        if image.width() == 0 || image.height() == 0 {
            return Err(FundusSegError::Shape {
                subject: "mask".to_string(),
                reason: format!(
                    "has an empty pixel grid ({}x{})",
                    image.width(),
                    image.height()
                ),
            });
        }

        let labels = binarize(&foreground(image), self.target_resolution);
        let size = self.target_resolution as usize;
        Ok(Array3::from_shape_fn(
            (size, size, self.class_count),
            |(y, x, _)| labels[[y, x]],
        ))
    }
}

/// Marks every pixel with any non-zero colour channel as 255, at the source bit
/// depth. Alpha is ignored.
fn foreground(image: &DynamicImage) -> GrayImage {
    let rgb = image.to_rgb32f();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let lesion = rgb.get_pixel(x, y).0.iter().any(|&c| c > 0.0);
        Luma([if lesion { u8::MAX } else { 0 }])
    })
}

/// Nearest-neighbour resize followed by `value > 0 -> 1.0`.
fn binarize(mask: &GrayImage, target_resolution: u32) -> Array2<f32> {
    let resized = resize_nearest(mask, target_resolution, target_resolution);
    resized
        .as_ndarray3()
        .index_axis_move(Axis(0), 0)
        .mapv(|v| if v > 0 { 1.0 } else { 0.0 })
}
