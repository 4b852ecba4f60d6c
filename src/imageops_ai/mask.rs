use anyhow::{anyhow, ensure, Result};
use image::{GenericImageView, ImageBuffer, Luma, Pixel, Primitive, Rgb};
use num_traits::AsPrimitive;

use crate::imageops_ai::get_max_value;

/// Weighted blend of a grayscale mask over an RGB image:
/// `out = image * (1 - mask_weight) + mask * mask_weight`, per channel.
pub fn blend_mask<I, M, SI, SM>(
    image: &I,
    mask: &M,
    mask_weight: f32,
) -> Result<ImageBuffer<Rgb<SI>, Vec<SI>>>
where
    I: GenericImageView<Pixel = Rgb<SI>>,
    M: GenericImageView<Pixel = Luma<SM>>,
    Rgb<SI>: Pixel<Subpixel = SI>,
    SI: Primitive + 'static + AsPrimitive<f32>,
    SM: Primitive + 'static + AsPrimitive<f32>,
    f32: AsPrimitive<SI>,
{
    ensure!(
        image.dimensions() == mask.dimensions(),
        "Image and mask dimensions do not match"
    );
    ensure!(
        (0.0..=1.0).contains(&mask_weight),
        "Mask weight must lie within [0, 1]"
    );

    let sm_max: f32 = get_max_value::<SM>().as_();
    let si_max: f32 = get_max_value::<SI>().as_();
    let rounding = if crate::imageops_ai::is_floating_point::<SI>() {
        0.0
    } else {
        0.5
    };

    let processed_pixels = image
        .pixels()
        .zip(mask.pixels())
        .flat_map(|(image_pixel, mask_pixel)| {
            let Rgb(channels) = image_pixel.2;
            let mask_value = (mask_pixel.2 .0[0].as_() / sm_max) * si_max;
            channels.map(|c| {
                let blended = c.as_() * (1.0 - mask_weight) + mask_value * mask_weight;
                (blended + rounding).min(si_max).as_()
            })
        })
        .collect::<Vec<SI>>();

    ImageBuffer::from_raw(image.width(), image.height(), processed_pixels)
        .ok_or_else(|| anyhow!("Failed to create ImageBuffer from processed pixels"))
}
