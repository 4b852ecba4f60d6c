use image::{GenericImageView, ImageBuffer, Pixel};

/// Nearest-neighbour resize that only ever copies source pixels, so label
/// values are never blended.
///
/// Destination pixel `(x, y)` samples source `(floor(x * w / nw), floor(y * h / nh))`.
pub fn resize_nearest<I, P>(
    image: &I,
    nwidth: u32,
    nheight: u32,
) -> ImageBuffer<P, Vec<P::Subpixel>>
where
    I: GenericImageView<Pixel = P>,
    P: Pixel + 'static,
{
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 || nwidth == 0 || nheight == 0 {
        return ImageBuffer::new(nwidth, nheight);
    }

    let scale = |dst: u32, src_len: u32, dst_len: u32| -> u32 {
        let src = u64::from(dst) * u64::from(src_len) / u64::from(dst_len);
        (src as u32).min(src_len - 1)
    };

    ImageBuffer::from_fn(nwidth, nheight, |x, y| {
        image.get_pixel(scale(x, width, nwidth), scale(y, height, nheight))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn test_downscale_keeps_only_source_values() {
        let src = GrayImage::from_fn(7, 5, |x, y| Luma([if (x + y) % 2 == 0 { 0 } else { 255 }]));
        let dst = resize_nearest(&src, 3, 3);

        assert_eq!(dst.dimensions(), (3, 3));
        assert!(dst.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    #[test]
    fn test_upscale_replicates_pixels() {
        let src = GrayImage::from_raw(2, 1, vec![10, 200]).unwrap();
        let dst = resize_nearest(&src, 4, 2);

        assert_eq!(dst.as_raw(), &vec![10, 10, 200, 200, 10, 10, 200, 200]);
    }

    #[test]
    fn test_identity_size() {
        let src = GrayImage::from_fn(4, 3, |x, y| Luma([(x * 10 + y) as u8]));
        let dst = resize_nearest(&src, 4, 3);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_empty_source() {
        let src = GrayImage::new(0, 0);
        let dst = resize_nearest(&src, 2, 2);
        assert_eq!(dst.dimensions(), (2, 2));
    }
}
