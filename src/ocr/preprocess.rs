use image::{DynamicImage, ImageBuffer, Luma, Rgba};

use crate::automation::config::RelativeRect;
use crate::ocr::engine::Preprocess;

/// Binarizes the panel: pixels brighter than `threshold` in every channel
/// become black text, everything else white.
///
/// The queue panel renders its labels in near-white over a translucent dark
/// backdrop, so this isolates the text from the map showing through.
pub fn threshold_bright_pixels(
    img: &ImageBuffer<Rgba<u8>, Vec<u8>>,
    threshold: u8,
) -> ImageBuffer<Luma<u8>, Vec<u8>> {
    ImageBuffer::from_fn(img.width(), img.height(), |x, y| {
        let Rgba([r, g, b, _]) = *img.get_pixel(x, y);
        let bright = r > threshold && g > threshold && b > threshold;
        Luma([if bright { 0 } else { 255 }])
    })
}

/// Cuts `region` out of a full screenshot. The rect is clamped to the
/// image, so a region hanging off the edge yields a smaller crop.
pub fn crop_region(
    img: &ImageBuffer<Rgba<u8>, Vec<u8>>,
    region: &RelativeRect,
) -> ImageBuffer<Rgba<u8>, Vec<u8>> {
    let (w, h) = img.dimensions();

    let x0 = ((region.x.max(0.0) * w as f32) as u32).min(w);
    let y0 = ((region.y.max(0.0) * h as f32) as u32).min(h);
    let rw = ((region.width.max(0.0) * w as f32) as u32).min(w - x0);
    let rh = ((region.height.max(0.0) * h as f32) as u32).min(h - y0);

    image::imageops::crop_imm(img, x0, y0, rw, rh).to_image()
}

/// Applies one OCR variant's preprocessing to the panel crop.
pub fn apply(panel: &ImageBuffer<Rgba<u8>, Vec<u8>>, preprocess: Preprocess) -> DynamicImage {
    match preprocess {
        Preprocess::None => DynamicImage::ImageRgba8(panel.clone()),
        Preprocess::Grayscale => DynamicImage::ImageRgba8(panel.clone()).grayscale(),
        Preprocess::BrightThreshold(t) => {
            DynamicImage::ImageLuma8(threshold_bright_pixels(panel, t))
        }
    }
}
