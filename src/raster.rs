//! Small raster helpers shared by the effect, stabilization and assembly stages.
//!
//! Frames are `image::RgbImage` throughout; every helper returns a new buffer.

use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Rgb, RgbImage};

pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("failed to decode image {}", path.display()))
}

/// Fits a decoded image to the render resolution: Lanczos resize that fills the
/// frame (center crop, no letterbox), normalized to 8-bit RGB.
pub fn optimize_for_video(image: &DynamicImage, width: u32, height: u32) -> RgbImage {
    if image.width() == width && image.height() == height {
        return image.to_rgb8();
    }
    image
        .resize_to_fill(width, height, FilterType::Lanczos3)
        .to_rgb8()
}

/// OpenCV `BORDER_REFLECT` indexing: `fedcba|abcdefgh|hgfedcb`.
#[inline]
pub fn reflect_index(index: i64, len: u32) -> u32 {
    debug_assert!(len > 0);
    let len = i64::from(len);
    if len == 1 {
        return 0;
    }
    let period = 2 * len;
    let mut i = index.rem_euclid(period);
    if i >= len {
        i = period - 1 - i;
    }
    i as u32
}

/// Integer translation with reflected borders. Output pixel `(x, y)` reads
/// source pixel `(x - dx, y - dy)`.
pub fn translate_reflect(image: &RgbImage, dx: i64, dy: i64) -> RgbImage {
    let (width, height) = image.dimensions();
    if dx == 0 && dy == 0 {
        return image.clone();
    }
    RgbImage::from_fn(width, height, |x, y| {
        let sx = reflect_index(i64::from(x) - dx, width);
        let sy = reflect_index(i64::from(y) - dy, height);
        *image.get_pixel(sx, sy)
    })
}

/// Bilinear sample with reflected borders.
#[inline]
pub fn sample_bilinear_reflect(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let x0 = x0 as i64;
    let y0 = y0 as i64;

    let xa = reflect_index(x0, width);
    let xb = reflect_index(x0 + 1, width);
    let ya = reflect_index(y0, height);
    let yb = reflect_index(y0 + 1, height);

    let p00 = image.get_pixel(xa, ya).0;
    let p10 = image.get_pixel(xb, ya).0;
    let p01 = image.get_pixel(xa, yb).0;
    let p11 = image.get_pixel(xb, yb).0;

    let mut out = [0_u8; 3];
    for channel in 0..3 {
        let top = f32::from(p00[channel]) * (1.0 - fx) + f32::from(p10[channel]) * fx;
        let bottom = f32::from(p01[channel]) * (1.0 - fx) + f32::from(p11[channel]) * fx;
        out[channel] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Applies `p' = R(angle) (p - c) + c + t` about the frame center `c`, reflecting
/// at the borders. Identity transforms return a plain copy.
pub fn warp_rigid_reflect(image: &RgbImage, angle: f32, tx: f32, ty: f32) -> RgbImage {
    if angle.abs() < 1e-6 && tx.abs() < 1e-3 && ty.abs() < 1e-3 {
        return image.clone();
    }

    let (width, height) = image.dimensions();
    let cx = (width as f32 - 1.0) * 0.5;
    let cy = (height as f32 - 1.0) * 0.5;
    let (sin, cos) = angle.sin_cos();

    RgbImage::from_fn(width, height, |x, y| {
        // Inverse map: p = R^-1 (p' - c - t) + c
        let px = x as f32 - cx - tx;
        let py = y as f32 - cy - ty;
        let sx = cos * px + sin * py + cx;
        let sy = -sin * px + cos * py + cy;
        sample_bilinear_reflect(image, sx, sy)
    })
}

/// Rec.601 luma, the weighting OpenCV uses for BGR->GRAY.
#[inline]
pub fn luma(pixel: &Rgb<u8>) -> f32 {
    0.299 * f32::from(pixel[0]) + 0.587 * f32::from(pixel[1]) + 0.114 * f32::from(pixel[2])
}

pub fn to_gray(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        image::Luma([luma(image.get_pixel(x, y)).round().clamp(0.0, 255.0) as u8])
    })
}
