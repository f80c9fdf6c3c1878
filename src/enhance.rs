//! Color boost for flat aerial and street imagery, plus the property outline
//! drawn on satellite tiles.

use image::{ColorType, DynamicImage, Rgb, RgbImage};

use crate::raster::reflect_index;

const VALUE_GAIN: f32 = 1.1;
const GRAYSCALE_BASE_SATURATION: f32 = 50.0 / 255.0;
const SHARPEN_KERNEL: [f32; 9] = [0.0, -0.5, 0.0, -0.5, 3.0, -0.5, 0.0, -0.5, 0.0];

/// HSV saturation boost, a 10% value lift and a mild sharpen. Grayscale inputs
/// have no saturation to scale, so they get a fixed base saturation instead.
pub fn enhance_image(image: &DynamicImage, boost: f32) -> RgbImage {
    let grayscale = matches!(
        image.color(),
        ColorType::L8 | ColorType::L16 | ColorType::La8 | ColorType::La16
    );
    let mut rgb = image.to_rgb8();

    for pixel in rgb.pixels_mut() {
        let (h, s, v) = rgb_to_hsv(*pixel);
        let s = if grayscale {
            (s + GRAYSCALE_BASE_SATURATION).min(1.0)
        } else {
            (s * boost).min(1.0)
        };
        let v = (v * VALUE_GAIN).min(1.0);
        *pixel = hsv_to_rgb(h, s, v);
    }

    sharpen(&rgb)
}

/// 3x3 convolution with [`SHARPEN_KERNEL`], reflecting at the borders.
fn sharpen(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let mut sum = [0.0_f32; 3];
        for (tap, weight) in SHARPEN_KERNEL.iter().enumerate() {
            if *weight == 0.0 {
                continue;
            }
            let sx = reflect_index(i64::from(x) + (tap % 3) as i64 - 1, width);
            let sy = reflect_index(i64::from(y) + (tap / 3) as i64 - 1, height);
            let source = image.get_pixel(sx, sy);
            for (acc, channel) in sum.iter_mut().zip(source.0) {
                *acc += weight * f32::from(channel);
            }
        }
        Rgb(sum.map(|v| v.round().clamp(0.0, 255.0) as u8))
    })
}

/// Rectangle outline inset by `inset_ratio` of each dimension.
pub fn draw_property_border(image: &RgbImage, color: [u8; 3], width: u32, inset_ratio: f32) -> RgbImage {
    let mut out = image.clone();
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || width == 0 {
        return out;
    }
    let ratio = inset_ratio.clamp(0.0, 0.5);
    let x1 = (w as f32 * ratio) as u32;
    let y1 = (h as f32 * ratio) as u32;
    let x2 = ((w as f32 * (1.0 - ratio)) as u32).min(w - 1);
    let y2 = ((h as f32 * (1.0 - ratio)) as u32).min(h - 1);

    // Stroke centered on the rectangle edge.
    let half = width / 2;
    let near = |value: u32, edge: u32| value + half >= edge && value <= edge + (width - half - 1);
    let color = Rgb(color);
    for y in y1.saturating_sub(half)..=(y2 + half).min(h - 1) {
        for x in x1.saturating_sub(half)..=(x2 + half).min(w - 1) {
            if near(x, x1) || near(x, x2) || near(y, y1) || near(y, y2) {
                out.put_pixel(x, y, color);
            }
        }
    }
    out
}

fn rgb_to_hsv(pixel: Rgb<u8>) -> (f32, f32, f32) {
    let [r, g, b] = pixel.0.map(|c| f32::from(c) / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta <= f32::EPSILON {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let s = if max <= f32::EPSILON { 0.0 } else { delta / max };
    (h, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
    let c = v * s;
    let hp = (h / 60.0).rem_euclid(6.0);
    let x = c * (1.0 - (hp.rem_euclid(2.0) - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = v - c;
    Rgb([r, g, b].map(|channel| ((channel + m) * 255.0).round().clamp(0.0, 255.0) as u8))
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma};

    use super::*;

    #[test]
    fn hsv_round_trip_is_exact_enough() {
        for pixel in [Rgb([255, 0, 0]), Rgb([12, 200, 99]), Rgb([40, 40, 40])] {
            let (h, s, v) = rgb_to_hsv(pixel);
            let back = hsv_to_rgb(h, s, v);
            for channel in 0..3 {
                assert!(back[channel].abs_diff(pixel[channel]) <= 1, "{pixel:?} -> {back:?}");
            }
        }
    }

    #[test]
    fn boost_increases_saturation_of_flat_color() {
        let muted = DynamicImage::ImageRgb8(RgbImage::from_pixel(5, 5, Rgb([140, 110, 100])));
        let enhanced = enhance_image(&muted, 1.5);
        let (_, s_before, _) = rgb_to_hsv(Rgb([140, 110, 100]));
        let (_, s_after, v_after) = rgb_to_hsv(*enhanced.get_pixel(2, 2));
        assert!(s_after > s_before);
        assert!(v_after > 140.0 / 255.0);
    }

    #[test]
    fn grayscale_input_gains_color() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(5, 5, Luma([120])));
        let enhanced = enhance_image(&gray, 1.5);
        let center = enhanced.get_pixel(2, 2);
        assert_ne!(center[0], center[2]);
    }

    #[test]
    fn sharpen_leaves_flat_regions_and_edges_intact() {
        let flat = RgbImage::from_pixel(4, 3, Rgb([90, 120, 30]));
        assert_eq!(sharpen(&flat), flat);
    }

    #[test]
    fn border_is_drawn_at_inset() {
        let image = RgbImage::from_pixel(100, 50, Rgb([0, 0, 0]));
        let out = draw_property_border(&image, [255, 0, 0], 3, 0.2);
        assert_eq!(out.get_pixel(20, 25), &Rgb([255, 0, 0]));
        assert_eq!(out.get_pixel(50, 10), &Rgb([255, 0, 0]));
        assert_eq!(out.get_pixel(50, 25), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(5, 5), &Rgb([0, 0, 0]));
    }
}
