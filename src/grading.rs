//! Frame-level color grades. Every grade is a pure `frame -> frame` function;
//! the only per-frame input is the frame index, which seeds the vintage grain.

use image::{Rgb, RgbImage};

use crate::schema::ColorGrade;

const CINEMATIC_LIFT: f32 = 0.03;
const CINEMATIC_CURVE_MIX: f32 = 0.25;
const CINEMATIC_SATURATION: f32 = 1.1;

const WARM_SHIFT: (f32, f32) = (6.0, 12.0);
const WARM_VIGNETTE: f32 = 0.25;

const VINTAGE_GRAIN: i32 = 12;
const VINTAGE_VIGNETTE: f32 = 0.35;

/// Tiny deterministic PRNG (xorshift64*).
#[derive(Debug, Clone, Copy)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    /// `seed = 0` is remapped to a non-zero internal state so the generator
    /// cannot lock into an all-zero sequence.
    pub const fn from_seed(seed: u64) -> Self {
        let mixed = seed ^ 0x9E37_79B9_7F4A_7C15;
        let state = if mixed == 0 {
            0xA076_1D64_78BD_642F
        } else {
            mixed
        };
        Self { state }
    }

    #[inline(always)]
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform value in `[-amplitude, amplitude]`.
    #[inline(always)]
    pub fn next_symmetric(&mut self, amplitude: i32) -> i32 {
        if amplitude <= 0 {
            return 0;
        }
        let span = (2 * amplitude + 1) as u64;
        (self.next_u64() % span) as i32 - amplitude
    }
}

pub fn apply_grade(frame: &RgbImage, grade: ColorGrade, frame_index: u64) -> RgbImage {
    match grade {
        ColorGrade::Cinematic => cinematic(frame),
        ColorGrade::Warm => warm(frame),
        ColorGrade::Cool => cool(frame),
        ColorGrade::Vintage => vintage(frame, frame_index),
    }
}

#[inline]
fn smoothstep(v: f32) -> f32 {
    v * v * (3.0 - 2.0 * v)
}

#[inline]
fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

pub fn cinematic(frame: &RgbImage) -> RgbImage {
    let mut out = frame.clone();
    for pixel in out.pixels_mut() {
        let mut channels = [0.0_f32; 3];
        for (slot, value) in channels.iter_mut().zip(pixel.0) {
            let v = f32::from(value) / 255.0;
            let lifted = v + CINEMATIC_LIFT * (1.0 - v);
            *slot = lifted + (smoothstep(lifted) - lifted) * CINEMATIC_CURVE_MIX;
        }
        let luma = 0.299 * channels[0] + 0.587 * channels[1] + 0.114 * channels[2];
        for (value, channel) in pixel.0.iter_mut().zip(channels) {
            let saturated = luma + (channel - luma) * CINEMATIC_SATURATION;
            *value = to_u8(saturated.clamp(0.0, 1.0) * 255.0);
        }
    }
    out
}

pub fn warm(frame: &RgbImage) -> RgbImage {
    let shifted = shift_lab(frame, WARM_SHIFT.0, WARM_SHIFT.1);
    vignette(&shifted, WARM_VIGNETTE)
}

pub fn cool(frame: &RgbImage) -> RgbImage {
    shift_lab(frame, -WARM_SHIFT.0, -WARM_SHIFT.1)
}

pub fn vintage(frame: &RgbImage, frame_index: u64) -> RgbImage {
    let mut rng = XorShift64::from_seed(frame_index);
    let mut out = frame.clone();
    for pixel in out.pixels_mut() {
        let [r, g, b] = pixel.0.map(f32::from);
        let sepia = [
            0.393 * r + 0.769 * g + 0.189 * b,
            0.349 * r + 0.686 * g + 0.168 * b,
            0.272 * r + 0.534 * g + 0.131 * b,
        ];
        let grain = rng.next_symmetric(VINTAGE_GRAIN) as f32;
        pixel.0 = sepia.map(|v| to_u8(v + grain));
    }
    vignette(&out, VINTAGE_VIGNETTE)
}

/// Radial darkening: `1 - strength * (r / r_max)^2` from the frame center.
pub fn vignette(frame: &RgbImage, strength: f32) -> RgbImage {
    let (width, height) = frame.dimensions();
    let cx = (width as f32 - 1.0) * 0.5;
    let cy = (height as f32 - 1.0) * 0.5;
    let max_sq = (cx * cx + cy * cy).max(f32::EPSILON);

    let mut out = frame.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let factor = 1.0 - strength * ((dx * dx + dy * dy) / max_sq);
        pixel.0 = pixel.0.map(|v| to_u8(f32::from(v) * factor));
    }
    out
}

fn shift_lab(frame: &RgbImage, da: f32, db: f32) -> RgbImage {
    let mut out = frame.clone();
    for pixel in out.pixels_mut() {
        let [l, a, b] = rgb_to_lab(*pixel);
        *pixel = lab_to_rgb([l, a + da, b + db]);
    }
    out
}

// sRGB <-> CIELAB, D65 white point.
const WHITE: [f32; 3] = [0.950_47, 1.0, 1.088_83];
const EPSILON: f32 = 216.0 / 24_389.0;
const KAPPA: f32 = 24_389.0 / 27.0;

fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.040_45 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(v: f32) -> f32 {
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

pub fn rgb_to_lab(pixel: Rgb<u8>) -> [f32; 3] {
    let [r, g, b] = pixel.0.map(|v| srgb_to_linear(f32::from(v) / 255.0));
    let xyz = [
        0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b,
        0.212_672_9 * r + 0.715_152_2 * g + 0.072_175 * b,
        0.019_333_9 * r + 0.119_192 * g + 0.950_304_1 * b,
    ];
    let f = |t: f32| {
        if t > EPSILON {
            t.cbrt()
        } else {
            (KAPPA * t + 16.0) / 116.0
        }
    };
    let fx = f(xyz[0] / WHITE[0]);
    let fy = f(xyz[1] / WHITE[1]);
    let fz = f(xyz[2] / WHITE[2]);
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

pub fn lab_to_rgb(lab: [f32; 3]) -> Rgb<u8> {
    let fy = (lab[0] + 16.0) / 116.0;
    let fx = fy + lab[1] / 500.0;
    let fz = fy - lab[2] / 200.0;
    let inv = |f: f32| {
        let cube = f * f * f;
        if cube > EPSILON {
            cube
        } else {
            (116.0 * f - 16.0) / KAPPA
        }
    };
    let x = inv(fx) * WHITE[0];
    let y = inv(fy) * WHITE[1];
    let z = inv(fz) * WHITE[2];

    let linear = [
        3.240_454_2 * x - 1.537_138_5 * y - 0.498_531_4 * z,
        -0.969_266 * x + 1.876_010_8 * y + 0.041_556 * z,
        0.055_643_4 * x - 0.204_025_9 * y + 1.057_225_2 * z,
    ];
    Rgb(linear.map(|v| to_u8(linear_to_srgb(v.clamp(0.0, 1.0)) * 255.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swatch() -> RgbImage {
        RgbImage::from_fn(24, 16, |x, y| {
            Rgb([(x * 10) as u8, (y * 15) as u8, ((x + y) * 6) as u8])
        })
    }

    #[test]
    fn cinematic_keeps_neutral_pixels_neutral() {
        let gray = RgbImage::from_fn(8, 1, |x, _| {
            let v = (x * 36) as u8;
            Rgb([v, v, v])
        });
        let twice = cinematic(&cinematic(&gray));
        for pixel in twice.pixels() {
            assert_eq!(pixel[0], pixel[1]);
            assert_eq!(pixel[1], pixel[2]);
        }
    }

    #[test]
    fn cinematic_lifts_black() {
        let black = RgbImage::from_pixel(2, 2, Rgb([0, 0, 0]));
        let graded = cinematic(&black);
        assert!(graded.get_pixel(0, 0)[0] > 0);
    }

    #[test]
    fn warm_and_cool_shift_in_opposite_directions() {
        let mid = RgbImage::from_pixel(1, 1, Rgb([128, 128, 128]));
        let warm = warm(&mid);
        let cool = cool(&mid);
        let w = warm.get_pixel(0, 0);
        let c = cool.get_pixel(0, 0);
        assert!(w[0] > w[2], "warm should favor red over blue: {w:?}");
        assert!(c[2] > c[0], "cool should favor blue over red: {c:?}");
    }

    #[test]
    fn lab_round_trip_is_close() {
        for pixel in [Rgb([0, 0, 0]), Rgb([255, 255, 255]), Rgb([200, 30, 90])] {
            let back = lab_to_rgb(rgb_to_lab(pixel));
            for channel in 0..3 {
                assert!(back[channel].abs_diff(pixel[channel]) <= 1, "{pixel:?} -> {back:?}");
            }
        }
    }

    #[test]
    fn vignette_darkens_corners_not_center() {
        let white = RgbImage::from_pixel(9, 9, Rgb([200, 200, 200]));
        let out = vignette(&white, VINTAGE_VIGNETTE);
        assert_eq!(out.get_pixel(4, 4)[0], 200);
        assert_eq!(out.get_pixel(0, 0)[0], 130);
    }

    #[test]
    fn vintage_grain_is_seeded_by_frame_index() {
        let frame = swatch();
        assert_eq!(vintage(&frame, 3), vintage(&frame, 3));
        assert_ne!(vintage(&frame, 3), vintage(&frame, 4));
    }

    #[test]
    fn symmetric_samples_stay_in_range() {
        let mut rng = XorShift64::from_seed(0);
        for _ in 0..1_000 {
            let v = rng.next_symmetric(VINTAGE_GRAIN);
            assert!((-VINTAGE_GRAIN..=VINTAGE_GRAIN).contains(&v));
        }
    }

    #[test]
    fn grades_preserve_dimensions() {
        let frame = swatch();
        for grade in [
            ColorGrade::Cinematic,
            ColorGrade::Warm,
            ColorGrade::Cool,
            ColorGrade::Vintage,
        ] {
            assert_eq!(apply_grade(&frame, grade, 0).dimensions(), frame.dimensions());
        }
    }
}
