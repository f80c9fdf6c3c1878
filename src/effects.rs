//! Camera-motion effects over a single still image.
//!
//! Every generator returns exactly the requested number of frames at the input
//! resolution and is fully deterministic: the same image, effect and frame count
//! always produce byte-identical frames.

use std::f64::consts::PI;

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::Serialize;

use crate::raster::translate_reflect;
use crate::schema::Transition;

/// Peak magnification reached at the zoomed-in end of a zoom effect.
pub const ZOOM_RANGE: f64 = 0.3;
/// Factors below this are close enough to the full frame that resampling
/// aliasing shows; those frames get a light blur.
pub const NEAR_FULL_FRAME_FACTOR: f64 = 1.02;
const NEAR_FULL_FRAME_SIGMA: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PanDirection {
    Right,
    Left,
    Up,
    Down,
}

impl PanDirection {
    pub fn is_horizontal(self) -> bool {
        matches!(self, Self::Right | Self::Left)
    }

    /// `right` and `down` run the offset curve backwards so every direction
    /// reads as the same perceived camera move.
    fn is_reversed(self) -> bool {
        matches!(self, Self::Right | Self::Down)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EffectKind {
    Zoom { zoom_in: bool },
    Pan { direction: PanDirection },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectDescriptor {
    pub kind: EffectKind,
    pub frames: usize,
}

/// Cosine ease-in-out on `[0, 1]`.
#[inline]
pub fn ease(t: f64) -> f64 {
    (1.0 - (PI * t.clamp(0.0, 1.0)).cos()) * 0.5
}

fn ease_at(index: usize, frame_count: usize) -> f64 {
    if frame_count <= 1 {
        return 0.0;
    }
    ease(index as f64 / (frame_count - 1) as f64)
}

/// Magnification per frame: `1 -> 1.3` when zooming in, `1.3 -> 1` when zooming out.
pub fn zoom_factors(frame_count: usize, zoom_in: bool) -> Vec<f64> {
    (0..frame_count)
        .map(|index| {
            let step = if zoom_in {
                index
            } else {
                frame_count - 1 - index
            };
            1.0 + ZOOM_RANGE * ease_at(step, frame_count)
        })
        .collect()
}

/// Pixel offset from the original framing per frame, never beyond `extent / 4`.
pub fn pan_offsets(frame_count: usize, extent: u32, direction: PanDirection) -> Vec<i64> {
    let max_shift = f64::from(extent / 4);
    (0..frame_count)
        .map(|index| {
            let step = if direction.is_reversed() {
                frame_count - 1 - index
            } else {
                index
            };
            (max_shift * ease_at(step, frame_count)).round() as i64
        })
        .collect()
}

/// Centered crop extents `(width, height)` for a magnification, clamped to the
/// valid range so a frame is never dropped.
pub fn crop_extent(width: u32, height: u32, factor: f64) -> (u32, u32) {
    let factor = factor.max(1.0);
    let crop_w = ((f64::from(width) / factor).round() as u32).clamp(1, width);
    let crop_h = ((f64::from(height) / factor).round() as u32).clamp(1, height);
    (crop_w, crop_h)
}

pub fn zoom_frame(image: &RgbImage, factor: f64) -> RgbImage {
    let (width, height) = image.dimensions();
    let (crop_w, crop_h) = crop_extent(width, height, factor);
    let x = (width - crop_w) / 2;
    let y = (height - crop_h) / 2;

    let frame = if crop_w == width && crop_h == height {
        image.clone()
    } else {
        let cropped = imageops::crop_imm(image, x, y, crop_w, crop_h).to_image();
        imageops::resize(&cropped, width, height, FilterType::CatmullRom)
    };

    if factor < NEAR_FULL_FRAME_FACTOR {
        imageops::blur(&frame, NEAR_FULL_FRAME_SIGMA)
    } else {
        frame
    }
}

pub fn pan_frame(image: &RgbImage, offset: i64, direction: PanDirection) -> RgbImage {
    if direction.is_horizontal() {
        translate_reflect(image, -offset, 0)
    } else {
        translate_reflect(image, 0, -offset)
    }
}

pub fn generate_frames(image: &RgbImage, descriptor: EffectDescriptor) -> Vec<RgbImage> {
    if descriptor.frames == 0 || image.width() == 0 || image.height() == 0 {
        return Vec::new();
    }

    match descriptor.kind {
        EffectKind::Zoom { zoom_in } => zoom_factors(descriptor.frames, zoom_in)
            .into_iter()
            .map(|factor| zoom_frame(image, factor))
            .collect(),
        EffectKind::Pan { direction } => {
            let extent = if direction.is_horizontal() {
                image.width()
            } else {
                image.height()
            };
            pan_offsets(descriptor.frames, extent, direction)
                .into_iter()
                .map(|offset| pan_frame(image, offset, direction))
                .collect()
        }
    }
}

const PAN_CYCLE: [PanDirection; 4] = [
    PanDirection::Right,
    PanDirection::Left,
    PanDirection::Up,
    PanDirection::Down,
];

/// Effect segments for the image at `index` under a transition style. Segment
/// frame counts always sum to `frames`.
pub fn plan_for_image(transition: Transition, index: usize, frames: usize) -> Vec<EffectDescriptor> {
    let zoom_in = index % 2 == 0;
    match transition {
        Transition::Zoom => vec![EffectDescriptor {
            kind: EffectKind::Zoom { zoom_in },
            frames,
        }],
        Transition::Pan => vec![EffectDescriptor {
            kind: EffectKind::Pan {
                direction: PAN_CYCLE[index % PAN_CYCLE.len()],
            },
            frames,
        }],
        Transition::Combined => {
            let zoom_frames = frames / 2;
            let direction = if index % 2 == 0 {
                PanDirection::Right
            } else {
                PanDirection::Left
            };
            vec![
                EffectDescriptor {
                    kind: EffectKind::Zoom { zoom_in },
                    frames: zoom_frames,
                },
                EffectDescriptor {
                    kind: EffectKind::Pan { direction },
                    frames: frames - zoom_frames,
                },
            ]
        }
    }
}

pub fn generate_for_image(
    image: &RgbImage,
    transition: Transition,
    index: usize,
    frames: usize,
) -> Vec<RgbImage> {
    let mut out = Vec::with_capacity(frames);
    for descriptor in plan_for_image(transition, index, frames) {
        out.extend(generate_frames(image, descriptor));
    }
    out
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    fn checker(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([230, 40, 40])
            } else {
                Rgb([20, 20, 200])
            }
        })
    }

    #[test]
    fn ease_hits_endpoints_and_midpoint() {
        assert!(ease(0.0).abs() < 1e-12);
        assert!((ease(1.0) - 1.0).abs() < 1e-12);
        assert!((ease(0.5) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn zoom_factors_are_symmetric_under_cosine_ease() {
        let factors = zoom_factors(10, true);
        assert_eq!(factors.len(), 10);
        assert!((factors[0] - 1.0).abs() < 1e-12);
        assert!((factors[9] - 1.3).abs() < 1e-12);
        for i in 0..10 {
            // f(i) - 1 + f(n-1-i) - 1 == 0.3 for the cosine ease.
            let pair = (factors[i] - 1.0) + (factors[9 - i] - 1.0);
            assert!((pair - ZOOM_RANGE).abs() < 1e-9, "index {i}: {pair}");
        }
        // Not linear: the first step is smaller than the linear step.
        assert!(factors[1] - factors[0] < ZOOM_RANGE / 9.0);
    }

    #[test]
    fn zoom_out_is_reverse_of_zoom_in() {
        let mut zoom_in = zoom_factors(7, true);
        zoom_in.reverse();
        assert_eq!(zoom_in, zoom_factors(7, false));
    }

    #[test]
    fn single_frame_zoom_is_full_frame() {
        assert_eq!(zoom_factors(1, true), vec![1.0]);
        assert_eq!(zoom_factors(1, false), vec![1.0]);
    }

    #[test]
    fn pan_offsets_never_exceed_quarter_extent() {
        for direction in PAN_CYCLE {
            for n in [1, 2, 5, 97] {
                let offsets = pan_offsets(n, 101, direction);
                assert_eq!(offsets.len(), n);
                assert!(offsets.iter().all(|o| (0..=25).contains(o)));
            }
        }
    }

    #[test]
    fn right_and_down_run_backwards() {
        let left = pan_offsets(6, 80, PanDirection::Left);
        let mut right = pan_offsets(6, 80, PanDirection::Right);
        right.reverse();
        assert_eq!(left, right);
        assert_eq!(left.first(), Some(&0));
        assert_eq!(left.last(), Some(&20));
    }

    #[test]
    fn crop_extent_clamps_degenerate_factors() {
        assert_eq!(crop_extent(64, 36, 1.0), (64, 36));
        assert_eq!(crop_extent(64, 36, 0.5), (64, 36));
        assert_eq!(crop_extent(2, 2, 1000.0), (1, 1));
    }

    #[test]
    fn generators_return_exact_count_and_resolution() {
        let image = checker(48, 27);
        let kinds = [
            EffectKind::Zoom { zoom_in: true },
            EffectKind::Zoom { zoom_in: false },
            EffectKind::Pan {
                direction: PanDirection::Up,
            },
            EffectKind::Pan {
                direction: PanDirection::Right,
            },
        ];
        for kind in kinds {
            for frames in [1, 2, 13] {
                let out = generate_frames(&image, EffectDescriptor { kind, frames });
                assert_eq!(out.len(), frames, "{kind:?}");
                assert!(out.iter().all(|f| f.dimensions() == (48, 27)));
            }
        }
    }

    #[test]
    fn tiny_image_still_yields_every_frame() {
        let image = checker(1, 1);
        let out = generate_frames(
            &image,
            EffectDescriptor {
                kind: EffectKind::Zoom { zoom_in: true },
                frames: 8,
            },
        );
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn zero_frames_yield_empty_sequence() {
        let image = checker(8, 8);
        let out = generate_frames(
            &image,
            EffectDescriptor {
                kind: EffectKind::Zoom { zoom_in: true },
                frames: 0,
            },
        );
        assert!(out.is_empty());
    }

    #[test]
    fn generation_is_deterministic() {
        let image = checker(32, 18);
        let first = generate_for_image(&image, Transition::Combined, 3, 9);
        let second = generate_for_image(&image, Transition::Combined, 3, 9);
        assert_eq!(first, second);
    }

    #[test]
    fn combined_plan_splits_frames() {
        let plan = plan_for_image(Transition::Combined, 1, 11);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].frames + plan[1].frames, 11);
        assert_eq!(plan[0].kind, EffectKind::Zoom { zoom_in: false });
        assert_eq!(
            plan[1].kind,
            EffectKind::Pan {
                direction: PanDirection::Left
            }
        );
    }

    #[test]
    fn pan_cycles_through_directions() {
        let directions: Vec<_> = (0..5)
            .map(|i| plan_for_image(Transition::Pan, i, 4)[0].kind)
            .collect();
        assert_eq!(
            directions[4],
            EffectKind::Pan {
                direction: PanDirection::Right
            }
        );
        assert_eq!(
            directions[2],
            EffectKind::Pan {
                direction: PanDirection::Up
            }
        );
    }
}
