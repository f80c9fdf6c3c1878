//! Sequence stabilizer: track corners between consecutive frames, accumulate the
//! rigid camera trajectory, smooth it with a centered moving average and warp
//! each frame by the difference between the smoothed and the raw trajectory.
//!
//! Stabilization is best-effort. Whenever the sequence cannot be analysed the
//! frames come back untouched, tagged with the reason.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use serde::Serialize;
use tracing::debug;

use crate::raster::{to_gray, warp_rigid_reflect};

#[derive(Debug, Clone)]
pub struct StabilizerConfig {
    /// Moving-average window over the trajectory, in frames.
    pub window: usize,
    pub max_corners: usize,
    /// Corners weaker than `quality * strongest` are discarded.
    pub quality: f32,
    /// Minimum distance between corners at full resolution.
    pub min_distance: f32,
    /// Analysis happens on a grayscale copy no wider than this.
    pub analysis_width: u32,
    pub min_tracked_points: usize,
    pub patch_radius: u32,
    pub search_radius: u32,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            window: 30,
            max_corners: 200,
            quality: 0.01,
            min_distance: 30.0,
            analysis_width: 320,
            min_tracked_points: 10,
            patch_radius: 3,
            search_radius: 8,
        }
    }
}

impl StabilizerConfig {
    pub fn with_window(window: usize) -> Self {
        Self {
            window: window.max(1),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmodifiedReason {
    TooFewFrames,
    InsufficientFeatures,
    TrajectoryTooShort,
}

#[derive(Debug, Clone)]
pub enum StabilizeOutcome {
    Stabilized {
        frames: Vec<RgbImage>,
        /// Frames that received a non-trivial correction.
        corrected: usize,
    },
    Unmodified {
        frames: Vec<RgbImage>,
        reason: UnmodifiedReason,
    },
}

impl StabilizeOutcome {
    pub fn frames(&self) -> &[RgbImage] {
        match self {
            Self::Stabilized { frames, .. } | Self::Unmodified { frames, .. } => frames,
        }
    }

    pub fn into_frames(self) -> Vec<RgbImage> {
        match self {
            Self::Stabilized { frames, .. } | Self::Unmodified { frames, .. } => frames,
        }
    }

    pub fn is_stabilized(&self) -> bool {
        matches!(self, Self::Stabilized { .. })
    }
}

/// Rigid motion between two frames: translation about the frame center plus
/// rotation in radians.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Motion {
    pub dx: f32,
    pub dy: f32,
    pub da: f32,
}

impl Motion {
    fn add(self, other: Motion) -> Motion {
        Motion {
            dx: self.dx + other.dx,
            dy: self.dy + other.dy,
            da: self.da + other.da,
        }
    }

    fn sub(self, other: Motion) -> Motion {
        Motion {
            dx: self.dx - other.dx,
            dy: self.dy - other.dy,
            da: self.da - other.da,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

pub fn stabilize_sequence(frames: Vec<RgbImage>, config: &StabilizerConfig) -> StabilizeOutcome {
    if frames.len() < 3 {
        return StabilizeOutcome::Unmodified {
            frames,
            reason: UnmodifiedReason::TooFewFrames,
        };
    }

    let width = frames[0].width();
    let scale = (config.analysis_width as f32 / width as f32).min(1.0);
    let min_distance = (config.min_distance * scale).max(1.0);
    let margin = config.patch_radius + config.search_radius + 1;

    let mut prev_gray = analysis_gray(&frames[0], scale);
    let mut prev_points = detect_corners(&prev_gray, config.max_corners, config.quality, min_distance, margin);
    if prev_points.len() < config.min_tracked_points {
        debug!(corners = prev_points.len(), "not enough features to stabilize");
        return StabilizeOutcome::Unmodified {
            frames,
            reason: UnmodifiedReason::InsufficientFeatures,
        };
    }

    let mut steps = Vec::with_capacity(frames.len() - 1);
    for frame in frames.iter().skip(1) {
        let gray = analysis_gray(frame, scale);
        let pairs = track_points(&prev_gray, &gray, &prev_points, config);

        if pairs.len() < config.min_tracked_points {
            steps.push(Motion::default());
            prev_points =
                detect_corners(&gray, config.max_corners, config.quality, min_distance, margin);
            prev_gray = gray;
            continue;
        }

        let center = Point {
            x: (gray.width() as f32 - 1.0) * 0.5,
            y: (gray.height() as f32 - 1.0) * 0.5,
        };
        let motion = match estimate_partial_affine(&pairs, center) {
            Some(motion) => motion,
            None => steps.last().copied().unwrap_or_default(),
        };
        steps.push(motion);

        prev_points = pairs.into_iter().map(|(_, current)| current).collect();
        prev_gray = gray;
    }

    let trajectory = accumulate(&steps);
    if trajectory.len() <= config.window {
        return StabilizeOutcome::Unmodified {
            frames,
            reason: UnmodifiedReason::TrajectoryTooShort,
        };
    }
    let smoothed = smooth_trajectory(&trajectory, config.window);

    let inv_scale = 1.0 / scale;
    let mut corrected = 0;
    let mut out = Vec::with_capacity(frames.len());
    let mut iter = frames.into_iter();
    if let Some(first) = iter.next() {
        out.push(first);
    }
    for (index, frame) in iter.enumerate() {
        let correction = smoothed[index].sub(trajectory[index]);
        let tx = correction.dx * inv_scale;
        let ty = correction.dy * inv_scale;
        if tx.abs() >= 0.05 || ty.abs() >= 0.05 || correction.da.abs() >= 1e-4 {
            corrected += 1;
            out.push(warp_rigid_reflect(&frame, correction.da, tx, ty));
        } else {
            out.push(frame);
        }
    }

    StabilizeOutcome::Stabilized {
        frames: out,
        corrected,
    }
}

fn analysis_gray(frame: &RgbImage, scale: f32) -> GrayImage {
    let gray = to_gray(frame);
    if scale >= 1.0 {
        return gray;
    }
    let width = ((frame.width() as f32 * scale).round() as u32).max(1);
    let height = ((frame.height() as f32 * scale).round() as u32).max(1);
    imageops::resize(&gray, width, height, FilterType::Triangle)
}

/// Minimum-eigenvalue corners over a 3x3 structure tensor, strongest first,
/// with non-maximum suppression and a minimum spacing.
pub fn detect_corners(
    gray: &GrayImage,
    max_corners: usize,
    quality: f32,
    min_distance: f32,
    margin: u32,
) -> Vec<Point> {
    let (width, height) = gray.dimensions();
    if width <= 2 * margin + 2 || height <= 2 * margin + 2 {
        return Vec::new();
    }

    let w = width as usize;
    let h = height as usize;
    let px = |x: usize, y: usize| f32::from(gray.get_pixel(x as u32, y as u32)[0]);

    let mut ixx = vec![0.0_f32; w * h];
    let mut iyy = vec![0.0_f32; w * h];
    let mut ixy = vec![0.0_f32; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = (px(x + 1, y) - px(x - 1, y)) * 0.5;
            let gy = (px(x, y + 1) - px(x, y - 1)) * 0.5;
            let i = y * w + x;
            ixx[i] = gx * gx;
            iyy[i] = gy * gy;
            ixy[i] = gx * gy;
        }
    }

    let mut response = vec![0.0_f32; w * h];
    let mut strongest = 0.0_f32;
    for y in 2..h - 2 {
        for x in 2..w - 2 {
            let (mut a, mut b, mut c) = (0.0, 0.0, 0.0);
            for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    let i = ny * w + nx;
                    a += ixx[i];
                    b += ixy[i];
                    c += iyy[i];
                }
            }
            let half_trace = (a + c) * 0.5;
            let det_term = (((a - c) * 0.5).powi(2) + b * b).sqrt();
            let min_eigen = half_trace - det_term;
            response[y * w + x] = min_eigen;
            strongest = strongest.max(min_eigen);
        }
    }
    if strongest <= 0.0 {
        return Vec::new();
    }

    let threshold = strongest * quality;
    let margin = margin as usize;
    let mut candidates = Vec::new();
    for y in margin..h - margin {
        for x in margin..w - margin {
            let value = response[y * w + x];
            if value <= threshold {
                continue;
            }
            let is_peak = (y - 1..=y + 1).all(|ny| {
                (x - 1..=x + 1).all(|nx| response[ny * w + nx] <= value)
            });
            if is_peak {
                candidates.push((value, x, y));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.2.cmp(&b.2)).then(a.1.cmp(&b.1)));

    let min_distance_sq = min_distance * min_distance;
    let mut selected: Vec<Point> = Vec::new();
    for (_, x, y) in candidates {
        let point = Point {
            x: x as f32,
            y: y as f32,
        };
        let far_enough = selected.iter().all(|p| {
            let dx = p.x - point.x;
            let dy = p.y - point.y;
            dx * dx + dy * dy >= min_distance_sq
        });
        if far_enough {
            selected.push(point);
            if selected.len() >= max_corners {
                break;
            }
        }
    }
    selected
}

/// Block-matching flow: for each point search the next frame for the patch with
/// the lowest sum of absolute differences, refined to sub-pixel with a parabola
/// fit. Points whose best match is poor or leaves the frame are dropped.
pub fn track_points(
    prev: &GrayImage,
    next: &GrayImage,
    points: &[Point],
    config: &StabilizerConfig,
) -> Vec<(Point, Point)> {
    let (width, height) = prev.dimensions();
    let patch = config.patch_radius as i64;
    let search = config.search_radius as i64;
    let patch_area = ((2 * patch + 1) * (2 * patch + 1)) as f32;
    let max_mean_error = 24.0;

    let in_bounds = |x: i64, y: i64| {
        x - patch >= 0 && y - patch >= 0 && x + patch < width as i64 && y + patch < height as i64
    };

    let sad = |px: i64, py: i64, qx: i64, qy: i64| -> f32 {
        let mut total = 0_u32;
        for oy in -patch..=patch {
            for ox in -patch..=patch {
                let a = prev.get_pixel((px + ox) as u32, (py + oy) as u32)[0];
                let b = next.get_pixel((qx + ox) as u32, (qy + oy) as u32)[0];
                total += u32::from(a.abs_diff(b));
            }
        }
        total as f32
    };

    let mut pairs = Vec::with_capacity(points.len());
    for point in points {
        let px = point.x.round() as i64;
        let py = point.y.round() as i64;
        if !in_bounds(px, py) {
            continue;
        }

        let side = (2 * search + 1) as usize;
        let mut costs = vec![f32::INFINITY; side * side];
        let mut best = (f32::INFINITY, 0_i64, 0_i64);
        for dy in -search..=search {
            for dx in -search..=search {
                let (qx, qy) = (px + dx, py + dy);
                if !in_bounds(qx, qy) {
                    continue;
                }
                let cost = sad(px, py, qx, qy);
                costs[((dy + search) as usize) * side + (dx + search) as usize] = cost;
                if cost < best.0 {
                    best = (cost, dx, dy);
                }
            }
        }

        let (cost, dx, dy) = best;
        if !cost.is_finite() || cost / patch_area > max_mean_error {
            continue;
        }

        let at = |ox: i64, oy: i64| -> Option<f32> {
            let (x, y) = (dx + ox, dy + oy);
            if x < -search || x > search || y < -search || y > search {
                return None;
            }
            let value = costs[((y + search) as usize) * side + (x + search) as usize];
            value.is_finite().then_some(value)
        };
        let sub_x = parabola_offset(at(-1, 0), cost, at(1, 0));
        let sub_y = parabola_offset(at(0, -1), cost, at(0, 1));

        pairs.push((
            Point {
                x: px as f32,
                y: py as f32,
            },
            Point {
                x: (px + dx) as f32 + sub_x,
                y: (py + dy) as f32 + sub_y,
            },
        ));
    }
    pairs
}

fn parabola_offset(left: Option<f32>, center: f32, right: Option<f32>) -> f32 {
    match (left, right) {
        (Some(l), Some(r)) => {
            let denominator = l - 2.0 * center + r;
            if denominator > f32::EPSILON {
                ((l - r) / (2.0 * denominator)).clamp(-0.5, 0.5)
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

/// Least-squares similarity fit `q = s R p + t` with one trimmed refit, reported
/// as rotation plus translation about `center`.
pub fn estimate_partial_affine(pairs: &[(Point, Point)], center: Point) -> Option<Motion> {
    let fit = fit_similarity(pairs)?;
    let residuals: Vec<f32> = pairs
        .iter()
        .map(|(p, q)| {
            let (x, y) = fit.apply(*p);
            ((x - q.x).powi(2) + (y - q.y).powi(2)).sqrt()
        })
        .collect();
    let inliers: Vec<(Point, Point)> = pairs
        .iter()
        .zip(&residuals)
        .filter(|(_, residual)| **residual <= 2.0)
        .map(|(pair, _)| *pair)
        .collect();
    let fit = if inliers.len() >= 3 && inliers.len() < pairs.len() {
        fit_similarity(&inliers).unwrap_or(fit)
    } else {
        fit
    };

    // Re-express the translation about the frame center: q - c = R (p - c) + t_c.
    let (rx, ry) = fit.rotate(center);
    Some(Motion {
        dx: fit.tx + rx - center.x,
        dy: fit.ty + ry - center.y,
        da: fit.b.atan2(fit.a),
    })
}

#[derive(Debug, Clone, Copy)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    fn rotate(&self, p: Point) -> (f32, f32) {
        (self.a * p.x - self.b * p.y, self.b * p.x + self.a * p.y)
    }

    fn apply(&self, p: Point) -> (f32, f32) {
        let (x, y) = self.rotate(p);
        (x + self.tx, y + self.ty)
    }
}

fn fit_similarity(pairs: &[(Point, Point)]) -> Option<Similarity> {
    if pairs.len() < 3 {
        return None;
    }
    let n = pairs.len() as f32;
    let (mut pmx, mut pmy, mut qmx, mut qmy) = (0.0, 0.0, 0.0, 0.0);
    for (p, q) in pairs {
        pmx += p.x;
        pmy += p.y;
        qmx += q.x;
        qmy += q.y;
    }
    pmx /= n;
    pmy /= n;
    qmx /= n;
    qmy /= n;

    let (mut norm, mut dot, mut cross) = (0.0_f32, 0.0_f32, 0.0_f32);
    for (p, q) in pairs {
        let (px, py) = (p.x - pmx, p.y - pmy);
        let (qx, qy) = (q.x - qmx, q.y - qmy);
        norm += px * px + py * py;
        dot += px * qx + py * qy;
        cross += px * qy - py * qx;
    }
    if norm < 1e-6 {
        return None;
    }

    let a = dot / norm;
    let b = cross / norm;
    Some(Similarity {
        a,
        b,
        tx: qmx - (a * pmx - b * pmy),
        ty: qmy - (b * pmx + a * pmy),
    })
}

fn accumulate(steps: &[Motion]) -> Vec<Motion> {
    let mut total = Motion::default();
    steps
        .iter()
        .map(|step| {
            total = total.add(*step);
            total
        })
        .collect()
}

/// Centered moving average; windows are truncated at the sequence ends.
pub fn smooth_trajectory(trajectory: &[Motion], window: usize) -> Vec<Motion> {
    let half = window / 2;
    (0..trajectory.len())
        .map(|index| {
            let start = index.saturating_sub(half);
            let end = (index + half + 1).min(trajectory.len());
            let slice = &trajectory[start..end];
            let count = slice.len() as f32;
            let sum = slice.iter().fold(Motion::default(), |acc, m| acc.add(*m));
            Motion {
                dx: sum.dx / count,
                dy: sum.dy / count,
                da: sum.da / count,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;
    use crate::grading::XorShift64;
    use crate::raster::translate_reflect;

    fn noise_texture(width: u32, height: u32, seed: u64) -> RgbImage {
        let mut rng = XorShift64::from_seed(seed);
        RgbImage::from_fn(width, height, |_, _| {
            let v = (rng.next_u64() & 0xFF) as u8;
            Rgb([v, v, v])
        })
    }

    fn mean_abs_diff(a: &RgbImage, b: &RgbImage) -> f64 {
        let total: u64 = a
            .as_raw()
            .iter()
            .zip(b.as_raw())
            .map(|(x, y)| u64::from(x.abs_diff(*y)))
            .sum();
        total as f64 / a.as_raw().len() as f64
    }

    #[test]
    fn fewer_than_three_frames_pass_through() {
        let frames = vec![noise_texture(32, 32, 1), noise_texture(32, 32, 2)];
        let outcome = stabilize_sequence(frames.clone(), &StabilizerConfig::default());
        assert!(matches!(
            outcome,
            StabilizeOutcome::Unmodified {
                reason: UnmodifiedReason::TooFewFrames,
                ..
            }
        ));
        assert_eq!(outcome.into_frames(), frames);
    }

    #[test]
    fn featureless_sequence_is_reported_unmodified() {
        let flat = RgbImage::from_pixel(200, 120, Rgb([90, 90, 90]));
        let frames = vec![flat; 40];
        let outcome = stabilize_sequence(frames.clone(), &StabilizerConfig::with_window(10));
        assert!(matches!(
            outcome,
            StabilizeOutcome::Unmodified {
                reason: UnmodifiedReason::InsufficientFeatures,
                ..
            }
        ));
        assert_eq!(outcome.frames(), frames.as_slice());
    }

    #[test]
    fn short_trajectory_is_reported_unmodified() {
        let base = noise_texture(320, 180, 7);
        let frames = vec![base; 8];
        let outcome = stabilize_sequence(frames, &StabilizerConfig::with_window(30));
        assert!(matches!(
            outcome,
            StabilizeOutcome::Unmodified {
                reason: UnmodifiedReason::TrajectoryTooShort,
                ..
            }
        ));
    }

    #[test]
    fn jitter_is_reduced_and_first_frame_is_kept() {
        let base = noise_texture(320, 180, 42);
        let frames: Vec<RgbImage> = (0..40)
            .map(|k| translate_reflect(&base, if k % 2 == 0 { 0 } else { 3 }, 0))
            .collect();

        let before: f64 = frames
            .windows(2)
            .map(|pair| mean_abs_diff(&pair[0], &pair[1]))
            .sum();

        let outcome = stabilize_sequence(frames.clone(), &StabilizerConfig::with_window(10));
        assert!(outcome.is_stabilized());
        let stabilized = outcome.into_frames();
        assert_eq!(stabilized.len(), frames.len());
        assert_eq!(stabilized[0], frames[0]);

        let after: f64 = stabilized
            .windows(2)
            .skip(1)
            .map(|pair| mean_abs_diff(&pair[0], &pair[1]))
            .sum();
        assert!(
            after < before * 0.5,
            "jitter should drop: before {before:.1}, after {after:.1}"
        );
    }

    #[test]
    fn pure_translation_is_recovered() {
        let center = Point { x: 50.0, y: 40.0 };
        let pairs: Vec<(Point, Point)> = (0..12)
            .map(|i| {
                let p = Point {
                    x: (i * 7 % 90) as f32,
                    y: (i * 13 % 70) as f32,
                };
                (p, Point { x: p.x + 2.5, y: p.y - 1.0 })
            })
            .collect();
        let motion = estimate_partial_affine(&pairs, center).expect("fit should succeed");
        assert!((motion.dx - 2.5).abs() < 1e-3);
        assert!((motion.dy + 1.0).abs() < 1e-3);
        assert!(motion.da.abs() < 1e-4);
    }

    #[test]
    fn moving_average_keeps_constant_trajectory() {
        let trajectory = vec![
            Motion {
                dx: 2.0,
                dy: -1.0,
                da: 0.0
            };
            9
        ];
        assert_eq!(smooth_trajectory(&trajectory, 4), trajectory);
    }
}
