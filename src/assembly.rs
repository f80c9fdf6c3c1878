//! Turns a validated [`RenderRequest`] into an MP4: probe the narration, split
//! its duration into per-image frame budgets, then generate, post-process and
//! stream every image's frames into the encoder in source order.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::effects::{generate_for_image, plan_for_image, EffectDescriptor};
use crate::encoding::{EncodeSettings, EncoderFactory, FrameSink};
use crate::enhance::enhance_image;
use crate::grading::apply_grade;
use crate::overlay::OverlayLayer;
use crate::probe::DurationProbe;
use crate::progress::ProgressReporter;
use crate::raster::{load_image, optimize_for_video};
use crate::schema::RenderRequest;
use crate::stabilize::{stabilize_sequence, StabilizeOutcome, StabilizerConfig};

pub const DEFAULT_SILENT_SECONDS_PER_IMAGE: f64 = 4.0;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("İşlem iptal edildi")]
    Canceled,
    #[error("Video oluşturma hatası: {primary}; yedek kodlayıcı da başarısız oldu: {fallback}")]
    EncodeFailed { primary: String, fallback: String },
    /// A source image could not be turned into frames; the encoder is not at fault.
    #[error("Görüntü işlenemedi ({}): {reason}", path.display())]
    ImageFailed { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct AssemblyOptions {
    pub output_dir: PathBuf,
    pub silent_seconds_per_image: f64,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            silent_seconds_per_image: DEFAULT_SILENT_SECONDS_PER_IMAGE,
        }
    }
}

/// Everything decided before the first frame is rendered.
#[derive(Debug, Clone, Serialize)]
pub struct RenderPlan {
    pub job_id: String,
    pub images: Vec<PathBuf>,
    pub duration_seconds: f64,
    /// Narration that will be muxed; `None` renders a silent clip.
    pub narration: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: String,
    pub frames_per_image: Vec<usize>,
    pub effects: Vec<Vec<EffectDescriptor>>,
    pub output: PathBuf,
}

impl RenderPlan {
    pub fn total_frames(&self) -> usize {
        self.frames_per_image.iter().sum()
    }

    pub fn is_silent(&self) -> bool {
        self.narration.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSummary {
    pub output: PathBuf,
    pub frames: usize,
    pub fps: u32,
    pub duration_seconds: f64,
    pub video_codec: String,
    pub used_fallback: bool,
    pub silent: bool,
    pub stabilized_images: usize,
}

/// Splits `round(duration * fps)` frames over `images`; the first
/// `total % images` images get one extra frame.
pub fn frame_budget(duration_seconds: f64, fps: u32, images: usize) -> Vec<usize> {
    if images == 0 {
        return Vec::new();
    }
    let total = ((duration_seconds * f64::from(fps)).round().max(1.0)) as usize;
    let base = total / images;
    let extra = total % images;
    (0..images)
        .map(|index| base + usize::from(index < extra))
        .collect()
}

pub fn default_output_path(output_dir: &Path, job_id: &str) -> PathBuf {
    output_dir.join(format!("property_reel_{job_id}.mp4"))
}

/// Sibling path the encoder writes to until the render succeeds, e.g.
/// `video.mp4` -> `video.partial.mp4`. The extension is kept so the container
/// is still inferred from it.
pub fn staging_output_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_owned());
    let name = match output.extension() {
        Some(ext) => format!("{stem}.partial.{}", ext.to_string_lossy()),
        None => format!("{stem}.partial"),
    };
    output.with_file_name(name)
}

fn discard_staged_output(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed partial output"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = %path.display(), %error, "failed to remove partial output"),
    }
}

pub struct Assembler<'a> {
    encoder: &'a dyn EncoderFactory,
    probe: &'a dyn DurationProbe,
    options: AssemblyOptions,
}

impl<'a> Assembler<'a> {
    pub fn new(
        encoder: &'a dyn EncoderFactory,
        probe: &'a dyn DurationProbe,
        options: AssemblyOptions,
    ) -> Self {
        Self {
            encoder,
            probe,
            options,
        }
    }

    pub fn plan(&self, request: &RenderRequest, job_id: &str) -> Result<RenderPlan> {
        request.validate()?;
        let images = request.selected_images();
        self.plan_with_fps(request, job_id, images, request.fps)
    }

    fn plan_with_fps(
        &self,
        request: &RenderRequest,
        job_id: &str,
        images: Vec<PathBuf>,
        fps: u32,
    ) -> Result<RenderPlan> {
        let (narration, duration_seconds) = self.narration_duration(request, images.len());
        let frames_per_image = frame_budget(duration_seconds, fps, images.len());
        let effects = frames_per_image
            .iter()
            .enumerate()
            .map(|(index, frames)| plan_for_image(request.transition, index, *frames))
            .collect();
        let (width, height) = request.quality.dimensions();
        let output = request
            .output
            .clone()
            .unwrap_or_else(|| default_output_path(&self.options.output_dir, job_id));

        Ok(RenderPlan {
            job_id: job_id.to_owned(),
            images,
            duration_seconds,
            narration,
            width,
            height,
            fps,
            bitrate: request.quality.bitrate(),
            frames_per_image,
            effects,
            output,
        })
    }

    /// Narration duration, or the silent fallback when the narration is absent
    /// or cannot be probed.
    fn narration_duration(&self, request: &RenderRequest, images: usize) -> (Option<PathBuf>, f64) {
        let silent = self.options.silent_seconds_per_image * images as f64;
        let Some(path) = request.narration.as_ref() else {
            return (None, silent);
        };
        if !path.is_file() {
            warn!(path = %path.display(), "narration missing, rendering silent video");
            return (None, silent);
        }
        match self.probe.duration_seconds(path) {
            Ok(seconds) => (Some(path.clone()), seconds),
            Err(error) => {
                warn!(path = %path.display(), error = %format!("{error:#}"), "narration could not be probed, rendering silent video");
                (None, silent)
            }
        }
    }

    pub fn render(
        &self,
        request: &RenderRequest,
        job_id: &str,
        progress: &mut ProgressReporter<'_>,
        is_canceled: &dyn Fn() -> bool,
    ) -> Result<RenderSummary> {
        progress.preparing(0, 2, "Ses dosyası hazırlanıyor...");
        let plan = self.plan(request, job_id)?;
        info!(
            job = %plan.job_id,
            images = plan.images.len(),
            frames = plan.total_frames(),
            fps = plan.fps,
            silent = plan.is_silent(),
            "render planned"
        );

        progress.preparing(1, 2, "Görüntüler hazırlanıyor...");
        let overlay = match &request.overlay {
            Some(settings) => OverlayLayer::build(settings, plan.width, plan.height)?,
            None => None,
        };
        if let Some(parent) = plan.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create output directory {}", parent.display()))?;
        }

        let staging = staging_output_path(&plan.output);
        match self.encode_with_fallback(request, &plan, &staging, overlay.as_ref(), progress, is_canceled) {
            Ok(summary) => {
                fs::rename(&staging, &plan.output).with_context(|| {
                    format!("failed to move {} to {}", staging.display(), plan.output.display())
                })?;
                progress.done();
                Ok(summary)
            }
            Err(error) => {
                discard_staged_output(&staging);
                Err(error)
            }
        }
    }

    /// Encodes into `staging`, retrying once with the fallback profile when the
    /// encoder itself fails.
    fn encode_with_fallback(
        &self,
        request: &RenderRequest,
        plan: &RenderPlan,
        staging: &Path,
        overlay: Option<&OverlayLayer>,
        progress: &mut ProgressReporter<'_>,
        is_canceled: &dyn Fn() -> bool,
    ) -> Result<RenderSummary> {
        let settings = self.encode_settings(request, plan, staging);
        let primary_error = match self.encode(request, plan, &settings, overlay, progress, is_canceled) {
            Ok(stabilized_images) => return Ok(self.summary(plan, &settings, false, stabilized_images)),
            Err(error) if !is_encoder_failure(&error) => return Err(error),
            Err(error) => error,
        };

        warn!(error = %format!("{primary_error:#}"), "primary encode failed, retrying with fallback profile");
        discard_staged_output(staging);
        let fallback_settings = settings.fallback();
        let fallback_plan = self.plan_with_fps(request, &plan.job_id, plan.images.clone(), fallback_settings.fps)?;
        match self.encode(
            request,
            &fallback_plan,
            &fallback_settings,
            overlay,
            progress,
            is_canceled,
        ) {
            Ok(stabilized_images) => Ok(self.summary(&fallback_plan, &fallback_settings, true, stabilized_images)),
            Err(error) if !is_encoder_failure(&error) => Err(error),
            Err(fallback_error) => Err(anyhow::Error::new(AssemblyError::EncodeFailed {
                primary: format!("{primary_error:#}"),
                fallback: format!("{fallback_error:#}"),
            })),
        }
    }

    fn encode_settings(&self, request: &RenderRequest, plan: &RenderPlan, staging: &Path) -> EncodeSettings {
        let mut settings = EncodeSettings::primary(request.quality, plan.fps, staging);
        settings.narration = plan.narration.clone();
        settings.music = request.music.clone();
        settings
    }

    fn summary(
        &self,
        plan: &RenderPlan,
        settings: &EncodeSettings,
        used_fallback: bool,
        stabilized_images: usize,
    ) -> RenderSummary {
        RenderSummary {
            output: plan.output.clone(),
            frames: plan.total_frames(),
            fps: plan.fps,
            duration_seconds: plan.duration_seconds,
            video_codec: settings.video_codec.clone(),
            used_fallback,
            silent: plan.is_silent(),
            stabilized_images,
        }
    }

    /// One full encode attempt; returns how many images were stabilized.
    fn encode(
        &self,
        request: &RenderRequest,
        plan: &RenderPlan,
        settings: &EncodeSettings,
        overlay: Option<&OverlayLayer>,
        progress: &mut ProgressReporter<'_>,
        is_canceled: &dyn Fn() -> bool,
    ) -> Result<usize> {
        let mut sink = self.encoder.open(settings)?;
        match self.stream_images(request, plan, overlay, sink.as_mut(), progress, is_canceled) {
            Ok(stabilized) => {
                if settings.has_audio() {
                    progress.muxing_audio();
                }
                progress.writing();
                sink.finish()?;
                progress.written();
                Ok(stabilized)
            }
            Err(error) => {
                // Reap the encoder; the streaming error is the one worth reporting.
                if let Err(finish_error) = sink.finish() {
                    debug!(error = %format!("{finish_error:#}"), "encoder shutdown after failed stream");
                }
                Err(error)
            }
        }
    }

    fn stream_images(
        &self,
        request: &RenderRequest,
        plan: &RenderPlan,
        overlay: Option<&OverlayLayer>,
        sink: &mut dyn FrameSink,
        progress: &mut ProgressReporter<'_>,
        is_canceled: &dyn Fn() -> bool,
    ) -> Result<usize> {
        let count = plan.images.len();
        let mut first_frame = 0_u64;
        let mut stabilized_images = 0;

        for (index, (path, frames)) in plan.images.iter().zip(&plan.frames_per_image).enumerate() {
            if is_canceled() {
                return Err(AssemblyError::Canceled.into());
            }
            progress.image(index, count);
            if *frames == 0 {
                continue;
            }

            let (sequence, stabilized) = render_image(request, plan, path, index, *frames, first_frame, overlay)
                .map_err(|error| AssemblyError::ImageFailed {
                    path: path.clone(),
                    reason: format!("{error:#}"),
                })?;
            stabilized_images += usize::from(stabilized);
            first_frame += sequence.len() as u64;

            for frame in sequence {
                sink.write_frame(frame)?;
            }
            debug!(image = index, frames, "image streamed");
        }
        Ok(stabilized_images)
    }
}

/// All frames for one source image, fully post-processed. Returns whether the
/// stabilizer actually corrected the sequence.
fn render_image(
    request: &RenderRequest,
    plan: &RenderPlan,
    path: &Path,
    index: usize,
    frames: usize,
    first_frame: u64,
    overlay: Option<&OverlayLayer>,
) -> Result<(Vec<RgbImage>, bool)> {
    let decoded = load_image(path)?;
    let base = if request.enhance_colors {
        let enhanced = DynamicImage::ImageRgb8(enhance_image(&decoded, request.color_boost));
        optimize_for_video(&enhanced, plan.width, plan.height)
    } else {
        optimize_for_video(&decoded, plan.width, plan.height)
    };
    drop(decoded);

    let mut sequence = generate_for_image(&base, request.transition, index, frames);
    let mut stabilized = false;
    if request.stabilize {
        let config = StabilizerConfig::with_window(request.stabilize_window);
        sequence = match stabilize_sequence(sequence, &config) {
            StabilizeOutcome::Stabilized { frames, corrected } => {
                debug!(image = index, corrected, "sequence stabilized");
                stabilized = true;
                frames
            }
            StabilizeOutcome::Unmodified { frames, reason } => {
                debug!(image = index, ?reason, "sequence left unstabilized");
                frames
            }
        };
    }

    if let Some(grade) = request.grade {
        for (offset, frame) in sequence.iter_mut().enumerate() {
            *frame = apply_grade(frame, grade, first_frame + offset as u64);
        }
    }

    if let Some(overlay) = overlay {
        for frame in &mut sequence {
            overlay.composite(frame);
        }
    }

    Ok((sequence, stabilized))
}

/// Cancellation and bad source images are not retried with another codec.
fn is_encoder_failure(error: &anyhow::Error) -> bool {
    !matches!(
        error.downcast_ref::<AssemblyError>(),
        Some(AssemblyError::Canceled | AssemblyError::ImageFailed { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_distributes_remainder_to_leading_images() {
        // 10.5 s at 30 fps = 315 frames over 4 images.
        let budget = frame_budget(10.5, 30, 4);
        assert_eq!(budget, vec![79, 79, 79, 78]);
        assert_eq!(budget.iter().sum::<usize>(), 315);
    }

    #[test]
    fn budget_total_matches_rounded_duration() {
        for (duration, fps, images) in [(47.304, 30, 13), (3.3, 24, 5), (59.99, 60, 7)] {
            let total: usize = frame_budget(duration, fps, images).iter().sum();
            assert_eq!(total, (duration * f64::from(fps)).round() as usize);
        }
    }

    #[test]
    fn budget_for_no_images_is_empty() {
        assert!(frame_budget(10.0, 30, 0).is_empty());
    }

    #[test]
    fn default_output_uses_job_id() {
        let path = default_output_path(Path::new("out"), "abc");
        assert_eq!(path, PathBuf::from("out/property_reel_abc.mp4"));
    }

    #[test]
    fn staging_path_keeps_directory_and_extension() {
        assert_eq!(
            staging_output_path(Path::new("out/video.mp4")),
            PathBuf::from("out/video.partial.mp4")
        );
        assert_eq!(staging_output_path(Path::new("clip")), PathBuf::from("clip.partial"));
    }

    #[test]
    fn only_encoder_errors_trigger_the_fallback() {
        assert!(is_encoder_failure(&anyhow::anyhow!("Unknown encoder 'libx264'")));
        assert!(!is_encoder_failure(&AssemblyError::Canceled.into()));
        let image = AssemblyError::ImageFailed {
            path: PathBuf::from("a.png"),
            reason: "bozuk".to_owned(),
        };
        assert!(!is_encoder_failure(&image.into()));
    }
}
