//! Render progress as a monotonic fraction plus a user-facing status line.

use serde::Serialize;

/// Phases of a render, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStage {
    Preparing,
    ProcessingImages,
    GeneratingVideo,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub fraction: f32,
    pub stage: RenderStage,
    pub message: String,
}

const PREPARE_END: f32 = 0.2;
const IMAGES_END: f32 = 0.8;
const WRITE_END: f32 = 0.95;

/// Forwards updates to a callback and never lets the fraction move backwards,
/// including across a fallback re-encode.
pub struct ProgressReporter<'a> {
    callback: Box<dyn FnMut(ProgressUpdate) + Send + 'a>,
    last: f32,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(callback: impl FnMut(ProgressUpdate) + Send + 'a) -> Self {
        Self {
            callback: Box::new(callback),
            last: 0.0,
        }
    }

    pub fn silent() -> Self {
        Self::new(|_| {})
    }

    pub fn fraction(&self) -> f32 {
        self.last
    }

    pub fn report(&mut self, fraction: f32, stage: RenderStage, message: impl Into<String>) {
        let fraction = fraction.clamp(0.0, 1.0).max(self.last);
        self.last = fraction;
        (self.callback)(ProgressUpdate {
            fraction,
            stage,
            message: message.into(),
        });
    }

    /// `step` of `steps` inside the preparation phase.
    pub fn preparing(&mut self, step: usize, steps: usize, message: impl Into<String>) {
        let fraction = PREPARE_END * ratio(step, steps);
        self.report(fraction, RenderStage::Preparing, message);
    }

    /// Called before image `index` (zero-based) of `count` is processed.
    pub fn image(&mut self, index: usize, count: usize) {
        let fraction = PREPARE_END + (IMAGES_END - PREPARE_END) * ratio(index, count);
        self.report(
            fraction,
            RenderStage::ProcessingImages,
            format!("Görüntü işleniyor {}/{}...", index + 1, count),
        );
    }

    pub fn muxing_audio(&mut self) {
        self.report(IMAGES_END, RenderStage::GeneratingVideo, "Ses ekleniyor...");
    }

    pub fn writing(&mut self) {
        let fraction = IMAGES_END + (WRITE_END - IMAGES_END) * 0.5;
        self.report(
            fraction,
            RenderStage::GeneratingVideo,
            "Video dosyası kaydediliyor...",
        );
    }

    pub fn written(&mut self) {
        self.report(WRITE_END, RenderStage::GeneratingVideo, "Video dosyası kaydedildi.");
    }

    pub fn done(&mut self) {
        self.report(1.0, RenderStage::Done, "Tamamlandı!");
    }
}

fn ratio(step: usize, steps: usize) -> f32 {
    if steps == 0 {
        return 1.0;
    }
    (step as f32 / steps as f32).clamp(0.0, 1.0)
}
