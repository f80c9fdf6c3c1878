use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::{self, FilterType};
use image::{Delay, DynamicImage, Frame, Rgba, RgbaImage};
use tracing::info;

use crate::raster::load_image;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewOptions {
    pub max_width: u32,
    pub max_height: u32,
    pub frame_ms: u32,
}

impl Default for PreviewOptions {
    fn default() -> Self {
        Self {
            max_width: 400,
            max_height: 300,
            frame_ms: 500,
        }
    }
}

/// Writes a looping GIF slideshow of `images`, each shrunk to fit the preview
/// bounds and centered on a shared canvas.
pub fn write_gif_preview(images: &[PathBuf], output: &Path, options: PreviewOptions) -> Result<()> {
    if images.is_empty() {
        bail!("preview needs at least one image");
    }

    let thumbnails = images
        .iter()
        .map(|path| load_image(path).map(|image| thumbnail(&image, options)))
        .collect::<Result<Vec<_>>>()?;

    let canvas_w = thumbnails.iter().map(RgbaImage::width).max().unwrap_or(1);
    let canvas_h = thumbnails.iter().map(RgbaImage::height).max().unwrap_or(1);

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = File::create(output)
        .with_context(|| format!("failed to create preview {}", output.display()))?;
    let mut encoder = GifEncoder::new(BufWriter::new(file));
    encoder
        .set_repeat(Repeat::Infinite)
        .context("failed to set GIF loop")?;

    let delay = Delay::from_numer_denom_ms(options.frame_ms, 1);
    let frames = thumbnails.into_iter().map(|thumb| {
        let mut canvas = RgbaImage::from_pixel(canvas_w, canvas_h, Rgba([0, 0, 0, 255]));
        let x = (canvas_w - thumb.width()) / 2;
        let y = (canvas_h - thumb.height()) / 2;
        imageops::overlay(&mut canvas, &thumb, i64::from(x), i64::from(y));
        Frame::from_parts(canvas, 0, 0, delay)
    });
    encoder
        .encode_frames(frames)
        .with_context(|| format!("failed to encode preview {}", output.display()))?;

    info!(path = %output.display(), frames = images.len(), "preview written");
    Ok(())
}

fn thumbnail(image: &DynamicImage, options: PreviewOptions) -> RgbaImage {
    if image.width() <= options.max_width && image.height() <= options.max_height {
        return image.to_rgba8();
    }
    image
        .resize(options.max_width, options.max_height, FilterType::Lanczos3)
        .to_rgba8()
}
