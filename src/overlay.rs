//! Text and logo overlays. Both are rasterized once per job into an RGBA layer
//! the size of the frame, then alpha-composited onto every frame.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use fontdue::layout::{CoordinateSystem, Layout, LayoutSettings, TextStyle};
use fontdue::{Font, FontSettings};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage, RgbImage};
use tracing::warn;

use crate::raster::load_image;
use crate::schema::{LogoOverlay, OverlayPosition, OverlaySettings, TextOverlay};

/// Tried in order when a text overlay names no font.
const SYSTEM_FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

pub struct OverlayLayer {
    layer: RgbaImage,
}

impl OverlayLayer {
    pub fn build(settings: &OverlaySettings, width: u32, height: u32) -> Result<Option<Self>> {
        if settings.is_empty() {
            return Ok(None);
        }
        let mut layer = RgbaImage::new(width, height);
        if let Some(text) = &settings.text {
            draw_text(&mut layer, text)?;
        }
        if let Some(logo) = &settings.logo {
            draw_logo(&mut layer, logo)?;
        }
        Ok(Some(Self { layer }))
    }

    pub fn layer(&self) -> &RgbaImage {
        &self.layer
    }

    pub fn composite(&self, frame: &mut RgbImage) {
        if frame.dimensions() != self.layer.dimensions() {
            warn!(
                frame = ?frame.dimensions(),
                layer = ?self.layer.dimensions(),
                "overlay layer size mismatch, skipping"
            );
            return;
        }
        for (dst, src) in frame.pixels_mut().zip(self.layer.pixels()) {
            let alpha = u32::from(src[3]);
            if alpha == 0 {
                continue;
            }
            for channel in 0..3 {
                let blended = u32::from(src[channel]) * alpha
                    + u32::from(dst[channel]) * (255 - alpha);
                dst[channel] = ((blended + 127) / 255) as u8;
            }
        }
    }
}

/// Top-left corner for a box of `box_w x box_h` at `position`.
pub fn anchor(
    position: OverlayPosition,
    frame: (u32, u32),
    size: (u32, u32),
    padding: u32,
) -> (i64, i64) {
    let (width, height) = (i64::from(frame.0), i64::from(frame.1));
    let (box_w, box_h) = (i64::from(size.0), i64::from(size.1));
    let padding = i64::from(padding);
    let centered_x = (width - box_w) / 2;
    let centered_y = (height - box_h) / 2;
    let right = width - box_w - padding;
    let bottom = height - box_h - padding;
    match position {
        OverlayPosition::Top => (centered_x, padding),
        OverlayPosition::Bottom => (centered_x, bottom),
        OverlayPosition::TopLeft => (padding, padding),
        OverlayPosition::TopRight => (right, padding),
        OverlayPosition::BottomLeft => (padding, bottom),
        OverlayPosition::BottomRight => (right, bottom),
        OverlayPosition::Center => (centered_x, centered_y),
    }
}

fn load_font(requested: Option<&Path>) -> Option<Font> {
    let candidates: Vec<PathBuf> = match requested {
        Some(path) => vec![path.to_path_buf()],
        None => SYSTEM_FONT_CANDIDATES.iter().map(PathBuf::from).collect(),
    };
    for path in candidates {
        let Ok(bytes) = fs::read(&path) else {
            continue;
        };
        match Font::from_bytes(bytes, FontSettings::default()) {
            Ok(font) => return Some(font),
            Err(error) => warn!(path = %path.display(), %error, "failed to parse font"),
        }
    }
    None
}

fn draw_text(layer: &mut RgbaImage, text: &TextOverlay) -> Result<()> {
    let font = load_font(text.font.as_deref());
    if font.is_none() {
        warn!("Yazı tipi yüklenemedi, yalnızca arka plan çiziliyor");
    }

    let mut layout = Layout::new(CoordinateSystem::PositiveYDown);
    let (text_w, text_h) = match &font {
        Some(font) => {
            layout.reset(&LayoutSettings::default());
            layout.append(&[font], &TextStyle::new(&text.text, text.font_size, 0));
            let width = layout
                .glyphs()
                .iter()
                .map(|glyph| glyph.x + glyph.width as f32)
                .fold(0.0_f32, f32::max);
            (width.ceil() as u32, layout.height().ceil() as u32)
        }
        // Rough metrics so the background box still has a sensible size.
        None => (
            (text.font_size * text.text.chars().count() as f32 * 0.6) as u32,
            (text.font_size * 1.5) as u32,
        ),
    };

    let (x, y) = anchor(text.position, layer.dimensions(), (text_w, text_h), text.padding);
    let padding = i64::from(text.padding);
    let background_alpha = (255.0 * text.background_opacity).round() as u8;
    fill_rect(
        layer,
        x - padding,
        y - padding,
        i64::from(text_w) + 2 * padding,
        i64::from(text_h) + 2 * padding,
        Rgba([0, 0, 0, background_alpha]),
    );

    let Some(font) = font else {
        return Ok(());
    };
    let [r, g, b] = text.color;
    for glyph in layout.glyphs() {
        if glyph.width == 0 || glyph.height == 0 {
            continue;
        }
        let (_, coverage) = font.rasterize_config(glyph.key);
        let gx = x + glyph.x.round() as i64;
        let gy = y + glyph.y.round() as i64;
        for (index, value) in coverage.iter().enumerate() {
            if *value == 0 {
                continue;
            }
            let px = gx + (index % glyph.width) as i64;
            let py = gy + (index / glyph.width) as i64;
            blend_over(layer, px, py, Rgba([r, g, b, *value]));
        }
    }
    Ok(())
}

fn draw_logo(layer: &mut RgbaImage, logo: &LogoOverlay) -> Result<()> {
    let source = load_image(&logo.path)
        .with_context(|| format!("failed to load logo {}", logo.path.display()))?
        .to_rgba8();
    if source.width() == 0 || source.height() == 0 {
        return Err(anyhow!("logo {} is empty", logo.path.display()));
    }

    let (width, _) = layer.dimensions();
    let logo_w = ((width as f32 * logo.size_percent / 100.0) as u32).max(1);
    let logo_h = ((u64::from(source.height()) * u64::from(logo_w) / u64::from(source.width())) as u32).max(1);
    let mut resized = imageops::resize(&source, logo_w, logo_h, FilterType::Lanczos3);
    for pixel in resized.pixels_mut() {
        pixel[3] = (f32::from(pixel[3]) * logo.opacity).round() as u8;
    }

    let (x, y) = anchor(logo.position, layer.dimensions(), (logo_w, logo_h), logo.padding);
    for (lx, ly, pixel) in resized.enumerate_pixels() {
        blend_over(layer, x + i64::from(lx), y + i64::from(ly), *pixel);
    }
    Ok(())
}

fn fill_rect(layer: &mut RgbaImage, x: i64, y: i64, w: i64, h: i64, color: Rgba<u8>) {
    for py in y..y + h {
        for px in x..x + w {
            blend_over(layer, px, py, color);
        }
    }
}

/// Porter-Duff "over" of `src` onto the layer pixel; out-of-bounds is ignored.
fn blend_over(layer: &mut RgbaImage, x: i64, y: i64, src: Rgba<u8>) {
    if x < 0 || y < 0 || x >= i64::from(layer.width()) || y >= i64::from(layer.height()) {
        return;
    }
    let dst = layer.get_pixel_mut(x as u32, y as u32);
    let sa = f32::from(src[3]) / 255.0;
    let da = f32::from(dst[3]) / 255.0;
    let out_a = sa + da * (1.0 - sa);
    if out_a <= f32::EPSILON {
        *dst = Rgba([0, 0, 0, 0]);
        return;
    }
    for channel in 0..3 {
        let value = (f32::from(src[channel]) * sa + f32::from(dst[channel]) * da * (1.0 - sa)) / out_a;
        dst[channel] = value.round().clamp(0.0, 255.0) as u8;
    }
    dst[3] = (out_a * 255.0).round() as u8;
}
