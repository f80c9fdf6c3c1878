use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error_codes::{
    CodedError, INVALID_GRADE, INVALID_QUALITY, INVALID_TRANSITION, NO_IMAGES,
};

/// Map imagery beyond this count is ignored to bound render time and memory.
pub const MAX_MAP_IMAGES: usize = 8;
/// User uploads beyond this count are ignored.
pub const MAX_USER_IMAGES: usize = 5;

pub const DEFAULT_FPS: u32 = 30;
pub const MAX_FPS: u32 = 60;

/// One render job, passed explicitly through every pipeline stage.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RenderRequest {
    #[serde(default)]
    pub map_images: Vec<PathBuf>,
    #[serde(default)]
    pub user_images: Vec<PathBuf>,
    #[serde(default)]
    pub narration: Option<PathBuf>,
    #[serde(default)]
    pub music: Option<MusicTrack>,
    #[serde(default)]
    pub transition: Transition,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default)]
    pub grade: Option<ColorGrade>,
    #[serde(default)]
    pub stabilize: bool,
    #[serde(default = "default_stabilize_window")]
    pub stabilize_window: usize,
    #[serde(default)]
    pub enhance_colors: bool,
    #[serde(default = "default_color_boost")]
    pub color_boost: f32,
    #[serde(default)]
    pub overlay: Option<OverlaySettings>,
    #[serde(default)]
    pub output: Option<PathBuf>,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            map_images: Vec::new(),
            user_images: Vec::new(),
            narration: None,
            music: None,
            transition: Transition::default(),
            fps: DEFAULT_FPS,
            quality: Quality::default(),
            grade: None,
            stabilize: false,
            stabilize_window: default_stabilize_window(),
            enhance_colors: false,
            color_boost: default_color_boost(),
            overlay: None,
            output: None,
        }
    }
}

impl RenderRequest {
    pub fn validate(&self) -> Result<()> {
        if self.map_images.is_empty() && self.user_images.is_empty() {
            return Err(anyhow!(CodedError::usage(
                NO_IMAGES,
                "En az bir görüntü gerekli!"
            )));
        }

        if self.fps == 0 || self.fps > MAX_FPS {
            bail!("fps must be in 1..={MAX_FPS}, got {}", self.fps);
        }

        if self.stabilize_window == 0 {
            bail!("stabilize_window must be > 0");
        }

        if !(self.color_boost > 0.0 && self.color_boost <= 4.0) {
            bail!("color_boost must be in (0, 4], got {}", self.color_boost);
        }

        if let Some(music) = &self.music {
            if !(0.0..=1.0).contains(&music.volume) {
                bail!("music.volume must be in [0, 1], got {}", music.volume);
            }
        }

        if let Some(overlay) = &self.overlay {
            overlay.validate()?;
        }

        Ok(())
    }

    /// Images that take part in the render: capped map imagery first, then capped
    /// user uploads, both in submission order.
    pub fn selected_images(&self) -> Vec<PathBuf> {
        self.map_images
            .iter()
            .take(MAX_MAP_IMAGES)
            .chain(self.user_images.iter().take(MAX_USER_IMAGES))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MusicTrack {
    pub path: PathBuf,
    #[serde(default = "default_music_volume")]
    pub volume: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    #[default]
    Normal,
    High,
}

impl Quality {
    pub fn from_keyword(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "normal" | "standart" => Ok(Self::Normal),
            "high" | "yüksek" | "yuksek" => Ok(Self::High),
            _ => Err(anyhow!(CodedError::usage(
                INVALID_QUALITY,
                format!("geçersiz kalite '{value}'"),
            )
            .with_details(json!({
                "provided": value,
                "allowed": ["normal", "high"]
            })))),
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Self::Normal => (1280, 720),
            Self::High => (1920, 1080),
        }
    }

    pub fn bitrate_kbps(self) -> u32 {
        match self {
            Self::Normal => 2000,
            Self::High => 4000,
        }
    }

    /// Bitrate in ffmpeg notation, e.g. `4000k`.
    pub fn bitrate(self) -> String {
        format!("{}k", self.bitrate_kbps())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    #[default]
    #[serde(alias = "yakinlasma", alias = "Yakınlaşma")]
    Zoom,
    #[serde(alias = "kaydirma", alias = "Kaydırma")]
    Pan,
    #[serde(alias = "karma")]
    Combined,
}

impl Transition {
    pub fn from_keyword(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "zoom" | "yakinlasma" | "yakınlaşma" => Ok(Self::Zoom),
            "pan" | "kaydirma" | "kaydırma" => Ok(Self::Pan),
            "combined" | "karma" => Ok(Self::Combined),
            _ => Err(anyhow!(CodedError::usage(
                INVALID_TRANSITION,
                format!("geçersiz geçiş efekti '{value}'"),
            )
            .with_details(json!({
                "provided": value,
                "allowed": ["zoom", "pan", "combined"]
            })))),
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Zoom => "zoom",
            Self::Pan => "pan",
            Self::Combined => "combined",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorGrade {
    Cinematic,
    Warm,
    Cool,
    Vintage,
}

impl ColorGrade {
    pub fn from_keyword(value: &str) -> Result<Option<Self>> {
        match value.trim().to_lowercase().as_str() {
            "none" | "yok" => Ok(None),
            "cinematic" => Ok(Some(Self::Cinematic)),
            "warm" => Ok(Some(Self::Warm)),
            "cool" => Ok(Some(Self::Cool)),
            "vintage" => Ok(Some(Self::Vintage)),
            _ => Err(anyhow!(CodedError::usage(
                INVALID_GRADE,
                format!("geçersiz renk efekti '{value}'"),
            )
            .with_details(json!({
                "provided": value,
                "allowed": ["none", "cinematic", "warm", "cool", "vintage"]
            })))),
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Cinematic => "cinematic",
            Self::Warm => "warm",
            Self::Cool => "cool",
            Self::Vintage => "vintage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayPosition {
    Top,
    #[default]
    Bottom,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    Center,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OverlaySettings {
    #[serde(default)]
    pub text: Option<TextOverlay>,
    #[serde(default)]
    pub logo: Option<LogoOverlay>,
}

impl OverlaySettings {
    pub fn validate(&self) -> Result<()> {
        if let Some(text) = &self.text {
            if text.text.trim().is_empty() {
                bail!("overlay.text.text cannot be empty");
            }
            if !(text.font_size >= 4.0 && text.font_size <= 256.0) {
                bail!("overlay.text.font_size must be in [4, 256]");
            }
            if !(0.0..=1.0).contains(&text.background_opacity) {
                bail!("overlay.text.background_opacity must be in [0, 1]");
            }
        }
        if let Some(logo) = &self.logo {
            if !(logo.size_percent > 0.0 && logo.size_percent <= 100.0) {
                bail!("overlay.logo.size_percent must be in (0, 100]");
            }
            if !(0.0..=1.0).contains(&logo.opacity) {
                bail!("overlay.logo.opacity must be in [0, 1]");
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.logo.is_none()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TextOverlay {
    pub text: String,
    #[serde(default)]
    pub position: OverlayPosition,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default = "default_text_color")]
    pub color: [u8; 3],
    #[serde(default = "default_background_opacity")]
    pub background_opacity: f32,
    #[serde(default = "default_padding")]
    pub padding: u32,
    #[serde(default)]
    pub font: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogoOverlay {
    pub path: PathBuf,
    #[serde(default = "default_logo_position")]
    pub position: OverlayPosition,
    #[serde(default = "default_logo_size_percent")]
    pub size_percent: f32,
    #[serde(default = "default_padding")]
    pub padding: u32,
    #[serde(default = "default_logo_opacity")]
    pub opacity: f32,
}

fn default_fps() -> u32 {
    DEFAULT_FPS
}

fn default_stabilize_window() -> usize {
    30
}

fn default_color_boost() -> f32 {
    1.5
}

fn default_music_volume() -> f32 {
    0.2
}

fn default_font_size() -> f32 {
    24.0
}

fn default_text_color() -> [u8; 3] {
    [255, 255, 255]
}

fn default_background_opacity() -> f32 {
    0.5
}

fn default_padding() -> u32 {
    10
}

fn default_logo_position() -> OverlayPosition {
    OverlayPosition::BottomRight
}

fn default_logo_size_percent() -> f32 {
    15.0
}

fn default_logo_opacity() -> f32 {
    0.8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_codes::find_coded_error;

    #[test]
    fn request_defaults_fill_optional_fields() {
        let request: RenderRequest = serde_yaml::from_str(
            r#"
map_images: [a.png, b.png]
narration: voice.mp3
"#,
        )
        .expect("request should parse");

        assert_eq!(request.fps, DEFAULT_FPS);
        assert_eq!(request.quality, Quality::Normal);
        assert_eq!(request.transition, Transition::Zoom);
        assert_eq!(request.stabilize_window, 30);
        assert!(request.grade.is_none());
        request.validate().expect("request should validate");
    }

    #[test]
    fn turkish_transition_aliases_parse() {
        let request: RenderRequest = serde_yaml::from_str(
            r#"
user_images: [a.png]
transition: Kaydırma
"#,
        )
        .expect("request should parse");
        assert_eq!(request.transition, Transition::Pan);
    }

    #[test]
    fn selected_images_caps_each_source() {
        let request = RenderRequest {
            map_images: (0..12).map(|i| PathBuf::from(format!("map_{i}.png"))).collect(),
            user_images: (0..7).map(|i| PathBuf::from(format!("user_{i}.png"))).collect(),
            ..RenderRequest::default()
        };

        let selected = request.selected_images();
        assert_eq!(selected.len(), MAX_MAP_IMAGES + MAX_USER_IMAGES);
        assert_eq!(selected[0], PathBuf::from("map_0.png"));
        assert_eq!(selected[7], PathBuf::from("map_7.png"));
        assert_eq!(selected[8], PathBuf::from("user_0.png"));
    }

    #[test]
    fn empty_request_reports_no_images_code() {
        let error = RenderRequest::default()
            .validate()
            .expect_err("empty request must fail");
        let coded = find_coded_error(&error).expect("coded error expected");
        assert_eq!(coded.code, NO_IMAGES);
    }

    #[test]
    fn quality_maps_to_resolution_and_bitrate() {
        assert_eq!(Quality::Normal.dimensions(), (1280, 720));
        assert_eq!(Quality::High.dimensions(), (1920, 1080));
        assert_eq!(Quality::High.bitrate(), "4000k");
        assert_eq!(Quality::Normal.bitrate(), "2000k");
    }

    #[test]
    fn unknown_grade_keyword_is_rejected_with_code() {
        let error = ColorGrade::from_keyword("sepia").expect_err("unknown grade");
        let coded = find_coded_error(&error).expect("coded error expected");
        assert_eq!(coded.code, INVALID_GRADE);
        assert_eq!(ColorGrade::from_keyword("yok").expect("none parses"), None);
    }

    #[test]
    fn overlay_opacity_out_of_range_fails_validation() {
        let request: RenderRequest = serde_yaml::from_str(
            r#"
map_images: [a.png]
overlay:
  logo:
    path: logo.png
    opacity: 1.5
"#,
        )
        .expect("request should parse");
        assert!(request.validate().is_err());
    }
}
