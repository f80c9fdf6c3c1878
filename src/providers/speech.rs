use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::json;
use tracing::info;

use super::types::ProviderError;

const ELEVENLABS_TTS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";
pub const SPEECH_MODEL: &str = "eleven_multilingual_v2";
pub const STABILITY: f32 = 0.5;
pub const SIMILARITY_BOOST: f32 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceOption {
    pub id: &'static str,
    pub label: &'static str,
}

pub const VOICE_OPTIONS: &[VoiceOption] = &[
    VoiceOption {
        id: "TxGEqnHWrfWFTfGW9XjX",
        label: "Erkek Sesi",
    },
    VoiceOption {
        id: "ErXwobaYiN019PkySvjV",
        label: "Kadın Sesi",
    },
    VoiceOption {
        id: "21m00Tcm4TlvDq8ikWAM",
        label: "Alternatif Ses",
    },
];

/// Accepts a voice id or one of the labels above.
pub fn resolve_voice(value: &str) -> &str {
    VOICE_OPTIONS
        .iter()
        .find(|voice| voice.label.eq_ignore_ascii_case(value.trim()))
        .map(|voice| voice.id)
        .unwrap_or(value)
}

/// ElevenLabs text-to-speech.
#[derive(Debug, Clone)]
pub struct SpeechClient {
    http: Client,
    api_key: Option<String>,
    voice_id: String,
}

impl SpeechClient {
    pub fn new(http: Client, api_key: Option<String>, voice_id: Option<String>) -> Self {
        Self {
            http,
            api_key,
            voice_id: voice_id.unwrap_or_else(|| VOICE_OPTIONS[0].id.to_owned()),
        }
    }

    pub fn voice_id(&self) -> &str {
        &self.voice_id
    }

    /// Synthesizes `text` and writes the MP3 to `target`.
    pub async fn synthesize(&self, text: &str, target: &Path) -> Result<()> {
        let key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::MissingKey { service: "ElevenLabs" })?;
        let response = self
            .http
            .post(format!("{ELEVENLABS_TTS_URL}/{}", self.voice_id))
            .header("Accept", "audio/mpeg")
            .header("xi-api-key", key)
            .json(&json!({
                "text": text,
                "model_id": SPEECH_MODEL,
                "voice_settings": {
                    "stability": STABILITY,
                    "similarity_boost": SIMILARITY_BOOST
                }
            }))
            .send()
            .await
            .context("failed to call ElevenLabs text-to-speech")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                service: "ElevenLabs",
                status: status.as_u16(),
                body,
            }
            .into());
        }
        let audio = response
            .bytes()
            .await
            .context("failed to read ElevenLabs audio")?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(target, &audio).with_context(|| format!("failed to write {}", target.display()))?;
        info!(path = %target.display(), bytes = audio.len(), "narration audio written");
        Ok(())
    }
}
