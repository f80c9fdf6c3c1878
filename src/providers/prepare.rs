use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use tracing::{info, warn};

use super::gemini::DescriptionClient;
use super::maps::MapsClient;
use super::speech::SpeechClient;
use super::types::{NearbyPlace, PropertyDetails};
use crate::config::ApiKeys;
use crate::schema::RenderRequest;

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Debug, Clone)]
pub struct PrepareInput {
    pub property: PropertyDetails,
    pub user_images: Vec<PathBuf>,
    pub assets_dir: PathBuf,
    /// Use this text instead of asking Gemini for one.
    pub narration_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub request: RenderRequest,
    pub formatted_address: String,
    pub nearby: Vec<NearbyPlace>,
    pub narration_text: String,
}

pub fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to create HTTP client")
}

/// Geocodes the address, downloads satellite and street imagery, writes the
/// narration text and audio under `assets_dir`, and returns a render request
/// pointing at those files.
pub async fn prepare_request(http: Client, keys: &ApiKeys, input: PrepareInput) -> Result<PreparedRequest> {
    fs::create_dir_all(&input.assets_dir)
        .with_context(|| format!("failed to create {}", input.assets_dir.display()))?;
    let maps = MapsClient::new(http.clone(), keys.google_maps.clone(), keys.google_places.clone());

    eprintln!("1/4 Adres çözümleniyor...");
    let geocoded = maps
        .geocode(&input.property.address)
        .await?
        .ok_or_else(|| anyhow!("Adres bulunamadı: {}", input.property.address))?;
    info!(address = %geocoded.formatted_address, lat = geocoded.location.lat, lng = geocoded.location.lng, "address geocoded");

    let nearby = match maps.nearby_places(geocoded.location, None).await {
        Ok(places) => places,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "nearby places unavailable, continuing without them");
            Vec::new()
        }
    };

    eprintln!("2/4 Harita görüntüleri indiriliyor...");
    let mut map_images = Vec::new();
    let imagery = [
        ("satellite", maps.satellite_image(geocoded.location).await?),
        ("street_view", maps.street_view_image(geocoded.location).await?),
    ];
    for (label, bytes) in imagery {
        let Some(bytes) = bytes else {
            warn!(label, "imagery not available for this location");
            continue;
        };
        let path = input.assets_dir.join(format!("{label}.png"));
        store_image(&bytes, &path)?;
        map_images.push(path);
    }

    eprintln!("3/4 İlan metni hazırlanıyor...");
    let narration_text = match input.narration_text {
        Some(text) => text,
        None => {
            DescriptionClient::new(http.clone(), keys.gemini.clone())
                .describe(&input.property, &nearby)
                .await?
        }
    };
    let text_path = input.assets_dir.join("narration.txt");
    fs::write(&text_path, &narration_text)
        .with_context(|| format!("failed to write {}", text_path.display()))?;

    eprintln!("4/4 Seslendirme oluşturuluyor...");
    let narration = input.assets_dir.join("narration.mp3");
    SpeechClient::new(http, keys.elevenlabs.clone(), keys.elevenlabs_voice_id.clone())
        .synthesize(&narration_text, &narration)
        .await?;

    let request = RenderRequest {
        map_images,
        user_images: input.user_images,
        narration: Some(narration),
        ..RenderRequest::default()
    };
    Ok(PreparedRequest {
        request,
        formatted_address: geocoded.formatted_address,
        nearby,
        narration_text,
    })
}

fn store_image(bytes: &[u8], path: &Path) -> Result<()> {
    image::load_from_memory(bytes)
        .context("downloaded imagery is not a decodable image")?
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}
