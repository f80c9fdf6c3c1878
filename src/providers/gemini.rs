use std::fmt::Write as _;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::types::{NearbyPlace, PropertyDetails, ProviderError};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const GEMINI_MODEL: &str = "gemini-1.5-pro-latest";
/// Closest places mentioned in the narration prompt.
pub const PROMPT_PLACE_LIMIT: usize = 7;

/// Writes the listing narration with Gemini.
#[derive(Debug, Clone)]
pub struct DescriptionClient {
    http: Client,
    api_key: Option<String>,
    model: String,
}

impl DescriptionClient {
    pub fn new(http: Client, api_key: Option<String>) -> Self {
        Self {
            http,
            api_key,
            model: GEMINI_MODEL.to_owned(),
        }
    }

    pub async fn describe(&self, property: &PropertyDetails, nearby: &[NearbyPlace]) -> Result<String> {
        let key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::MissingKey { service: "Gemini" })?;
        let prompt = build_prompt(property, nearby);
        let response = self
            .http
            .post(format!("{GEMINI_API_BASE}/{}:generateContent", self.model))
            .query(&[("key", key)])
            .json(&json!({ "contents": [{ "parts": [{ "text": prompt }] }] }))
            .send()
            .await
            .context("failed to call Gemini generateContent")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                service: "Gemini",
                status: status.as_u16(),
                body,
            }
            .into());
        }
        let payload: GenerateResponse = response
            .json()
            .await
            .context("failed to decode Gemini response")?;
        let text = payload.text().ok_or_else(|| ProviderError::Malformed {
            service: "Gemini",
            reason: "yanıtta metin yok".to_owned(),
        })?;
        info!(chars = text.chars().count(), "narration text generated");
        Ok(text)
    }
}

pub fn build_prompt(property: &PropertyDetails, nearby: &[NearbyPlace]) -> String {
    let mut nearby_text = String::new();
    if !nearby.is_empty() {
        let mut closest: Vec<&NearbyPlace> = nearby.iter().collect();
        closest.sort_by_key(|place| place.distance);
        nearby_text.push_str("Yakın çevrede bulunan önemli noktalar:\n");
        for place in closest.into_iter().take(PROMPT_PLACE_LIMIT) {
            let _ = writeln!(
                nearby_text,
                "- {} ({}) - {} metre",
                place.name,
                place.kind.replace('_', " "),
                place.distance
            );
        }
    }

    format!(
        "Aşağıdaki bilgilere dayanarak Türkçe dilinde bir emlak ilanı metni oluştur.\n\
         Metin profesyonel, çekici ve bilgilendirici olmalıdır.\n\
         Metin normal bir hızda okunduğunda yaklaşık 45-60 saniye sürmeli (maksimum 600 karakter).\n\
         \n\
         Adres: {address}\n\
         Emlak Tipi: {property_type}\n\
         Oda Sayısı: {rooms}\n\
         Banyo Sayısı: {bathrooms}\n\
         Alan: {area} m²\n\
         Fiyat: {price} TL\n\
         Yapım Yılı: {year_built}\n\
         Özel Özellikler: {special_features}\n\
         \n\
         {nearby_text}\n\
         Mevcut Açıklama: {description}\n\
         \n\
         Çevredeki alanlardan, konum avantajlarından ve emlağın değerini artıran özelliklerden bahset.\n\
         Lütfen sadece metni döndür, başka açıklama ekleme.",
        address = property.address,
        property_type = property.property_type,
        rooms = property.rooms,
        bathrooms = property.bathrooms,
        area = property.area,
        price = group_thousands(property.price),
        year_built = property.year_built,
        special_features = property.special_features,
        description = property.description,
    )
}

/// `2500000` -> `2,500,000`.
fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    grouped
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    fn text(&self) -> Option<String> {
        let candidate = self.candidates.first()?;
        let text: String = candidate
            .content
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect();
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place(name: &str, kind: &str, distance: u32) -> NearbyPlace {
        NearbyPlace {
            name: name.to_owned(),
            kind: kind.to_owned(),
            distance,
            rating: None,
        }
    }

    #[test]
    fn prompt_lists_seven_closest_places() {
        let places: Vec<NearbyPlace> = (0..10)
            .rev()
            .map(|i| place(&format!("Yer {i}"), "shopping_mall", 100 * (i + 1)))
            .collect();
        let property = PropertyDetails {
            address: "Moda Cad. 12, Kadıköy".to_owned(),
            price: 12_500_000,
            ..PropertyDetails::default()
        };
        let prompt = build_prompt(&property, &places);

        assert!(prompt.contains("- Yer 0 (shopping mall) - 100 metre"));
        assert!(prompt.contains("- Yer 6 (shopping mall) - 700 metre"));
        assert!(!prompt.contains("Yer 7"));
        assert!(prompt.find("Yer 0").expect("first") < prompt.find("Yer 1").expect("second"));
        assert!(prompt.contains("Fiyat: 12,500,000 TL"));
        assert!(prompt.contains("maksimum 600 karakter"));
    }

    #[test]
    fn prompt_without_places_has_no_header() {
        let prompt = build_prompt(&PropertyDetails::default(), &[]);
        assert!(!prompt.contains("Yakın çevrede"));
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
    }

    #[test]
    fn response_text_joins_parts() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"  Deniz manzaralı "},{"text":"daire. "}]}}]}"#;
        let response: GenerateResponse = serde_json::from_str(raw).expect("decode");
        assert_eq!(response.text().as_deref(), Some("Deniz manzaralı daire."));
        let empty: GenerateResponse = serde_json::from_str(r#"{"candidates":[]}"#).expect("decode");
        assert!(empty.text().is_none());
    }
}
