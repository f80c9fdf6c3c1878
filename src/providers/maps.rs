use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::types::{distance_meters, GeocodedAddress, LatLng, NearbyPlace, ProviderError};

const GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const NEARBY_URL: &str = "https://maps.googleapis.com/maps/api/place/nearbysearch/json";
const STATIC_MAP_URL: &str = "https://maps.googleapis.com/maps/api/staticmap";
const STREET_VIEW_URL: &str = "https://maps.googleapis.com/maps/api/streetview";

pub const NEARBY_RADIUS_METERS: u32 = 1500;
pub const NEARBY_LIMIT: usize = 10;
pub const SATELLITE_ZOOM: u8 = 18;
pub const IMAGERY_SIZE: &str = "640x640";

/// Google Maps Platform endpoints: geocoding, nearby places and imagery.
#[derive(Debug, Clone)]
pub struct MapsClient {
    http: Client,
    maps_key: Option<String>,
    places_key: Option<String>,
}

impl MapsClient {
    pub fn new(http: Client, maps_key: Option<String>, places_key: Option<String>) -> Self {
        Self {
            http,
            maps_key,
            places_key,
        }
    }

    fn maps_key(&self) -> Result<&str> {
        self.maps_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingKey { service: "Google Maps" }.into())
    }

    /// `None` when the address cannot be resolved.
    pub async fn geocode(&self, address: &str) -> Result<Option<GeocodedAddress>> {
        let url = Url::parse_with_params(GEOCODE_URL, &[("address", address), ("key", self.maps_key()?)])
            .context("failed to build geocode URL")?;
        let response: GeocodeResponse = self.get_json("Google Geocoding", url).await?;
        if response.status != "OK" {
            warn!(status = %response.status, address, "geocoding returned no match");
            return Ok(None);
        }
        Ok(response.results.into_iter().next().map(|result| GeocodedAddress {
            location: LatLng {
                lat: result.geometry.location.lat,
                lng: result.geometry.location.lng,
            },
            formatted_address: result.formatted_address,
        }))
    }

    /// Up to ten places within 1.5 km, in the order the API ranks them.
    pub async fn nearby_places(&self, origin: LatLng, place_type: Option<&str>) -> Result<Vec<NearbyPlace>> {
        let key = self
            .places_key
            .as_deref()
            .ok_or(ProviderError::MissingKey { service: "Google Places" })?;
        let location = format!("{},{}", origin.lat, origin.lng);
        let radius = NEARBY_RADIUS_METERS.to_string();
        let mut params = vec![
            ("location", location.as_str()),
            ("radius", radius.as_str()),
            ("key", key),
        ];
        if let Some(kind) = place_type {
            params.push(("type", kind));
        }
        let url = Url::parse_with_params(NEARBY_URL, &params).context("failed to build places URL")?;
        let response: NearbyResponse = self.get_json("Google Places", url).await?;
        if response.status != "OK" && response.status != "ZERO_RESULTS" {
            warn!(status = %response.status, "nearby search failed");
            return Ok(Vec::new());
        }

        Ok(response
            .results
            .into_iter()
            .take(NEARBY_LIMIT)
            .map(|place| NearbyPlace {
                distance: distance_meters(
                    origin,
                    LatLng {
                        lat: place.geometry.location.lat,
                        lng: place.geometry.location.lng,
                    },
                ),
                kind: place.types.into_iter().next().unwrap_or_default(),
                name: place.name,
                rating: place.rating,
            })
            .collect())
    }

    /// Satellite view centred on the property.
    pub async fn satellite_image(&self, origin: LatLng) -> Result<Option<Vec<u8>>> {
        let center = format!("{},{}", origin.lat, origin.lng);
        let zoom = SATELLITE_ZOOM.to_string();
        let url = Url::parse_with_params(
            STATIC_MAP_URL,
            &[
                ("center", center.as_str()),
                ("zoom", zoom.as_str()),
                ("size", IMAGERY_SIZE),
                ("maptype", "satellite"),
                ("key", self.maps_key()?),
            ],
        )
        .context("failed to build static map URL")?;
        self.get_image("Google Static Maps", url).await
    }

    pub async fn street_view_image(&self, origin: LatLng) -> Result<Option<Vec<u8>>> {
        let location = format!("{},{}", origin.lat, origin.lng);
        let url = Url::parse_with_params(
            STREET_VIEW_URL,
            &[
                ("location", location.as_str()),
                ("size", IMAGERY_SIZE),
                ("fov", "90"),
                ("heading", "0"),
                ("pitch", "0"),
                ("key", self.maps_key()?),
            ],
        )
        .context("failed to build street view URL")?;
        self.get_image("Google Street View", url).await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, service: &'static str, url: Url) -> Result<T> {
        debug!(service, "GET {}", redact_key(&url));
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to call {service}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                service,
                status: status.as_u16(),
                body,
            }
            .into());
        }
        response
            .json()
            .await
            .with_context(|| format!("failed to decode {service} response"))
    }

    async fn get_image(&self, service: &'static str, url: Url) -> Result<Option<Vec<u8>>> {
        debug!(service, "GET {}", redact_key(&url));
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to call {service}"))?;
        if response.status() != StatusCode::OK {
            warn!(service, status = response.status().as_u16(), "imagery unavailable");
            return Ok(None);
        }
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read {service} image"))?;
        Ok(Some(bytes.to_vec()))
    }
}

fn redact_key(url: &Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(name, value)| {
            let value = if name == "key" { "***".to_owned() } else { value.into_owned() };
            (name.into_owned(), value)
        })
        .collect();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    formatted_address: String,
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: Location,
}

#[derive(Debug, Deserialize)]
struct Location {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct NearbyResponse {
    status: String,
    #[serde(default)]
    results: Vec<PlaceResult>,
}

#[derive(Debug, Deserialize)]
struct PlaceResult {
    name: String,
    geometry: Geometry,
    #[serde(default)]
    types: Vec<String>,
    #[serde(default)]
    rating: Option<f32>,
}
