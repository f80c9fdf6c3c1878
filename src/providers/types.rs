use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean earth radius used for place distances, in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6373.0;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{service} API anahtarı gereklidir!")]
    MissingKey { service: &'static str },
    #[error("{service} isteği başarısız oldu (HTTP {status}): {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("{service} yanıtı beklenmedik biçimde: {reason}")]
    Malformed {
        service: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodedAddress {
    pub location: LatLng,
    pub formatted_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyPlace {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Metres from the property.
    pub distance: u32,
    pub rating: Option<f32>,
}

/// Listing details the narration is written from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyDetails {
    pub address: String,
    pub property_type: String,
    pub rooms: u32,
    pub bathrooms: u32,
    pub area: u32,
    /// Asking price in TL.
    pub price: u64,
    pub year_built: u32,
    pub special_features: String,
    pub description: String,
}

/// Great-circle distance rounded to whole metres.
pub fn distance_meters(from: LatLng, to: LatLng) -> u32 {
    let (lat1, lng1) = (from.lat.to_radians(), from.lng.to_radians());
    let (lat2, lng2) = (to.lat.to_radians(), to.lng.to_radians());
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    (EARTH_RADIUS_KM * c * 1000.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_point_is_zero_metres() {
        let point = LatLng { lat: 41.0082, lng: 28.9784 };
        assert_eq!(distance_meters(point, point), 0);
    }

    #[test]
    fn one_thousandth_degree_of_latitude() {
        let a = LatLng { lat: 41.0, lng: 29.0 };
        let b = LatLng { lat: 41.001, lng: 29.0 };
        // 6373 km * 0.001 deg in radians
        assert_eq!(distance_meters(a, b), 111);
        assert_eq!(distance_meters(b, a), 111);
    }

    #[test]
    fn missing_key_message_is_turkish() {
        let error = ProviderError::MissingKey { service: "Gemini" };
        assert_eq!(error.to_string(), "Gemini API anahtarı gereklidir!");
    }
}
