//! Thin wrappers over the hosted services that produce render inputs:
//! Google Maps Platform for location and imagery, Gemini for the listing
//! text and ElevenLabs for the narration. No retries; failures surface as
//! [`ProviderError`] inside an `anyhow::Error`.

pub mod gemini;
pub mod maps;
pub mod prepare;
pub mod speech;
pub mod types;

pub use gemini::DescriptionClient;
pub use maps::MapsClient;
pub use prepare::{prepare_request, PrepareInput, PreparedRequest};
pub use speech::{SpeechClient, VOICE_OPTIONS};
pub use types::{distance_meters, GeocodedAddress, LatLng, NearbyPlace, PropertyDetails, ProviderError};
