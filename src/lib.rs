pub mod assembly;
pub mod config;
pub mod effects;
pub mod encoding;
pub mod enhance;
pub mod error_codes;
pub mod grading;
pub mod logging;
pub mod manifest;
pub mod overlay;
pub mod preview;
pub mod probe;
pub mod progress;
pub mod project;
#[cfg(feature = "providers")]
pub mod providers;
pub mod raster;
pub mod sandbox;
pub mod schema;
pub mod stabilize;
pub mod tasks;
