use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use tracing::warn;

use crate::schema::RenderRequest;

/// Reads a render request (YAML, or JSON which parses as YAML), validates it and
/// resolves every relative path against the request file's directory.
pub fn load_and_validate_request(path: &Path) -> Result<RenderRequest> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read request {}", path.display()))?;
    let mut request: RenderRequest = serde_yaml::from_str(&contents).map_err(|error| {
        let location = error
            .location()
            .map(|location| format!("line {}, column {}", location.line(), location.column()))
            .unwrap_or_else(|| "unknown location".to_owned());
        anyhow!(
            "failed to parse request in {} at {}: {}",
            path.display(),
            location,
            error
        )
    })?;

    let request_dir = path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    resolve_request_paths(&mut request, &request_dir)?;
    Ok(request)
}

pub fn resolve_request_paths(request: &mut RenderRequest, request_dir: &Path) -> Result<()> {
    request.validate()?;

    for (index, image) in request.map_images.iter_mut().enumerate() {
        *image = resolve_and_validate_asset_path(request_dir, image, &format!("map_images[{index}]"))?;
    }
    for (index, image) in request.user_images.iter_mut().enumerate() {
        *image =
            resolve_and_validate_asset_path(request_dir, image, &format!("user_images[{index}]"))?;
    }

    // A missing narration is not fatal: the render falls back to a silent clip.
    if let Some(narration) = request.narration.as_mut() {
        let resolved = resolve_relative(request_dir, narration);
        if !resolved.is_file() {
            warn!(path = %resolved.display(), "narration file not found, video will be silent");
        }
        *narration = resolved;
    }

    if let Some(music) = request.music.as_mut() {
        music.path = resolve_and_validate_asset_path(request_dir, &music.path, "music.path")?;
    }

    if let Some(overlay) = request.overlay.as_mut() {
        if let Some(text) = overlay.text.as_mut() {
            if let Some(font) = text.font.as_mut() {
                *font = resolve_and_validate_asset_path(request_dir, font, "overlay.text.font")?;
            }
        }
        if let Some(logo) = overlay.logo.as_mut() {
            logo.path = resolve_and_validate_asset_path(request_dir, &logo.path, "overlay.logo.path")?;
        }
    }

    if let Some(output) = request.output.as_mut() {
        *output = resolve_relative(request_dir, output);
    }

    Ok(())
}

fn resolve_relative(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn resolve_and_validate_asset_path(
    base_dir: &Path,
    source_path: &Path,
    field_name: &str,
) -> Result<PathBuf> {
    let resolved = resolve_relative(base_dir, source_path);

    if !resolved.exists() {
        bail!("{} does not exist: {}", field_name, resolved.display());
    }

    if !resolved.is_file() {
        bail!("{} is not a file: {}", field_name, resolved.display());
    }

    Ok(resolved)
}
