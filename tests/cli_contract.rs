use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use image::{Rgb, RgbImage};
use serde_json::Value;
use tempfile::tempdir;

fn run_cli(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_property-reel"))
        .current_dir(cwd)
        .env("RUST_LOG", "off")
        .env_remove("PROPERTY_REEL_CONFIG")
        .env_remove("PROPERTY_REEL_STABILIZE")
        .env_remove("PROPERTY_REEL_ENHANCE")
        .env("PROPERTY_REEL_PROJECTS_DIR", cwd.join("storage"))
        .args(args)
        .output()
        .expect("property-reel should run")
}

fn write_request(dir: &Path, yaml: &str) {
    for (name, shade) in [("front.png", 30_u8), ("garden.png", 160)] {
        RgbImage::from_pixel(64, 48, Rgb([shade, 120, 80]))
            .save(dir.join(name))
            .expect("write image");
    }
    fs::write(dir.join("request.yaml"), yaml).expect("write request");
}

fn envelope(output: &Output) -> Value {
    let stderr = String::from_utf8_lossy(&output.stderr);
    serde_json::from_str(&stderr).expect("stderr should be an error envelope")
}

#[test]
fn check_json_reports_silent_plan() {
    let dir = tempdir().expect("tempdir");
    write_request(dir.path(), "map_images: [front.png]\nuser_images: [garden.png]\n");

    let output = run_cli(dir.path(), &["check", "request.yaml", "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let plan: Value = serde_json::from_slice(&output.stdout).expect("plan json");
    assert_eq!(plan["width"], 1280);
    assert_eq!(plan["fps"], 30);
    assert_eq!(plan["narration"], Value::Null);
    assert_eq!(plan["frames_per_image"], serde_json::json!([120, 120]));
}

#[test]
fn check_applies_keyword_overrides() {
    let dir = tempdir().expect("tempdir");
    write_request(dir.path(), "map_images: [front.png]\n");

    let output = run_cli(
        dir.path(),
        &["check", "request.yaml", "--json", "--quality", "yüksek", "--transition", "karma", "--fps", "24"],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let plan: Value = serde_json::from_slice(&output.stdout).expect("plan json");
    assert_eq!(plan["width"], 1920);
    assert_eq!(plan["bitrate"], "4000k");
    assert_eq!(plan["effects"][0].as_array().map(Vec::len), Some(2));
}

#[test]
fn invalid_transition_emits_usage_envelope() {
    let dir = tempdir().expect("tempdir");
    write_request(dir.path(), "map_images: [front.png]\n");

    let output = run_cli(dir.path(), &["check", "request.yaml", "--transition", "spin"]);
    assert_eq!(output.status.code(), Some(2));
    let parsed = envelope(&output);
    assert_eq!(parsed["ok"], Value::Bool(false));
    assert_eq!(parsed["error"]["code"], "INVALID_TRANSITION");
    assert_eq!(parsed["error"]["details"]["provided"], "spin");
}

#[test]
fn request_without_images_is_a_usage_error() {
    let dir = tempdir().expect("tempdir");
    write_request(dir.path(), "fps: 30\n");

    let output = run_cli(dir.path(), &["check", "request.yaml"]);
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(envelope(&output)["error"]["code"], "NO_IMAGES");
}

#[test]
fn preview_writes_gif() {
    let dir = tempdir().expect("tempdir");
    write_request(dir.path(), "map_images: [front.png]\nuser_images: [garden.png]\n");

    let output = run_cli(dir.path(), &["preview", "request.yaml", "-o", "preview.gif"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let bytes = fs::read(dir.path().join("preview.gif")).expect("gif written");
    assert!(bytes.starts_with(b"GIF8"));
}

#[test]
fn project_commands_round_trip_through_storage() {
    let dir = tempdir().expect("tempdir");
    write_request(dir.path(), "map_images: [front.png]\n");

    let saved = run_cli(
        dir.path(),
        &["project", "save", "bahceli-ev", "request.yaml", "--location", "Urla, İzmir"],
    );
    assert!(saved.status.success(), "{}", String::from_utf8_lossy(&saved.stderr));

    let listed = run_cli(dir.path(), &["project", "list"]);
    assert_eq!(String::from_utf8_lossy(&listed.stdout).trim(), "bahceli-ev");

    let loaded = run_cli(
        dir.path(),
        &["project", "load", "bahceli-ev", "--write-request", "restored.yaml"],
    );
    assert!(loaded.status.success(), "{}", String::from_utf8_lossy(&loaded.stderr));
    let state: Value = serde_json::from_slice(&loaded.stdout).expect("state json");
    assert_eq!(state["property_location"], "Urla, İzmir");
    assert!(dir.path().join("restored.yaml").is_file());

    let restored_check = run_cli(dir.path(), &["check", "restored.yaml"]);
    assert!(restored_check.status.success(), "{}", String::from_utf8_lossy(&restored_check.stderr));

    let deleted = run_cli(dir.path(), &["project", "delete", "bahceli-ev"]);
    assert!(deleted.status.success());
    let listed = run_cli(dir.path(), &["project", "list"]);
    assert!(String::from_utf8_lossy(&listed.stdout).trim().is_empty());
}

#[test]
fn invalid_project_name_is_rejected() {
    let dir = tempdir().expect("tempdir");
    write_request(dir.path(), "map_images: [front.png]\n");

    let output = run_cli(dir.path(), &["project", "save", "../dışarı", "request.yaml"]);
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(envelope(&output)["error"]["code"], "INVALID_PROJECT_NAME");
}

#[test]
fn version_reports_package_version() {
    let dir = tempdir().expect("tempdir");
    let output = run_cli(dir.path(), &["--version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}
