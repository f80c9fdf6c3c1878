use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::debug;

use property_reel::assembly::{Assembler, RenderSummary};
use property_reel::config::{parse_timeout, resolve_bool_override, AppConfig};
use property_reel::encoding::{FfmpegEncoderFactory, FfmpegMode};
use property_reel::error_codes::{find_coded_error, CodedError, CodedErrorKind, RENDER_FAILED};
use property_reel::logging::{init_logging, job_span, LogFormat};
use property_reel::manifest::load_and_validate_request;
use property_reel::preview::{write_gif_preview, PreviewOptions};
use property_reel::probe::FfprobeDuration;
use property_reel::progress::ProgressReporter;
use property_reel::project::{ProjectSnapshot, ProjectStore};
use property_reel::schema::{ColorGrade, Quality, RenderRequest, Transition};
use property_reel::tasks::{TaskRunner, TaskRunnerConfig, TaskSnapshot, TaskStatus};

const RENDER_TASK_NAME: &str = "video_generation";

#[derive(Debug, Parser)]
#[command(name = "property-reel")]
#[command(about = "Narrated drone-tour videos from property imagery")]
#[command(version = env!("PROPERTY_REEL_VERSION"))]
struct Cli {
    /// YAML settings file (defaults to $PROPERTY_REEL_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long = "log-format", global = true)]
    log_format: Option<String>,
    /// auto, system or sidecar.
    #[arg(long = "ffmpeg-mode", global = true)]
    ffmpeg_mode: Option<String>,
    #[arg(long = "output-dir", global = true)]
    output_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render a request file to MP4 in the background task runner.
    Render {
        request: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        /// Seconds, or `off` to let the render run unbounded.
        #[arg(long)]
        timeout: Option<String>,
        #[command(flatten)]
        overrides: RequestOverrides,
    },
    /// Validate a request and print its render plan.
    Check {
        request: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
        #[command(flatten)]
        overrides: RequestOverrides,
    },
    /// Write a looping GIF slideshow of the request's images.
    Preview {
        request: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long = "frame-ms", default_value_t = 500)]
        frame_ms: u32,
    },
    #[command(subcommand)]
    Project(ProjectCommands),
    /// Fetch imagery, listing text and narration for an address and write a
    /// render request.
    #[cfg(feature = "providers")]
    Prepare {
        /// YAML file with the listing details (address, rooms, price, ...).
        details: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long = "user-image")]
        user_images: Vec<PathBuf>,
        /// Voice id or label ("Erkek Sesi", "Kadın Sesi", "Alternatif Ses").
        #[arg(long)]
        voice: Option<String>,
        /// Narrate this file instead of generating the listing text.
        #[arg(long = "text-file")]
        text_file: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum ProjectCommands {
    /// Save a request (and its assets) under a project name.
    Save {
        name: String,
        request: PathBuf,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        text: Option<String>,
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Print a saved project, optionally writing it back out as a request file.
    Load {
        name: String,
        #[arg(long = "write-request")]
        write_request: Option<PathBuf>,
    },
    List,
    Delete {
        name: String,
    },
}

#[derive(Debug, Clone, Default, Args)]
struct RequestOverrides {
    /// zoom, pan or combined (Turkish names accepted).
    #[arg(long)]
    transition: Option<String>,
    /// normal or high.
    #[arg(long)]
    quality: Option<String>,
    /// none, cinematic, warm, cool or vintage.
    #[arg(long)]
    grade: Option<String>,
    #[arg(long)]
    fps: Option<u32>,
    /// Overrides the request; falls back to $PROPERTY_REEL_STABILIZE.
    #[arg(long)]
    stabilize: Option<bool>,
    /// Overrides the request; falls back to $PROPERTY_REEL_ENHANCE.
    #[arg(long = "enhance-colors")]
    enhance_colors: Option<bool>,
}

impl RequestOverrides {
    fn apply(&self, request: &mut RenderRequest) -> Result<()> {
        if let Some(value) = &self.transition {
            request.transition = Transition::from_keyword(value)?;
        }
        if let Some(value) = &self.quality {
            request.quality = Quality::from_keyword(value)?;
        }
        if let Some(value) = &self.grade {
            request.grade = ColorGrade::from_keyword(value)?;
        }
        if let Some(fps) = self.fps {
            request.fps = fps;
        }
        if let Some(stabilize) =
            resolve_bool_override(self.stabilize, env::var("PROPERTY_REEL_STABILIZE").ok())
        {
            request.stabilize = stabilize;
        }
        if let Some(enhance) =
            resolve_bool_override(self.enhance_colors, env::var("PROPERTY_REEL_ENHANCE").ok())
        {
            request.enhance_colors = enhance;
        }
        request.validate()
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => report_error(&error),
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }
    if let Some(mode) = cli.ffmpeg_mode {
        config.ffmpeg_mode = mode;
    }
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }
    init_logging(LogFormat::from_keyword(&config.log_format)?, "property_reel=info")?;
    debug!(
        output_dir = %config.output_dir.display(),
        projects_dir = %config.projects_dir.display(),
        "configuration loaded"
    );

    match cli.command {
        Commands::Render {
            request,
            output,
            timeout,
            overrides,
        } => run_render(&config, &request, output, timeout.as_deref(), &overrides),
        Commands::Check {
            request,
            json,
            overrides,
        } => run_check(&config, &request, json, &overrides),
        Commands::Preview {
            request,
            output,
            frame_ms,
        } => run_preview(&request, &output, frame_ms),
        Commands::Project(command) => run_project(&config, command),
        #[cfg(feature = "providers")]
        Commands::Prepare {
            details,
            output,
            user_images,
            voice,
            text_file,
        } => run_prepare(&config, &details, &output, user_images, voice, text_file),
    }
}

fn load_request(path: &Path, overrides: &RequestOverrides) -> Result<RenderRequest> {
    let mut request = load_and_validate_request(path)?;
    overrides.apply(&mut request)?;
    Ok(request)
}

fn run_check(config: &AppConfig, path: &Path, as_json: bool, overrides: &RequestOverrides) -> Result<()> {
    let request = load_request(path, overrides)?;
    let encoder = FfmpegEncoderFactory {
        mode: FfmpegMode::from_keyword(&config.ffmpeg_mode)?,
    };
    let probe = FfprobeDuration::default();
    let assembler = Assembler::new(&encoder, &probe, config.assembly_options());
    let plan = assembler.plan(&request, "check")?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }
    println!(
        "OK: {} ({}x{}, {} fps, {} frames, {:.2}s, {})",
        path.display(),
        plan.width,
        plan.height,
        plan.fps,
        plan.total_frames(),
        plan.duration_seconds,
        if plan.is_silent() { "sessiz" } else { "sesli" }
    );
    for (image, frames) in plan.images.iter().zip(&plan.frames_per_image) {
        println!("  {frames:>5} frames  {}", image.display());
    }
    Ok(())
}

fn run_render(
    config: &AppConfig,
    path: &Path,
    output: Option<PathBuf>,
    timeout: Option<&str>,
    overrides: &RequestOverrides,
) -> Result<()> {
    let mut request = load_request(path, overrides)?;
    if output.is_some() {
        request.output = output;
    }
    let timeout = match timeout {
        Some(raw) => parse_timeout(raw)
            .with_context(|| format!("invalid --timeout '{raw}'"))?
            .map(Duration::from_secs),
        None => config.task_timeout(),
    };
    let mode = FfmpegMode::from_keyword(&config.ffmpeg_mode)?;
    let options = config.assembly_options();

    // The runner applies no default of its own: `timeout` is already resolved.
    let runner = TaskRunner::new(TaskRunnerConfig::default())?;
    let task_id = runner.submit(RENDER_TASK_NAME, timeout, move |ctx| {
        let _span = job_span(ctx.id(), RENDER_TASK_NAME).entered();
        let encoder = FfmpegEncoderFactory { mode };
        let probe = FfprobeDuration::default();
        let assembler = Assembler::new(&encoder, &probe, options);
        let mut progress = ProgressReporter::new(|update| ctx.report_progress(&update));
        let summary = assembler.render(&request, ctx.id(), &mut progress, &|| ctx.is_canceled())?;
        Ok(serde_json::to_value(summary)?)
    })?;

    let finished = poll_until_finished(&runner, &task_id, config)?;
    match finished.status {
        TaskStatus::Completed => {
            let summary: RenderSummary = serde_json::from_value(
                finished
                    .result
                    .ok_or_else(|| anyhow!("completed task {task_id} carries no result"))?,
            )
            .context("failed to decode render summary")?;
            if summary.used_fallback {
                eprintln!("Uyarı: yedek kodlayıcı ({}) kullanıldı", summary.video_codec);
            }
            println!(
                "Wrote {} ({} frames, {:.2}s)",
                summary.output.display(),
                summary.frames,
                summary.duration_seconds
            );
            Ok(())
        }
        _ => Err(failed_task_error(finished)),
    }
}

/// Prints a line whenever the task's status, percent or message changes.
fn poll_until_finished(runner: &TaskRunner, task_id: &str, config: &AppConfig) -> Result<TaskSnapshot> {
    let mut last_line = String::new();
    loop {
        runner.cleanup_finished(config.task_retention());
        let snapshot = runner
            .status(task_id)
            .ok_or_else(|| anyhow!("task {task_id} is no longer tracked"))?;
        let line = format!(
            "[{}] %{} {}",
            snapshot.status.label(),
            snapshot.progress,
            snapshot.message
        );
        if line != last_line {
            eprintln!("{line}");
            last_line = line;
        }
        if snapshot.status.is_terminal() {
            return Ok(snapshot);
        }
        thread::sleep(config.poll_interval());
    }
}

fn failed_task_error(snapshot: TaskSnapshot) -> anyhow::Error {
    let message = snapshot
        .error
        .unwrap_or_else(|| snapshot.status.label().to_owned());
    let mut coded = CodedError::render(RENDER_FAILED, message);
    coded = coded.with_details(json!({
        "task_id": snapshot.id,
        "status": snapshot.status.keyword(),
        "details": snapshot.error_details,
    }));
    anyhow!(coded)
}

fn run_preview(path: &Path, output: &Path, frame_ms: u32) -> Result<()> {
    let request = load_and_validate_request(path)?;
    let options = PreviewOptions {
        frame_ms,
        ..PreviewOptions::default()
    };
    write_gif_preview(&request.selected_images(), output, options)?;
    println!("Wrote {}", output.display());
    Ok(())
}

fn run_project(config: &AppConfig, command: ProjectCommands) -> Result<()> {
    let store = ProjectStore::open(&config.projects_dir)?;
    match command {
        ProjectCommands::Save {
            name,
            request,
            location,
            text,
            overwrite,
        } => {
            let snapshot = ProjectSnapshot {
                property_location: location,
                property_text: text,
                request: load_and_validate_request(&request)?,
            };
            store.save(&name, &snapshot, overwrite)?;
            println!("Proje '{name}' kaydedildi");
        }
        ProjectCommands::Load {
            name,
            write_request,
        } => {
            let state = store.load(&name)?;
            if let Some(target) = write_request {
                let yaml = serde_yaml::to_string(&state.snapshot.request)
                    .context("failed to encode request")?;
                fs::write(&target, yaml)
                    .with_context(|| format!("failed to write {}", target.display()))?;
                eprintln!("Wrote {}", target.display());
            }
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        ProjectCommands::List => {
            for name in store.list()? {
                println!("{name}");
            }
        }
        ProjectCommands::Delete { name } => {
            store.delete(&name)?;
            println!("Proje '{name}' silindi");
        }
    }
    Ok(())
}

#[cfg(feature = "providers")]
fn run_prepare(
    config: &AppConfig,
    details: &Path,
    output: &Path,
    user_images: Vec<PathBuf>,
    voice: Option<String>,
    text_file: Option<PathBuf>,
) -> Result<()> {
    use property_reel::providers::speech::resolve_voice;
    use property_reel::providers::{prepare_request, PrepareInput, PropertyDetails};

    let raw = fs::read_to_string(details)
        .with_context(|| format!("failed to read {}", details.display()))?;
    let property: PropertyDetails =
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", details.display()))?;
    if property.address.trim().is_empty() {
        return Err(anyhow!("{}: address is required", details.display()));
    }
    let narration_text = text_file
        .map(|path| {
            fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
        })
        .transpose()?;

    let mut keys = config.api.clone();
    if let Some(voice) = voice {
        keys.elevenlabs_voice_id = Some(resolve_voice(&voice).to_owned());
    }
    let output_dir = output
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let stem = output
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("request");
    let input = PrepareInput {
        property,
        user_images,
        assets_dir: output_dir.join(format!("{stem}_assets")),
        narration_text,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let http = property_reel::providers::prepare::http_client()?;
    let prepared = runtime.block_on(prepare_request(http, &keys, input))?;

    // Written paths are relative to the request file so it can be moved
    // together with its assets directory.
    let mut request = prepared.request;
    for image in &mut request.map_images {
        *image = relative_to(image, &output_dir);
    }
    for image in &mut request.user_images {
        *image = fs::canonicalize(&*image)
            .with_context(|| format!("user image not found: {}", image.display()))?;
    }
    request.narration = request.narration.map(|path| relative_to(&path, &output_dir));
    request.validate()?;
    let yaml = serde_yaml::to_string(&request).context("failed to encode request")?;
    fs::write(output, yaml).with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "Wrote {} ({}, {} nearby places)",
        output.display(),
        prepared.formatted_address,
        prepared.nearby.len()
    );
    Ok(())
}

#[cfg(feature = "providers")]
fn relative_to(path: &Path, base: &Path) -> PathBuf {
    path.strip_prefix(base)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Coded errors are printed as a JSON envelope; usage errors exit with 2.
fn report_error(error: &anyhow::Error) -> ExitCode {
    let Some(coded) = find_coded_error(error) else {
        eprintln!("Hata: {error:#}");
        return ExitCode::FAILURE;
    };
    match serde_json::to_string_pretty(&coded.envelope()) {
        Ok(envelope) => eprintln!("{envelope}"),
        Err(_) => eprintln!("{coded}"),
    }
    match coded.kind {
        CodedErrorKind::Usage => ExitCode::from(2),
        CodedErrorKind::Render => ExitCode::FAILURE,
    }
}
