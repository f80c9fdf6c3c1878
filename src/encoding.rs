use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use tracing::debug;

use crate::schema::{MusicTrack, Quality};

pub const PRIMARY_VIDEO_CODEC: &str = "libx264";
pub const FALLBACK_VIDEO_CODEC: &str = "mpeg4";
pub const FALLBACK_MAX_FPS: u32 = 24;
const AUDIO_CODEC: &str = "aac";
const AUDIO_BITRATE: &str = "192k";

/// Everything ffmpeg needs to turn a raw RGB frame stream into the final MP4.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_codec: String,
    pub bitrate_kbps: u32,
    pub narration: Option<PathBuf>,
    pub music: Option<MusicTrack>,
    pub output: PathBuf,
}

impl EncodeSettings {
    pub fn primary(quality: Quality, fps: u32, output: &Path) -> Self {
        let (width, height) = quality.dimensions();
        Self {
            width,
            height,
            fps,
            video_codec: PRIMARY_VIDEO_CODEC.to_owned(),
            bitrate_kbps: quality.bitrate_kbps(),
            narration: None,
            music: None,
            output: output.to_path_buf(),
        }
    }

    /// Safer retry profile: `mpeg4`, half the bitrate, at most 24 fps.
    pub fn fallback(&self) -> Self {
        Self {
            video_codec: FALLBACK_VIDEO_CODEC.to_owned(),
            bitrate_kbps: (self.bitrate_kbps / 2).max(1),
            fps: self.fps.min(FALLBACK_MAX_FPS),
            ..self.clone()
        }
    }

    pub fn bitrate(&self) -> String {
        format!("{}k", self.bitrate_kbps)
    }

    pub fn has_audio(&self) -> bool {
        self.narration.is_some() || self.music.is_some()
    }
}

/// Destination for rendered frames, in presentation order.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: RgbImage) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait EncoderFactory: Send + Sync {
    fn open(&self, settings: &EncodeSettings) -> Result<Box<dyn FrameSink>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FfmpegMode {
    #[default]
    Auto,
    System,
    Sidecar,
}

impl FfmpegMode {
    pub fn from_keyword(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "system" => Ok(Self::System),
            "sidecar" => Ok(Self::Sidecar),
            other => bail!("unknown ffmpeg mode '{other}' (expected auto, system or sidecar)"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegEncoderFactory {
    pub mode: FfmpegMode,
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn open(&self, settings: &EncodeSettings) -> Result<Box<dyn FrameSink>> {
        Ok(Box::new(FfmpegPipe::spawn_with_mode(settings, self.mode)?))
    }
}

pub struct FfmpegPipe {
    sender: Option<mpsc::SyncSender<Vec<u8>>>,
    worker: Option<JoinHandle<Result<()>>>,
    frame_len: usize,
}

trait VideoEncoderBackend: Send {
    fn mode_label(&self) -> &'static str;
    fn run(self: Box<Self>, receiver: mpsc::Receiver<Vec<u8>>) -> Result<()>;
}

struct SystemFfmpegBackend {
    settings: EncodeSettings,
}

#[cfg(feature = "sidecar_ffmpeg")]
struct SidecarFfmpegBackend {
    settings: EncodeSettings,
}

impl FfmpegPipe {
    pub fn spawn(settings: &EncodeSettings) -> Result<Self> {
        Self::spawn_with_mode(settings, FfmpegMode::Auto)
    }

    pub fn spawn_with_mode(settings: &EncodeSettings, mode: FfmpegMode) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(4);
        let backend = select_backend(mode, settings.clone())?;
        let worker_name = format!("property-reel-encoder-{}", backend.mode_label());

        let worker = thread::Builder::new()
            .name(worker_name)
            .spawn(move || backend.run(receiver))
            .context("failed to spawn ffmpeg writer thread")?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            frame_len: settings.width as usize * settings.height as usize * 3,
        })
    }

    pub fn write_rgb(&mut self, rgb_frame: Vec<u8>) -> Result<()> {
        if rgb_frame.len() != self.frame_len {
            bail!(
                "frame has {} bytes, encoder expects {}",
                rgb_frame.len(),
                self.frame_len
            );
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("encoder has already been finalized"))?;
        if sender.send(rgb_frame).is_err() {
            // The writer thread only hangs up when ffmpeg failed; surface its error.
            drop(self.sender.take());
            return Err(self
                .join_worker()
                .err()
                .unwrap_or_else(|| anyhow!("failed to enqueue frame for ffmpeg")));
        }
        Ok(())
    }

    fn join_worker(&mut self) -> Result<()> {
        let handle = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("ffmpeg worker thread missing"))?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow!("ffmpeg worker thread panicked")),
        }
    }

    pub fn close(mut self) -> Result<()> {
        drop(self.sender.take());
        self.join_worker()
    }
}

impl FrameSink for FfmpegPipe {
    fn write_frame(&mut self, frame: RgbImage) -> Result<()> {
        self.write_rgb(frame.into_raw())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        (*self).close()
    }
}

fn select_backend(mode: FfmpegMode, settings: EncodeSettings) -> Result<Box<dyn VideoEncoderBackend>> {
    match mode {
        FfmpegMode::Auto | FfmpegMode::System => Ok(Box::new(SystemFfmpegBackend { settings })),
        FfmpegMode::Sidecar => {
            #[cfg(feature = "sidecar_ffmpeg")]
            {
                Ok(Box::new(SidecarFfmpegBackend { settings }))
            }
            #[cfg(not(feature = "sidecar_ffmpeg"))]
            {
                let _ = settings;
                Err(anyhow!(
                    "ffmpeg sidecar mode requested but property-reel was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`."
                ))
            }
        }
    }
}

impl VideoEncoderBackend for SystemFfmpegBackend {
    fn mode_label(&self) -> &'static str {
        "system"
    }

    fn run(self: Box<Self>, receiver: mpsc::Receiver<Vec<u8>>) -> Result<()> {
        run_ffmpeg_process(Path::new("ffmpeg"), receiver, &self.settings, self.mode_label())
    }
}

#[cfg(feature = "sidecar_ffmpeg")]
impl VideoEncoderBackend for SidecarFfmpegBackend {
    fn mode_label(&self) -> &'static str {
        "sidecar"
    }

    fn run(self: Box<Self>, receiver: mpsc::Receiver<Vec<u8>>) -> Result<()> {
        let path = ffmpeg_sidecar::paths::ffmpeg_path();
        if !path.exists() {
            ffmpeg_sidecar::download::auto_download()
                .context("failed to auto-download ffmpeg sidecar binary")?;
        }
        run_ffmpeg_process(&path, receiver, &self.settings, self.mode_label())
    }
}

fn run_ffmpeg_process(
    ffmpeg_path: &Path,
    receiver: mpsc::Receiver<Vec<u8>>,
    settings: &EncodeSettings,
    mode_label: &str,
) -> Result<()> {
    let path_str = settings.output.to_string_lossy();
    if path_str.len() > 1024 {
        bail!("Output path is suspiciously long");
    }
    if path_str.chars().any(|c| c.is_control()) {
        bail!("Output path contains invalid control characters");
    }

    let args = ffmpeg_args(settings);
    debug!(mode = mode_label, args = %args.join(" "), "spawning ffmpeg");
    let mut child = Command::new(ffmpeg_path)
        .args(args.iter().map(String::as_str))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                anyhow!(
                    "ffmpeg executable not found (mode={mode_label}, resolved_path={}). Install ffmpeg (system mode) or use sidecar mode with `--features sidecar_ffmpeg`.",
                    ffmpeg_path.display()
                )
            } else {
                anyhow!(
                    "failed to spawn ffmpeg process (mode={mode_label}, resolved_path={}, args='{}'): {error}",
                    ffmpeg_path.display(),
                    args.join(" ")
                )
            }
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to capture ffmpeg stdin"))?;
    let mut stderr_pipe = child.stderr.take();

    // ffmpeg may exit early (bad codec, unreadable audio); collect its status
    // and stderr before reporting the broken pipe.
    let mut write_error = None;
    while let Ok(frame) = receiver.recv() {
        if let Err(error) = stdin.write_all(&frame) {
            write_error = Some(error);
            break;
        }
    }
    if write_error.is_none() {
        if let Err(error) = stdin.flush() {
            write_error = Some(error);
        }
    }
    drop(stdin);
    drop(receiver);

    let status = child.wait().context("failed waiting for ffmpeg process")?;
    let stderr_tail = read_stderr_tail(&mut stderr_pipe)?;
    if !status.success() {
        return Err(anyhow!(
            "ffmpeg failed with status {status} (mode={mode_label}, resolved_path={}, args='{}', stderr_tail='{}')",
            ffmpeg_path.display(),
            args.join(" "),
            stderr_tail
        ));
    }
    if let Some(error) = write_error {
        return Err(anyhow!(error).context("failed to write frame to ffmpeg stdin"));
    }

    Ok(())
}

pub fn ffmpeg_args(settings: &EncodeSettings) -> Vec<String> {
    let size = format!("{}x{}", settings.width, settings.height);
    let mut args = ffmpeg_rawvideo_input_args(&size, &settings.fps.to_string());
    args.extend(ffmpeg_audio_args(settings));
    args.extend(ffmpeg_video_output_args(settings));
    args.extend(ffmpeg_container_output_args(&settings.output));
    args.push(settings.output.to_string_lossy().into_owned());
    args
}

pub fn ffmpeg_rawvideo_input_args(size: &str, fps: &str) -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "-pix_fmt".to_owned(),
        "rgb24".to_owned(),
        "-s:v".to_owned(),
        size.to_owned(),
        "-r".to_owned(),
        fps.to_owned(),
        "-i".to_owned(),
        "-".to_owned(),
    ]
}

/// Extra inputs, audio graph and stream mapping. Narration is input 1 when
/// present; music follows it.
pub fn ffmpeg_audio_args(settings: &EncodeSettings) -> Vec<String> {
    let mut args = Vec::new();
    if !settings.has_audio() {
        args.push("-an".to_owned());
        return args;
    }

    if let Some(narration) = &settings.narration {
        args.push("-i".to_owned());
        args.push(narration.to_string_lossy().into_owned());
    }
    if let Some(music) = &settings.music {
        // Short beds loop for the whole narration.
        args.push("-stream_loop".to_owned());
        args.push("-1".to_owned());
        args.push("-i".to_owned());
        args.push(music.path.to_string_lossy().into_owned());
    }

    match (&settings.narration, &settings.music) {
        (Some(_), None) => {
            args.extend(["-map", "0:v:0", "-map", "1:a:0"].map(str::to_owned));
        }
        (Some(_), Some(music)) => {
            args.push("-filter_complex".to_owned());
            args.push(format!(
                "[2:a]volume={:.2}[bg];[1:a][bg]amix=inputs=2:duration=first:dropout_transition=0[aout]",
                music.volume
            ));
            args.extend(["-map", "0:v:0", "-map", "[aout]"].map(str::to_owned));
        }
        (None, Some(music)) => {
            args.push("-filter_complex".to_owned());
            args.push(format!("[1:a]volume={:.2}[aout]", music.volume));
            args.extend(["-map", "0:v:0", "-map", "[aout]"].map(str::to_owned));
        }
        (None, None) => {}
    }

    args.extend(
        ["-c:a", AUDIO_CODEC, "-b:a", AUDIO_BITRATE, "-shortest"].map(str::to_owned),
    );
    args
}

pub fn ffmpeg_video_output_args(settings: &EncodeSettings) -> Vec<String> {
    vec![
        "-c:v".to_owned(),
        settings.video_codec.clone(),
        "-b:v".to_owned(),
        settings.bitrate(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
    ]
}

pub fn ffmpeg_container_output_args(output_path: &Path) -> Vec<String> {
    let ext = output_path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if matches!(ext.as_str(), "mov" | "mp4" | "m4v") {
        vec!["-movflags".to_owned(), "+faststart".to_owned()]
    } else {
        Vec::new()
    }
}

fn read_stderr_tail(stderr: &mut Option<std::process::ChildStderr>) -> Result<String> {
    let Some(mut pipe) = stderr.take() else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)
        .context("failed reading ffmpeg stderr")?;
    let text = String::from_utf8_lossy(&buf).to_string();
    Ok(last_n_chars(&text, 500))
}

fn last_n_chars(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars().collect::<Vec<_>>();
    if chars.len() > max_chars {
        chars = chars[chars.len().saturating_sub(max_chars)..].to_vec();
    }
    chars.into_iter().collect::<String>().trim().to_owned()
}
