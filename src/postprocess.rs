use crate::catalogue::ResolvedOptions;
use crate::cmd;
use crate::{EngineError, Result};
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::thread;
use std::time::Duration;

const THUMBNAIL_EXTENSIONS: &[&str] = &["webp", "jpg", "jpeg", "png"];
const POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcessStep {
    /// `pp_extract_audio = "mp3"` and similar; the encoder follows the extension.
    ExtractAudio { format: String },
    /// Converts the sidecar thumbnail the downloader wrote next to the media.
    ConvertThumbnail { format: String },
    /// Stream-copied excerpt, `pp_clip_start` with optional `pp_clip_end`.
    Clip { start: String, end: Option<String> },
}

impl PostProcessStep {
    pub fn name(&self) -> &'static str {
        match self {
            PostProcessStep::ExtractAudio { .. } => "extract_audio",
            PostProcessStep::ConvertThumbnail { .. } => "convert_thumbnail",
            PostProcessStep::Clip { .. } => "clip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfmpegRun {
    Completed,
    Cancelled,
}

pub fn steps_from_options(options: &ResolvedOptions) -> Vec<PostProcessStep> {
    let mut steps = Vec::new();
    if let Some(format) = clean_format(options.text("pp_extract_audio")) {
        steps.push(PostProcessStep::ExtractAudio { format });
    }
    if let Some(format) = clean_format(options.text("pp_convert_thumbnail")) {
        steps.push(PostProcessStep::ConvertThumbnail { format });
    }
    if let Some(start) = options
        .text("pp_clip_start")
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        let end = options
            .text("pp_clip_end")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        steps.push(PostProcessStep::Clip {
            start: start.to_string(),
            end,
        });
    }
    steps
}

fn clean_format(raw: Option<&str>) -> Option<String> {
    let value = raw?.trim().trim_start_matches('.').to_ascii_lowercase();
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(value)
}

/// Input file for a step, or `None` when there is nothing to work on.
pub fn step_input(step: &PostProcessStep, media: &Path) -> Option<PathBuf> {
    match step {
        PostProcessStep::ConvertThumbnail { .. } => find_thumbnail(media),
        _ => media.exists().then(|| media.to_path_buf()),
    }
}

pub fn step_output(step: &PostProcessStep, input: &Path) -> PathBuf {
    match step {
        PostProcessStep::ExtractAudio { format } | PostProcessStep::ConvertThumbnail { format } => {
            input.with_extension(format)
        }
        PostProcessStep::Clip { .. } => {
            let stem = input
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "clip".to_string());
            let ext = input
                .extension()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "mkv".to_string());
            input.with_file_name(format!("{stem}.clip.{ext}"))
        }
    }
}

pub fn ffmpeg_args(step: &PostProcessStep, input: &Path, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-nostdin".into(), "-y".into()];
    match step {
        PostProcessStep::ExtractAudio { .. } => {
            args.push("-i".into());
            args.push(input.into());
            args.extend(["-vn", "-map", "0:a:0"].map(OsString::from));
        }
        PostProcessStep::ConvertThumbnail { .. } => {
            args.push("-i".into());
            args.push(input.into());
            args.extend(["-frames:v", "1"].map(OsString::from));
        }
        PostProcessStep::Clip { start, end } => {
            args.push("-ss".into());
            args.push(start.into());
            if let Some(end) = end {
                args.push("-to".into());
                args.push(end.into());
            }
            args.push("-i".into());
            args.push(input.into());
            args.extend(["-c", "copy"].map(OsString::from));
        }
    }
    args.push(output.into());
    args
}

fn find_thumbnail(media: &Path) -> Option<PathBuf> {
    THUMBNAIL_EXTENSIONS
        .iter()
        .map(|ext| media.with_extension(ext))
        .find(|candidate| candidate.exists() && candidate != media)
}

/// Runs ffmpeg, polling `is_cancelled` while it works. A cancelled run
/// removes its partial output.
pub fn run_ffmpeg(
    ffmpeg: &Path,
    args: &[OsString],
    output: &Path,
    is_cancelled: &dyn Fn() -> bool,
) -> Result<FfmpegRun> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut child = cmd::command(ffmpeg)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
                tool: "ffmpeg".to_string(),
            },
            _ => EngineError::Io(e),
        })?;

    let stderr_handle = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });

    let status = loop {
        if is_cancelled() {
            cmd::kill_child_process_tree(&mut child);
            if let Some(handle) = stderr_handle {
                let _ = handle.join();
            }
            let _ = std::fs::remove_file(output);
            return Ok(FfmpegRun::Cancelled);
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => thread::sleep(Duration::from_millis(POLL_INTERVAL_MS)),
        }
    };

    let stderr = stderr_handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    if !status.success() {
        return Err(EngineError::ExternalToolFailed {
            tool: "ffmpeg".to_string(),
            code: status.code(),
            stderr: last_lines(&String::from_utf8_lossy(&stderr), 5),
        });
    }
    Ok(FfmpegRun::Completed)
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
