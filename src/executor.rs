//! What a worker slot actually runs for a job.
//!
//! Executors never touch the catalogue directly: they report progress and
//! record mutations through the [`SlotContext`], and the coordinator decides
//! what gets committed.

use crate::catalogue::{
    now_ms, DiscoveredItem, ItemMetadata, LivestreamState, Mutation, NodeId, NodeKind,
    RetentionPolicy, SharedCatalogue,
};
use crate::config::EngineSettings;
use crate::job::{Job, JobId, JobMode};
use crate::logging::JobLog;
use crate::paths::AppPaths;
use crate::postprocess::{self, FfmpegRun};
use crate::process::{LaunchSpec, NextEvent, ProcessWrapper, ProgressEvent};
use crate::profile::{CompiledExitRules, DownloaderProfile, FailureKind};
use crate::{EngineError, Result};
use regex::Regex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

const EVENT_POLL_INTERVAL_MS: u64 = 200;
const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "webm", "mov", "avi", "flv", "m4a", "mp3", "opus", "ogg", "flac", "wav", "aac",
];
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp"];

static MEDIA_NAME_RE: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Succeeded,
    Failed { kind: FailureKind, message: String },
    /// The cancel token fired; whatever the attempt recorded is void.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SlotEvent {
    pub job_id: JobId,
    pub kind: SlotEventKind,
}

#[derive(Debug, Clone)]
pub enum SlotEventKind {
    Started { attempt: u32 },
    Progress(ProgressEvent),
    Mutation(Mutation),
    /// A file to delete once the job's mutations are persisted.
    RemoveAfterCommit(PathBuf),
    Exited(ExecOutcome),
    /// Removed from the queue before it ever ran.
    Dropped,
}

pub struct SlotContext {
    pub job_id: JobId,
    pub attempt: u32,
    pub bandwidth_kib: Option<u64>,
    pub cancel: CancelToken,
    pub log: JobLog,
    sink: Sender<SlotEvent>,
}

impl SlotContext {
    pub fn new(
        job_id: JobId,
        attempt: u32,
        bandwidth_kib: Option<u64>,
        cancel: CancelToken,
        log: JobLog,
        sink: Sender<SlotEvent>,
    ) -> Self {
        Self {
            job_id,
            attempt,
            bandwidth_kib,
            cancel,
            log,
            sink,
        }
    }

    fn send(&self, kind: SlotEventKind) {
        // The coordinator may already be gone during shutdown.
        let _ = self.sink.send(SlotEvent {
            job_id: self.job_id.clone(),
            kind,
        });
    }

    pub fn emit(&self, event: ProgressEvent) {
        self.send(SlotEventKind::Progress(event));
    }

    pub fn mutation(&self, mutation: Mutation) {
        self.send(SlotEventKind::Mutation(mutation));
    }

    pub fn remove_after_commit(&self, path: PathBuf) {
        self.send(SlotEventKind::RemoveAfterCommit(path));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub trait JobExecutor: Send + Sync {
    fn execute(&self, job: &Job, ctx: &SlotContext) -> ExecOutcome;
}

/// Executors by job mode. A mode without an executor fails its jobs at launch.
#[derive(Clone, Default)]
pub struct ExecutorSet {
    by_mode: HashMap<JobMode, Arc<dyn JobExecutor>>,
}

impl std::fmt::Debug for ExecutorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.by_mode.keys().map(|m| m.as_str()))
            .finish()
    }
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard(
        paths: &AppPaths,
        settings: &EngineSettings,
        profile: Arc<dyn DownloaderProfile>,
        catalogue: Arc<SharedCatalogue>,
    ) -> Result<Self> {
        let downloader: Arc<dyn JobExecutor> =
            Arc::new(DownloaderExecutor::new(paths, settings, profile)?);
        let mut set = Self::new();
        for mode in [
            JobMode::Check,
            JobMode::Download,
            JobMode::CustomDownload,
            JobMode::LivestreamProbe,
        ] {
            set.insert(mode, downloader.clone());
        }
        set.insert(JobMode::Refresh, Arc::new(RefreshExecutor::new(catalogue.clone())));
        set.insert(
            JobMode::Tidy,
            Arc::new(TidyExecutor::new(catalogue.clone(), settings.retention)),
        );
        set.insert(
            JobMode::Process,
            Arc::new(PostProcessExecutor::new(catalogue, ffmpeg_path(paths, settings))),
        );
        Ok(set)
    }

    pub fn insert(&mut self, mode: JobMode, executor: Arc<dyn JobExecutor>) {
        self.by_mode.insert(mode, executor);
    }

    pub fn with(mut self, mode: JobMode, executor: Arc<dyn JobExecutor>) -> Self {
        self.insert(mode, executor);
        self
    }

    pub fn get(&self, mode: JobMode) -> Option<Arc<dyn JobExecutor>> {
        self.by_mode.get(&mode).cloned()
    }
}

pub fn ffmpeg_path(paths: &AppPaths, settings: &EngineSettings) -> PathBuf {
    settings
        .ffmpeg_path
        .clone()
        .unwrap_or_else(|| paths.ffmpeg_cmd())
}

/// Runs the configured downloader. Without an explicit executable it falls
/// back from the bundled copy to PATH and then `python -m`; only a missing
/// program moves on to the next candidate.
pub struct DownloaderExecutor {
    profile: Arc<dyn DownloaderProfile>,
    rules: CompiledExitRules,
    candidates: Vec<(PathBuf, Vec<String>)>,
    extra_args: Vec<String>,
    stall_timeout: Duration,
    grace: Duration,
    ffmpeg: PathBuf,
}

impl DownloaderExecutor {
    pub fn new(
        paths: &AppPaths,
        settings: &EngineSettings,
        profile: Arc<dyn DownloaderProfile>,
    ) -> Result<Self> {
        let rules = CompiledExitRules::compile(&settings.exit_rules)?;
        let candidates = match &settings.downloader.executable {
            Some(exe) => vec![(exe.clone(), Vec::new())],
            None => {
                let mut out = Vec::new();
                let bundled = paths.bundled_downloader_path(profile.program());
                if bundled.exists() {
                    out.push((bundled, Vec::new()));
                }
                out.push((PathBuf::from(profile.program()), Vec::new()));
                for python in ["python", "python3"] {
                    out.push((
                        PathBuf::from(python),
                        vec!["-m".to_string(), profile.python_module().to_string()],
                    ));
                }
                out
            }
        };
        Ok(Self {
            profile,
            rules,
            candidates,
            extra_args: settings.downloader.extra_args.clone(),
            stall_timeout: Duration::from_secs(settings.stall_timeout_secs),
            grace: Duration::from_millis(settings.cancel_grace_ms),
            ffmpeg: ffmpeg_path(paths, settings),
        })
    }

    fn drive(&self, job: &Job, ctx: &SlotContext, spec: LaunchSpec) -> Result<ExecOutcome> {
        let handle = ProcessWrapper::start(spec)?;
        let pid = handle.pid();
        let canceller = handle.canceller();
        ctx.log.record(
            "info",
            "process_started",
            json!({ "pid": pid, "attempt": ctx.attempt }),
        );
        let line_log = ctx.log.clone();
        let mut events = handle.events().with_line_hook(move |stream, line| {
            line_log.record("debug", "output", json!({ "stream": stream.as_str(), "line": line }));
        });

        let poll = Duration::from_millis(EVENT_POLL_INTERVAL_MS);
        let mut last_activity = Instant::now();
        let mut cancelled = false;
        let mut stalled = false;
        let mut exit_code = None;
        let mut errors: Vec<String> = Vec::new();
        let mut media: Vec<PathBuf> = Vec::new();

        loop {
            if !cancelled && !stalled && ctx.is_cancelled() {
                canceller.cancel();
                cancelled = true;
            }
            match events.next_timeout(poll) {
                NextEvent::Event(ProgressEvent::Finished { code }) => {
                    exit_code = code;
                    break;
                }
                NextEvent::Event(event) => {
                    last_activity = Instant::now();
                    match &event {
                        ProgressEvent::Error(text) => errors.push(text.clone()),
                        ProgressEvent::ItemDiscovered(item) => {
                            if let Some(path) = &item.media_path {
                                media.push(path.clone());
                            }
                        }
                        _ => {}
                    }
                    ctx.emit(event);
                }
                NextEvent::Timeout => {
                    let stall_limit_hit = !self.stall_timeout.is_zero()
                        && last_activity.elapsed() >= self.stall_timeout;
                    if !cancelled && !stalled && stall_limit_hit {
                        tracing::warn!(job_id = %job.id, pid, "downloader stalled, cancelling");
                        canceller.cancel();
                        stalled = true;
                    }
                }
                NextEvent::End => break,
            }
        }

        ctx.log.record(
            "info",
            "process_exited",
            json!({ "pid": pid, "code": exit_code, "cancelled": cancelled, "stalled": stalled }),
        );
        if cancelled {
            return Ok(ExecOutcome::Cancelled);
        }
        if stalled {
            return Ok(ExecOutcome::Failed {
                kind: FailureKind::Stalled,
                message: format!("no output for {}s", self.stall_timeout.as_secs()),
            });
        }

        let tail = events.stderr_tail();
        if job.mode == JobMode::LivestreamProbe && self.rules.livestream_waiting(&tail) {
            if let Some(node) = job.target.node_id() {
                ctx.mutation(Mutation::SetLivestream {
                    node,
                    state: LivestreamState::Waiting,
                    scheduled_at_ms: None,
                });
            }
            return Ok(ExecOutcome::Succeeded);
        }

        if exit_code == Some(0) {
            if job.mode.downloads_media() {
                for path in &media {
                    let resolved = resolve_media_path(&job.destination, path);
                    if let Some(outcome) = run_post_steps(&self.ffmpeg, job, ctx, &resolved, false) {
                        return Ok(outcome);
                    }
                }
            }
            return Ok(ExecOutcome::Succeeded);
        }

        let kind = self.profile.classify_exit(exit_code, &tail, &self.rules);
        let message = errors
            .last()
            .cloned()
            .or_else(|| tail.last().cloned())
            .unwrap_or_else(|| format!("downloader exited with {exit_code:?}"));
        Ok(ExecOutcome::Failed { kind, message })
    }
}

impl JobExecutor for DownloaderExecutor {
    fn execute(&self, job: &Job, ctx: &SlotContext) -> ExecOutcome {
        let args = self.profile.build_args(job, ctx.bandwidth_kib, &self.extra_args);
        let cwd = if job.mode.downloads_media() {
            if let Err(err) = std::fs::create_dir_all(&job.destination) {
                return ExecOutcome::Failed {
                    kind: FailureKind::Terminal,
                    message: format!(
                        "cannot create destination {}: {err}",
                        job.destination.display()
                    ),
                };
            }
            Some(job.destination.clone())
        } else {
            None
        };

        let mut missing: Vec<String> = Vec::new();
        for (program, prefix) in &self.candidates {
            let mut full = prefix.clone();
            full.extend(args.iter().cloned());
            let spec = LaunchSpec {
                program: program.clone(),
                args: full,
                cwd: cwd.clone(),
                grace: self.grace,
                profile: self.profile.clone(),
            };
            match self.drive(job, ctx, spec) {
                Ok(outcome) => return outcome,
                Err(EngineError::ExternalToolMissing { tool }) => {
                    missing.push(tool);
                    continue;
                }
                Err(err) => {
                    return ExecOutcome::Failed {
                        kind: FailureKind::Launch,
                        message: err.to_string(),
                    }
                }
            }
        }
        ExecOutcome::Failed {
            kind: FailureKind::Launch,
            message: format!(
                "{} is not installed (tried {})",
                self.profile.program(),
                missing.join(", ")
            ),
        }
    }
}

fn resolve_media_path(destination: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        destination.join(path)
    }
}

/// Runs every post-processing step for one media file. Returns an outcome
/// only when the job has to end early.
fn run_post_steps(
    ffmpeg: &Path,
    job: &Job,
    ctx: &SlotContext,
    media: &Path,
    fail_on_error: bool,
) -> Option<ExecOutcome> {
    for step in postprocess::steps_from_options(&job.options) {
        let Some(input) = postprocess::step_input(&step, media) else {
            continue;
        };
        let output = postprocess::step_output(&step, &input);
        if output.exists() {
            continue;
        }
        let args = postprocess::ffmpeg_args(&step, &input, &output);
        let cancel = ctx.cancel.clone();
        match postprocess::run_ffmpeg(ffmpeg, &args, &output, &move || cancel.is_cancelled()) {
            Ok(FfmpegRun::Completed) => {
                ctx.log.record(
                    "info",
                    "postprocess_done",
                    json!({ "step": step.name(), "output": output.to_string_lossy() }),
                );
            }
            Ok(FfmpegRun::Cancelled) => return Some(ExecOutcome::Cancelled),
            Err(err) => {
                let message = format!("{} failed for {}: {err}", step.name(), input.display());
                ctx.log.record("warn", "postprocess_failed", json!({ "error": message }));
                if fail_on_error {
                    let kind = match err {
                        EngineError::ExternalToolMissing { .. } => FailureKind::Launch,
                        _ => FailureKind::Terminal,
                    };
                    return Some(ExecOutcome::Failed { kind, message });
                }
                ctx.emit(ProgressEvent::Warning(message));
            }
        }
    }
    None
}

fn require_node(job: &Job) -> std::result::Result<NodeId, ExecOutcome> {
    job.target.node_id().ok_or_else(|| ExecOutcome::Failed {
        kind: FailureKind::Terminal,
        message: format!("{} jobs need a catalogue node", job.mode.as_str()),
    })
}

#[derive(Debug, Clone)]
struct VideoFacts {
    id: NodeId,
    item_id: Option<String>,
    media_path: Option<PathBuf>,
    downloaded: bool,
    missing: bool,
}

/// The target itself when it is a video, otherwise its direct video children.
fn videos_in_scope(catalogue: &SharedCatalogue, node: NodeId) -> Vec<VideoFacts> {
    catalogue.read(|c| {
        let Some(target) = c.node(node) else {
            return Vec::new();
        };
        let nodes = if target.kind == NodeKind::Video {
            vec![target]
        } else {
            c.children(node)
                .into_iter()
                .filter(|n| n.kind == NodeKind::Video)
                .collect()
        };
        nodes
            .into_iter()
            .map(|n| VideoFacts {
                id: n.id,
                item_id: n.source_item_id.clone(),
                media_path: n.media_path.clone(),
                downloaded: n.is_downloaded(),
                missing: n.flags.missing,
            })
            .collect()
    })
}

/// `Some Title [abc123].mkv` -> (`abc123`, `Some Title`).
pub fn media_file_item(file_name: &str) -> Option<(String, String)> {
    let re = MEDIA_NAME_RE.get_or_init(|| {
        Regex::new(r"^(?P<title>.*?)\s*\[(?P<id>[A-Za-z0-9_-]+)\]\.(?P<ext>[A-Za-z0-9]+)$")
            .expect("media name regex")
    });
    let caps = re.captures(file_name)?;
    let ext = caps.name("ext")?.as_str().to_ascii_lowercase();
    if !MEDIA_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    Some((
        caps.name("id")?.as_str().to_string(),
        caps.name("title")?.as_str().trim().to_string(),
    ))
}

fn scan_media_dir(dir: &Path) -> BTreeMap<String, (PathBuf, String)> {
    let mut out = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some((item_id, title)) = media_file_item(&name) {
            out.entry(item_id).or_insert((path, title));
        }
    }
    out
}

fn emit_percent(ctx: &SlotContext, done: usize, total: usize) {
    if total == 0 {
        return;
    }
    ctx.emit(ProgressEvent::Progress {
        percent: (done as f64 / total as f64) * 100.0,
        speed_bps: None,
        eta_secs: None,
    });
}

/// Reconciles the catalogue with what is actually on disk.
pub struct RefreshExecutor {
    catalogue: Arc<SharedCatalogue>,
}

impl RefreshExecutor {
    pub fn new(catalogue: Arc<SharedCatalogue>) -> Self {
        Self { catalogue }
    }
}

impl JobExecutor for RefreshExecutor {
    fn execute(&self, job: &Job, ctx: &SlotContext) -> ExecOutcome {
        let node = match require_node(job) {
            Ok(node) => node,
            Err(outcome) => return outcome,
        };
        let videos = videos_in_scope(&self.catalogue, node);
        let mut on_disk = scan_media_dir(&job.destination);
        let total = videos.len();

        for (idx, video) in videos.iter().enumerate() {
            if ctx.is_cancelled() {
                return ExecOutcome::Cancelled;
            }
            let recorded_exists = video.media_path.as_ref().is_some_and(|p| p.exists());
            let found = video.item_id.as_ref().and_then(|id| on_disk.remove(id));

            if recorded_exists {
                if video.missing {
                    ctx.mutation(Mutation::SetMissing {
                        node: video.id,
                        missing: false,
                    });
                }
            } else if let (Some(item_id), Some((path, _))) = (&video.item_id, found) {
                ctx.mutation(Mutation::UpsertItem {
                    parent: node,
                    item: DiscoveredItem {
                        item_id: item_id.clone(),
                        media_path: Some(path),
                        ..DiscoveredItem::default()
                    },
                });
            } else if video.downloaded && !video.missing {
                ctx.mutation(Mutation::SetMissing {
                    node: video.id,
                    missing: true,
                });
            }
            emit_percent(ctx, idx + 1, total);
        }

        if job.target.is_container() {
            for (item_id, (path, title)) in on_disk {
                ctx.mutation(Mutation::UpsertItem {
                    parent: node,
                    item: DiscoveredItem {
                        item_id,
                        metadata: ItemMetadata {
                            title: (!title.is_empty()).then_some(title),
                            ..ItemMetadata::default()
                        },
                        media_path: Some(path),
                        ..DiscoveredItem::default()
                    },
                });
            }
        }
        ExecOutcome::Succeeded
    }
}

/// Removes download leftovers and applies the retention policy. Expired
/// media is only deleted from disk after the catalogue commit lands.
pub struct TidyExecutor {
    catalogue: Arc<SharedCatalogue>,
    retention: RetentionPolicy,
}

impl TidyExecutor {
    pub fn new(catalogue: Arc<SharedCatalogue>, retention: RetentionPolicy) -> Self {
        Self {
            catalogue,
            retention,
        }
    }

    fn policy_for(&self, job: &Job) -> RetentionPolicy {
        let mut policy = self.retention;
        if let Some(days) = job.options.number("retention_max_age_days") {
            policy.max_age_days = u32::try_from(days).ok().filter(|d| *d > 0);
        }
        if let Some(count) = job.options.number("retention_max_items") {
            policy.max_items_per_container = usize::try_from(count).ok().filter(|c| *c > 0);
        }
        policy
    }
}

pub fn is_partial_download(file_name: &str) -> bool {
    PARTIAL_SUFFIXES.iter().any(|s| file_name.ends_with(s)) || file_name.contains(".part-Frag")
}

impl JobExecutor for TidyExecutor {
    fn execute(&self, job: &Job, ctx: &SlotContext) -> ExecOutcome {
        let node = match require_node(job) {
            Ok(node) => node,
            Err(outcome) => return outcome,
        };

        let mut removed_partials = 0_usize;
        if let Ok(entries) = std::fs::read_dir(&job.destination) {
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                if path.is_file() && is_partial_download(&name) {
                    match std::fs::remove_file(&path) {
                        Ok(()) => removed_partials += 1,
                        Err(err) => {
                            ctx.emit(ProgressEvent::Warning(format!(
                                "could not remove {}: {err}",
                                path.display()
                            )));
                        }
                    }
                }
            }
        }

        if ctx.is_cancelled() {
            return ExecOutcome::Cancelled;
        }

        let policy = self.policy_for(job);
        let expired: Vec<(NodeId, Option<PathBuf>)> = if job.target.is_container() {
            self.catalogue.read(|c| {
                c.retention_candidates(node, &policy, now_ms())
                    .into_iter()
                    .map(|id| (id, c.node(id).and_then(|n| n.media_path.clone())))
                    .collect()
            })
        } else {
            Vec::new()
        };

        for (id, media) in &expired {
            ctx.mutation(Mutation::Delete { node: *id });
            if let Some(path) = media {
                ctx.remove_after_commit(path.clone());
            }
        }

        ctx.log.record(
            "info",
            "tidy_done",
            json!({ "partials_removed": removed_partials, "expired": expired.len() }),
        );
        ExecOutcome::Succeeded
    }
}

/// ffmpeg steps over every downloaded file below the target.
pub struct PostProcessExecutor {
    catalogue: Arc<SharedCatalogue>,
    ffmpeg: PathBuf,
}

impl PostProcessExecutor {
    pub fn new(catalogue: Arc<SharedCatalogue>, ffmpeg: PathBuf) -> Self {
        Self { catalogue, ffmpeg }
    }
}

impl JobExecutor for PostProcessExecutor {
    fn execute(&self, job: &Job, ctx: &SlotContext) -> ExecOutcome {
        let node = match require_node(job) {
            Ok(node) => node,
            Err(outcome) => return outcome,
        };
        if postprocess::steps_from_options(&job.options).is_empty() {
            return ExecOutcome::Succeeded;
        }

        let media: Vec<PathBuf> = self.catalogue.read(|c| {
            c.videos_under(node)
                .into_iter()
                .filter_map(|id| c.node(id))
                .filter(|n| n.is_downloaded() && !n.flags.missing)
                .filter_map(|n| n.media_path.clone())
                .collect()
        });

        let total = media.len();
        for (idx, path) in media.iter().enumerate() {
            if ctx.is_cancelled() {
                return ExecOutcome::Cancelled;
            }
            if let Some(outcome) = run_post_steps(&self.ffmpeg, job, ctx, path, true) {
                return outcome;
            }
            emit_percent(ctx, idx + 1, total);
        }
        ExecOutcome::Succeeded
    }
}
