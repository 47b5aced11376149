//! One user request fanned out into jobs, followed to completion and committed.

use crate::catalogue::{
    now_ms, Catalogue, LivestreamState, Mutation, MutationBatch, NodeId, NodeKind, OptionsSet,
};
use crate::config::RetrySettings;
use crate::executor::{ExecOutcome, JobExecutor, SlotEvent, SlotEventKind};
use crate::history::JobResultRecord;
use crate::job::{Job, JobId, JobMode, JobPriority, JobRun, JobState, JobTarget, OperationId};
use crate::logging::JobLog;
use crate::manager::EngineCore;
use crate::process::ProgressEvent;
use crate::profile::FailureKind;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const COORDINATOR_TICK_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Check,
    Download,
    CustomDownload,
    LivestreamCheck,
    Refresh,
    Tidy,
    Process,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Check => "check",
            OperationKind::Download => "download",
            OperationKind::CustomDownload => "custom_download",
            OperationKind::LivestreamCheck => "livestream_check",
            OperationKind::Refresh => "refresh",
            OperationKind::Tidy => "tidy",
            OperationKind::Process => "process",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "check" => Some(OperationKind::Check),
            "download" => Some(OperationKind::Download),
            "custom_download" => Some(OperationKind::CustomDownload),
            "livestream_check" => Some(OperationKind::LivestreamCheck),
            "refresh" => Some(OperationKind::Refresh),
            "tidy" => Some(OperationKind::Tidy),
            "process" => Some(OperationKind::Process),
            _ => None,
        }
    }

    pub fn job_mode(&self) -> JobMode {
        match self {
            OperationKind::Check => JobMode::Check,
            OperationKind::Download => JobMode::Download,
            OperationKind::CustomDownload => JobMode::CustomDownload,
            OperationKind::LivestreamCheck => JobMode::LivestreamProbe,
            OperationKind::Refresh => JobMode::Refresh,
            OperationKind::Tidy => JobMode::Tidy,
            OperationKind::Process => JobMode::Process,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetSet {
    All,
    Nodes { ids: Vec<NodeId> },
    /// Classic mode: bare URLs downloaded outside the catalogue.
    Urls {
        urls: Vec<String>,
        destination: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    Expanding,
    Running,
    Draining,
    Committing,
    Aborting,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationCounts {
    pub total: u32,
    pub queued: u32,
    pub running: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// Includes stopped-early jobs and busy targets.
    pub skipped: u32,
    pub stopped_early: u32,
    pub cancelled: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub job_id: Option<JobId>,
    pub node_id: Option<NodeId>,
    pub url: Option<String>,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitStatus {
    Committed { sha256: String },
    NothingToCommit,
    /// In-memory state is kept; `OperationManager::retry_commit` persists it later.
    Failed { reason: String },
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatus::Committed { .. } => "committed",
            CommitStatus::NothingToCommit => "nothing_to_commit",
            CommitStatus::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSummary {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub counts: OperationCounts,
    pub failures: Vec<JobFailure>,
    pub skipped_busy: Vec<NodeId>,
    pub touched_nodes: Vec<NodeId>,
    pub commit: CommitStatus,
    pub cancelled: bool,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    PhaseChanged(OperationPhase),
    ProgressTick { job_id: JobId, percent: f64 },
    JobFinished { job_id: JobId, state: JobState },
    NodeUpdated(NodeId),
    /// A watched livestream went live.
    LivestreamLive(NodeId),
    Finished(OperationSummary),
}

/// Called from the coordinator thread, in event order.
pub trait OperationObserver: Send + Sync {
    fn on_event(&self, operation_id: &str, event: &OperationEvent);
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl OperationObserver for NoopObserver {
    fn on_event(&self, _operation_id: &str, _event: &OperationEvent) {}
}

/// Forwards every event into a channel.
pub struct ChannelObserver {
    tx: Mutex<Sender<(OperationId, OperationEvent)>>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<(OperationId, OperationEvent)>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }
}

impl OperationObserver for ChannelObserver {
    fn on_event(&self, operation_id: &str, event: &OperationEvent) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let _ = tx.send((operation_id.to_string(), event.clone()));
    }
}

/// Fans events out to several observers.
pub struct ObserverSet(pub Vec<Arc<dyn OperationObserver>>);

impl OperationObserver for ObserverSet {
    fn on_event(&self, operation_id: &str, event: &OperationEvent) {
        for observer in &self.0 {
            observer.on_event(operation_id, event);
        }
    }
}

struct HandleShared {
    cancel: AtomicBool,
    phase: Mutex<OperationPhase>,
    summary: Mutex<Option<OperationSummary>>,
    done: Condvar,
}

#[derive(Clone)]
pub struct OperationHandle {
    id: OperationId,
    kind: OperationKind,
    shared: Arc<HandleShared>,
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("phase", &self.phase())
            .finish()
    }
}

impl OperationHandle {
    pub(crate) fn new(id: OperationId, kind: OperationKind) -> Self {
        Self {
            id,
            kind,
            shared: Arc::new(HandleShared {
                cancel: AtomicBool::new(false),
                phase: Mutex::new(OperationPhase::Expanding),
                summary: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Asks the coordinator to abort; it acts on the next tick.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> OperationPhase {
        *self.shared.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_finished(&self) -> bool {
        self.summary_guard().is_some()
    }

    pub fn summary(&self) -> Option<OperationSummary> {
        self.summary_guard().clone()
    }

    fn summary_guard(&self) -> MutexGuard<'_, Option<OperationSummary>> {
        self.shared.summary.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn wait(&self) -> OperationSummary {
        let mut guard = self.summary_guard();
        loop {
            if let Some(summary) = guard.as_ref() {
                return summary.clone();
            }
            guard = self
                .shared
                .done
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<OperationSummary> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.summary_guard();
        loop {
            if let Some(summary) = guard.as_ref() {
                return Some(summary.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            guard = self
                .shared
                .done
                .wait_timeout(guard, remaining)
                .map(|(g, _)| g)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn set_phase(&self, phase: OperationPhase) {
        *self.shared.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    fn finish(&self, summary: OperationSummary) {
        *self.summary_guard() = Some(summary);
        self.shared.done.notify_all();
    }
}

/// Jobs produced from a target set, plus what could not become a job.
#[derive(Debug, Default)]
pub(crate) struct Expansion {
    pub jobs: Vec<Arc<Job>>,
    pub skipped_busy: Vec<NodeId>,
    pub rejected: Vec<JobFailure>,
}

pub(crate) struct ExpandRequest<'a> {
    pub operation_id: &'a str,
    pub kind: OperationKind,
    pub targets: &'a TargetSet,
    pub options_override: Option<&'a OptionsSet>,
    pub downloads_root: &'a Path,
}

/// Turns a target set into jobs and claims their nodes. Runs under the
/// catalogue lock and the claim registry lock so no other operation can
/// claim the same nodes in between.
pub(crate) fn expand(
    catalogue: &Catalogue,
    claims: &mut HashMap<NodeId, OperationId>,
    req: &ExpandRequest<'_>,
) -> Result<Expansion> {
    let mode = req.kind.job_mode();
    let mut out = Expansion::default();

    if let TargetSet::Urls { urls, destination } = req.targets {
        if !mode.uses_downloader() || mode == JobMode::LivestreamProbe {
            return Err(EngineError::InvalidJob(format!(
                "{} operations need catalogue nodes",
                req.kind.as_str()
            )));
        }
        let base = catalogue.default_options();
        let options = Arc::new(match req.options_override {
            Some(extra) => base.overlay(extra),
            None => base,
        });
        let destination = destination
            .clone()
            .unwrap_or_else(|| req.downloads_root.to_path_buf());
        for url in urls {
            match Job::new(
                req.operation_id,
                JobTarget::BareUrl { url: url.clone() },
                mode,
                options.clone(),
                destination.clone(),
                JobPriority::Normal,
            ) {
                Ok(job) => out.jobs.push(Arc::new(job)),
                Err(err) => out.rejected.push(JobFailure {
                    job_id: None,
                    node_id: None,
                    url: Some(url.clone()),
                    kind: FailureKind::Terminal,
                    message: err.to_string(),
                    attempts: 0,
                }),
            }
        }
        return Ok(out);
    }

    let requested: Vec<NodeId> = match req.targets {
        TargetSet::All if mode == JobMode::LivestreamProbe => catalogue.pending_livestreams(),
        TargetSet::All => catalogue.roots().to_vec(),
        TargetSet::Nodes { ids } => {
            for id in ids {
                catalogue.require(*id)?;
            }
            ids.clone()
        }
        TargetSet::Urls { .. } => Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut targets: Vec<NodeId> = Vec::new();
    for id in requested {
        for target in catalogue.job_targets_under(id) {
            if seen.insert(target) {
                targets.push(target);
            }
        }
    }

    let mut claimed_now: Vec<NodeId> = Vec::new();
    for target in targets {
        let Some(node) = catalogue.node(target) else {
            continue;
        };
        if node.flags.blocked {
            tracing::debug!(node_id = target, "skipping blocked node");
            continue;
        }
        if mode == JobMode::LivestreamProbe
            && (node.kind != NodeKind::Video || !node.livestream.is_pending())
        {
            continue;
        }
        if is_busy(catalogue, claims, target) {
            out.skipped_busy.push(target);
            continue;
        }

        let options = match catalogue.resolve_options(target) {
            Ok(resolved) => match req.options_override {
                Some(extra) => resolved.overlay(extra),
                None => resolved,
            },
            Err(err) => {
                out.rejected.push(JobFailure {
                    job_id: None,
                    node_id: Some(target),
                    url: node.source_url.clone(),
                    kind: FailureKind::Terminal,
                    message: err.to_string(),
                    attempts: 0,
                });
                continue;
            }
        };
        let priority = if node.livestream == LivestreamState::LiveNow {
            JobPriority::LiveNow
        } else {
            JobPriority::Normal
        };
        let job = catalogue
            .destination_dir(target, req.downloads_root)
            .and_then(|destination| {
                Job::new(
                    req.operation_id,
                    JobTarget::Node {
                        id: target,
                        kind: node.kind,
                        url: node.source_url.clone(),
                    },
                    mode,
                    Arc::new(options),
                    destination,
                    priority,
                )
            });
        match job {
            Ok(job) => {
                claims.insert(target, req.operation_id.to_string());
                claimed_now.push(target);
                out.jobs.push(Arc::new(job));
            }
            Err(err) => out.rejected.push(JobFailure {
                job_id: None,
                node_id: Some(target),
                url: node.source_url.clone(),
                kind: FailureKind::Terminal,
                message: err.to_string(),
                attempts: 0,
            }),
        }
    }
    tracing::debug!(
        operation_id = req.operation_id,
        jobs = out.jobs.len(),
        busy = out.skipped_busy.len(),
        claimed = claimed_now.len(),
        "targets expanded"
    );
    Ok(out)
}

/// A node is busy when it, an ancestor or a descendant is claimed.
fn is_busy(catalogue: &Catalogue, claims: &HashMap<NodeId, OperationId>, target: NodeId) -> bool {
    if claims.contains_key(&target) {
        return true;
    }
    if catalogue.ancestors(target).iter().any(|a| claims.contains_key(a)) {
        return true;
    }
    claims
        .keys()
        .any(|claimed| catalogue.is_self_or_descendant(*claimed, target))
}

/// Upserts of child items survive a failed or stopped job; nothing else does.
pub(crate) fn child_upserts(delta: &[Mutation]) -> Vec<Mutation> {
    delta
        .iter()
        .filter(|m| matches!(m, Mutation::UpsertItem { .. }))
        .cloned()
        .collect()
}

/// Mutations for the job's own target after a successful run.
pub(crate) fn success_mutations(job: &Job, delta: &[Mutation], media_path: Option<PathBuf>) -> Vec<Mutation> {
    let JobTarget::Node { id, kind, .. } = &job.target else {
        return Vec::new();
    };
    let node = *id;
    let mut out = Vec::new();
    match job.mode {
        JobMode::Check => out.push(Mutation::MarkChecked { node }),
        JobMode::Download | JobMode::CustomDownload => {
            if *kind == NodeKind::Video {
                out.push(Mutation::MarkDownloaded { node, media_path });
            } else {
                out.push(Mutation::MarkChecked { node });
            }
        }
        JobMode::LivestreamProbe => {
            out.push(Mutation::MarkChecked { node });
            let reported_live_state = delta.iter().any(|m| match m {
                Mutation::UpsertItem { item, .. } => item.livestream.is_some(),
                Mutation::SetLivestream { .. } => true,
                _ => false,
            });
            let saw_item = delta.iter().any(|m| matches!(m, Mutation::UpsertItem { .. }));
            // The source no longer calls it a livestream at all.
            if saw_item && !reported_live_state {
                out.push(Mutation::SetLivestream {
                    node,
                    state: LivestreamState::Finished,
                    scheduled_at_ms: None,
                });
            }
        }
        JobMode::Refresh | JobMode::Tidy | JobMode::Process => {}
    }
    out.push(Mutation::ClearFailure { node });
    out
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed file after commit"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not remove file after commit");
            }
        }
    }
}

pub(crate) struct Coordinator {
    core: Arc<EngineCore>,
    handle: OperationHandle,
    targets_json: String,
    options_json: Option<String>,
    executor: Arc<dyn JobExecutor>,
    observer: Arc<dyn OperationObserver>,
    retry: RetrySettings,
    runs: HashMap<JobId, JobRun>,
    order: Vec<JobId>,
    media: HashMap<JobId, PathBuf>,
    pending_retries: Vec<(Instant, JobId)>,
    known: HashSet<String>,
    batch: MutationBatch,
    /// Files from succeeded jobs, deleted only after the batch is persisted.
    cleanup: Vec<PathBuf>,
    failures: Vec<JobFailure>,
    skipped_busy: Vec<NodeId>,
    aborting: bool,
    phase: OperationPhase,
    started_at_ms: i64,
    tx: Sender<SlotEvent>,
    rx: Receiver<SlotEvent>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        core: Arc<EngineCore>,
        handle: OperationHandle,
        targets: &TargetSet,
        options_override: Option<&OptionsSet>,
        expansion: Expansion,
        executor: Arc<dyn JobExecutor>,
        observer: Arc<dyn OperationObserver>,
        retry: RetrySettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let mut runs = HashMap::new();
        let mut order = Vec::new();
        for job in expansion.jobs {
            order.push(job.id.clone());
            runs.insert(job.id.clone(), JobRun::new(job));
        }
        Self {
            core,
            handle,
            targets_json: serde_json::to_string(targets).unwrap_or_else(|_| "null".to_string()),
            options_json: options_override.and_then(|o| serde_json::to_string(o).ok()),
            executor,
            observer,
            retry,
            runs,
            order,
            media: HashMap::new(),
            pending_retries: Vec::new(),
            known: HashSet::new(),
            batch: MutationBatch::new(),
            cleanup: Vec::new(),
            failures: expansion.rejected,
            skipped_busy: expansion.skipped_busy,
            aborting: false,
            phase: OperationPhase::Expanding,
            started_at_ms: now_ms(),
            tx,
            rx,
        }
    }

    fn id(&self) -> &str {
        self.handle.id()
    }

    fn emit(&self, event: OperationEvent) {
        self.observer.on_event(self.handle.id(), &event);
    }

    fn set_phase(&mut self, phase: OperationPhase) {
        if self.phase == phase {
            return;
        }
        tracing::debug!(operation_id = %self.id(), phase = ?phase, "operation phase");
        self.phase = phase;
        self.handle.set_phase(phase);
        self.emit(OperationEvent::PhaseChanged(phase));
    }

    pub(crate) fn run(mut self) -> OperationSummary {
        self.emit(OperationEvent::PhaseChanged(OperationPhase::Expanding));
        if let Some(history) = &self.core.history {
            if let Err(err) = history.record_started(
                self.id(),
                self.handle.kind(),
                &self.targets_json,
                self.options_json.as_deref(),
            ) {
                tracing::warn!(operation_id = %self.id(), error = %err, "history write failed");
            }
        }

        self.set_phase(OperationPhase::Running);
        let order = self.order.clone();
        for job_id in &order {
            self.submit(job_id, 1);
        }

        let tick = Duration::from_millis(COORDINATOR_TICK_MS);
        loop {
            if !self.aborting && self.handle.is_cancel_requested() {
                self.abort();
            }
            self.fire_due_retries();
            if self.all_terminal() {
                break;
            }
            self.update_draining();

            let wait = self
                .pending_retries
                .iter()
                .map(|(due, _)| due.saturating_duration_since(Instant::now()))
                .min()
                .map_or(tick, |d| d.min(tick));
            match self.rx.recv_timeout(wait) {
                Ok(event) => self.handle_slot_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let summary = self.commit();
        if let Some(history) = &self.core.history {
            if let Err(err) = history.record_finished(&summary) {
                tracing::warn!(operation_id = %self.id(), error = %err, "history write failed");
            }
        }
        self.core.release_claims(self.id());
        self.set_phase(OperationPhase::Done);
        tracing::info!(
            operation_id = %self.id(),
            kind = self.handle.kind().as_str(),
            succeeded = summary.counts.succeeded,
            failed = summary.counts.failed,
            skipped = summary.counts.skipped,
            cancelled = summary.counts.cancelled,
            commit = summary.commit.as_str(),
            "operation finished"
        );
        self.handle.finish(summary.clone());
        self.emit(OperationEvent::Finished(summary.clone()));
        summary
    }

    fn submit(&mut self, job_id: &str, attempt: u32) {
        let Some(run) = self.runs.get_mut(job_id) else {
            return;
        };
        run.state = JobState::Queued;
        let job = run.job.clone();
        if let Err(err) = self
            .core
            .pool
            .submit(job, attempt, self.executor.clone(), self.tx.clone())
        {
            tracing::warn!(operation_id = %self.handle.id(), job_id, error = %err, "job could not be queued");
            self.finish_job(job_id, JobState::Cancelled);
        }
    }

    fn fire_due_retries(&mut self) {
        if self.pending_retries.is_empty() {
            return;
        }
        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) = self
            .pending_retries
            .drain(..)
            .partition(|(at, _)| *at <= now);
        self.pending_retries = later;
        for (_, job_id) in due {
            let attempt = self.runs.get(&job_id).map_or(1, |r| r.failures + 1);
            self.submit(&job_id, attempt);
        }
    }

    fn all_terminal(&self) -> bool {
        self.pending_retries.is_empty() && self.runs.values().all(|r| r.state.is_terminal())
    }

    fn update_draining(&mut self) {
        if self.aborting || !self.pending_retries.is_empty() {
            return;
        }
        let any_queued = self.runs.values().any(|r| r.state == JobState::Queued);
        let any_running = self
            .runs
            .values()
            .any(|r| matches!(r.state, JobState::Running | JobState::Stopping));
        if !any_queued && any_running {
            self.set_phase(OperationPhase::Draining);
        }
    }

    fn abort(&mut self) {
        self.aborting = true;
        self.set_phase(OperationPhase::Aborting);
        let retries: Vec<JobId> = self.pending_retries.drain(..).map(|(_, id)| id).collect();
        for job_id in retries {
            self.finish_job(&job_id, JobState::Cancelled);
        }
        let signalled = self.core.pool.cancel_operation(self.handle.id());
        tracing::info!(operation_id = %self.id(), signalled, "operation cancelled");
    }

    fn handle_slot_event(&mut self, event: SlotEvent) {
        let SlotEvent { job_id, kind } = event;
        let Some(state) = self.runs.get(&job_id).map(|r| r.state) else {
            return;
        };
        if state.is_terminal() {
            return;
        }
        match kind {
            SlotEventKind::Started { .. } => {
                if let Some(run) = self.runs.get_mut(&job_id) {
                    run.state = JobState::Running;
                }
            }
            SlotEventKind::Progress(progress) => self.handle_progress(&job_id, progress),
            SlotEventKind::Mutation(mutation) => {
                if let Some(run) = self.runs.get_mut(&job_id) {
                    run.delta.push(mutation);
                }
            }
            SlotEventKind::RemoveAfterCommit(path) => {
                if let Some(run) = self.runs.get_mut(&job_id) {
                    run.cleanup.push(path);
                }
            }
            SlotEventKind::Exited(outcome) => self.handle_exit(&job_id, outcome),
            SlotEventKind::Dropped => self.finish_job(&job_id, JobState::Cancelled),
        }
    }

    fn handle_progress(&mut self, job_id: &str, progress: ProgressEvent) {
        match progress {
            ProgressEvent::Progress { percent, .. } => {
                if let Some(run) = self.runs.get_mut(job_id) {
                    run.last_percent = Some(percent);
                }
                self.emit(OperationEvent::ProgressTick {
                    job_id: job_id.to_string(),
                    percent,
                });
            }
            ProgressEvent::ItemDiscovered(item) => {
                let Some(run) = self.runs.get(job_id) else {
                    return;
                };
                // Output after an early stop must not count.
                if run.state == JobState::Stopping {
                    return;
                }
                let Some(parent) = run.job.target.node_id() else {
                    return;
                };
                let mode = run.job.mode;
                // A single video lists itself; only containers stop on known items.
                let may_stop = run.job.target.is_container();
                let known_elsewhere = self.known.contains(&item.item_id)
                    || self
                        .core
                        .catalogue
                        .read(|c| c.find_item(&item.item_id).is_some());
                let stop = {
                    let Some(run) = self.runs.get_mut(job_id) else {
                        return;
                    };
                    let consecutive = run.record_discovery(&item.item_id, known_elsewhere);
                    if let Some(path) = &item.media_path {
                        let full = if path.is_absolute() {
                            path.clone()
                        } else {
                            run.job.destination.join(path)
                        };
                        self.media.insert(job_id.to_string(), full);
                    }
                    run.delta.push(Mutation::UpsertItem { parent, item });
                    may_stop && self.core.governor.should_stop_early(mode, consecutive)
                };
                if stop {
                    if let Some(run) = self.runs.get_mut(job_id) {
                        run.stopped_early = true;
                        run.state = JobState::Stopping;
                    }
                    tracing::info!(operation_id = %self.handle.id(), job_id, "stopping job early: only known items left");
                    self.core.pool.cancel_job(job_id);
                }
            }
            ProgressEvent::Warning(text) => {
                tracing::debug!(operation_id = %self.id(), job_id, warning = %text, "downloader warning");
            }
            ProgressEvent::Error(text) => {
                tracing::debug!(operation_id = %self.id(), job_id, error = %text, "downloader error line");
            }
            ProgressEvent::Finished { .. } => {}
        }
    }

    fn handle_exit(&mut self, job_id: &str, outcome: ExecOutcome) {
        let Some(run) = self.runs.get(job_id) else {
            return;
        };
        if run.stopped_early {
            let upserts = child_upserts(&run.delta);
            self.fold(job_id, upserts);
            self.finish_job(job_id, JobState::Skipped);
            return;
        }

        match outcome {
            ExecOutcome::Succeeded => {
                let media = self.media.get(job_id).cloned();
                let mut mutations = run.delta.clone();
                mutations.extend(success_mutations(&run.job, &run.delta, media));
                self.fold(job_id, mutations);
                if let Some(run) = self.runs.get_mut(job_id) {
                    self.cleanup.append(&mut run.cleanup);
                }
                self.finish_job(job_id, JobState::Succeeded);
            }
            ExecOutcome::Cancelled => {
                self.finish_job(job_id, JobState::Cancelled);
            }
            ExecOutcome::Failed { kind, message } => {
                let limit = self.retry.retry_limit.max(1);
                let failures = run.failures + 1;
                let retry = kind.is_retryable() && failures < limit && !self.aborting;
                let job_log = JobLog::new(&self.core.paths, job_id);

                if retry {
                    let delay = self.retry.backoff(failures);
                    if let Some(run) = self.runs.get_mut(job_id) {
                        run.failures = failures;
                        run.last_failure = Some((kind, message.clone()));
                        run.reset_attempt();
                        run.state = JobState::Queued;
                    }
                    self.media.remove(job_id);
                    job_log.record(
                        "warn",
                        "retry_scheduled",
                        json!({ "failures": failures, "kind": kind.as_str(), "message": message, "delay_ms": delay.as_millis() as u64 }),
                    );
                    tracing::info!(operation_id = %self.handle.id(), job_id, failures, kind = kind.as_str(), "job will be retried");
                    self.pending_retries.push((Instant::now() + delay, job_id.to_string()));
                    return;
                }

                let (target, url, mut mutations) = {
                    let mutations = child_upserts(&run.delta);
                    (run.job.target.node_id(), run.job.target.url().map(str::to_string), mutations)
                };
                if let Some(node) = target {
                    mutations.push(Mutation::MarkFailed {
                        node,
                        error: message.clone(),
                    });
                }
                if let Some(run) = self.runs.get_mut(job_id) {
                    run.failures = failures;
                    run.last_failure = Some((kind, message.clone()));
                }
                job_log.record(
                    "error",
                    "job_failed",
                    json!({ "failures": failures, "kind": kind.as_str(), "message": message }),
                );
                self.failures.push(JobFailure {
                    job_id: Some(job_id.to_string()),
                    node_id: target,
                    url,
                    kind,
                    message,
                    attempts: failures,
                });
                self.fold(job_id, mutations);
                self.finish_job(job_id, JobState::Failed);
            }
        }
    }

    fn fold(&mut self, job_id: &str, mutations: Vec<Mutation>) {
        if let Some(run) = self.runs.get(job_id) {
            self.known.extend(run.discovered.iter().cloned());
        }
        self.batch.extend(mutations);
    }

    fn finish_job(&mut self, job_id: &str, state: JobState) {
        let Some(run) = self.runs.get_mut(job_id) else {
            return;
        };
        run.state = state;
        if state == JobState::Cancelled {
            run.delta.clear();
            run.cleanup.clear();
        }
        let record = JobResultRecord {
            job_id: job_id.to_string(),
            operation_id: self.handle.id().to_string(),
            node_id: run.job.target.node_id(),
            url: run.job.target.url().map(str::to_string),
            mode: run.job.mode.as_str().to_string(),
            state: state.as_str().to_string(),
            attempts: run.failures + u32::from(state != JobState::Failed),
            failure_kind: run.last_failure.as_ref().map(|(k, _)| k.as_str().to_string()),
            message: run.last_failure.as_ref().map(|(_, m)| m.clone()),
            finished_at_ms: now_ms(),
        };
        if let Some(history) = &self.core.history {
            if let Err(err) = history.record_job(&record) {
                tracing::warn!(job_id, error = %err, "history write failed");
            }
        }
        self.emit(OperationEvent::JobFinished {
            job_id: job_id.to_string(),
            state,
        });
    }

    fn counts(&self) -> OperationCounts {
        let mut counts = OperationCounts {
            total: self.runs.len() as u32,
            ..OperationCounts::default()
        };
        for run in self.runs.values() {
            match run.state {
                JobState::Queued => counts.queued += 1,
                JobState::Running | JobState::Stopping => counts.running += 1,
                JobState::Succeeded => counts.succeeded += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Skipped => counts.skipped += 1,
                JobState::Cancelled => counts.cancelled += 1,
            }
            if run.stopped_early {
                counts.stopped_early += 1;
            }
        }
        counts.skipped += self.skipped_busy.len() as u32;
        counts.failed += self.failures.iter().filter(|f| f.job_id.is_none()).count() as u32;
        counts
    }

    fn commit(&mut self) -> OperationSummary {
        self.set_phase(OperationPhase::Committing);
        let batch = std::mem::take(&mut self.batch);
        let (touched, commit) = if batch.is_empty() {
            (Vec::new(), CommitStatus::NothingToCommit)
        } else {
            let (touched, result) = self.core.guard.commit(&self.core.catalogue, &batch);
            let status = match result {
                Ok(sha256) => CommitStatus::Committed { sha256 },
                Err(err) => {
                    tracing::error!(operation_id = %self.id(), error = %err, "catalogue commit failed");
                    self.core.note_commit_failed(self.handle.id());
                    CommitStatus::Failed {
                        reason: err.to_string(),
                    }
                }
            };
            (touched, status)
        };
        for node in &touched {
            self.emit(OperationEvent::NodeUpdated(*node));
        }
        let cleanup = std::mem::take(&mut self.cleanup);
        if matches!(commit, CommitStatus::Failed { .. }) {
            if !cleanup.is_empty() {
                tracing::warn!(operation_id = %self.id(), files = cleanup.len(), "commit failed, leaving files on disk");
            }
        } else {
            remove_files(&cleanup);
        }

        let mut failures = self.failures.clone();
        failures.sort_by_key(|f| f.job_id.as_ref().and_then(|id| self.order.iter().position(|o| o == id)));
        OperationSummary {
            operation_id: self.handle.id().to_string(),
            kind: self.handle.kind(),
            counts: self.counts(),
            failures,
            skipped_busy: self.skipped_busy.clone(),
            touched_nodes: touched,
            commit,
            cancelled: self.aborting,
            started_at_ms: self.started_at_ms,
            finished_at_ms: now_ms(),
        }
    }
}
