use crate::catalogue::{Catalogue, NodeId, OptionsSet, RepairReport, SharedCatalogue};
use crate::config::{self, EngineSettings};
use crate::executor::{ExecutorSet, JobExecutor};
use crate::governor::{Clock, Governor, SystemClock};
use crate::history::History;
use crate::job::{JobMode, OperationId};
use crate::livestream::{self, LivestreamPoller, PollOutcome};
use crate::logging::prune_job_logs;
use crate::operation::{
    expand, Coordinator, ExpandRequest, NoopObserver, ObserverSet, OperationHandle, OperationKind,
    OperationObserver, TargetSet,
};
use crate::paths::AppPaths;
use crate::persist::{CorruptionError, IntegrityReport, LoadSource, PersistenceGuard};
use crate::pool::WorkerPool;
use crate::profile::ProfileRegistry;
use crate::{EngineError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// State shared by the manager, every coordinator thread and the poller.
pub(crate) struct EngineCore {
    pub(crate) paths: AppPaths,
    settings: RwLock<EngineSettings>,
    pub(crate) catalogue: Arc<SharedCatalogue>,
    pub(crate) guard: PersistenceGuard,
    pub(crate) pool: WorkerPool,
    pub(crate) governor: Arc<Governor>,
    profiles: ProfileRegistry,
    executors: RwLock<ExecutorSet>,
    /// Modes whose executor was injected and must survive settings updates.
    pinned_modes: Vec<JobMode>,
    pub(crate) history: Option<History>,
    pub(crate) observer: Arc<dyn OperationObserver>,
    claims: Mutex<HashMap<NodeId, OperationId>>,
    active: Mutex<HashMap<OperationId, OperationHandle>>,
    uncommitted: Mutex<Vec<OperationId>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCore")
            .field("paths", &self.paths)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl EngineCore {
    pub(crate) fn settings(&self) -> EngineSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn release_claims(&self, operation_id: &str) {
        lock(&self.claims).retain(|_, owner| owner != operation_id);
    }

    pub(crate) fn note_commit_failed(&self, operation_id: &str) {
        lock(&self.uncommitted).push(operation_id.to_string());
    }

    pub(crate) fn start_operation(
        self: &Arc<Self>,
        kind: OperationKind,
        targets: TargetSet,
        options_override: Option<OptionsSet>,
        observer: Option<Arc<dyn OperationObserver>>,
    ) -> Result<OperationHandle> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }
        let mode = kind.job_mode();
        let executor: Arc<dyn JobExecutor> = self
            .executors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(mode)
            .ok_or_else(|| EngineError::Config(format!("no executor for {} jobs", mode.as_str())))?;
        let settings = self.settings();
        let downloads_root = settings.downloads_dir(&self.paths);

        let operation_id = Uuid::new_v4().to_string();
        let expansion = self.catalogue.read(|cat| {
            let mut claims = lock(&self.claims);
            expand(
                cat,
                &mut claims,
                &ExpandRequest {
                    operation_id: &operation_id,
                    kind,
                    targets: &targets,
                    options_override: options_override.as_ref(),
                    downloads_root: &downloads_root,
                },
            )
        })?;

        let handle = OperationHandle::new(operation_id.clone(), kind);
        let observer: Arc<dyn OperationObserver> = match observer {
            Some(extra) => Arc::new(ObserverSet(vec![self.observer.clone(), extra])),
            None => self.observer.clone(),
        };
        tracing::info!(
            operation_id = %operation_id,
            kind = kind.as_str(),
            jobs = expansion.jobs.len(),
            busy = expansion.skipped_busy.len(),
            rejected = expansion.rejected.len(),
            "operation started"
        );
        let coordinator = Coordinator::new(
            self.clone(),
            handle.clone(),
            &targets,
            options_override.as_ref(),
            expansion,
            executor,
            observer,
            settings.retry,
        );

        lock(&self.active).insert(operation_id.clone(), handle.clone());
        let core = self.clone();
        let id = operation_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("operation-{}", &operation_id[..8.min(operation_id.len())]))
            .spawn(move || {
                coordinator.run();
                lock(&core.active).remove(&id);
            });
        if let Err(err) = spawned {
            lock(&self.active).remove(&operation_id);
            self.release_claims(&operation_id);
            return Err(err.into());
        }
        Ok(handle)
    }
}

/// Configures and opens an [`OperationManager`].
pub struct ManagerBuilder {
    paths: AppPaths,
    settings: Option<EngineSettings>,
    clock: Option<Arc<dyn Clock>>,
    executors: Vec<(JobMode, Arc<dyn JobExecutor>)>,
    observer: Option<Arc<dyn OperationObserver>>,
    history: bool,
    livestream_poller: bool,
}

impl ManagerBuilder {
    pub fn new(paths: AppPaths) -> Self {
        Self {
            paths,
            settings: None,
            clock: None,
            executors: Vec::new(),
            observer: None,
            history: true,
            livestream_poller: false,
        }
    }

    /// Use these settings instead of `config/settings.json`.
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the executor for one mode.
    pub fn executor(mut self, mode: JobMode, executor: Arc<dyn JobExecutor>) -> Self {
        self.executors.push((mode, executor));
        self
    }

    pub fn observer(mut self, observer: Arc<dyn OperationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn history(mut self, enabled: bool) -> Self {
        self.history = enabled;
        self
    }

    pub fn livestream_poller(mut self, enabled: bool) -> Self {
        self.livestream_poller = enabled;
        self
    }

    pub fn open(self) -> Result<OperationManager> {
        let paths = self.paths;
        paths.ensure_dirs()?;

        let settings = match self.settings {
            Some(settings) => settings,
            None => config::load_settings(&paths)?,
        };
        let profiles = ProfileRegistry::default();
        settings.validate(&profiles)?;

        let guard = PersistenceGuard::new(paths.clone(), settings.persistence.max_backups);
        let (catalogue, source) = guard.load_or_recover()?;
        if let LoadSource::Backup(backup) = &source {
            tracing::warn!(backup = %backup.display(), "catalogue loaded from backup");
        }
        let catalogue = Arc::new(SharedCatalogue::new(catalogue));

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let governor = Arc::new(Governor::new(
            settings.default_limit,
            settings.schedule.clone(),
            settings.early_stop,
            clock,
        )?);

        match prune_job_logs(&paths, &settings.job_logs) {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "old job logs pruned"),
            Err(err) => tracing::warn!(error = %err, "job log pruning failed"),
        }

        let profile = profiles.require(&settings.downloader.profile)?;
        let mut executors =
            ExecutorSet::standard(&paths, &settings, profile, catalogue.clone())?;
        let mut pinned_modes = Vec::new();
        for (mode, executor) in self.executors {
            executors.insert(mode, executor);
            pinned_modes.push(mode);
        }

        let history = if self.history {
            let history = History::open(&paths)?;
            let interrupted = history.mark_interrupted_runs()?;
            if interrupted > 0 {
                tracing::warn!(interrupted, "operations from a previous run never finished");
            }
            Some(history)
        } else {
            None
        };

        let pool = WorkerPool::start(
            paths.clone(),
            governor.clone(),
            Duration::from_millis(settings.scheduler_tick_ms),
        );
        let start_poller = self.livestream_poller && settings.livestream.enabled;

        let core = Arc::new(EngineCore {
            paths,
            settings: RwLock::new(settings),
            catalogue,
            guard,
            pool,
            governor,
            profiles,
            executors: RwLock::new(executors),
            pinned_modes,
            history,
            observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            claims: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            uncommitted: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });

        let poller = if start_poller {
            Some(LivestreamPoller::start(Arc::downgrade(&core))?)
        } else {
            None
        };
        tracing::info!(base_dir = %core.paths.base_dir.display(), "operation manager opened");
        Ok(OperationManager {
            core,
            poller: Mutex::new(poller),
            load_source: source,
        })
    }
}

/// Entry point for the presentation layer.
#[derive(Debug)]
pub struct OperationManager {
    core: Arc<EngineCore>,
    poller: Mutex<Option<LivestreamPoller>>,
    load_source: LoadSource,
}

impl OperationManager {
    pub fn builder(paths: AppPaths) -> ManagerBuilder {
        ManagerBuilder::new(paths)
    }

    pub fn open(paths: AppPaths) -> Result<Self> {
        ManagerBuilder::new(paths).open()
    }

    pub fn paths(&self) -> &AppPaths {
        &self.core.paths
    }

    /// Where the catalogue came from when the manager opened.
    pub fn load_source(&self) -> &LoadSource {
        &self.load_source
    }

    pub fn catalogue(&self) -> Arc<SharedCatalogue> {
        self.core.catalogue.clone()
    }

    pub fn governor(&self) -> Arc<Governor> {
        self.core.governor.clone()
    }

    /// Edits the tree outside any operation and persists the result.
    pub fn edit_catalogue<R>(&self, edit: impl FnOnce(&mut Catalogue) -> Result<R>) -> Result<R> {
        let out = self.core.catalogue.mutate(edit)?;
        self.core.guard.persist(&self.core.catalogue)?;
        Ok(out)
    }

    pub fn start_operation(
        &self,
        kind: OperationKind,
        targets: TargetSet,
        options_override: Option<OptionsSet>,
    ) -> Result<OperationHandle> {
        self.core.start_operation(kind, targets, options_override, None)
    }

    pub fn start_operation_with_observer(
        &self,
        kind: OperationKind,
        targets: TargetSet,
        options_override: Option<OptionsSet>,
        observer: Arc<dyn OperationObserver>,
    ) -> Result<OperationHandle> {
        self.core
            .start_operation(kind, targets, options_override, Some(observer))
    }

    pub fn cancel_operation(&self, handle: &OperationHandle) {
        handle.cancel();
    }

    pub fn cancel_operation_by_id(&self, operation_id: &str) -> bool {
        match lock(&self.core.active).get(operation_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_operations(&self) -> Vec<OperationHandle> {
        lock(&self.core.active).values().cloned().collect()
    }

    /// Re-persists in-memory state after a failed commit. `None` when there
    /// was nothing outstanding.
    pub fn retry_commit(&self) -> Result<Option<String>> {
        let pending: Vec<OperationId> = lock(&self.core.uncommitted).clone();
        if pending.is_empty() {
            return Ok(None);
        }
        let sha256 = self.core.guard.persist(&self.core.catalogue)?;
        lock(&self.core.uncommitted).retain(|id| !pending.contains(id));
        if let Some(history) = &self.core.history {
            history.mark_committed(&pending)?;
        }
        tracing::info!(operations = pending.len(), "uncommitted results persisted");
        Ok(Some(sha256))
    }

    pub fn has_uncommitted_results(&self) -> bool {
        !lock(&self.core.uncommitted).is_empty()
    }

    pub fn check_integrity(&self) -> std::result::Result<IntegrityReport, CorruptionError> {
        self.core.guard.check_integrity()
    }

    pub fn repair_catalogue(&self) -> Result<RepairReport> {
        self.core.guard.repair(&self.core.catalogue)
    }

    pub fn settings(&self) -> EngineSettings {
        self.core.settings()
    }

    /// Validates, saves and applies new settings. Running jobs keep what
    /// they started with; the pool picks up new limits on its next tick.
    pub fn update_settings(&self, settings: EngineSettings) -> Result<()> {
        settings.validate(&self.core.profiles)?;
        let profile = self.core.profiles.require(&settings.downloader.profile)?;
        let mut executors = ExecutorSet::standard(
            &self.core.paths,
            &settings,
            profile,
            self.core.catalogue.clone(),
        )?;
        {
            let current = self.core.executors.read().unwrap_or_else(|e| e.into_inner());
            for mode in &self.core.pinned_modes {
                if let Some(executor) = current.get(*mode) {
                    executors.insert(*mode, executor);
                }
            }
        }

        config::save_settings(&self.core.paths, &settings)?;
        self.core.governor.set_default_limit(settings.default_limit)?;
        self.core.governor.replace_rules(settings.schedule.clone())?;
        self.core.governor.set_early_stop(settings.early_stop);
        *self.core.executors.write().unwrap_or_else(|e| e.into_inner()) = executors;
        *self.core.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        self.core.pool.nudge();
        Ok(())
    }

    /// One livestream probe round, run on the calling thread.
    pub fn poll_livestreams_once(&self) -> Result<Option<PollOutcome>> {
        livestream::poll_once(&self.core)
    }

    pub fn history(&self) -> Option<&History> {
        self.core.history.as_ref()
    }

    pub fn running_jobs(&self) -> usize {
        self.core.pool.running_count()
    }

    pub fn queued_jobs(&self) -> usize {
        self.core.pool.queued_count()
    }

    pub fn peak_running_jobs(&self) -> usize {
        self.core.pool.peak_running()
    }

    /// Stops the poller, cancels every operation and waits up to `wait`
    /// for them to finish.
    pub fn shutdown(&self, wait: Duration) {
        if self.core.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let poller = lock(&self.poller).take();
        if let Some(poller) = &poller {
            poller.request_stop();
        }
        let active = self.active_operations();
        for handle in &active {
            handle.cancel();
        }
        for handle in &active {
            if handle.wait_timeout(wait).is_none() {
                tracing::warn!(operation_id = %handle.id(), "operation still running at shutdown");
            }
        }
        if let Some(mut poller) = poller {
            poller.stop();
        }
        self.core.pool.shutdown(wait);
        tracing::info!("operation manager shut down");
    }
}

impl Drop for OperationManager {
    fn drop(&mut self) {
        self.core.shutting_down.store(true, Ordering::SeqCst);
        for handle in lock(&self.core.active).values() {
            handle.cancel();
        }
    }
}
