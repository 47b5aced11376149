//! Shared job queue with a scheduler thread and one thread per running slot.

use crate::executor::{CancelToken, ExecOutcome, JobExecutor, SlotContext, SlotEvent, SlotEventKind};
use crate::governor::Governor;
use crate::job::{Job, JobId, JobPriority};
use crate::logging::JobLog;
use crate::paths::AppPaths;
use crate::profile::FailureKind;
use crate::{EngineError, Result};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct QueuedJob {
    job: Arc<Job>,
    attempt: u32,
    executor: Arc<dyn JobExecutor>,
    sink: Sender<SlotEvent>,
}

struct RunningSlot {
    operation_id: String,
    cancel: CancelToken,
    bandwidth_kib: Option<u64>,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<QueuedJob>,
    running: HashMap<JobId, RunningSlot>,
    peak_running: usize,
    shutdown: bool,
}

struct PoolInner {
    paths: AppPaths,
    governor: Arc<Governor>,
    tick: Duration,
    state: Mutex<PoolState>,
    wake: Condvar,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queued", &self.queued_count())
            .field("running", &self.running_count())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn start(paths: AppPaths, governor: Arc<Governor>, tick: Duration) -> Self {
        let inner = Arc::new(PoolInner {
            paths,
            governor,
            tick: tick.max(Duration::from_millis(10)),
            state: Mutex::new(PoolState::default()),
            wake: Condvar::new(),
        });
        let scheduler_inner = inner.clone();
        let handle = thread::spawn(move || scheduler_loop(scheduler_inner));
        Self {
            inner,
            scheduler: Mutex::new(Some(handle)),
        }
    }

    /// Queues one attempt of `job`. Never blocks on the job itself.
    pub fn submit(
        &self,
        job: Arc<Job>,
        attempt: u32,
        executor: Arc<dyn JobExecutor>,
        sink: Sender<SlotEvent>,
    ) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if state.shutdown {
                return Err(EngineError::Shutdown);
            }
            tracing::debug!(job_id = %job.id, operation_id = %job.operation_id, attempt, "job queued");
            state.queue.push_back(QueuedJob {
                job,
                attempt,
                executor,
                sink,
            });
        }
        self.inner.wake.notify_all();
        Ok(())
    }

    /// Drops the job if still queued, otherwise fires its cancel token.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let mut state = self.inner.lock();
        let queued = state
            .queue
            .iter()
            .position(|q| q.job.id == job_id)
            .and_then(|pos| state.queue.remove(pos));
        if let Some(queued) = queued {
            drop(state);
            send_dropped(&queued);
            return true;
        }
        match state.running.get(job_id) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Returns how many jobs were dropped or signalled.
    pub fn cancel_operation(&self, operation_id: &str) -> usize {
        let mut state = self.inner.lock();
        let (dropped, kept): (VecDeque<QueuedJob>, VecDeque<QueuedJob>) = state
            .queue
            .drain(..)
            .partition(|q| q.job.operation_id == operation_id);
        state.queue = kept;
        let mut signalled = 0;
        for slot in state.running.values() {
            if slot.operation_id == operation_id {
                slot.cancel.cancel();
                signalled += 1;
            }
        }
        drop(state);
        for queued in &dropped {
            send_dropped(queued);
        }
        dropped.len() + signalled
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Highest number of simultaneously running slots since start.
    pub fn peak_running(&self) -> usize {
        self.inner.lock().peak_running
    }

    /// Wakes the scheduler so it re-reads the governor now.
    pub fn nudge(&self) {
        self.inner.wake.notify_all();
    }

    /// Stops admitting work, drops the queue, cancels running slots and
    /// waits up to `wait` for them to exit.
    pub fn shutdown(&self, wait: Duration) {
        let dropped: Vec<QueuedJob> = {
            let mut state = self.inner.lock();
            state.shutdown = true;
            for slot in state.running.values() {
                slot.cancel.cancel();
            }
            state.queue.drain(..).collect()
        };
        for queued in &dropped {
            send_dropped(queued);
        }
        self.inner.wake.notify_all();

        let handle = self
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        let deadline = Instant::now() + wait;
        let mut state = self.inner.lock();
        while !state.running.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(running = state.running.len(), "pool shutdown left slots running");
                break;
            }
            state = self
                .inner
                .wake
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.inner.lock().shutdown = true;
        self.inner.wake.notify_all();
    }
}

fn send_dropped(queued: &QueuedJob) {
    let _ = queued.sink.send(SlotEvent {
        job_id: queued.job.id.clone(),
        kind: SlotEventKind::Dropped,
    });
}

/// Live-now livestreams jump the queue; everything else is FIFO.
fn next_index(queue: &VecDeque<QueuedJob>) -> Option<usize> {
    queue
        .iter()
        .position(|q| q.job.priority == JobPriority::LiveNow)
        .or_else(|| (!queue.is_empty()).then_some(0))
}

fn scheduler_loop(inner: Arc<PoolInner>) {
    let mut state = inner.lock();
    loop {
        if state.shutdown {
            break;
        }
        // Re-read every pass: a lowered limit stops admissions but never preempts.
        let limit = inner.governor.limit_now();
        while state.running.len() < limit.max_concurrent {
            let Some(idx) = next_index(&state.queue) else {
                break;
            };
            // Caps are fixed at launch, so only unassigned budget can be handed out.
            let bandwidth = limit.admission_bandwidth(state.running.values().map(|s| s.bandwidth_kib));
            if bandwidth == Some(0) {
                break;
            }
            let Some(queued) = state.queue.remove(idx) else {
                break;
            };
            let cancel = CancelToken::new();
            state.running.insert(
                queued.job.id.clone(),
                RunningSlot {
                    operation_id: queued.job.operation_id.clone(),
                    cancel: cancel.clone(),
                    bandwidth_kib: bandwidth,
                },
            );
            state.peak_running = state.peak_running.max(state.running.len());

            let slot_inner = inner.clone();
            thread::spawn(move || run_slot(slot_inner, queued, bandwidth, cancel));
        }

        state = inner
            .wake
            .wait_timeout(state, inner.tick)
            .map(|(guard, _)| guard)
            .unwrap_or_else(|e| e.into_inner().0);
    }
}

fn run_slot(inner: Arc<PoolInner>, queued: QueuedJob, bandwidth_kib: Option<u64>, cancel: CancelToken) {
    let QueuedJob {
        job,
        attempt,
        executor,
        sink,
    } = queued;
    let log = JobLog::new(&inner.paths, &job.id);
    log.record(
        "info",
        "slot_started",
        json!({
            "operation_id": job.operation_id,
            "mode": job.mode.as_str(),
            "attempt": attempt,
            "bandwidth_kib": bandwidth_kib,
            "target": job.target,
        }),
    );
    let _ = sink.send(SlotEvent {
        job_id: job.id.clone(),
        kind: SlotEventKind::Started { attempt },
    });

    let ctx = SlotContext::new(job.id.clone(), attempt, bandwidth_kib, cancel, log.clone(), sink.clone());
    let outcome = catch_unwind(AssertUnwindSafe(|| executor.execute(&job, &ctx))).unwrap_or_else(|_| {
        tracing::error!(job_id = %job.id, "executor panicked");
        ExecOutcome::Failed {
            kind: FailureKind::Terminal,
            message: "executor panicked".to_string(),
        }
    });

    log.record("info", "slot_finished", json!({ "outcome": format!("{outcome:?}") }));
    inner.lock().running.remove(&job.id);
    inner.wake.notify_all();

    let _ = sink.send(SlotEvent {
        job_id: job.id.clone(),
        kind: SlotEventKind::Exited(outcome),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{OptionsSet, ResolvedOptions};
    use crate::governor::{EarlyStopSettings, RateLimit, SystemClock};
    use crate::job::{JobMode, JobTarget};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    struct Sleepy {
        current: AtomicUsize,
        max_seen: AtomicUsize,
        delay: Duration,
        caps: Mutex<Vec<Option<u64>>>,
    }

    impl Sleepy {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
                caps: Mutex::new(Vec::new()),
            })
        }
    }

    impl JobExecutor for Sleepy {
        fn execute(&self, _job: &Job, ctx: &SlotContext) -> ExecOutcome {
            self.caps.lock().expect("caps").push(ctx.bandwidth_kib);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            let started = Instant::now();
            while started.elapsed() < self.delay && !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            self.current.fetch_sub(1, Ordering::SeqCst);
            if ctx.is_cancelled() {
                ExecOutcome::Cancelled
            } else {
                ExecOutcome::Succeeded
            }
        }
    }

    fn pool(max_concurrent: usize) -> (tempfile::TempDir, WorkerPool) {
        pool_with_budget(max_concurrent, Some(1000))
    }

    fn pool_with_budget(max_concurrent: usize, budget: Option<u64>) -> (tempfile::TempDir, WorkerPool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let governor = Governor::new(
            RateLimit {
                max_concurrent,
                max_bandwidth_kib: budget,
            },
            Vec::new(),
            EarlyStopSettings::default(),
            Arc::new(SystemClock),
        )
        .expect("governor");
        let pool = WorkerPool::start(
            AppPaths::new(dir.path().to_path_buf()),
            Arc::new(governor),
            Duration::from_millis(20),
        );
        (dir, pool)
    }

    fn job(op: &str, n: usize, priority: JobPriority) -> Arc<Job> {
        Arc::new(
            Job::new(
                op,
                JobTarget::BareUrl {
                    url: format!("https://example.com/v/{n}"),
                },
                JobMode::Download,
                Arc::new(ResolvedOptions::from_layers([&OptionsSet::new("default")])),
                std::path::PathBuf::from("/tmp"),
                priority,
            )
            .expect("job"),
        )
    }

    fn exits(rx: &mpsc::Receiver<SlotEvent>, count: usize) -> Vec<(JobId, ExecOutcome)> {
        let mut out = Vec::new();
        while out.len() < count {
            let event = rx.recv_timeout(Duration::from_secs(10)).expect("slot event");
            match event.kind {
                SlotEventKind::Exited(outcome) => out.push((event.job_id, outcome)),
                SlotEventKind::Dropped => out.push((event.job_id, ExecOutcome::Cancelled)),
                _ => {}
            }
        }
        out
    }

    #[test]
    fn never_runs_more_than_the_limit() {
        let (_dir, pool) = pool(3);
        let exec = Sleepy::new(40);
        let (tx, rx) = mpsc::channel();
        for n in 0..10 {
            pool.submit(job("op", n, JobPriority::Normal), 1, exec.clone(), tx.clone())
                .expect("submit");
        }
        let done = exits(&rx, 10);
        assert!(done.iter().all(|(_, o)| *o == ExecOutcome::Succeeded));
        assert!(exec.max_seen.load(Ordering::SeqCst) <= 3);
        assert!(pool.peak_running() <= 3);
        assert!(pool.peak_running() >= 2);
        pool.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn slot_caps_never_exceed_the_bandwidth_budget() {
        let (_dir, pool) = pool_with_budget(3, Some(900));
        let exec = Sleepy::new(150);
        let (tx, rx) = mpsc::channel();
        for n in 0..3 {
            pool.submit(job("op", n, JobPriority::Normal), 1, exec.clone(), tx.clone())
                .expect("submit");
            // Admit one at a time.
            thread::sleep(Duration::from_millis(40));
        }
        exits(&rx, 3);
        let caps = exec.caps.lock().expect("caps").clone();
        assert_eq!(caps, vec![Some(300), Some(300), Some(300)]);
        assert_eq!(exec.max_seen.load(Ordering::SeqCst), 3);
        pool.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn live_now_jobs_start_first_and_bandwidth_is_shared() {
        let (_dir, pool) = pool(1);
        let exec = Sleepy::new(30);
        let (tx, rx) = mpsc::channel();
        let blocker = job("op", 0, JobPriority::Normal);
        pool.submit(blocker, 1, Sleepy::new(300), tx.clone()).expect("submit");
        // Give the blocker time to occupy the only slot.
        thread::sleep(Duration::from_millis(50));
        let normal = job("op", 1, JobPriority::Normal);
        let live = job("op", 2, JobPriority::LiveNow);
        pool.submit(normal.clone(), 1, exec.clone(), tx.clone()).expect("submit");
        pool.submit(live.clone(), 1, exec.clone(), tx.clone()).expect("submit");

        let mut started = Vec::new();
        while started.len() < 3 {
            let event = rx.recv_timeout(Duration::from_secs(10)).expect("event");
            if let SlotEventKind::Started { .. } = event.kind {
                started.push(event.job_id);
            }
        }
        assert_eq!(started[1], live.id);
        assert_eq!(started[2], normal.id);
        pool.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn cancelling_an_operation_drops_queued_and_stops_running() {
        let (_dir, pool) = pool(1);
        let exec = Sleepy::new(5_000);
        let (tx, rx) = mpsc::channel();
        for n in 0..3 {
            pool.submit(job("doomed", n, JobPriority::Normal), 1, exec.clone(), tx.clone())
                .expect("submit");
        }
        let started = rx.recv_timeout(Duration::from_secs(10)).expect("event");
        assert!(matches!(started.kind, SlotEventKind::Started { .. }));

        assert_eq!(pool.cancel_operation("doomed"), 3);
        let done = exits(&rx, 3);
        assert!(done.iter().all(|(_, o)| *o == ExecOutcome::Cancelled));
        assert_eq!(pool.queued_count(), 0);
        pool.shutdown(Duration::from_secs(1));
        assert_eq!(pool.running_count(), 0);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let (_dir, pool) = pool(1);
        pool.shutdown(Duration::from_millis(10));
        let (tx, _rx) = mpsc::channel();
        let err = pool
            .submit(job("op", 0, JobPriority::Normal), 1, Sleepy::new(1), tx)
            .expect_err("shut down");
        assert!(matches!(err, EngineError::Shutdown));
    }
}
