use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tubekeep_engine::catalogue::{
    DiscoveredItem, ItemMetadata, LivestreamState, Mutation, NewNode, NodeId, NodeKind,
};
use tubekeep_engine::config::{EngineSettings, RetrySettings};
use tubekeep_engine::executor::{ExecOutcome, JobExecutor, SlotContext};
use tubekeep_engine::governor::{ManualClock, RateLimit, ScheduleRule};
use tubekeep_engine::job::{Job, JobMode, JobState};
use tubekeep_engine::operation::{
    ChannelObserver, CommitStatus, OperationEvent, OperationSummary,
};
use tubekeep_engine::paths::AppPaths;
use tubekeep_engine::persist::PersistenceGuard;
use tubekeep_engine::process::ProgressEvent;
use tubekeep_engine::profile::FailureKind;
use tubekeep_engine::{OperationKind, OperationManager, TargetSet};

const WAIT: Duration = Duration::from_secs(20);

struct Scripted<F>(F);

impl<F> JobExecutor for Scripted<F>
where
    F: Fn(&Job, &SlotContext) -> ExecOutcome + Send + Sync,
{
    fn execute(&self, job: &Job, ctx: &SlotContext) -> ExecOutcome {
        (self.0)(job, ctx)
    }
}

fn scripted<F>(f: F) -> Arc<dyn JobExecutor>
where
    F: Fn(&Job, &SlotContext) -> ExecOutcome + Send + Sync + 'static,
{
    Arc::new(Scripted(f))
}

/// Blocks until the slot is cancelled or `release` is set.
fn hold(ctx: &SlotContext, release: &AtomicBool) -> ExecOutcome {
    let started = Instant::now();
    while started.elapsed() < WAIT {
        if ctx.is_cancelled() {
            return ExecOutcome::Cancelled;
        }
        if release.load(Ordering::SeqCst) {
            return ExecOutcome::Succeeded;
        }
        sleep(Duration::from_millis(5));
    }
    ExecOutcome::Succeeded
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();
    while !condition() {
        assert!(started.elapsed() < WAIT, "timed out waiting for {what}");
        sleep(Duration::from_millis(10));
    }
}

fn settings(max_concurrent: usize) -> EngineSettings {
    EngineSettings {
        default_limit: RateLimit {
            max_concurrent,
            max_bandwidth_kib: None,
        },
        retry: RetrySettings {
            retry_limit: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 40,
        },
        scheduler_tick_ms: 20,
        ..EngineSettings::default()
    }
}

fn open(
    dir: &tempfile::TempDir,
    settings: EngineSettings,
    executors: Vec<(JobMode, Arc<dyn JobExecutor>)>,
) -> OperationManager {
    let mut builder =
        OperationManager::builder(AppPaths::new(dir.path().to_path_buf())).settings(settings);
    for (mode, executor) in executors {
        builder = builder.executor(mode, executor);
    }
    builder.open().expect("open manager")
}

fn add_node(
    manager: &OperationManager,
    kind: NodeKind,
    name: &str,
    parent: Option<NodeId>,
    url: Option<&str>,
) -> NodeId {
    manager
        .edit_catalogue(|cat| {
            cat.add_node(NewNode {
                kind,
                name: name.to_string(),
                parent,
                source_url: url.map(str::to_string),
            })
        })
        .expect("add node")
}

fn item(id: &str, title: &str) -> DiscoveredItem {
    DiscoveredItem {
        item_id: id.to_string(),
        url: Some(format!("https://example.com/watch?v={id}")),
        metadata: ItemMetadata {
            title: Some(title.to_string()),
            ..ItemMetadata::default()
        },
        ..DiscoveredItem::default()
    }
}

fn add_item(manager: &OperationManager, parent: NodeId, id: &str, title: &str) -> NodeId {
    manager
        .edit_catalogue(|cat| cat.upsert_item(parent, &item(id, title)).map(|(node, _)| node))
        .expect("add item")
}

fn add_video(manager: &OperationManager, name: &str) -> NodeId {
    add_node(
        manager,
        NodeKind::Video,
        name,
        None,
        Some(&format!("https://example.com/watch?v={name}")),
    )
}

fn run(manager: &OperationManager, kind: OperationKind, targets: TargetSet) -> OperationSummary {
    manager
        .start_operation(kind, targets, None)
        .expect("start operation")
        .wait_timeout(WAIT)
        .expect("operation finished")
}

fn drain_events(rx: &Receiver<(String, OperationEvent)>) -> Vec<OperationEvent> {
    let mut out = Vec::new();
    while let Ok((_, event)) = rx.recv_timeout(Duration::from_millis(200)) {
        out.push(event);
    }
    out
}

#[test]
fn download_of_single_video_marks_it_downloaded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = open(
        &dir,
        settings(2),
        vec![(JobMode::Download, scripted(|_, _| ExecOutcome::Succeeded))],
    );
    let video = add_video(&manager, "solo");

    let summary = run(&manager, OperationKind::Download, TargetSet::Nodes { ids: vec![video] });
    assert_eq!(summary.counts.succeeded, 1);
    assert_eq!(summary.counts.failed, 0);
    assert_eq!(summary.counts.skipped, 0);
    assert!(matches!(summary.commit, CommitStatus::Committed { .. }));
    assert!(manager
        .catalogue()
        .read(|c| c.node(video).expect("video").is_downloaded()));

    let on_disk = PersistenceGuard::new(manager.paths().clone(), 5)
        .load()
        .expect("load from disk");
    assert!(on_disk.node(video).expect("video on disk").is_downloaded());

    let history = manager.history().expect("history");
    let run = history
        .get_operation(&summary.operation_id)
        .expect("query")
        .expect("recorded");
    assert_eq!(run.status, "completed");
    assert_eq!(run.succeeded, 1);
}

#[test]
fn known_single_video_is_downloaded_despite_a_low_threshold() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = settings(2);
    config.early_stop.enabled = true;
    config.early_stop.download_threshold = 1;

    let manager = open(
        &dir,
        config,
        vec![(
            JobMode::Download,
            scripted(|_, ctx| {
                ctx.emit(ProgressEvent::ItemDiscovered(item("v9", "again")));
                ExecOutcome::Succeeded
            }),
        )],
    );
    let channel = add_node(
        &manager,
        NodeKind::Channel,
        "Band",
        None,
        Some("https://example.com/@band"),
    );
    let video = add_item(&manager, channel, "v9", "known video");

    let summary = run(&manager, OperationKind::Download, TargetSet::Nodes { ids: vec![video] });
    assert_eq!(summary.counts.succeeded, 1);
    assert_eq!(summary.counts.stopped_early, 0);
    assert_eq!(summary.counts.skipped, 0);
    manager.catalogue().read(|c| {
        let node = c.node(video).expect("video");
        assert!(node.is_downloaded());
        assert_eq!(node.metadata.title.as_deref(), Some("again"));
    });
}

#[test]
fn check_stops_early_after_consecutive_known_items() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = settings(2);
    config.early_stop.enabled = true;
    config.early_stop.check_threshold = 3;

    let manager = open(
        &dir,
        config,
        vec![(
            JobMode::Check,
            scripted(|_, ctx| {
                for (id, title) in [
                    ("n1", "new one"),
                    ("n2", "new two"),
                    ("k1", "fresh k1"),
                    ("k2", "fresh k2"),
                    ("k3", "fresh k3"),
                ] {
                    ctx.emit(ProgressEvent::ItemDiscovered(item(id, title)));
                }
                // Keep listing until told to stop.
                hold(ctx, &AtomicBool::new(false))
            }),
        )],
    );
    let channel = add_node(
        &manager,
        NodeKind::Channel,
        "Band",
        None,
        Some("https://example.com/@band"),
    );
    for id in ["k1", "k2", "k3"] {
        add_item(&manager, channel, id, "old title");
    }
    let before = manager
        .catalogue()
        .read(|c| c.node(channel).cloned())
        .expect("channel");

    let summary = run(&manager, OperationKind::Check, TargetSet::Nodes { ids: vec![channel] });
    assert_eq!(summary.counts.skipped, 1);
    assert_eq!(summary.counts.stopped_early, 1);
    assert_eq!(summary.counts.failed, 0);
    assert!(summary.failures.is_empty());

    manager.catalogue().read(|c| {
        let after = c.node(channel).expect("channel");
        assert_eq!(after.last_checked_at_ms, before.last_checked_at_ms);
        assert_eq!(after.flags, before.flags);
        assert_eq!(after.last_error, before.last_error);
        assert_eq!(c.children(channel).len(), 5);
        for id in ["n1", "n2", "k1", "k2", "k3"] {
            let matches = c
                .nodes()
                .filter(|n| n.source_item_id.as_deref() == Some(id))
                .count();
            assert_eq!(matches, 1, "item {id}");
        }
        let k1 = c.find_item("k1").and_then(|id| c.node(id)).expect("k1");
        assert_eq!(k1.metadata.title.as_deref(), Some("fresh k1"));
    });

    let jobs = manager
        .history()
        .expect("history")
        .list_job_results(&summary.operation_id)
        .expect("jobs");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Skipped.as_str());
}

#[test]
fn same_item_from_two_jobs_creates_one_node() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = open(
        &dir,
        settings(2),
        vec![(
            JobMode::Check,
            scripted(|job, ctx| {
                let url = job.target.url().unwrap_or_default().to_string();
                let title = if url.ends_with("a") { "from a" } else { "from b" };
                ctx.emit(ProgressEvent::ItemDiscovered(item("shared", title)));
                ExecOutcome::Succeeded
            }),
        )],
    );
    let a = add_node(&manager, NodeKind::Channel, "A", None, Some("https://example.com/@a"));
    let b = add_node(&manager, NodeKind::Channel, "B", None, Some("https://example.com/@b"));

    let summary = run(&manager, OperationKind::Check, TargetSet::Nodes { ids: vec![a, b] });
    assert_eq!(summary.counts.succeeded, 2);
    manager.catalogue().read(|c| {
        let shared: Vec<_> = c
            .nodes()
            .filter(|n| n.source_item_id.as_deref() == Some("shared"))
            .collect();
        assert_eq!(shared.len(), 1);
        assert!(c.node(a).expect("a").last_checked_at_ms.is_some());
        assert!(c.node(b).expect("b").last_checked_at_ms.is_some());
    });
}

#[test]
fn transient_failures_retry_until_the_limit_then_flag_the_node() {
    let dir = tempfile::tempdir().expect("tempdir");
    let calls: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let seen = calls.clone();
    let manager = open(
        &dir,
        settings(2),
        vec![(
            JobMode::Download,
            scripted(move |job, _| {
                let url = job.target.url().unwrap_or_default().to_string();
                *seen.lock().expect("calls").entry(url.clone()).or_insert(0) += 1;
                if url.contains("gone") {
                    ExecOutcome::Failed {
                        kind: FailureKind::Terminal,
                        message: "Video unavailable".to_string(),
                    }
                } else {
                    ExecOutcome::Failed {
                        kind: FailureKind::Transient,
                        message: "HTTP Error 503".to_string(),
                    }
                }
            }),
        )],
    );
    let flaky = add_video(&manager, "flaky");
    let gone = add_video(&manager, "gone");

    let summary = run(
        &manager,
        OperationKind::Download,
        TargetSet::Nodes {
            ids: vec![flaky, gone],
        },
    );
    assert_eq!(summary.counts.failed, 2);
    assert_eq!(summary.counts.succeeded, 0);

    let flaky_failure = summary
        .failures
        .iter()
        .find(|f| f.node_id == Some(flaky))
        .expect("flaky failure");
    assert_eq!(flaky_failure.kind, FailureKind::Transient);
    assert_eq!(flaky_failure.attempts, 3);
    let gone_failure = summary
        .failures
        .iter()
        .find(|f| f.node_id == Some(gone))
        .expect("gone failure");
    assert_eq!(gone_failure.kind, FailureKind::Terminal);
    assert_eq!(gone_failure.attempts, 1);

    let calls = calls.lock().expect("calls");
    assert_eq!(calls.get("https://example.com/watch?v=flaky"), Some(&3));
    assert_eq!(calls.get("https://example.com/watch?v=gone"), Some(&1));

    manager.catalogue().read(|c| {
        let node = c.node(flaky).expect("flaky is kept");
        assert!(node.flags.failed);
        assert_eq!(node.last_error.as_deref(), Some("HTTP Error 503"));
        assert!(!node.is_downloaded());
        assert!(c.node(gone).expect("gone is kept").flags.failed);
    });
}

#[test]
fn a_retry_that_succeeds_clears_the_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let manager = open(
        &dir,
        settings(1),
        vec![(
            JobMode::Download,
            scripted(move |_, _| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    ExecOutcome::Failed {
                        kind: FailureKind::Stalled,
                        message: "no output for 600s".to_string(),
                    }
                } else {
                    ExecOutcome::Succeeded
                }
            }),
        )],
    );
    let video = add_video(&manager, "second-try");
    manager
        .edit_catalogue(|cat| {
            cat.apply(&Mutation::MarkFailed {
                node: video,
                error: "old failure".to_string(),
            });
            Ok(())
        })
        .expect("seed failure");

    let summary = run(&manager, OperationKind::Download, TargetSet::Nodes { ids: vec![video] });
    assert_eq!(summary.counts.succeeded, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    manager.catalogue().read(|c| {
        let node = c.node(video).expect("video");
        assert!(node.is_downloaded());
        assert!(!node.flags.failed);
        assert!(node.last_error.is_none());
    });

    let jobs = manager
        .history()
        .expect("history")
        .list_job_results(&summary.operation_id)
        .expect("jobs");
    assert_eq!(jobs[0].attempts, 2);
}

#[test]
fn cancel_commits_exactly_the_finished_jobs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let never = Arc::new(AtomicBool::new(false));
    let gate = never.clone();
    let manager = open(
        &dir,
        settings(2),
        vec![(
            JobMode::Download,
            scripted(move |job, ctx| {
                if job.target.url().unwrap_or_default().contains("fast") {
                    ExecOutcome::Succeeded
                } else {
                    hold(ctx, &gate)
                }
            }),
        )],
    );
    let fast: Vec<NodeId> = (0..2).map(|n| add_video(&manager, &format!("fast{n}"))).collect();
    let slow: Vec<NodeId> = (0..4).map(|n| add_video(&manager, &format!("slow{n}"))).collect();
    let mut ids = fast.clone();
    ids.extend(&slow);

    let (observer, rx) = ChannelObserver::new();
    let handle = manager
        .start_operation_with_observer(
            OperationKind::Download,
            TargetSet::Nodes { ids },
            None,
            Arc::new(observer),
        )
        .expect("start");

    let mut succeeded = 0;
    let started = Instant::now();
    while succeeded < 2 {
        assert!(started.elapsed() < WAIT, "fast jobs never finished");
        if let Ok((_, OperationEvent::JobFinished { state, .. })) =
            rx.recv_timeout(Duration::from_millis(50))
        {
            if state == JobState::Succeeded {
                succeeded += 1;
            }
        }
    }
    wait_until("slow jobs to occupy both slots", || manager.running_jobs() == 2);

    manager.cancel_operation(&handle);
    let summary = handle.wait_timeout(WAIT).expect("finished");
    assert!(summary.cancelled);
    assert_eq!(summary.counts.succeeded, 2);
    assert_eq!(summary.counts.cancelled, 4);
    assert_eq!(summary.counts.failed, 0);
    assert!(matches!(summary.commit, CommitStatus::Committed { .. }));

    let on_disk = PersistenceGuard::new(manager.paths().clone(), 5)
        .load()
        .expect("load");
    for id in &fast {
        assert!(on_disk.node(*id).expect("fast").is_downloaded());
    }
    for id in &slow {
        assert!(!on_disk.node(*id).expect("slow").is_downloaded());
    }
    let run = manager
        .history()
        .expect("history")
        .get_operation(&summary.operation_id)
        .expect("query")
        .expect("recorded");
    assert_eq!(run.status, "cancelled");
}

#[test]
fn night_rule_raises_the_slot_limit_at_the_boundary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let at = |h: u32, m: u32, s: u32| -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .and_then(|d| d.and_hms_opt(h, m, s))
            .expect("datetime")
    };
    let clock = Arc::new(ManualClock::new(at(21, 59, 0)));

    let mut config = settings(2);
    config.schedule = vec![ScheduleRule {
        name: "night".to_string(),
        days: Vec::new(),
        start: NaiveTime::from_hms_opt(22, 0, 0).expect("start"),
        end: NaiveTime::from_hms_opt(6, 0, 0).expect("end"),
        limit: RateLimit {
            max_concurrent: 6,
            max_bandwidth_kib: None,
        },
    }];

    let release = Arc::new(AtomicBool::new(false));
    let current = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let (gate, now, peak) = (release.clone(), current.clone(), max_seen.clone());

    let manager = OperationManager::builder(AppPaths::new(dir.path().to_path_buf()))
        .settings(config)
        .clock(clock.clone())
        .executor(
            JobMode::Download,
            scripted(move |_, ctx| {
                let running = now.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(running, Ordering::SeqCst);
                let outcome = hold(ctx, &gate);
                now.fetch_sub(1, Ordering::SeqCst);
                outcome
            }),
        )
        .open()
        .expect("open");

    let urls = (0..10).map(|n| format!("https://example.com/v/{n}")).collect();
    let handle = manager
        .start_operation(
            OperationKind::Download,
            TargetSet::Urls {
                urls,
                destination: Some(dir.path().join("out")),
            },
            None,
        )
        .expect("start");

    wait_until("two running slots", || current.load(Ordering::SeqCst) == 2);
    sleep(Duration::from_millis(200));
    assert_eq!(current.load(Ordering::SeqCst), 2);
    assert_eq!(max_seen.load(Ordering::SeqCst), 2);

    clock.set(at(22, 0, 30));
    wait_until("six running slots", || current.load(Ordering::SeqCst) == 6);
    sleep(Duration::from_millis(200));
    assert_eq!(max_seen.load(Ordering::SeqCst), 6);

    release.store(true, Ordering::SeqCst);
    let summary = handle.wait_timeout(WAIT).expect("finished");
    assert_eq!(summary.counts.succeeded, 10);
    assert!(manager.peak_running_jobs() <= 6);
    assert!(max_seen.load(Ordering::SeqCst) <= 6);
}

#[test]
fn overlapping_operations_skip_busy_nodes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let release = Arc::new(AtomicBool::new(false));
    let gate = release.clone();
    let manager = open(
        &dir,
        settings(2),
        vec![(JobMode::Check, scripted(move |_, ctx| hold(ctx, &gate)))],
    );
    let folder = add_node(&manager, NodeKind::Folder, "Music", None, None);
    let channel = add_node(
        &manager,
        NodeKind::Channel,
        "Band",
        Some(folder),
        Some("https://example.com/@band"),
    );

    let first = manager
        .start_operation(OperationKind::Check, TargetSet::Nodes { ids: vec![channel] }, None)
        .expect("first");
    wait_until("first job running", || manager.running_jobs() == 1);

    let second = run(&manager, OperationKind::Check, TargetSet::Nodes { ids: vec![folder] });
    assert_eq!(second.counts.total, 0);
    assert_eq!(second.counts.skipped, 1);
    assert_eq!(second.skipped_busy, vec![channel]);
    assert_eq!(second.commit, CommitStatus::NothingToCommit);

    release.store(true, Ordering::SeqCst);
    let first = first.wait_timeout(WAIT).expect("first finished");
    assert_eq!(first.counts.succeeded, 1);

    let third = run(&manager, OperationKind::Check, TargetSet::Nodes { ids: vec![channel] });
    assert_eq!(third.counts.succeeded, 1);
    assert!(third.skipped_busy.is_empty());
}

#[test]
fn failed_commit_keeps_results_for_retry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = open(
        &dir,
        settings(2),
        vec![(JobMode::Download, scripted(|_, _| ExecOutcome::Succeeded))],
    );
    let video = add_video(&manager, "keep-me");

    let data_dir = manager.paths().data_dir();
    std::fs::remove_dir_all(&data_dir).expect("remove data dir");
    std::fs::write(&data_dir, b"not a directory").expect("block data dir");

    let summary = run(&manager, OperationKind::Download, TargetSet::Nodes { ids: vec![video] });
    assert_eq!(summary.counts.succeeded, 1);
    assert!(matches!(summary.commit, CommitStatus::Failed { .. }));
    assert!(manager.has_uncommitted_results());
    assert!(manager
        .catalogue()
        .read(|c| c.node(video).expect("video").is_downloaded()));

    let history = manager.history().expect("history");
    let run_record = history
        .get_operation(&summary.operation_id)
        .expect("query")
        .expect("recorded");
    assert_eq!(run_record.status, "commit_failed");

    assert!(manager.retry_commit().is_err());
    assert!(manager.has_uncommitted_results());

    std::fs::remove_file(&data_dir).expect("unblock");
    std::fs::create_dir_all(&data_dir).expect("data dir");
    assert!(manager.retry_commit().expect("retry").is_some());
    assert!(!manager.has_uncommitted_results());
    assert_eq!(manager.retry_commit().expect("nothing left"), None);

    let on_disk = PersistenceGuard::new(manager.paths().clone(), 5)
        .load()
        .expect("load");
    assert!(on_disk.node(video).expect("video").is_downloaded());
    let fixed = history
        .get_operation(&summary.operation_id)
        .expect("query")
        .expect("recorded");
    assert_eq!(fixed.status, "completed");
}

/// A channel with two downloaded videos whose media files exist on disk.
fn channel_with_media(
    manager: &OperationManager,
    media_dir: &std::path::Path,
) -> (NodeId, Vec<(NodeId, std::path::PathBuf)>) {
    let channel = add_node(
        manager,
        NodeKind::Channel,
        "Archive",
        None,
        Some("https://example.com/@archive"),
    );
    let mut videos = Vec::new();
    for id in ["t1", "t2"] {
        let path = media_dir.join(format!("clip [{id}].mp4"));
        std::fs::write(&path, b"media").expect("media file");
        let node = add_item(manager, channel, id, "clip");
        manager
            .edit_catalogue(|cat| {
                cat.apply(&Mutation::MarkDownloaded {
                    node,
                    media_path: Some(path.clone()),
                });
                Ok(())
            })
            .expect("mark downloaded");
        videos.push((node, path));
    }
    (channel, videos)
}

#[test]
fn tidy_deletes_expired_media_only_after_the_commit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let media_dir = tempfile::tempdir().expect("media dir");
    let mut config = settings(2);
    config.retention.max_items_per_container = Some(1);
    let manager = open(&dir, config, Vec::new());
    let (channel, videos) = channel_with_media(&manager, media_dir.path());

    let summary = run(&manager, OperationKind::Tidy, TargetSet::Nodes { ids: vec![channel] });
    assert_eq!(summary.counts.succeeded, 1);
    assert!(matches!(summary.commit, CommitStatus::Committed { .. }));

    let on_disk = PersistenceGuard::new(manager.paths().clone(), 5)
        .load()
        .expect("load");
    for (node, path) in &videos {
        assert_eq!(
            on_disk.node(*node).is_some(),
            path.exists(),
            "file and persisted node disagree for {}",
            path.display()
        );
    }
    assert_eq!(videos.iter().filter(|(_, path)| path.exists()).count(), 1);
}

#[test]
fn tidy_keeps_files_when_the_commit_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let media_dir = tempfile::tempdir().expect("media dir");
    let mut config = settings(2);
    config.retention.max_items_per_container = Some(1);
    let manager = open(&dir, config, Vec::new());
    let (channel, videos) = channel_with_media(&manager, media_dir.path());

    let data_dir = manager.paths().data_dir();
    std::fs::remove_dir_all(&data_dir).expect("remove data dir");
    std::fs::write(&data_dir, b"not a directory").expect("block data dir");

    let summary = run(&manager, OperationKind::Tidy, TargetSet::Nodes { ids: vec![channel] });
    assert!(matches!(summary.commit, CommitStatus::Failed { .. }));
    assert!(videos.iter().all(|(_, path)| path.exists()));
}

#[test]
fn bare_urls_download_without_touching_the_catalogue() {
    let dir = tempfile::tempdir().expect("tempdir");
    let destinations = Arc::new(Mutex::new(Vec::new()));
    let seen = destinations.clone();
    let manager = open(
        &dir,
        settings(2),
        vec![(
            JobMode::Download,
            scripted(move |job, _| {
                seen.lock().expect("destinations").push(job.destination.clone());
                ExecOutcome::Succeeded
            }),
        )],
    );
    let out = dir.path().join("classic");

    let summary = run(
        &manager,
        OperationKind::Download,
        TargetSet::Urls {
            urls: vec![
                "https://example.com/watch?v=a".to_string(),
                "https://example.com/watch?v=b".to_string(),
                "not a url".to_string(),
            ],
            destination: Some(out.clone()),
        },
    );
    assert_eq!(summary.counts.succeeded, 2);
    assert_eq!(summary.counts.failed, 1);
    assert_eq!(summary.failures.len(), 1);
    assert!(summary.failures[0].job_id.is_none());
    assert_eq!(summary.commit, CommitStatus::NothingToCommit);
    assert!(manager.catalogue().read(|c| c.is_empty()));
    assert!(destinations
        .lock()
        .expect("destinations")
        .iter()
        .all(|d| *d == out));

    assert!(manager
        .start_operation(
            OperationKind::Refresh,
            TargetSet::Urls {
                urls: vec!["https://example.com/watch?v=a".to_string()],
                destination: None,
            },
            None,
        )
        .is_err());
}

#[test]
fn livestream_rounds_follow_waiting_live_finished() {
    let dir = tempfile::tempdir().expect("tempdir");
    let round = Arc::new(AtomicUsize::new(0));
    let counter = round.clone();
    let (observer, rx) = ChannelObserver::new();
    let manager = OperationManager::builder(AppPaths::new(dir.path().to_path_buf()))
        .settings(settings(2))
        .observer(Arc::new(observer))
        .executor(
            JobMode::LivestreamProbe,
            scripted(move |_, ctx| {
                let state = if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    LivestreamState::LiveNow
                } else {
                    LivestreamState::Finished
                };
                ctx.emit(ProgressEvent::ItemDiscovered(DiscoveredItem {
                    livestream: Some(state),
                    ..item("stream", "Premiere")
                }));
                ExecOutcome::Succeeded
            }),
        )
        .open()
        .expect("open");

    let channel = add_node(
        &manager,
        NodeKind::Channel,
        "Live",
        None,
        Some("https://example.com/@live"),
    );
    let video = add_item(&manager, channel, "stream", "Premiere");
    add_item(&manager, channel, "plain", "Not a stream");
    manager
        .edit_catalogue(|cat| {
            cat.apply(&Mutation::SetLivestream {
                node: video,
                state: LivestreamState::Waiting,
                scheduled_at_ms: None,
            });
            Ok(())
        })
        .expect("waiting");

    let first = manager
        .poll_livestreams_once()
        .expect("first round")
        .expect("something watched");
    assert_eq!(first.summary.counts.total, 1);
    assert_eq!(first.went_live(), vec![video]);
    assert!(first.auto_download.is_none());
    assert!(drain_events(&rx)
        .iter()
        .any(|e| *e == OperationEvent::LivestreamLive(video)));

    let second = manager
        .poll_livestreams_once()
        .expect("second round")
        .expect("still watched");
    assert_eq!(second.ended(), vec![video]);
    assert!(manager.catalogue().read(|c| c.node(video).is_some()));

    assert!(manager.poll_livestreams_once().expect("third round").is_none());
    assert_eq!(round.load(Ordering::SeqCst), 2);
}

#[test]
fn background_poller_probes_waiting_streams() {
    let dir = tempfile::tempdir().expect("tempdir");
    let probes = Arc::new(AtomicUsize::new(0));
    let counter = probes.clone();
    let mut config = settings(2);
    config.livestream.default_interval_secs = 1;
    config.livestream.waiting_interval_secs = 1;
    config.livestream.live_interval_secs = 1;

    let (observer, rx) = ChannelObserver::new();
    let manager = OperationManager::builder(AppPaths::new(dir.path().to_path_buf()))
        .settings(config)
        .observer(Arc::new(observer))
        .livestream_poller(true)
        .executor(
            JobMode::LivestreamProbe,
            scripted(move |_, ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                ctx.emit(ProgressEvent::ItemDiscovered(DiscoveredItem {
                    livestream: Some(LivestreamState::LiveNow),
                    ..item("premiere", "Premiere")
                }));
                ExecOutcome::Succeeded
            }),
        )
        .open()
        .expect("open");

    let channel = add_node(
        &manager,
        NodeKind::Channel,
        "Live",
        None,
        Some("https://example.com/@live"),
    );
    let video = add_item(&manager, channel, "premiere", "Premiere");
    manager
        .edit_catalogue(|cat| {
            cat.apply(&Mutation::SetLivestream {
                node: video,
                state: LivestreamState::Waiting,
                scheduled_at_ms: None,
            });
            Ok(())
        })
        .expect("waiting");

    wait_until("the poller to go live", || {
        manager
            .catalogue()
            .read(|c| c.node(video).map(|n| n.livestream) == Some(LivestreamState::LiveNow))
    });
    assert!(probes.load(Ordering::SeqCst) >= 1);

    let started = Instant::now();
    let mut notified = false;
    while !notified && started.elapsed() < WAIT {
        if let Ok((_, OperationEvent::LivestreamLive(id))) = rx.recv_timeout(Duration::from_millis(100)) {
            notified = id == video;
        }
    }
    assert!(notified);

    manager.shutdown(Duration::from_secs(5));
    let after = probes.load(Ordering::SeqCst);
    sleep(Duration::from_millis(1_500));
    assert_eq!(probes.load(Ordering::SeqCst), after);
}
