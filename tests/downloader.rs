#![cfg(unix)]

//! The standard downloader executor against a shell script standing in for
//! the real downloader.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tubekeep_engine::catalogue::{NewNode, NodeId, NodeKind};
use tubekeep_engine::config::{EngineSettings, RetrySettings};
use tubekeep_engine::governor::RateLimit;
use tubekeep_engine::operation::{
    ChannelObserver, CommitStatus, OperationEvent, OperationSummary,
};
use tubekeep_engine::paths::AppPaths;
use tubekeep_engine::profile::FailureKind;
use tubekeep_engine::{OperationKind, OperationManager, TargetSet};

const WAIT: Duration = Duration::from_secs(30);

fn fake_downloader(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-downloader");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

fn settings(downloader: PathBuf, retry_limit: u32) -> EngineSettings {
    let mut settings = EngineSettings {
        default_limit: RateLimit {
            max_concurrent: 1,
            max_bandwidth_kib: None,
        },
        retry: RetrySettings {
            retry_limit,
            backoff_base_ms: 10,
            backoff_max_ms: 40,
        },
        scheduler_tick_ms: 20,
        cancel_grace_ms: 200,
        ..EngineSettings::default()
    };
    settings.downloader.executable = Some(downloader);
    settings
}

fn open(dir: &tempfile::TempDir, settings: EngineSettings) -> OperationManager {
    OperationManager::builder(AppPaths::new(dir.path().join("base")))
        .settings(settings)
        .open()
        .expect("open manager")
}

fn add_node(manager: &OperationManager, kind: NodeKind, name: &str, url: &str) -> NodeId {
    manager
        .edit_catalogue(|cat| {
            cat.add_node(NewNode {
                kind,
                name: name.to_string(),
                parent: None,
                source_url: Some(url.to_string()),
            })
        })
        .expect("add node")
}

fn run(
    manager: &OperationManager,
    kind: OperationKind,
    target: NodeId,
) -> (OperationSummary, Receiver<(String, OperationEvent)>) {
    let (observer, rx) = ChannelObserver::new();
    let summary = manager
        .start_operation_with_observer(
            kind,
            TargetSet::Nodes { ids: vec![target] },
            None,
            Arc::new(observer),
        )
        .expect("start operation")
        .wait_timeout(WAIT)
        .expect("operation finished");
    (summary, rx)
}

fn lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn process_alive(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[test]
fn listed_items_and_progress_reach_the_operation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = fake_downloader(
        dir.path(),
        r#"echo '[download]  42.0% of 1.00MiB at 1.00KiB/s ETA 00:01'
echo '{"id":"e1","title":"First","webpage_url":"https://example.com/watch?v=e1"}'
echo 'WARNING: slow listing' 1>&2
echo '{"id":"e2","title":"Second","webpage_url":"https://example.com/watch?v=e2"}'
exit 0"#,
    );
    let manager = open(&dir, settings(script, 3));
    let channel = add_node(&manager, NodeKind::Channel, "Band", "https://example.com/@band");

    let (summary, rx) = run(&manager, OperationKind::Check, channel);
    assert_eq!(summary.counts.succeeded, 1, "failures: {:?}", summary.failures);
    assert!(matches!(summary.commit, CommitStatus::Committed { .. }));

    manager.catalogue().read(|c| {
        let mut names: Vec<String> = c.children(channel).iter().map(|n| n.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["First".to_string(), "Second".to_string()]);
        let first = c.find_item("e1").and_then(|id| c.node(id)).expect("e1");
        assert_eq!(first.source_url.as_deref(), Some("https://example.com/watch?v=e1"));
        assert!(c.node(channel).expect("channel").last_checked_at_ms.is_some());
    });

    let events: Vec<OperationEvent> = rx.try_iter().map(|(_, event)| event).collect();
    assert!(events.iter().any(|e| matches!(
        e,
        OperationEvent::ProgressTick { percent, .. } if (percent - 42.0).abs() < 1e-9
    )));
}

#[test]
fn network_errors_are_retried_then_reported_as_transient() {
    let dir = tempfile::tempdir().expect("tempdir");
    let attempts = dir.path().join("attempts");
    let script = fake_downloader(
        dir.path(),
        &format!(
            "echo run >> '{}'\necho 'ERROR: network error' 1>&2\nexit 1",
            attempts.display()
        ),
    );
    let manager = open(&dir, settings(script, 3));
    let channel = add_node(&manager, NodeKind::Channel, "Flaky", "https://example.com/@flaky");

    let (summary, _rx) = run(&manager, OperationKind::Check, channel);
    assert_eq!(summary.counts.failed, 1);
    assert_eq!(summary.failures.len(), 1);
    let failure = &summary.failures[0];
    assert_eq!(failure.kind, FailureKind::Transient);
    assert!(failure.kind.is_retryable());
    assert_eq!(failure.attempts, 3);
    assert!(failure.message.contains("network error"), "{}", failure.message);
    assert_eq!(lines(&attempts).len(), 3);

    manager.catalogue().read(|c| {
        let node = c.node(channel).expect("channel");
        assert!(node.flags.failed);
        assert!(node.last_error.as_deref().is_some_and(|e| e.contains("network error")));
    });
}

#[test]
fn silent_downloader_is_killed_as_stalled_and_retried() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pids = dir.path().join("pids");
    let script = fake_downloader(
        dir.path(),
        &format!(
            "echo $$ >> '{}'\necho '[download]   1.0% of 1.00MiB at 1.00KiB/s ETA 09:59'\nexec sleep 30",
            pids.display()
        ),
    );
    let mut config = settings(script, 2);
    config.stall_timeout_secs = 1;
    let manager = open(&dir, config);
    let video = add_node(
        &manager,
        NodeKind::Video,
        "quiet",
        "https://example.com/watch?v=quiet",
    );

    let started = Instant::now();
    let (summary, _rx) = run(&manager, OperationKind::Download, video);
    assert!(started.elapsed() < Duration::from_secs(20), "stall was not cut short");

    assert_eq!(summary.counts.failed, 1);
    let failure = &summary.failures[0];
    assert_eq!(failure.kind, FailureKind::Stalled);
    assert_eq!(failure.attempts, 2);

    let launched = lines(&pids);
    assert_eq!(launched.len(), 2, "one launch per attempt");
    for pid in &launched {
        assert!(!process_alive(pid), "downloader {pid} is still running");
    }
    assert!(!manager
        .catalogue()
        .read(|c| c.node(video).expect("video").is_downloaded()));
}
