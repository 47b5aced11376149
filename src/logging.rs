use crate::catalogue::now_ms;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LOG_FILTER: &str = "tubekeep_engine=info,tubekeep=info";

const JOB_LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const JOB_LOG_MAX_BACKUPS: usize = 3;
const JOB_LOG_MAX_AGE_DAYS: u64 = 30;
const JOB_LOG_TOTAL_CAP_BYTES: u64 = 512 * 1024 * 1024;

/// Installs the global subscriber: stderr plus a daily file under `logs/`.
///
/// Keep the returned guard alive for as long as logs should be flushed.
pub fn init_tracing(paths: &AppPaths, default_filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(paths.logs_dir())?;
    let file_appender = tracing_appender::rolling::daily(paths.logs_dir(), "tubekeep.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()
        .map_err(|e| EngineError::Logging(format!("failed to install log subscriber: {e}")))?;

    Ok(guard)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobLogRetentionPolicy {
    pub rotate_bytes: u64,
    pub max_backups: usize,
    pub max_age_days: u64,
    pub total_cap_bytes: u64,
}

impl Default for JobLogRetentionPolicy {
    fn default() -> Self {
        Self {
            rotate_bytes: JOB_LOG_ROTATE_BYTES,
            max_backups: JOB_LOG_MAX_BACKUPS,
            max_age_days: JOB_LOG_MAX_AGE_DAYS,
            total_cap_bytes: JOB_LOG_TOTAL_CAP_BYTES,
        }
    }
}

/// Append-only JSONL log for one job, shared by every attempt.
#[derive(Debug, Clone)]
pub struct JobLog {
    path: PathBuf,
    job_id: String,
    rotate_bytes: u64,
    max_backups: usize,
}

impl JobLog {
    pub fn new(paths: &AppPaths, job_id: &str) -> Self {
        let policy = JobLogRetentionPolicy::default();
        Self {
            path: paths.job_log_path(job_id),
            job_id: job_id.to_string(),
            rotate_bytes: policy.rotate_bytes,
            max_backups: policy.max_backups,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&self, level: &str, event: &str, data: serde_json::Value) -> Result<()> {
        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "job_id": self.job_id,
            "level": level,
            "event": event,
            "data": data
        })
        .to_string();

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        self.rotate_if_needed()?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }

    /// Logging must never fail a job; errors go to tracing instead.
    pub fn record(&self, level: &str, event: &str, data: serde_json::Value) {
        if let Err(err) = self.line(level, event, data) {
            tracing::debug!(job_id = %self.job_id, error = %err, "job log write failed");
        }
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let len = match std::fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(_) => return Ok(()),
        };
        if len < self.rotate_bytes {
            return Ok(());
        }
        rotate_file_backups(&self.path, self.max_backups)?;
        Ok(())
    }
}

pub fn rotate_file_backups(path: &Path, max_backups: usize) -> std::io::Result<()> {
    if max_backups == 0 {
        let _ = std::fs::remove_file(path);
        return Ok(());
    }

    for i in (1..=max_backups).rev() {
        let dst = path_with_suffix(path, &format!(".{i}"));
        let src = if i == 1 {
            path.to_path_buf()
        } else {
            path_with_suffix(path, &format!(".{}", i - 1))
        };

        if !src.exists() {
            continue;
        }

        if dst.exists() {
            let _ = std::fs::remove_file(&dst);
        }
        std::fs::rename(src, dst)?;
    }
    Ok(())
}

pub fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let file_name = match path.file_name() {
        Some(n) => n.to_string_lossy().to_string(),
        None => suffix.to_string(),
    };
    path.with_file_name(format!("{file_name}{suffix}"))
}

/// Drops job logs older than the age limit, then the oldest ones until the
/// directory fits the total cap. Returns how many files were removed.
pub fn prune_job_logs(paths: &AppPaths, policy: &JobLogRetentionPolicy) -> Result<usize> {
    let dir = paths.job_logs_dir();
    if !dir.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let cutoff = now
        .checked_sub(Duration::from_secs(policy.max_age_days * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    let mut candidates: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = match entry {
            Ok(v) => v,
            Err(_) => continue,
        };
        let meta = match entry.metadata() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let path = entry.path();
        let size = meta.len();

        if modified < cutoff {
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
            continue;
        }

        candidates.push((path, modified, size));
    }

    candidates.sort_by_key(|(_, modified, _)| *modified);
    let mut total: u64 = candidates.iter().map(|(_, _, size)| *size).sum();
    for (path, _modified, size) in candidates {
        if total <= policy.total_cap_bytes {
            break;
        }
        if std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
        total = total.saturating_sub(size);
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_file_backups_shifts_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("job.jsonl");

        std::fs::write(&log, "main").expect("write main");
        std::fs::write(path_with_suffix(&log, ".1"), "b1").expect("write b1");
        std::fs::write(path_with_suffix(&log, ".2"), "b2").expect("write b2");

        rotate_file_backups(&log, 2).expect("rotate");

        assert!(!log.exists());
        assert_eq!(
            std::fs::read_to_string(path_with_suffix(&log, ".1")).expect("r1"),
            "main"
        );
        assert_eq!(
            std::fs::read_to_string(path_with_suffix(&log, ".2")).expect("r2"),
            "b1"
        );
        assert!(!path_with_suffix(&log, ".3").exists());
    }

    #[test]
    fn job_log_appends_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let log = JobLog::new(&paths, "job-1");
        log.line("info", "started", serde_json::json!({ "attempt": 1 }))
            .expect("line 1");
        log.line("warn", "stderr", serde_json::json!({ "text": "slow" }))
            .expect("line 2");

        let raw = std::fs::read_to_string(log.path()).expect("read");
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "started");
        assert_eq!(lines[1]["data"]["text"], "slow");
    }

    #[test]
    fn prune_removes_stale_logs_and_enforces_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.job_logs_dir()).expect("dirs");

        let stale = paths.job_log_path("stale");
        let older = paths.job_log_path("older");
        let newer = paths.job_log_path("newer");
        std::fs::write(&stale, "x").expect("stale");
        std::fs::write(&older, vec![b'a'; 600]).expect("older");
        std::fs::write(&newer, vec![b'b'; 600]).expect("newer");

        let now = SystemTime::now();
        let sixty_days = Duration::from_secs(60 * 24 * 60 * 60);
        filetime::set_file_mtime(
            &stale,
            filetime::FileTime::from_system_time(now - sixty_days),
        )
        .expect("mtime stale");
        filetime::set_file_mtime(
            &older,
            filetime::FileTime::from_system_time(now - Duration::from_secs(3600)),
        )
        .expect("mtime older");

        let policy = JobLogRetentionPolicy {
            total_cap_bytes: 1000,
            ..JobLogRetentionPolicy::default()
        };
        let removed = prune_job_logs(&paths, &policy).expect("prune");
        assert_eq!(removed, 2);
        assert!(!stale.exists());
        assert!(!older.exists());
        assert!(newer.exists());
    }
}
