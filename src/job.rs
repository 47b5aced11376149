use crate::catalogue::{now_ms, Mutation, NodeId, NodeKind, ResolvedOptions};
use crate::profile::FailureKind;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

pub type JobId = String;
pub type OperationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Check,
    Download,
    CustomDownload,
    /// Status-only probe used by the livestream poller.
    LivestreamProbe,
    Refresh,
    Tidy,
    Process,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Check => "check",
            JobMode::Download => "download",
            JobMode::CustomDownload => "custom_download",
            JobMode::LivestreamProbe => "livestream_probe",
            JobMode::Refresh => "refresh",
            JobMode::Tidy => "tidy",
            JobMode::Process => "process",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "check" => Some(JobMode::Check),
            "download" => Some(JobMode::Download),
            "custom_download" => Some(JobMode::CustomDownload),
            "livestream_probe" => Some(JobMode::LivestreamProbe),
            "refresh" => Some(JobMode::Refresh),
            "tidy" => Some(JobMode::Tidy),
            "process" => Some(JobMode::Process),
            _ => None,
        }
    }

    /// Modes that run the external downloader.
    pub fn uses_downloader(&self) -> bool {
        matches!(
            self,
            JobMode::Check | JobMode::Download | JobMode::CustomDownload | JobMode::LivestreamProbe
        )
    }

    pub fn downloads_media(&self) -> bool {
        matches!(self, JobMode::Download | JobMode::CustomDownload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTarget {
    Node {
        id: NodeId,
        kind: NodeKind,
        url: Option<String>,
    },
    /// Classic-mode download that never touches the catalogue.
    BareUrl { url: String },
}

impl JobTarget {
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            JobTarget::Node { id, .. } => Some(*id),
            JobTarget::BareUrl { .. } => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            JobTarget::Node { url, .. } => url.as_deref(),
            JobTarget::BareUrl { url } => Some(url.as_str()),
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, JobTarget::Node { kind, .. } if kind.is_container())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    LiveNow,
    Normal,
}

/// One unit of work. Never changes after creation; run state lives in [`JobRun`].
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub operation_id: OperationId,
    pub target: JobTarget,
    pub mode: JobMode,
    /// Snapshot taken at expansion; left out of job records.
    #[serde(skip)]
    pub options: Arc<ResolvedOptions>,
    pub destination: PathBuf,
    pub priority: JobPriority,
    pub created_at_ms: i64,
}

impl Job {
    pub fn new(
        operation_id: &str,
        target: JobTarget,
        mode: JobMode,
        options: Arc<ResolvedOptions>,
        destination: PathBuf,
        priority: JobPriority,
    ) -> Result<Self> {
        if !options.is_resolved() {
            return Err(EngineError::InvalidJob(
                "options snapshot has not been resolved".to_string(),
            ));
        }

        let target = match target {
            JobTarget::BareUrl { url } => {
                if !mode.uses_downloader() {
                    return Err(EngineError::InvalidJob(format!(
                        "{} jobs need a catalogue node",
                        mode.as_str()
                    )));
                }
                JobTarget::BareUrl {
                    url: normalize_job_url(&url)?,
                }
            }
            JobTarget::Node { id, kind, url } => {
                let url = match url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
                    Some(u) => Some(normalize_job_url(u)?),
                    None => None,
                };
                if mode.uses_downloader() && url.is_none() {
                    return Err(EngineError::InvalidJob(format!(
                        "node {id} has no source URL"
                    )));
                }
                JobTarget::Node { id, kind, url }
            }
        };

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            operation_id: operation_id.to_string(),
            target,
            mode,
            options,
            destination,
            priority,
            created_at_ms: now_ms(),
        })
    }
}

fn normalize_job_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidJob("URL is empty".to_string()));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|e| EngineError::InvalidJob(format!("invalid URL {trimmed:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.to_string()),
        other => Err(EngineError::InvalidJob(format!(
            "unsupported URL scheme {other:?}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Stopping,
    Succeeded,
    Failed,
    Skipped,
    /// Interrupted by an operation cancel; contributes nothing to the commit.
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Stopping => "stopping",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped | JobState::Cancelled
        )
    }
}

/// Mutable bookkeeping the coordinator keeps for one job.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub job: Arc<Job>,
    pub state: JobState,
    /// Failed attempts so far.
    pub failures: u32,
    pub consecutive_known: u32,
    pub last_percent: Option<f64>,
    pub stopped_early: bool,
    pub last_failure: Option<(FailureKind, String)>,
    /// Mutations recorded by the current attempt, folded in at the end.
    pub delta: Vec<Mutation>,
    /// Item ids seen by the current attempt.
    pub discovered: Vec<String>,
    /// Files the current attempt wants gone once its mutations are committed.
    pub cleanup: Vec<PathBuf>,
    seen: HashSet<String>,
}

impl JobRun {
    pub fn new(job: Arc<Job>) -> Self {
        Self {
            job,
            state: JobState::Queued,
            failures: 0,
            consecutive_known: 0,
            last_percent: None,
            stopped_early: false,
            last_failure: None,
            delta: Vec::new(),
            discovered: Vec::new(),
            cleanup: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Starts a fresh attempt: whatever the last one recorded is thrown away.
    pub fn reset_attempt(&mut self) {
        self.consecutive_known = 0;
        self.last_percent = None;
        self.delta.clear();
        self.discovered.clear();
        self.cleanup.clear();
        self.seen.clear();
    }

    /// Records a discovered item and returns the updated consecutive-known count.
    pub fn record_discovery(&mut self, item_id: &str, known_elsewhere: bool) -> u32 {
        let repeat = !self.seen.insert(item_id.to_string());
        if !repeat {
            self.discovered.push(item_id.to_string());
        }
        if known_elsewhere || repeat {
            self.consecutive_known += 1;
        } else {
            self.consecutive_known = 0;
        }
        self.consecutive_known
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::OptionsSet;

    fn resolved() -> Arc<ResolvedOptions> {
        Arc::new(ResolvedOptions::from_layers([&OptionsSet::new("default")]))
    }

    #[test]
    fn downloader_jobs_need_http_urls() {
        let ok = Job::new(
            "op",
            JobTarget::BareUrl {
                url: " https://example.com/watch?v=1 ".to_string(),
            },
            JobMode::Download,
            resolved(),
            PathBuf::from("/dl"),
            JobPriority::Normal,
        )
        .expect("valid job");
        assert_eq!(ok.target.url(), Some("https://example.com/watch?v=1"));

        for bad in ["", "ftp://example.com/a", "not a url"] {
            let err = Job::new(
                "op",
                JobTarget::BareUrl { url: bad.to_string() },
                JobMode::Download,
                resolved(),
                PathBuf::from("/dl"),
                JobPriority::Normal,
            )
            .expect_err("invalid");
            assert!(matches!(err, EngineError::InvalidJob(_)));
        }
    }

    #[test]
    fn node_jobs_without_url_are_only_valid_for_local_modes() {
        let target = JobTarget::Node {
            id: 7,
            kind: NodeKind::Channel,
            url: None,
        };
        assert!(Job::new("op", target.clone(), JobMode::Check, resolved(), PathBuf::new(), JobPriority::Normal).is_err());
        assert!(Job::new("op", target, JobMode::Refresh, resolved(), PathBuf::new(), JobPriority::Normal).is_ok());
    }

    #[test]
    fn unresolved_options_are_rejected() {
        let empty = Arc::new(ResolvedOptions::from_layers(Vec::<&OptionsSet>::new()));
        let err = Job::new(
            "op",
            JobTarget::BareUrl {
                url: "https://example.com/v".to_string(),
            },
            JobMode::Check,
            empty,
            PathBuf::new(),
            JobPriority::Normal,
        )
        .expect_err("unresolved");
        assert!(matches!(err, EngineError::InvalidJob(_)));
    }

    #[test]
    fn consecutive_known_resets_on_new_items() {
        let job = Job::new(
            "op",
            JobTarget::BareUrl {
                url: "https://example.com/c".to_string(),
            },
            JobMode::Check,
            resolved(),
            PathBuf::new(),
            JobPriority::Normal,
        )
        .expect("job");
        let mut run = JobRun::new(Arc::new(job));
        assert_eq!(run.record_discovery("a", true), 1);
        assert_eq!(run.record_discovery("b", true), 2);
        assert_eq!(run.record_discovery("c", false), 0);
        assert_eq!(run.record_discovery("c", false), 1);
        assert_eq!(run.discovered, vec!["a", "b", "c"]);

        run.reset_attempt();
        assert!(run.discovered.is_empty());
        assert_eq!(run.record_discovery("a", false), 0);
    }

    #[test]
    fn job_records_carry_target_but_not_options() {
        let job = Job::new(
            "op",
            JobTarget::BareUrl {
                url: "https://example.com/watch?v=9".to_string(),
            },
            JobMode::Download,
            resolved(),
            PathBuf::from("/dl"),
            JobPriority::Normal,
        )
        .expect("job");
        let value = serde_json::to_value(&job).expect("serialize job");
        assert_eq!(value["operation_id"], "op");
        assert_eq!(value["target"]["url"], "https://example.com/watch?v=9");
        assert!(value.get("options").is_none());
    }
}
