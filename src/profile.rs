//! Downloader families: argument building, output parsing and exit classification.

use crate::catalogue::{DiscoveredItem, ItemMetadata, LivestreamState, OptionValue};
use crate::job::{Job, JobMode};
use crate::process::{ProgressEvent, StreamKind};
use crate::{EngineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

pub const YT_DLP_PROFILE: &str = "yt-dlp";
pub const YOUTUBE_DL_PROFILE: &str = "youtube-dl";

static PROGRESS_RE: OnceLock<Regex> = OnceLock::new();
static BRACKET_TAG_RE: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Launch,
    Transient,
    Terminal,
    Stalled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Launch => "launch",
            FailureKind::Transient => "transient",
            FailureKind::Terminal => "terminal",
            FailureKind::Stalled => "stalled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::Stalled)
    }
}

/// Exit-code and stderr signatures that decide retry vs give up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitRules {
    pub transient_patterns: Vec<String>,
    pub terminal_patterns: Vec<String>,
    pub transient_codes: Vec<i32>,
    pub terminal_codes: Vec<i32>,
    /// Stderr that means a scheduled livestream has not started yet.
    pub livestream_waiting_patterns: Vec<String>,
}

impl Default for ExitRules {
    fn default() -> Self {
        let owned = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            transient_patterns: owned(&[
                r"(?i)HTTP Error 5\d\d",
                r"(?i)HTTP Error 429",
                r"(?i)timed? ?out",
                r"(?i)connection (reset|refused|aborted)",
                r"(?i)temporary failure in name resolution",
                r"(?i)unable to download (webpage|video data)",
                r"(?i)incomplete read",
            ]),
            terminal_patterns: owned(&[
                r"(?i)video unavailable",
                r"(?i)unsupported url",
                r"(?i)private video",
                r"(?i)has been removed",
                r"(?i)is not a valid url",
                r"(?i)not available in your country",
                r"(?i)HTTP Error 404",
                r"(?i)sign in to confirm your age",
                r"No module named",
            ]),
            transient_codes: Vec::new(),
            terminal_codes: vec![2],
            livestream_waiting_patterns: owned(&[
                r"(?i)this live event will begin in",
                r"(?i)premieres in",
                r"(?i)waiting for (the )?(live )?stream",
            ]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledExitRules {
    transient: Vec<Regex>,
    terminal: Vec<Regex>,
    transient_codes: Vec<i32>,
    terminal_codes: Vec<i32>,
    livestream_waiting: Vec<Regex>,
}

impl CompiledExitRules {
    pub fn compile(rules: &ExitRules) -> Result<Self> {
        Ok(Self {
            transient: compile_all(&rules.transient_patterns)?,
            terminal: compile_all(&rules.terminal_patterns)?,
            transient_codes: rules.transient_codes.clone(),
            terminal_codes: rules.terminal_codes.clone(),
            livestream_waiting: compile_all(&rules.livestream_waiting_patterns)?,
        })
    }

    pub fn livestream_waiting(&self, stderr_tail: &[String]) -> bool {
        stderr_tail
            .iter()
            .any(|line| self.livestream_waiting.iter().any(|re| re.is_match(line)))
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| EngineError::Config(format!("invalid exit pattern {p:?}: {e}")))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineParse {
    Event(ProgressEvent),
    /// A known line shape that carries nothing the engine needs.
    Ignored,
    Anomaly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    Switch,
    Value,
}

/// Option key to command-line flag. Keys starting with `pp_` belong to
/// post-processing and never reach the downloader.
const YT_DLP_FLAGS: &[(&str, FlagKind, &str)] = &[
    ("format", FlagKind::Value, "--format"),
    ("merge_output_format", FlagKind::Value, "--merge-output-format"),
    ("write_subs", FlagKind::Switch, "--write-subs"),
    ("write_auto_subs", FlagKind::Switch, "--write-auto-subs"),
    ("sub_langs", FlagKind::Value, "--sub-langs"),
    ("write_thumbnail", FlagKind::Switch, "--write-thumbnail"),
    ("embed_thumbnail", FlagKind::Switch, "--embed-thumbnail"),
    ("write_description", FlagKind::Switch, "--write-description"),
    ("write_info_json", FlagKind::Switch, "--write-info-json"),
    ("extract_audio", FlagKind::Switch, "--extract-audio"),
    ("audio_format", FlagKind::Value, "--audio-format"),
    ("cookies_file", FlagKind::Value, "--cookies"),
    ("proxy", FlagKind::Value, "--proxy"),
    ("user_agent", FlagKind::Value, "--user-agent"),
    ("referer", FlagKind::Value, "--referer"),
    ("socket_timeout", FlagKind::Value, "--socket-timeout"),
    ("retries", FlagKind::Value, "--retries"),
    ("sleep_interval", FlagKind::Value, "--sleep-interval"),
    ("min_filesize", FlagKind::Value, "--min-filesize"),
    ("max_filesize", FlagKind::Value, "--max-filesize"),
    ("date_after", FlagKind::Value, "--dateafter"),
    ("date_before", FlagKind::Value, "--datebefore"),
    ("match_filter", FlagKind::Value, "--match-filter"),
    ("playlist_reverse", FlagKind::Switch, "--playlist-reverse"),
    ("max_downloads", FlagKind::Value, "--max-downloads"),
    ("geo_bypass", FlagKind::Switch, "--geo-bypass"),
];

const YOUTUBE_DL_FLAGS: &[(&str, FlagKind, &str)] = &[
    ("format", FlagKind::Value, "--format"),
    ("merge_output_format", FlagKind::Value, "--merge-output-format"),
    ("write_subs", FlagKind::Switch, "--write-sub"),
    ("write_auto_subs", FlagKind::Switch, "--write-auto-sub"),
    ("sub_langs", FlagKind::Value, "--sub-lang"),
    ("write_thumbnail", FlagKind::Switch, "--write-thumbnail"),
    ("embed_thumbnail", FlagKind::Switch, "--embed-thumbnail"),
    ("write_description", FlagKind::Switch, "--write-description"),
    ("write_info_json", FlagKind::Switch, "--write-info-json"),
    ("extract_audio", FlagKind::Switch, "--extract-audio"),
    ("audio_format", FlagKind::Value, "--audio-format"),
    ("cookies_file", FlagKind::Value, "--cookies"),
    ("proxy", FlagKind::Value, "--proxy"),
    ("user_agent", FlagKind::Value, "--user-agent"),
    ("referer", FlagKind::Value, "--referer"),
    ("socket_timeout", FlagKind::Value, "--socket-timeout"),
    ("retries", FlagKind::Value, "--retries"),
    ("sleep_interval", FlagKind::Value, "--sleep-interval"),
    ("min_filesize", FlagKind::Value, "--min-filesize"),
    ("max_filesize", FlagKind::Value, "--max-filesize"),
    ("date_after", FlagKind::Value, "--dateafter"),
    ("date_before", FlagKind::Value, "--datebefore"),
    ("match_filter", FlagKind::Value, "--match-filter"),
    ("playlist_reverse", FlagKind::Switch, "--playlist-reverse"),
    ("max_downloads", FlagKind::Value, "--max-downloads"),
    ("geo_bypass", FlagKind::Switch, "--geo-bypass"),
];

pub const DEFAULT_OUTPUT_TEMPLATE: &str = "%(title)s [%(id)s].%(ext)s";

pub trait DownloaderProfile: Send + Sync {
    fn id(&self) -> &'static str;

    /// Executable name looked up on PATH.
    fn program(&self) -> &'static str;

    /// Python module for the `python -m` fallback.
    fn python_module(&self) -> &'static str;

    fn flag_table(&self) -> &'static [(&'static str, FlagKind, &'static str)];

    /// Arguments that make the tool print one JSON object per item.
    fn json_args(&self, mode: JobMode) -> Vec<String>;

    fn build_args(&self, job: &Job, bandwidth_kib: Option<u64>, extra_args: &[String]) -> Vec<String> {
        let mut args: Vec<String> = vec!["--newline".to_string()];
        args.extend(self.json_args(job.mode));

        if job.mode == JobMode::LivestreamProbe || (job.mode == JobMode::Check && !job.target.is_container()) {
            args.push("--no-playlist".to_string());
        }

        if job.mode.downloads_media() {
            let template = job
                .options
                .text("output_template")
                .unwrap_or(DEFAULT_OUTPUT_TEMPLATE);
            args.push("--output".to_string());
            args.push(job.destination.join(template).to_string_lossy().to_string());

            for (key, value) in &job.options.values {
                if key.starts_with("pp_") {
                    continue;
                }
                let Some((_, kind, flag)) = self.flag_table().iter().find(|(k, _, _)| *k == key.as_str()) else {
                    continue;
                };
                match (kind, value) {
                    (FlagKind::Switch, OptionValue::Flag(true)) => args.push(flag.to_string()),
                    (FlagKind::Switch, _) => {}
                    (FlagKind::Value, OptionValue::Flag(_)) => {}
                    (FlagKind::Value, other) => {
                        let text = other.to_arg();
                        if !text.trim().is_empty() {
                            args.push(flag.to_string());
                            args.push(text.trim().to_string());
                        }
                    }
                }
            }

            if let Some(kib) = bandwidth_kib {
                args.push("--limit-rate".to_string());
                args.push(format!("{kib}K"));
            }
        } else if let Some(cookies) = job.options.text("cookies_file") {
            args.push("--cookies".to_string());
            args.push(cookies.to_string());
        }

        args.extend(extra_args.iter().cloned());
        args.push("--".to_string());
        if let Some(url) = job.target.url() {
            args.push(url.to_string());
        }
        args
    }

    fn parse_line(&self, stream: StreamKind, line: &str) -> LineParse {
        parse_downloader_line(stream, line)
    }

    fn classify_exit(&self, code: Option<i32>, stderr_tail: &[String], rules: &CompiledExitRules) -> FailureKind {
        classify_by_rules(code, stderr_tail, rules)
    }
}

#[derive(Debug, Default)]
pub struct YtDlpProfile;

impl DownloaderProfile for YtDlpProfile {
    fn id(&self) -> &'static str {
        YT_DLP_PROFILE
    }

    fn program(&self) -> &'static str {
        "yt-dlp"
    }

    fn python_module(&self) -> &'static str {
        "yt_dlp"
    }

    fn flag_table(&self) -> &'static [(&'static str, FlagKind, &'static str)] {
        YT_DLP_FLAGS
    }

    fn json_args(&self, mode: JobMode) -> Vec<String> {
        let args: &[&str] = match mode {
            JobMode::Download | JobMode::CustomDownload => &["--dump-json", "--no-simulate"],
            JobMode::Check => &["--dump-json", "--skip-download", "--flat-playlist"],
            _ => &["--dump-json", "--skip-download"],
        };
        args.iter().map(|s| s.to_string()).collect()
    }
}

#[derive(Debug, Default)]
pub struct YoutubeDlProfile;

impl DownloaderProfile for YoutubeDlProfile {
    fn id(&self) -> &'static str {
        YOUTUBE_DL_PROFILE
    }

    fn program(&self) -> &'static str {
        "youtube-dl"
    }

    fn python_module(&self) -> &'static str {
        "youtube_dl"
    }

    fn flag_table(&self) -> &'static [(&'static str, FlagKind, &'static str)] {
        YOUTUBE_DL_FLAGS
    }

    fn json_args(&self, mode: JobMode) -> Vec<String> {
        let args: &[&str] = match mode {
            JobMode::Download | JobMode::CustomDownload => &["--print-json"],
            JobMode::Check => &["--dump-json", "--skip-download", "--flat-playlist"],
            _ => &["--dump-json", "--skip-download"],
        };
        args.iter().map(|s| s.to_string()).collect()
    }
}

#[derive(Clone)]
pub struct ProfileRegistry {
    profiles: Vec<Arc<dyn DownloaderProfile>>,
}

impl std::fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.profiles.iter().map(|p| p.id()))
            .finish()
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self {
            profiles: vec![Arc::new(YtDlpProfile), Arc::new(YoutubeDlProfile)],
        }
    }
}

impl ProfileRegistry {
    pub fn get(&self, id: &str) -> Option<Arc<dyn DownloaderProfile>> {
        self.profiles.iter().find(|p| p.id() == id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Arc<dyn DownloaderProfile>> {
        self.get(id)
            .ok_or_else(|| EngineError::Config(format!("unknown downloader profile {id:?}")))
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.profiles.iter().map(|p| p.id()).collect()
    }
}

pub fn classify_by_rules(code: Option<i32>, stderr_tail: &[String], rules: &CompiledExitRules) -> FailureKind {
    let text_matches = |patterns: &[Regex]| {
        stderr_tail
            .iter()
            .any(|line| patterns.iter().any(|re| re.is_match(line)))
    };
    // Message signatures are more specific than exit codes.
    if text_matches(&rules.terminal) {
        return FailureKind::Terminal;
    }
    if text_matches(&rules.transient) {
        return FailureKind::Transient;
    }
    match code {
        Some(c) if rules.terminal_codes.contains(&c) => FailureKind::Terminal,
        Some(c) if rules.transient_codes.contains(&c) => FailureKind::Transient,
        // Killed by a signal or an unrecognised failure: worth another try.
        _ => FailureKind::Transient,
    }
}

pub fn parse_downloader_line(stream: StreamKind, line: &str) -> LineParse {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineParse::Ignored;
    }

    if let Some(rest) = trimmed.strip_prefix("ERROR:") {
        return LineParse::Event(ProgressEvent::Error(rest.trim().to_string()));
    }
    if let Some(rest) = trimmed.strip_prefix("WARNING:") {
        return LineParse::Event(ProgressEvent::Warning(rest.trim().to_string()));
    }

    if stream == StreamKind::Stdout && trimmed.starts_with('{') {
        return match parse_item_json(trimmed) {
            Some(item) => LineParse::Event(ProgressEvent::ItemDiscovered(item)),
            None => LineParse::Anomaly,
        };
    }

    if let Some(event) = parse_progress(trimmed) {
        return LineParse::Event(event);
    }

    let tag_re = BRACKET_TAG_RE.get_or_init(|| Regex::new(r"^\[[A-Za-z0-9:_ -]+\]").expect("tag regex"));
    if tag_re.is_match(trimmed) || trimmed.starts_with("Deleting original file") {
        return LineParse::Ignored;
    }
    LineParse::Anomaly
}

fn parse_progress(line: &str) -> Option<ProgressEvent> {
    let re = PROGRESS_RE.get_or_init(|| {
        Regex::new(
            r"^\[download\]\s+(?P<pct>\d+(?:\.\d+)?)%(?:\s+of\s+~?\s*(?P<size>\S+))?(?:\s+at\s+(?P<speed>\S+))?(?:\s+ETA\s+(?P<eta>\S+))?",
        )
        .expect("progress regex")
    });
    let caps = re.captures(line)?;
    let percent: f64 = caps.name("pct")?.as_str().parse().ok()?;
    let speed_bps = caps.name("speed").and_then(|m| parse_rate(m.as_str()));
    let eta_secs = caps.name("eta").and_then(|m| parse_eta(m.as_str()));
    Some(ProgressEvent::Progress {
        percent: percent.clamp(0.0, 100.0),
        speed_bps,
        eta_secs,
    })
}

/// "1.50MiB/s" -> bytes per second.
fn parse_rate(raw: &str) -> Option<f64> {
    let value = raw.strip_suffix("/s")?;
    let split = value.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let scale = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "KB" | "kB" => 1000.0,
        "MB" => 1000.0 * 1000.0,
        "GB" => 1000.0 * 1000.0 * 1000.0,
        _ => return None,
    };
    Some(number * scale)
}

/// "01:02:03" or "02:03" -> seconds.
fn parse_eta(raw: &str) -> Option<u64> {
    let mut total: u64 = 0;
    let mut parts = 0;
    for part in raw.split(':') {
        let value: u64 = part.parse().ok()?;
        total = total * 60 + value;
        parts += 1;
    }
    if parts == 0 || parts > 3 {
        return None;
    }
    Some(total)
}

fn parse_item_json(line: &str) -> Option<DiscoveredItem> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;
    let text = |key: &str| {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let item_id = text("id")?;
    let url = text("webpage_url")
        .or_else(|| text("original_url"))
        .or_else(|| text("url").filter(|u| u.starts_with("http")));

    let livestream = match obj.get("live_status").and_then(|v| v.as_str()) {
        Some("is_upcoming") => Some(LivestreamState::Waiting),
        Some("is_live") => Some(LivestreamState::LiveNow),
        Some("was_live") | Some("post_live") => Some(LivestreamState::Finished),
        Some("not_live") => None,
        _ => {
            if obj.get("is_live").and_then(|v| v.as_bool()) == Some(true) {
                Some(LivestreamState::LiveNow)
            } else if obj.get("was_live").and_then(|v| v.as_bool()) == Some(true) {
                Some(LivestreamState::Finished)
            } else {
                None
            }
        }
    };
    let scheduled_at_ms = obj
        .get("release_timestamp")
        .and_then(|v| v.as_i64())
        .map(|secs| secs * 1000);

    let media_path = text("_filename")
        .or_else(|| text("filename"))
        .map(PathBuf::from);

    Some(DiscoveredItem {
        item_id,
        url,
        metadata: ItemMetadata {
            title: text("title"),
            uploader: text("uploader").or_else(|| text("channel")),
            upload_date: text("upload_date"),
            duration_secs: obj.get("duration").and_then(|v| v.as_f64()),
        },
        livestream,
        scheduled_at_ms,
        media_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{NodeKind, OptionsSet, ResolvedOptions};
    use crate::job::{JobPriority, JobTarget};

    #[test]
    fn parses_progress_lines() {
        let parsed = parse_downloader_line(
            StreamKind::Stdout,
            "[download]  42.3% of ~ 10.00MiB at  1.50MiB/s ETA 01:05",
        );
        match parsed {
            LineParse::Event(ProgressEvent::Progress {
                percent,
                speed_bps,
                eta_secs,
            }) => {
                assert!((percent - 42.3).abs() < 1e-9);
                assert_eq!(speed_bps, Some(1.5 * 1024.0 * 1024.0));
                assert_eq!(eta_secs, Some(65));
            }
            other => panic!("unexpected parse: {other:?}"),
        }

        assert!(matches!(
            parse_downloader_line(StreamKind::Stdout, "[download] 100% of 3.00MiB in 00:02"),
            LineParse::Event(ProgressEvent::Progress { .. })
        ));
    }

    #[test]
    fn parses_item_json_and_livestream_status() {
        let line = r#"{"id":"abc","webpage_url":"https://example.com/watch?v=abc","title":"Hello","duration":12.5,"live_status":"is_upcoming","release_timestamp":1700000000}"#;
        let LineParse::Event(ProgressEvent::ItemDiscovered(item)) =
            parse_downloader_line(StreamKind::Stdout, line)
        else {
            panic!("expected item");
        };
        assert_eq!(item.item_id, "abc");
        assert_eq!(item.metadata.title.as_deref(), Some("Hello"));
        assert_eq!(item.livestream, Some(LivestreamState::Waiting));
        assert_eq!(item.scheduled_at_ms, Some(1_700_000_000_000));
    }

    #[test]
    fn unknown_lines_are_anomalies_not_errors() {
        assert_eq!(
            parse_downloader_line(StreamKind::Stdout, "something odd"),
            LineParse::Anomaly
        );
        assert_eq!(
            parse_downloader_line(StreamKind::Stdout, "{not json"),
            LineParse::Anomaly
        );
        assert_eq!(
            parse_downloader_line(StreamKind::Stdout, "[youtube] abc: Downloading webpage"),
            LineParse::Ignored
        );
        assert_eq!(
            parse_downloader_line(StreamKind::Stderr, "ERROR: Video unavailable"),
            LineParse::Event(ProgressEvent::Error("Video unavailable".to_string()))
        );
    }

    #[test]
    fn exit_classification_follows_rules() {
        let rules = CompiledExitRules::compile(&ExitRules::default()).expect("compile");
        let tail = |s: &str| vec![s.to_string()];
        assert_eq!(
            classify_by_rules(Some(1), &tail("ERROR: [youtube] x: Video unavailable"), &rules),
            FailureKind::Terminal
        );
        assert_eq!(
            classify_by_rules(Some(1), &tail("ERROR: HTTP Error 503: Service Unavailable"), &rules),
            FailureKind::Transient
        );
        assert_eq!(classify_by_rules(Some(2), &[], &rules), FailureKind::Terminal);
        assert_eq!(classify_by_rules(None, &[], &rules), FailureKind::Transient);
        assert!(rules.livestream_waiting(&tail("ERROR: This live event will begin in 3 hours.")));

        let bad = ExitRules {
            terminal_patterns: vec!["(".to_string()],
            ..ExitRules::default()
        };
        assert!(matches!(CompiledExitRules::compile(&bad), Err(EngineError::Config(_))));
    }

    #[test]
    fn build_args_maps_options_and_bandwidth() {
        let options = OptionsSet::new("default")
            .with("format", OptionValue::Text("bestaudio".to_string()))
            .with("write_subs", OptionValue::Flag(true))
            .with("embed_thumbnail", OptionValue::Flag(false))
            .with("pp_extract_audio", OptionValue::Text("mp3".to_string()));
        let job = Job::new(
            "op",
            JobTarget::Node {
                id: 1,
                kind: NodeKind::Video,
                url: Some("https://example.com/watch?v=1".to_string()),
            },
            JobMode::Download,
            Arc::new(ResolvedOptions::from_layers([&options])),
            PathBuf::from("/media/chan"),
            JobPriority::Normal,
        )
        .expect("job");

        let yt = YtDlpProfile.build_args(&job, Some(512), &[]);
        assert!(yt.windows(2).any(|w| w[0] == "--format" && w[1] == "bestaudio"));
        assert!(yt.contains(&"--write-subs".to_string()));
        assert!(!yt.contains(&"--embed-thumbnail".to_string()));
        assert!(yt.windows(2).any(|w| w[0] == "--limit-rate" && w[1] == "512K"));
        assert!(!yt.iter().any(|a| a.contains("mp3")));
        assert_eq!(yt.last().map(String::as_str), Some("https://example.com/watch?v=1"));

        let ydl = YoutubeDlProfile.build_args(&job, None, &[]);
        assert!(ydl.contains(&"--write-sub".to_string()));
        assert!(ydl.contains(&"--print-json".to_string()));

        let registry = ProfileRegistry::default();
        assert!(registry.get("yt-dlp").is_some());
        assert!(registry.require("nope").is_err());
    }
}
