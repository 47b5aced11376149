use crate::catalogue::RetentionPolicy;
use crate::governor::{EarlyStopSettings, RateLimit, ScheduleRule};
use crate::livestream::LivestreamSettings;
use crate::logging::JobLogRetentionPolicy;
use crate::paths::AppPaths;
use crate::persist::DEFAULT_MAX_BACKUPS;
use crate::profile::{CompiledExitRules, ExitRules, ProfileRegistry, YT_DLP_PROFILE};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderSettings {
    /// Profile id, "yt-dlp" or "youtube-dl".
    pub profile: String,
    /// Explicit executable; disables the PATH and python fallbacks.
    pub executable: Option<PathBuf>,
    /// Appended verbatim before the URL.
    pub extra_args: Vec<String>,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            profile: YT_DLP_PROFILE.to_string(),
            executable: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Failed attempts after which a transient failure becomes final.
    pub retry_limit: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl RetrySettings {
    /// Delay before the next attempt, doubling per failure up to the cap.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        let delay = self.backoff_base_ms.saturating_mul(1_u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub max_backups: usize,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub downloader: DownloaderSettings,
    pub ffmpeg_path: Option<PathBuf>,
    /// Root for catalogue downloads; defaults to `<base>/downloads`.
    pub downloads_dir: Option<PathBuf>,
    pub default_limit: RateLimit,
    pub schedule: Vec<ScheduleRule>,
    pub early_stop: EarlyStopSettings,
    pub retry: RetrySettings,
    /// Silence from the downloader for this long counts as a stall. 0 disables.
    pub stall_timeout_secs: u64,
    pub cancel_grace_ms: u64,
    pub scheduler_tick_ms: u64,
    pub exit_rules: ExitRules,
    pub livestream: LivestreamSettings,
    pub persistence: PersistenceSettings,
    pub retention: RetentionPolicy,
    pub job_logs: JobLogRetentionPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            downloader: DownloaderSettings::default(),
            ffmpeg_path: None,
            downloads_dir: None,
            default_limit: RateLimit::default(),
            schedule: Vec::new(),
            early_stop: EarlyStopSettings::default(),
            retry: RetrySettings::default(),
            stall_timeout_secs: 600,
            cancel_grace_ms: 3_000,
            scheduler_tick_ms: 500,
            exit_rules: ExitRules::default(),
            livestream: LivestreamSettings::default(),
            persistence: PersistenceSettings::default(),
            retention: RetentionPolicy::default(),
            job_logs: JobLogRetentionPolicy::default(),
        }
    }
}

impl EngineSettings {
    pub fn downloads_dir(&self, paths: &AppPaths) -> PathBuf {
        self.downloads_dir
            .clone()
            .unwrap_or_else(|| paths.default_download_dir())
    }

    pub fn validate(&self, profiles: &ProfileRegistry) -> Result<()> {
        if self.downloader.profile.trim().is_empty() {
            return Err(EngineError::Config("downloader profile is empty".to_string()));
        }
        profiles.require(&self.downloader.profile)?;
        if self.default_limit.max_concurrent == 0 {
            return Err(EngineError::Config(
                "default_limit.max_concurrent must be at least 1".to_string(),
            ));
        }
        for rule in &self.schedule {
            rule.validate()?;
        }
        CompiledExitRules::compile(&self.exit_rules)?;
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return Err(EngineError::Config(
                "retry.backoff_base_ms exceeds retry.backoff_max_ms".to_string(),
            ));
        }
        if self.scheduler_tick_ms == 0 {
            return Err(EngineError::Config("scheduler_tick_ms must be positive".to_string()));
        }
        self.livestream.validate()?;
        Ok(())
    }
}

pub fn load_settings(paths: &AppPaths) -> Result<EngineSettings> {
    let path = paths.settings_path();
    if !path.exists() {
        return Ok(EngineSettings::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: EngineSettings = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::Config(format!(
            "failed to parse settings at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_settings(paths: &AppPaths, settings: &EngineSettings) -> Result<()> {
    let path = paths.settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults_and_save_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let loaded = load_settings(&paths).expect("defaults");
        assert_eq!(loaded, EngineSettings::default());

        let mut settings = EngineSettings::default();
        settings.retry.retry_limit = 7;
        settings.downloader.profile = "youtube-dl".to_string();
        save_settings(&paths, &settings).expect("save");

        let text = std::fs::read_to_string(paths.settings_path()).expect("read");
        assert!(text.ends_with("}\n"));
        assert_eq!(load_settings(&paths).expect("load"), settings);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.config_dir()).expect("config dir");
        std::fs::write(
            paths.settings_path(),
            r#"{"default_limit":{"max_concurrent":4},"retry":{"retry_limit":1}}"#,
        )
        .expect("write");

        let loaded = load_settings(&paths).expect("load");
        assert_eq!(loaded.default_limit.max_concurrent, 4);
        assert_eq!(loaded.retry.retry_limit, 1);
        assert_eq!(loaded.retry.backoff_base_ms, 2_000);
        assert_eq!(loaded.downloader.profile, "yt-dlp");

        std::fs::write(paths.settings_path(), "{not json").expect("write");
        assert!(matches!(load_settings(&paths), Err(EngineError::Config(_))));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let profiles = ProfileRegistry::default();
        assert!(EngineSettings::default().validate(&profiles).is_ok());

        let mut settings = EngineSettings::default();
        settings.default_limit.max_concurrent = 0;
        assert!(settings.validate(&profiles).is_err());

        let mut settings = EngineSettings::default();
        settings.downloader.profile = "aria".to_string();
        assert!(settings.validate(&profiles).is_err());

        let mut settings = EngineSettings::default();
        settings.exit_rules.transient_patterns.push("[".to_string());
        assert!(settings.validate(&profiles).is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetrySettings {
            retry_limit: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 350,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
        assert_eq!(retry.backoff(40), Duration::from_millis(350));
    }
}
