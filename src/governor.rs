//! Concurrency and bandwidth limits by time of day, plus the early-stop rule.

use crate::job::JobMode;
use crate::{EngineError, Result};
use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_concurrent: usize,
    /// Total budget shared by all running slots, in KiB/s.
    #[serde(default)]
    pub max_bandwidth_kib: Option<u64>,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_bandwidth_kib: None,
        }
    }
}

impl RateLimit {
    /// Cap for one more slot, given the caps of the slots already running.
    /// Uncapped running slots count as a full share. `Some(0)` means the
    /// budget is spent and nothing more may start.
    pub fn admission_bandwidth(&self, assigned: impl IntoIterator<Item = Option<u64>>) -> Option<u64> {
        let total = self.max_bandwidth_kib?;
        let share = (total / self.max_concurrent.max(1) as u64).max(1);
        let used: u64 = assigned.into_iter().map(|cap| cap.unwrap_or(share)).sum();
        Some(share.min(total.saturating_sub(used)))
    }
}

/// One user-ordered window. An empty `days` list matches every day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub limit: RateLimit,
}

impl ScheduleRule {
    pub fn matches(&self, now: NaiveDateTime) -> bool {
        let time = now.time();
        let today = now.weekday();
        if self.start < self.end {
            time >= self.start && time < self.end && self.day_allowed(today)
        } else if self.start > self.end {
            // Wraps midnight: the early-morning part belongs to yesterday's window.
            if time >= self.start {
                self.day_allowed(today)
            } else if time < self.end {
                self.day_allowed(today.pred())
            } else {
                false
            }
        } else {
            false
        }
    }

    fn day_allowed(&self, day: Weekday) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }

    pub fn validate(&self) -> Result<()> {
        if self.start == self.end {
            return Err(EngineError::Config(format!(
                "schedule rule {:?} has a zero-length window",
                self.name
            )));
        }
        if self.limit.max_concurrent == 0 {
            return Err(EngineError::Config(format!(
                "schedule rule {:?} allows zero concurrent jobs",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarlyStopSettings {
    pub enabled: bool,
    pub check_threshold: u32,
    pub download_threshold: u32,
}

impl Default for EarlyStopSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            check_threshold: 50,
            download_threshold: 50,
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
struct GovernorState {
    default_limit: RateLimit,
    rules: Vec<ScheduleRule>,
    early_stop: EarlyStopSettings,
}

pub struct Governor {
    clock: Arc<dyn Clock>,
    state: RwLock<GovernorState>,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("state", &*self.read())
            .finish_non_exhaustive()
    }
}

impl Governor {
    pub fn new(
        default_limit: RateLimit,
        rules: Vec<ScheduleRule>,
        early_stop: EarlyStopSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        validate_limit(&default_limit)?;
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self {
            clock,
            state: RwLock::new(GovernorState {
                default_limit,
                rules,
                early_stop,
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, GovernorState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, GovernorState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// First matching rule wins; no rule means the default.
    pub fn current_limit(&self, now: NaiveDateTime) -> RateLimit {
        let state = self.read();
        state
            .rules
            .iter()
            .find(|rule| rule.matches(now))
            .map(|rule| rule.limit)
            .unwrap_or(state.default_limit)
    }

    pub fn limit_now(&self) -> RateLimit {
        self.current_limit(self.clock.now())
    }

    /// Best effort: assumes the source lists newest items first.
    pub fn should_stop_early(&self, mode: JobMode, consecutive_known: u32) -> bool {
        let settings = self.read().early_stop;
        if !settings.enabled {
            return false;
        }
        let threshold = match mode {
            JobMode::Check => settings.check_threshold,
            JobMode::Download | JobMode::CustomDownload => settings.download_threshold,
            _ => return false,
        };
        threshold > 0 && consecutive_known >= threshold
    }

    pub fn replace_rules(&self, rules: Vec<ScheduleRule>) -> Result<()> {
        for rule in &rules {
            rule.validate()?;
        }
        self.write().rules = rules;
        Ok(())
    }

    pub fn set_default_limit(&self, limit: RateLimit) -> Result<()> {
        validate_limit(&limit)?;
        self.write().default_limit = limit;
        Ok(())
    }

    pub fn set_early_stop(&self, early_stop: EarlyStopSettings) {
        self.write().early_stop = early_stop;
    }

    pub fn rules(&self) -> Vec<ScheduleRule> {
        self.read().rules.clone()
    }
}

fn validate_limit(limit: &RateLimit) -> Result<()> {
    if limit.max_concurrent == 0 {
        return Err(EngineError::Config(
            "max_concurrent must be at least 1".to_string(),
        ));
    }
    Ok(())
}
