//! Recurring status probes for livestreams that have not finished yet.

use crate::catalogue::{now_ms, Catalogue, LivestreamState, NodeId};
use crate::manager::EngineCore;
use crate::operation::{OperationEvent, OperationKind, OperationSummary, TargetSet};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivestreamActions {
    /// Emit `OperationEvent::LivestreamLive` to the observer.
    pub notify: bool,
    /// Start a Download operation for streams that went live.
    pub auto_download: bool,
}

impl Default for LivestreamActions {
    fn default() -> Self {
        Self {
            notify: true,
            auto_download: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivestreamSettings {
    pub enabled: bool,
    pub default_interval_secs: u64,
    pub waiting_interval_secs: u64,
    pub live_interval_secs: u64,
    /// A waiting stream scheduled within this window counts as imminent.
    pub imminent_window_secs: u64,
    pub actions: LivestreamActions,
}

impl Default for LivestreamSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_interval_secs: 900,
            waiting_interval_secs: 120,
            live_interval_secs: 60,
            imminent_window_secs: 1_800,
            actions: LivestreamActions::default(),
        }
    }
}

impl LivestreamSettings {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("default_interval_secs", self.default_interval_secs),
            ("waiting_interval_secs", self.waiting_interval_secs),
            ("live_interval_secs", self.live_interval_secs),
        ] {
            if value == 0 {
                return Err(EngineError::Config(format!(
                    "livestream.{name} must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Time until the next probe round given the current catalogue.
    pub fn next_interval(&self, catalogue: &Catalogue, now_ms: i64) -> Duration {
        let window_ms = i64::try_from(self.imminent_window_secs.saturating_mul(1_000)).unwrap_or(i64::MAX);
        let mut imminent = false;
        for id in catalogue.pending_livestreams() {
            let Some(node) = catalogue.node(id) else {
                continue;
            };
            match node.livestream {
                LivestreamState::LiveNow => return Duration::from_secs(self.live_interval_secs),
                LivestreamState::Waiting => {
                    if let Some(at) = node.livestream_scheduled_at_ms {
                        if at.saturating_sub(now_ms) <= window_ms {
                            imminent = true;
                        }
                    }
                }
                _ => {}
            }
        }
        if imminent {
            Duration::from_secs(self.waiting_interval_secs)
        } else {
            Duration::from_secs(self.default_interval_secs)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivestreamTransition {
    pub node: NodeId,
    pub from: LivestreamState,
    pub to: LivestreamState,
}

/// What one probe round found.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub summary: OperationSummary,
    pub transitions: Vec<LivestreamTransition>,
    /// Download operation started for streams that went live, if any.
    pub auto_download: Option<String>,
}

impl PollOutcome {
    pub fn went_live(&self) -> Vec<NodeId> {
        self.transitions
            .iter()
            .filter(|t| t.to == LivestreamState::LiveNow)
            .map(|t| t.node)
            .collect()
    }

    pub fn ended(&self) -> Vec<NodeId> {
        self.transitions
            .iter()
            .filter(|t| !t.to.is_pending())
            .map(|t| t.node)
            .collect()
    }
}

fn pending_states(catalogue: &Catalogue) -> HashMap<NodeId, LivestreamState> {
    catalogue
        .pending_livestreams()
        .into_iter()
        .filter_map(|id| catalogue.node(id).map(|n| (id, n.livestream)))
        .collect()
}

pub(crate) fn transitions(
    before: &HashMap<NodeId, LivestreamState>,
    catalogue: &Catalogue,
) -> Vec<LivestreamTransition> {
    let mut out: Vec<LivestreamTransition> = before
        .iter()
        .filter_map(|(&node, &from)| {
            // A deleted node has left the active set as well.
            let to = catalogue
                .node(node)
                .map_or(LivestreamState::Finished, |n| n.livestream);
            (to != from).then_some(LivestreamTransition { node, from, to })
        })
        .collect();
    out.sort_by_key(|t| t.node);
    out
}

/// Runs one probe round through the shared pool and acts on what changed.
/// Returns `None` when nothing is being watched.
pub(crate) fn poll_once(core: &Arc<EngineCore>) -> Result<Option<PollOutcome>> {
    let before = core.catalogue.read(pending_states);
    if before.is_empty() {
        return Ok(None);
    }

    let handle = core.start_operation(OperationKind::LivestreamCheck, TargetSet::All, None, None)?;
    let summary = handle.wait();
    let changes = core.catalogue.read(|c| transitions(&before, c));
    let actions = core.settings().livestream.actions;

    let mut live = Vec::new();
    for change in &changes {
        match change.to {
            LivestreamState::LiveNow => {
                tracing::info!(node_id = change.node, "livestream went live");
                if actions.notify {
                    core.observer
                        .on_event(handle.id(), &OperationEvent::LivestreamLive(change.node));
                }
                live.push(change.node);
            }
            to if !to.is_pending() => {
                tracing::info!(node_id = change.node, state = ?to, "livestream no longer watched");
            }
            _ => {}
        }
    }

    let mut auto_download = None;
    if actions.auto_download && !live.is_empty() {
        match core.start_operation(
            OperationKind::Download,
            TargetSet::Nodes { ids: live },
            None,
            None,
        ) {
            Ok(download) => auto_download = Some(download.id().to_string()),
            Err(err) => tracing::warn!(error = %err, "automatic livestream download not started"),
        }
    }

    Ok(Some(PollOutcome {
        summary,
        transitions: changes,
        auto_download,
    }))
}

struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background thread that keeps probing watched livestreams.
pub struct LivestreamPoller {
    stop: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LivestreamPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivestreamPoller")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl LivestreamPoller {
    pub(crate) fn start(core: Weak<EngineCore>) -> Result<Self> {
        let stop = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let signal = stop.clone();
        let thread = thread::Builder::new()
            .name("livestream-poller".to_string())
            .spawn(move || poller_loop(core, &signal))?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Tells the loop to end after the current round without waiting.
    pub fn request_stop(&self) {
        *self.stop.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.stop.wake.notify_all();
    }

    /// Ends the loop; a round in flight finishes first.
    pub fn stop(&mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for LivestreamPoller {
    fn drop(&mut self) {
        self.request_stop();
    }
}

fn poller_loop(core: Weak<EngineCore>, signal: &StopSignal) {
    tracing::debug!("livestream poller started");
    loop {
        let interval = match core.upgrade() {
            Some(core) => {
                let settings = core.settings().livestream;
                core.catalogue.read(|c| settings.next_interval(c, now_ms()))
            }
            None => break,
        };

        {
            let mut stopped = signal.stopped.lock().unwrap_or_else(|e| e.into_inner());
            if !*stopped {
                stopped = signal
                    .wake
                    .wait_timeout(stopped, interval)
                    .map(|(g, _)| g)
                    .unwrap_or_else(|e| e.into_inner().0);
            }
            if *stopped {
                break;
            }
        }

        let Some(core) = core.upgrade() else {
            break;
        };
        if !core.settings().livestream.enabled {
            continue;
        }
        match poll_once(&core) {
            Ok(Some(outcome)) => tracing::debug!(
                operation_id = %outcome.summary.operation_id,
                changes = outcome.transitions.len(),
                "livestream round finished"
            ),
            Ok(None) => {}
            Err(EngineError::Shutdown) => break,
            Err(err) => tracing::warn!(error = %err, "livestream round failed"),
        }
    }
    tracing::debug!("livestream poller stopped");
}
