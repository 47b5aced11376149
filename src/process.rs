//! One external downloader process per job attempt.
//!
//! Each pipe gets a blocking reader thread and a waiter thread polls for exit;
//! all three feed a single channel so per-stream order is kept.

use crate::catalogue::DiscoveredItem;
use crate::cmd;
use crate::profile::{DownloaderProfile, LineParse};
use crate::{EngineError, Result};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAIT_POLL_INTERVAL_MS: u64 = 50;
const STDERR_TAIL_LINES: usize = 40;
/// Longest line handed to the profile. Info JSON lines run to a few hundred KiB.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;
/// How long to wait for pipes held open by grandchildren after the process exits.
const PIPE_LINGER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress {
        percent: f64,
        speed_bps: Option<f64>,
        eta_secs: Option<u64>,
    },
    ItemDiscovered(DiscoveredItem),
    Warning(String),
    Error(String),
    /// Always the last event. `None` when the process died from a signal.
    Finished { code: Option<i32> },
}

pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Time between the polite terminate request and the hard kill.
    pub grace: Duration,
    pub profile: Arc<dyn DownloaderProfile>,
}

enum Msg {
    Line {
        stream: StreamKind,
        text: String,
        parsed: LineParse,
    },
    Closed,
    Exited(Option<i32>),
}

pub struct ProcessWrapper;

impl ProcessWrapper {
    pub fn start(spec: LaunchSpec) -> Result<ProcessHandle> {
        let program = spec.program.to_string_lossy().to_string();
        let mut command = cmd::command(&spec.program);
        command
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
                tool: program.clone(),
            },
            _ => EngineError::Launch {
                program: program.clone(),
                reason: e.to_string(),
            },
        })?;

        let pid = child.id();
        let (tx, rx) = mpsc::channel::<Msg>();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut open_streams = 0_u8;
        if let Some(pipe) = stdout {
            spawn_reader(pipe, StreamKind::Stdout, spec.profile.clone(), tx.clone());
            open_streams += 1;
        }
        if let Some(pipe) = stderr {
            spawn_reader(pipe, StreamKind::Stderr, spec.profile.clone(), tx.clone());
            open_streams += 1;
        }

        let shared = Arc::new(CancelShared {
            pid,
            requested_at: Mutex::new(None),
            exited: AtomicBool::new(false),
        });
        let waiter_shared = shared.clone();
        let grace = spec.grace;
        thread::spawn(move || {
            let mut killed = false;
            let code = loop {
                match child.try_wait() {
                    Ok(Some(status)) => break status.code(),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(pid, error = %err, "waiting on downloader failed");
                        cmd::kill_child_process_tree(&mut child);
                        break None;
                    }
                }
                if !killed {
                    if let Some(at) = waiter_shared.requested_at() {
                        if at.elapsed() >= grace {
                            tracing::debug!(pid, "grace period over, killing downloader");
                            cmd::kill_child_process_tree(&mut child);
                            killed = true;
                        }
                    }
                }
                thread::sleep(Duration::from_millis(WAIT_POLL_INTERVAL_MS));
            };
            waiter_shared.exited.store(true, Ordering::SeqCst);
            let _ = tx.send(Msg::Exited(code));
        });

        tracing::debug!(pid, program = %program, "downloader started");
        Ok(ProcessHandle {
            pid,
            rx,
            open_streams,
            canceller: ProcessCanceller { shared },
        })
    }
}

fn spawn_reader(
    pipe: impl Read + Send + 'static,
    stream: StreamKind,
    profile: Arc<dyn DownloaderProfile>,
    tx: Sender<Msg>,
) {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match read_capped_line(&mut reader, &mut buf, MAX_LINE_BYTES) {
                Ok((0, _)) => break,
                Ok((_, truncated)) => {
                    if truncated {
                        tracing::warn!(
                            stream = stream.as_str(),
                            max_bytes = MAX_LINE_BYTES,
                            "downloader output line too long, truncated"
                        );
                    }
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    let parsed = profile.parse_line(stream, &text);
                    if tx.send(Msg::Line { stream, text, parsed }).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = tx.send(Msg::Closed);
    });
}

/// Reads one line into `buf`, keeping at most `max` bytes and discarding the
/// rest of that line. Returns the bytes consumed and whether anything was cut.
fn read_capped_line(
    reader: &mut impl BufRead,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<(usize, bool)> {
    let read = reader.by_ref().take(max as u64).read_until(b'\n', buf)?;
    if read < max || buf.last() == Some(&b'\n') {
        return Ok((read, false));
    }
    let mut dropped = 0;
    let mut newline = 0;
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            break;
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                dropped += pos;
                newline = 1;
                break;
            }
            None => {
                let len = available.len();
                reader.consume(len);
                dropped += len;
            }
        }
    }
    Ok((read + dropped + newline, dropped > 0))
}

struct CancelShared {
    pid: u32,
    requested_at: Mutex<Option<Instant>>,
    exited: AtomicBool,
}

impl CancelShared {
    fn requested_at(&self) -> Option<Instant> {
        *self.requested_at.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Idempotent cancel: terminate politely, then kill once the grace period ends.
#[derive(Clone)]
pub struct ProcessCanceller {
    shared: Arc<CancelShared>,
}

impl ProcessCanceller {
    /// Returns true only for the call that actually sent the request.
    pub fn cancel(&self) -> bool {
        if self.shared.exited.load(Ordering::SeqCst) {
            return false;
        }
        {
            let mut requested = self
                .shared
                .requested_at
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if requested.is_some() {
                return false;
            }
            *requested = Some(Instant::now());
        }
        if !cmd::request_terminate(self.shared.pid) {
            tracing::debug!(pid = self.shared.pid, "terminate request failed, waiting for hard kill");
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.requested_at().is_some()
    }
}

pub struct ProcessHandle {
    pid: u32,
    rx: Receiver<Msg>,
    open_streams: u8,
    canceller: ProcessCanceller,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn canceller(&self) -> ProcessCanceller {
        self.canceller.clone()
    }

    /// Single pass: the stream cannot be restarted once consumed.
    pub fn events(self) -> EventStream {
        EventStream {
            rx: self.rx,
            open_streams: self.open_streams,
            exit: None,
            exited_at: None,
            finished: false,
            stderr_tail: VecDeque::new(),
            line_hook: None,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum NextEvent {
    Event(ProgressEvent),
    Timeout,
    End,
}

type LineHook = Box<dyn FnMut(StreamKind, &str) + Send>;

pub struct EventStream {
    rx: Receiver<Msg>,
    open_streams: u8,
    exit: Option<Option<i32>>,
    exited_at: Option<Instant>,
    finished: bool,
    stderr_tail: VecDeque<String>,
    line_hook: Option<LineHook>,
}

impl EventStream {
    /// Sees every raw line, recognised or not.
    pub fn with_line_hook(mut self, hook: impl FnMut(StreamKind, &str) + Send + 'static) -> Self {
        self.line_hook = Some(Box::new(hook));
        self
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.iter().cloned().collect()
    }

    fn ready_to_finish(&self) -> Option<Option<i32>> {
        let code = self.exit?;
        let drained = self.open_streams == 0;
        let lingered = self.exited_at.is_some_and(|at| at.elapsed() >= PIPE_LINGER);
        if drained || lingered {
            Some(code)
        } else {
            None
        }
    }

    /// Waits up to `timeout` for the next event.
    pub fn next_timeout(&mut self, timeout: Duration) -> NextEvent {
        if self.finished {
            return NextEvent::End;
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.ready_to_finish() {
                self.finished = true;
                return NextEvent::Event(ProgressEvent::Finished { code });
            }

            let now = Instant::now();
            let mut wait = deadline.saturating_duration_since(now);
            if let Some(at) = self.exited_at {
                wait = wait.min(PIPE_LINGER.saturating_sub(at.elapsed()));
            }

            match self.rx.recv_timeout(wait) {
                Ok(Msg::Line { stream, text, parsed }) => {
                    if stream == StreamKind::Stderr {
                        self.stderr_tail.push_back(text.clone());
                        if self.stderr_tail.len() > STDERR_TAIL_LINES {
                            self.stderr_tail.pop_front();
                        }
                    }
                    if let Some(hook) = self.line_hook.as_mut() {
                        hook(stream, &text);
                    }
                    match parsed {
                        LineParse::Event(event) => return NextEvent::Event(event),
                        LineParse::Ignored => {}
                        LineParse::Anomaly => {
                            tracing::trace!(stream = stream.as_str(), line = %text, "unrecognised downloader output");
                        }
                    }
                }
                Ok(Msg::Closed) => {
                    self.open_streams = self.open_streams.saturating_sub(1);
                }
                Ok(Msg::Exited(code)) => {
                    self.exit = Some(code);
                    self.exited_at = Some(Instant::now());
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.exit.is_none() && Instant::now() >= deadline {
                        return NextEvent::Timeout;
                    }
                    if self.exit.is_some() && self.ready_to_finish().is_none() && Instant::now() >= deadline {
                        return NextEvent::Timeout;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if self.exit.is_none() {
                        self.exit = Some(None);
                    }
                    self.open_streams = 0;
                }
            }
        }
    }
}

impl Iterator for EventStream {
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.next_timeout(Duration::from_secs(3600)) {
                NextEvent::Event(event) => return Some(event),
                NextEvent::Timeout => continue,
                NextEvent::End => return None,
            }
        }
    }
}
