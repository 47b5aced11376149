use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tubekeep_engine::catalogue::{NewNode, NodeId, NodeKind, OptionValue, OptionsSet};
use tubekeep_engine::logging::{init_tracing, DEFAULT_LOG_FILTER};
use tubekeep_engine::operation::{OperationEvent, OperationObserver};
use tubekeep_engine::paths::AppPaths;
use tubekeep_engine::{OperationKind, OperationManager, TargetSet};

struct Args {
    command: String,
    base_dir: Option<PathBuf>,
    nodes: Vec<NodeId>,
    urls: Vec<String>,
    all: bool,
    dest: Option<PathBuf>,
    options: Vec<(String, OptionValue)>,
    limit: usize,
    operation: Option<String>,
    kind: Option<NodeKind>,
    name: Option<String>,
    parent: Option<NodeId>,
    watch_secs: Option<u64>,
    quiet: bool,
}

fn main() -> Result<(), String> {
    let raw: Vec<String> = std::env::args().collect();

    if raw.len() < 2 || raw.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }
    let args = parse_args(&raw)?;

    let base_dir = args
        .base_dir
        .clone()
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;
    let _log_guard = init_tracing(&paths, DEFAULT_LOG_FILTER).map_err(|e| e.to_string())?;

    match args.command.as_str() {
        "integrity" => return integrity(&paths),
        "history" => return history(&paths, &args),
        "watch" => return watch(paths, &args),
        _ => {}
    }

    let manager = OperationManager::open(paths).map_err(|e| e.to_string())?;
    let result = match args.command.as_str() {
        "check" => run(&manager, OperationKind::Check, &args),
        "download" => {
            let kind = if args.options.is_empty() {
                OperationKind::Download
            } else {
                OperationKind::CustomDownload
            };
            run(&manager, kind, &args)
        }
        "livestreams" => run(&manager, OperationKind::LivestreamCheck, &args),
        "refresh" => run(&manager, OperationKind::Refresh, &args),
        "tidy" => run(&manager, OperationKind::Tidy, &args),
        "process" => run(&manager, OperationKind::Process, &args),
        "repair" => repair(&manager),
        "add" => add(&manager, &args),
        "list" => list(&manager),
        other => Err(format!("unknown command: {other} (try --help)")),
    };
    manager.shutdown(Duration::from_secs(10));
    result
}

fn parse_args(raw: &[String]) -> Result<Args, String> {
    let mut args = Args {
        command: raw[1].clone(),
        base_dir: None,
        nodes: Vec::new(),
        urls: Vec::new(),
        all: false,
        dest: None,
        options: Vec::new(),
        limit: 20,
        operation: None,
        kind: None,
        name: None,
        parent: None,
        watch_secs: None,
        quiet: false,
    };

    let mut i = 2;
    while i < raw.len() {
        match raw[i].as_str() {
            "--base-dir" => args.base_dir = Some(PathBuf::from(take_value(raw, &mut i, "--base-dir")?)),
            "--node" => {
                let v = take_value(raw, &mut i, "--node")?;
                args.nodes
                    .push(v.parse().map_err(|_| format!("invalid node id: {v}"))?);
            }
            "--url" => args.urls.push(take_value(raw, &mut i, "--url")?),
            "--all" => args.all = true,
            "--dest" => args.dest = Some(PathBuf::from(take_value(raw, &mut i, "--dest")?)),
            "--set" => {
                let v = take_value(raw, &mut i, "--set")?;
                let (key, val) = v
                    .split_once('=')
                    .ok_or_else(|| format!("--set expects key=value, got {v}"))?;
                args.options.push((key.trim().to_string(), parse_option_value(val)));
            }
            "--limit" => {
                let v = take_value(raw, &mut i, "--limit")?;
                args.limit = v.parse().map_err(|_| format!("invalid limit: {v}"))?;
            }
            "--op" => args.operation = Some(take_value(raw, &mut i, "--op")?),
            "--kind" => {
                let v = take_value(raw, &mut i, "--kind")?;
                args.kind = Some(NodeKind::from_str(&v).ok_or_else(|| format!("unknown kind: {v}"))?);
            }
            "--name" => args.name = Some(take_value(raw, &mut i, "--name")?),
            "--parent" => {
                let v = take_value(raw, &mut i, "--parent")?;
                args.parent = Some(v.parse().map_err(|_| format!("invalid node id: {v}"))?);
            }
            "--for" => {
                let v = take_value(raw, &mut i, "--for")?;
                args.watch_secs = Some(v.parse().map_err(|_| format!("invalid duration: {v}"))?);
            }
            "--quiet" | "-q" => args.quiet = true,
            other => return Err(format!("unknown arg: {other} (try --help)")),
        }
        i += 1;
    }
    Ok(args)
}

fn take_value(raw: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    raw.get(*i)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_option_value(raw: &str) -> OptionValue {
    let raw = raw.trim();
    match raw {
        "true" | "yes" => OptionValue::Flag(true),
        "false" | "no" => OptionValue::Flag(false),
        _ => match raw.parse::<i64>() {
            Ok(n) => OptionValue::Number(n),
            Err(_) => OptionValue::Text(raw.to_string()),
        },
    }
}

struct PrintObserver;

impl OperationObserver for PrintObserver {
    fn on_event(&self, operation_id: &str, event: &OperationEvent) {
        let short = &operation_id[..8.min(operation_id.len())];
        match event {
            OperationEvent::PhaseChanged(phase) => println!("[{short}] phase: {phase:?}"),
            OperationEvent::ProgressTick { job_id, percent } => {
                println!("[{short}] {} {percent:.1}%", &job_id[..8.min(job_id.len())])
            }
            OperationEvent::JobFinished { job_id, state } => {
                println!("[{short}] job {} {}", &job_id[..8.min(job_id.len())], state.as_str())
            }
            OperationEvent::NodeUpdated(id) => println!("[{short}] node {id} updated"),
            OperationEvent::LivestreamLive(id) => println!("[{short}] livestream {id} is live"),
            OperationEvent::Finished(_) => {}
        }
    }
}

fn watch(paths: AppPaths, args: &Args) -> Result<(), String> {
    let manager = OperationManager::builder(paths)
        .observer(Arc::new(PrintObserver))
        .livestream_poller(true)
        .open()
        .map_err(|e| e.to_string())?;
    if !manager.settings().livestream.enabled {
        manager.shutdown(Duration::from_secs(10));
        return Err("livestream polling is disabled in settings".to_string());
    }

    println!("watching livestreams (Ctrl-C to stop)");
    let started = Instant::now();
    while args
        .watch_secs
        .map_or(true, |secs| started.elapsed() < Duration::from_secs(secs))
    {
        std::thread::sleep(Duration::from_millis(500));
    }
    manager.shutdown(Duration::from_secs(10));
    Ok(())
}

fn run(manager: &OperationManager, kind: OperationKind, args: &Args) -> Result<(), String> {
    let targets = if !args.urls.is_empty() {
        TargetSet::Urls {
            urls: args.urls.clone(),
            destination: args.dest.clone(),
        }
    } else if !args.nodes.is_empty() {
        TargetSet::Nodes {
            ids: args.nodes.clone(),
        }
    } else if args.all || kind == OperationKind::LivestreamCheck {
        TargetSet::All
    } else {
        return Err("pass --node <id>, --url <url> or --all".to_string());
    };

    let options = if args.options.is_empty() {
        None
    } else {
        let mut set = OptionsSet::new("cli");
        for (key, value) in &args.options {
            set = set.with(key, value.clone());
        }
        Some(set)
    };

    let handle = if args.quiet {
        manager.start_operation(kind, targets, options)
    } else {
        manager.start_operation_with_observer(kind, targets, options, Arc::new(PrintObserver))
    }
    .map_err(|e| e.to_string())?;

    let summary = handle.wait();
    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    println!("{json}");
    if manager.has_uncommitted_results() {
        eprintln!("catalogue commit failed; retrying once");
        manager.retry_commit().map_err(|e| e.to_string())?;
    }
    if summary.counts.failed > 0 {
        return Err(format!("{} job(s) failed", summary.counts.failed));
    }
    Ok(())
}

fn integrity(paths: &AppPaths) -> Result<(), String> {
    let guard = tubekeep_engine::persist::PersistenceGuard::new(
        paths.clone(),
        tubekeep_engine::persist::DEFAULT_MAX_BACKUPS,
    );
    match guard.check_integrity() {
        Ok(report) => {
            let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
            println!("{json}");
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    }
}

fn repair(manager: &OperationManager) -> Result<(), String> {
    let report = manager.repair_catalogue().map_err(|e| e.to_string())?;
    for fixed in &report.fixed {
        println!("fixed: {fixed}");
    }
    for remaining in &report.remaining {
        println!("remaining: {remaining}");
    }
    if report.fixed.is_empty() && report.remaining.is_empty() {
        println!("catalogue is healthy");
    }
    Ok(())
}

fn add(manager: &OperationManager, args: &Args) -> Result<(), String> {
    let kind = args.kind.ok_or_else(|| "--kind is required".to_string())?;
    let name = args
        .name
        .clone()
        .ok_or_else(|| "--name is required".to_string())?;
    let id = manager
        .edit_catalogue(|cat| {
            cat.add_node(NewNode {
                kind,
                name,
                parent: args.parent,
                source_url: args.urls.first().cloned(),
            })
        })
        .map_err(|e| e.to_string())?;
    println!("{id}");
    Ok(())
}

fn list(manager: &OperationManager) -> Result<(), String> {
    manager.catalogue().read(|cat| {
        let mut stack: Vec<(NodeId, usize)> = cat.roots().iter().rev().map(|id| (*id, 0)).collect();
        while let Some((id, depth)) = stack.pop() {
            let Some(node) = cat.node(id) else {
                continue;
            };
            let mut marks = String::new();
            if node.is_downloaded() {
                marks.push_str(" [downloaded]");
            }
            if node.flags.failed {
                marks.push_str(" [failed]");
            }
            if node.flags.missing {
                marks.push_str(" [missing]");
            }
            if node.livestream.is_pending() {
                marks.push_str(&format!(" [{:?}]", node.livestream));
            }
            println!(
                "{}{} {} {}{}",
                "  ".repeat(depth),
                node.id,
                node.kind.as_str(),
                node.name,
                marks
            );
            for child in node.children.iter().rev() {
                stack.push((*child, depth + 1));
            }
        }
    });
    Ok(())
}

fn history(paths: &AppPaths, args: &Args) -> Result<(), String> {
    let history = tubekeep_engine::history::History::open(paths).map_err(|e| e.to_string())?;
    if let Some(id) = &args.operation {
        let run = history
            .get_operation(id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no operation {id}"))?;
        let jobs = history.list_job_results(id).map_err(|e| e.to_string())?;
        let json = serde_json::to_string_pretty(&serde_json::json!({ "operation": run, "jobs": jobs }))
            .map_err(|e| e.to_string())?;
        println!("{json}");
        return Ok(());
    }
    for run in history.list_operations(args.limit, 0).map_err(|e| e.to_string())? {
        println!(
            "{} {:<16} {:<14} ok={} failed={} skipped={} cancelled={}",
            run.id, run.kind, run.status, run.succeeded, run.failed, run.skipped, run.cancelled
        );
    }
    Ok(())
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("TUBEKEEP_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("tubekeep"));
            }
        }
    }

    std::env::var("HOME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".local").join("share").join("tubekeep"))
}

fn print_help() {
    println!(
        r#"tubekeep

Checks and downloads channels, playlists and videos kept in a local catalogue.

Usage:
  tubekeep check --all
  tubekeep download --node 12
  tubekeep download --url https://example.com/watch?v=abc --dest ./out
  tubekeep download --node 12 --set format=bestaudio --set embed_thumbnail=true
  tubekeep add --kind channel --name "Some Channel" --url https://example.com/@some

Commands:
  check         List sources and record new items
  download      Download targets (custom download when --set is given)
  livestreams   Probe waiting and live streams once
  watch         Keep probing livestreams in the background (--for <secs> to stop)
  refresh       Re-link media files on disk, flag vanished ones as missing
  tidy          Remove partial downloads and apply retention
  process       Run ffmpeg post-processing on downloaded videos
  integrity     Validate the catalogue file on disk
  repair        Fix structural problems in the catalogue
  history       Show recent operations (--op <id> for one run)
  add           Add a channel, playlist, video or folder
  list          Print the catalogue tree

Options:
  --base-dir <path>   Override base dir (default: $TUBEKEEP_BASE_DIR or ~/.local/share/tubekeep)
  --node <id>         Target node (repeatable)
  --url <url>         Bare URL target (repeatable); source URL for add
  --all               Every root node
  --dest <path>       Destination for bare URL downloads
  --set <key=value>   Options override (repeatable)
  --limit <n>         Rows for history (default 20)
  --op <id>           Operation id for history
  --kind <kind>       Node kind for add (video, channel, playlist, folder)
  --name <name>       Node name for add
  --parent <id>       Parent node for add
  --for <secs>        How long watch runs (default: until interrupted)
  -q, --quiet         Only print the final summary
"#
    );
}
