//! scrumsync operator CLI.
//!
//! Inspects and edits the persisted change queue, and runs an offline/online
//! scenario against an in-memory remote.
//!
//! ## Usage
//!
//! ```bash
//! scrumsync status
//! scrumsync list --json
//! scrumsync enqueue task t-1 create --payload '{"title": "Write docs"}'
//! scrumsync export > queue.json
//! scrumsync import queue.json
//! scrumsync clear
//! scrumsync simulate --flaky 2 --conflict
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use tracing::info;

use scrumsync_client::{ConnectivityMonitor, DrainMode, InMemoryRemote, SyncService};
use scrumsync_core::{
    ChangeLog, EntityKey, EntityType, KvStore, MemoryStore, Operation, PendingChange,
    RemoteError, Side, SqliteStore, SyncConfig, SyncStatus, Task, TaskList,
};

/// How long `simulate` waits for the queue to settle.
const SIMULATE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "scrumsync")]
#[command(about = "Inspect and drive the scrumsync offline change queue")]
struct Args {
    /// SQLite database holding the queue
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// RON file with sync settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Summarize the persisted queue
    Status,
    /// Print every pending change in drain order
    List {
        /// Print the raw JSON entries
        #[arg(long)]
        json: bool,
    },
    /// Queue a mutation
    Enqueue {
        entity_type: EntityType,
        id: String,
        operation: Operation,
        /// Entity snapshot as JSON (ignored for deletes)
        #[arg(long)]
        payload: Option<String>,
        /// Remote version the mutation is based on
        #[arg(long)]
        base_version: Option<u64>,
    },
    /// Write the queue as JSON to stdout
    Export,
    /// Replace the queue with an exported one
    Import { file: PathBuf },
    /// Discard every pending change
    Clear,
    /// Queue changes offline, reconnect, and watch them drain
    Simulate {
        #[arg(long, value_enum, default_value_t = Mode::Worker)]
        mode: Mode,
        /// Transient failures injected before the first task goes through
        #[arg(long, default_value_t = 0)]
        flaky: usize,
        /// Also queue an update that conflicts with a remote edit
        #[arg(long)]
        conflict: bool,
        /// Side kept when resolving the conflict
        #[arg(long, value_enum, default_value_t = Keep::Local)]
        keep: Keep,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Worker,
    Inline,
}

impl From<Mode> for DrainMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Worker => DrainMode::Worker,
            Mode::Inline => DrainMode::Inline,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Keep {
    Local,
    Remote,
}

impl From<Keep> for Side {
    fn from(keep: Keep) -> Self {
        match keep {
            Keep::Local => Side::Local,
            Keep::Remote => Side::Remote,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _telemetry = scrumsync_telemetry::init_tracing("scrumsync-cli", "info");

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    let db = args.db.unwrap_or_else(SqliteStore::default_path);
    match args.command {
        Command::Status => with_log(&db, &config, |log| cmd_status(log, &db)),
        Command::List { json } => with_log(&db, &config, |log| cmd_list(log, json)),
        Command::Enqueue { entity_type, id, operation, payload, base_version } => {
            with_log(&db, &config, |log| {
                cmd_enqueue(log, entity_type, id, operation, payload, base_version)
            })
        }
        Command::Export => with_log(&db, &config, |log| {
            println!("{}", log.export_json());
            Ok(())
        }),
        Command::Import { file } => with_log(&db, &config, |log| cmd_import(log, &file)),
        Command::Clear => with_log(&db, &config, |log| {
            let n = log.len();
            log.clear();
            println!("Cleared {n} pending change(s)");
            Ok(())
        }),
        Command::Simulate { mode, flaky, conflict, keep } => {
            simulate(config, mode.into(), flaky, conflict, keep.into()).await
        }
    }
}

/// Open the persisted queue, run `f` on it, and fail if a write was lost.
fn with_log<F>(db: &Path, config: &SyncConfig, f: F) -> Result<()>
where
    F: FnOnce(&mut ChangeLog) -> Result<()>,
{
    let store: Arc<dyn KvStore> =
        Arc::new(SqliteStore::open(db).with_context(|| format!("opening {}", db.display()))?);
    let mut log = ChangeLog::load(store, config.storage_key.clone());
    f(&mut log)?;
    if let Some(err) = log.persistence_error() {
        bail!("queue not persisted: {err}");
    }
    Ok(())
}

// ============================================================================
// Queue commands
// ============================================================================

fn sorted(log: &ChangeLog) -> Vec<PendingChange> {
    let mut changes = log.all();
    changes.sort_by_key(PendingChange::drain_order);
    changes
}

fn cmd_status(log: &ChangeLog, db: &Path) -> Result<()> {
    println!("Database:   {}", db.display());
    println!("Pending:    {}", log.len());
    println!("Conflicted: {}", log.awaiting_resolution());

    let changes = log.all();
    for op in [Operation::Create, Operation::Update, Operation::Complete, Operation::Delete] {
        let n = changes.iter().filter(|c| c.operation == op).count();
        if n > 0 {
            println!("  {op:<9} {n}");
        }
    }
    if let Some(retrying) = changes.iter().map(|c| c.attempts).max().filter(|a| *a > 0) {
        println!("Most attempts on one change: {retrying}");
    }
    Ok(())
}

fn cmd_list(log: &ChangeLog, as_json: bool) -> Result<()> {
    let changes = sorted(log);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&changes)?);
        return Ok(());
    }
    if changes.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    for c in changes {
        let flag = if c.awaiting_resolution { " [conflict]" } else { "" };
        println!(
            "{:>4}  {:<8} {:<20} attempts={}{}",
            c.seq,
            c.operation,
            c.key(),
            c.attempts,
            flag
        );
    }
    Ok(())
}

fn cmd_enqueue(
    log: &mut ChangeLog,
    entity_type: EntityType,
    id: String,
    operation: Operation,
    payload: Option<String>,
    base_version: Option<u64>,
) -> Result<()> {
    let payload = payload
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .context("payload is not valid JSON")?;
    if operation.has_payload() && payload.is_none() {
        bail!("{operation} needs --payload");
    }

    let mut change = PendingChange::new(entity_type, id, operation, payload);
    change.base_version = base_version;
    let key = change.key();
    let outcome = log.enqueue(change);
    println!("{key}: {outcome:?} ({} pending)", log.len());
    Ok(())
}

fn cmd_import(log: &mut ChangeLog, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let n = log.import_json(&raw).context("import rejected")?;
    println!("Imported {n} pending change(s)");
    Ok(())
}

// ============================================================================
// Simulation
// ============================================================================

/// Offline edits, reconnect, drain. Runs against an in-memory store and
/// remote, so the persisted queue is never touched.
async fn simulate(
    mut config: SyncConfig,
    mode: DrainMode,
    flaky: usize,
    conflict: bool,
    keep: Side,
) -> Result<()> {
    // Keep the scenario to a few seconds.
    config.initial_backoff_ms = config.initial_backoff_ms.min(200);
    config.sync_interval_ms = config.sync_interval_ms.min(250);
    config.connectivity_debounce_ms = config.connectivity_debounce_ms.min(300);

    let remote = Arc::new(InMemoryRemote::new());
    let monitor = ConnectivityMonitor::new(false);
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let service = SyncService::start(config, store, remote.clone(), monitor.clone(), mode)?;

    info!("Offline: queueing changes");
    let mut task = Task::new("t-1", "Draft sprint goals");
    service.enqueue_entity(&task, Operation::Create)?;
    task.title = "Draft sprint goals for Q3".into();
    service.enqueue_entity(&task, Operation::Update)?;

    let scratch = Task::new("t-2", "Scratch");
    service.enqueue_entity(&scratch, Operation::Create)?;
    service.enqueue_entity(&scratch, Operation::Delete)?;

    let list = TaskList {
        id: "l-1".into(),
        name: "Backlog".into(),
        position: 0,
        task_count: 0,
        updated_at: 0,
    };
    service.enqueue_entity(&list, Operation::Create)?;

    if flaky > 0 {
        remote.fail_key(
            EntityKey::new(EntityType::Task, "t-1"),
            RemoteError::Transient("503 Service Unavailable".into()),
            flaky,
        );
    }

    if conflict {
        let key = EntityKey::new(EntityType::Task, "t-3");
        remote.seed(key.clone(), json!({"id": "t-3", "title": "Retro notes"}), 1);
        remote.edit(&key, json!({"title": "Retro notes (edited elsewhere)"}));
        let change = PendingChange::new(
            EntityType::Task,
            "t-3",
            Operation::Update,
            Some(json!({"title": "Retro notes, action items"})),
        )
        .with_base_version(1);
        service.enqueue_change(change);
    }

    print_status("offline", &service.current_status());

    info!("Reconnecting");
    monitor.set_online(true);
    let status = wait_settled(&service).await?;
    print_status("after reconnect", &status);

    if status.pending_conflicts > 0 {
        for c in service.conflicts() {
            println!("Conflict {} on {}:", c.id.short(), c.key);
            for diff in &c.diffs {
                println!("  {}: local={} remote={}", diff.field, diff.local_value, diff.remote_value);
            }
        }
        let n = service.resolve_all_conflicts(keep)?;
        println!("Resolved {n} conflict(s) keeping {keep}");
        let status = wait_settled(&service).await?;
        print_status("after resolution", &status);
    }

    println!("\nHistory:");
    for event in service.history() {
        let count = event.change_count.map(|n| format!(" ({n})")).unwrap_or_default();
        let details = event.details.map(|d| format!(": {d}")).unwrap_or_default();
        println!("  {}{}{}", event.kind, count, details);
    }

    for failed in service.failed_changes() {
        println!("Failed {} ({}): {}", failed.change.key(), failed.reason, failed.error);
    }

    println!("\nRemote:");
    for key in [
        EntityKey::new(EntityType::Task, "t-1"),
        EntityKey::new(EntityType::Task, "t-2"),
        EntityKey::new(EntityType::Task, "t-3"),
        EntityKey::new(EntityType::List, "l-1"),
    ] {
        match remote.get(&key) {
            Some((entity, version)) => println!("  {key} v{version} {entity}"),
            None => println!("  {key} absent"),
        }
    }
    println!("  {} send(s) total", remote.calls().len());

    service.dispose().await;
    Ok(())
}

/// Wait until nothing is in flight and only conflicted changes remain.
async fn wait_settled(service: &SyncService) -> Result<SyncStatus> {
    let mut rx = service.subscribe_status();
    let waited = tokio::time::timeout(
        SIMULATE_TIMEOUT,
        rx.wait_for(|s| !s.is_processing && s.queue_length == s.pending_conflicts),
    )
    .await
    .context("queue did not settle")?;
    let status = waited.context("sync service stopped")?.clone();
    Ok(status)
}

fn print_status(label: &str, s: &SyncStatus) {
    println!(
        "[{label}] online={} queued={} conflicts={} failed={} last_error={}",
        s.is_online,
        s.queue_length,
        s.pending_conflicts,
        s.failed_changes,
        s.last_error.as_deref().unwrap_or("-")
    );
}
