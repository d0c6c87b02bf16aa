//! The composition point: one [`SyncService`] per signed-in client.
//!
//! The service owns the authoritative [`ChangeLog`], the [`SyncHistory`],
//! the [`ConflictResolver`] and the failed-change list. Draining happens
//! either in the background worker (the default) or, with
//! [`DrainMode::Inline`], on tokio tasks that work on the change log
//! directly.
//!
//! ```text
//!   UI ──enqueue──▶ SyncService ──AddItem/RemoveItem──▶ worker mirror
//!                    │   ▲                                  │
//!                    │   └──────── WorkerEvent ─────────────┘
//!                    ├── ChangeLog (write-through KvStore)
//!                    ├── SyncHistory ──broadcast──▶ subscribers
//!                    └── SyncStatus ──watch──▶ subscribers
//! ```
//!
//! Nothing here is global: build as many services as there are stores.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use scrumsync_core::{
    ChangeLog, Conflict, ConflictId, ConflictResolver, DropReason, EnqueueOutcome, EntityKey,
    ItemOutcome, ItemResult, KvStore, Operation, PendingChange, ResolutionChoice, Side, SyncConfig,
    SyncEvent, SyncEventKind, SyncHistory, SyncStatus, Syncable, now_millis,
};

use crate::connectivity::ConnectivityMonitor;
use crate::constants::{REPORT_BROADCAST_CAPACITY, SHUTDOWN_TIMEOUT};
use crate::engine::{DrainQueue, DrainReport, SyncEngine};
use crate::error::ServiceError;
use crate::remote::RemoteStore;
use crate::worker::{WorkerCommand, WorkerEvent, WorkerHandle, spawn_worker};

/// Where drain passes run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DrainMode {
    /// Background worker task with its own queue mirror.
    #[default]
    Worker,
    /// Spawned tasks draining the change log directly.
    Inline,
}

/// A change that left the queue without reaching the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedChange {
    pub change: PendingChange,
    pub reason: DropReason,
    pub error: String,
    pub failed_at: u64,
}

/// Outcome of one pass as seen by `sync_now` waiters.
type PassResult = Result<DrainReport, String>;

// ============================================================================
// Shared state
// ============================================================================

struct ServiceInner {
    log: ChangeLog,
    history: SyncHistory,
    resolver: ConflictResolver,
    failed: Vec<FailedChange>,
    config: SyncConfig,
    last_sync_at: Option<u64>,
    last_error: Option<String>,
    /// Last `is_processing` the worker reported.
    worker_processing: bool,
}

enum Backend {
    Inline(SyncEngine),
    Worker(WorkerHandle),
}

struct Shared {
    inner: Mutex<ServiceInner>,
    status_tx: watch::Sender<SyncStatus>,
    passes: broadcast::Sender<PassResult>,
    monitor: ConnectivityMonitor,
    remote: Arc<dyn RemoteStore>,
    backend: Backend,
    closed: AtomicBool,
    /// Work was queued by the running inline pass itself.
    rerun: AtomicBool,
}

impl Shared {
    fn config(&self) -> SyncConfig {
        self.inner.lock().config.clone()
    }

    fn status_of(&self, inner: &ServiceInner) -> SyncStatus {
        let is_processing = match &self.backend {
            Backend::Inline(engine) => engine.is_draining(),
            Backend::Worker(_) => inner.worker_processing,
        };
        SyncStatus {
            queue_length: inner.log.len(),
            is_processing,
            is_online: self.monitor.current(),
            last_sync_at: inner.last_sync_at,
            last_error: inner
                .last_error
                .clone()
                .or_else(|| inner.log.persistence_error().map(str::to_string)),
            pending_conflicts: inner.resolver.unresolved_count(),
            failed_changes: inner.failed.len(),
        }
    }

    /// Push the derived status to subscribers if it changed.
    fn publish(&self, inner: &ServiceInner) {
        let status = self.status_of(inner);
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn notify_worker(&self, command: WorkerCommand) {
        if let Backend::Worker(handle) = &self.backend {
            if let Err(e) = handle.send(command) {
                warn!("Could not reach sync worker: {}", e);
            }
        }
    }

    /// Request a drain pass. Non-forced requests are dropped while one runs.
    fn trigger(self: &Arc<Self>, force: bool) {
        if self.closed.load(Ordering::SeqCst) || !self.monitor.current() {
            return;
        }
        match &self.backend {
            Backend::Inline(_) => {
                let shared = self.clone();
                tokio::spawn(async move {
                    drain_inline(&shared, force).await;
                });
            }
            Backend::Worker(_) => {
                self.notify_worker(if force { WorkerCommand::ForceSync } else { WorkerCommand::Sync });
            }
        }
    }

    fn enqueue_locked(&self, inner: &mut ServiceInner, change: PendingChange) -> (EnqueueOutcome, bool) {
        let key = change.key();
        let was_empty = inner.log.is_empty();
        let outcome = inner.log.enqueue(change);

        // A newer local edit supersedes any open conflict for the entity.
        inner.resolver.retain_keys(|k| k != &key);

        match outcome {
            EnqueueOutcome::Cancelled => self.notify_worker(WorkerCommand::RemoveItem(key)),
            _ => {
                if let Some(entry) = inner.log.get(&key) {
                    self.notify_worker(WorkerCommand::AddItem(entry.clone()));
                }
            }
        }
        (outcome, was_empty && !inner.log.is_empty())
    }

    /// Fold one send result into the log, history and resolver.
    fn settle(&self, inner: &mut ServiceInner, outcome: &ItemOutcome) -> bool {
        if !inner.log.apply_outcome(outcome) {
            if let Some(delete) = inner.log.reconcile_cancelled(outcome) {
                match &self.backend {
                    Backend::Inline(_) => self.rerun.store(true, Ordering::SeqCst),
                    Backend::Worker(_) => self.notify_worker(WorkerCommand::AddItem(delete)),
                }
            }
            return false;
        }
        let key = outcome.key();
        match &outcome.result {
            ItemResult::Synced { .. } => {
                trace!("{} confirmed by remote", key);
            }
            ItemResult::Retrying { error } => {
                inner.last_error = Some(format!("{key}: {error}"));
            }
            ItemResult::Dropped { reason, error } => {
                let details = format!(
                    "{} {} failed permanently ({}): {}",
                    outcome.change.operation, key, reason, error
                );
                warn!("{}", details);
                inner.history.record(
                    SyncEvent::new(SyncEventKind::Error)
                        .with_count(1)
                        .with_details(details.clone())
                        .with_entity(key.clone()),
                );
                inner.last_error = Some(details);
                inner.failed.retain(|f| f.change.key() != key);
                inner.failed.push(FailedChange {
                    change: outcome.change.clone(),
                    reason: *reason,
                    error: error.clone(),
                    failed_at: now_millis(),
                });
            }
            ItemResult::Conflict { remote, version } => {
                inner.resolver.register(&outcome.change, remote.clone(), *version);
            }
        }
        true
    }

    fn start_pass(&self, count: usize) {
        let mut inner = self.inner.lock();
        inner.history.record(SyncEvent::new(SyncEventKind::Started).with_count(count));
        self.publish(&inner);
    }

    fn finish_pass(&self, report: &DrainReport) {
        let mut inner = self.inner.lock();
        if report.eligible > 0 && report.failures() == 0 {
            inner.last_error = None;
        }
        if report.is_success() {
            inner.last_sync_at = Some(report.finished_at);
            inner
                .history
                .record(SyncEvent::new(SyncEventKind::Success).with_count(report.synced));
        }
        self.publish(&inner);
        drop(inner);
        // No waiters is fine.
        let _ = self.passes.send(Ok(report.clone()));
    }

    fn on_connectivity(&self, online: bool) {
        let mut inner = self.inner.lock();
        let kind = if online {
            SyncEventKind::ConnectivityRestored
        } else {
            SyncEventKind::ConnectivityLost
        };
        let pending = inner.log.len();
        inner.history.record(SyncEvent::new(kind).with_count(pending));
        if !online {
            self.notify_worker(WorkerCommand::SetOnline(false));
        }
        self.publish(&inner);
    }

    /// Connectivity came back and stayed up through the debounce.
    fn on_restored(self: &Arc<Self>) {
        match &self.backend {
            Backend::Worker(_) => self.notify_worker(WorkerCommand::SetOnline(true)),
            Backend::Inline(_) => {
                if !self.inner.lock().log.is_empty() {
                    self.trigger(false);
                }
            }
        }
    }

    fn on_worker_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::WorkerInitialized { queue_length } => {
                debug!("Sync worker ready ({} mirrored)", queue_length);
            }
            WorkerEvent::QueueUpdated(count) => {
                trace!("Worker mirror holds {} change(s)", count);
            }
            WorkerEvent::SyncStarted { count } => self.start_pass(count),
            WorkerEvent::SyncItemCompleted(outcome)
            | WorkerEvent::SyncItemFailed(outcome)
            | WorkerEvent::SyncItemConflict(outcome) => {
                let mut inner = self.inner.lock();
                self.settle(&mut inner, &outcome);
                self.publish(&inner);
            }
            WorkerEvent::SyncCompleted(report) => self.finish_pass(&report),
            WorkerEvent::SyncFailed(reason) => {
                debug!("Worker refused sync: {}", reason);
                let _ = self.passes.send(Err(reason));
            }
            WorkerEvent::StatusUpdate(status) => {
                let mut inner = self.inner.lock();
                inner.worker_processing = status.is_processing;
                self.publish(&inner);
            }
        }
    }
}

// ============================================================================
// Inline draining
// ============================================================================

/// The change log as seen by an inline pass. Locks per call, never across a
/// send.
struct InlineQueue<'a> {
    shared: &'a Shared,
}

impl DrainQueue for InlineQueue<'_> {
    fn pending(&self) -> Vec<PendingChange> {
        self.shared.inner.lock().log.all()
    }

    fn current_seq(&self, key: &EntityKey) -> Option<u64> {
        self.shared.inner.lock().log.get(key).map(|c| c.seq)
    }

    fn apply_outcome(&mut self, outcome: &ItemOutcome) -> bool {
        let mut inner = self.shared.inner.lock();
        let applied = self.shared.settle(&mut inner, outcome);
        self.shared.publish(&inner);
        applied
    }

    fn on_started(&mut self, eligible: usize) {
        self.shared.start_pass(eligible);
    }

    fn checkpoint(&mut self) -> ControlFlow<()> {
        if self.shared.closed.load(Ordering::SeqCst) || !self.shared.monitor.current() {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }
}

async fn drain_inline(shared: &Arc<Shared>, force: bool) -> Option<DrainReport> {
    let Backend::Inline(engine) = &shared.backend else {
        return None;
    };
    let mut queue = InlineQueue { shared };
    let report = engine.drain(&mut queue, force).await?;
    shared.finish_pass(&report);
    if shared.rerun.swap(false, Ordering::SeqCst) {
        shared.trigger(false);
    }
    Some(report)
}

// ============================================================================
// Background tasks
// ============================================================================

/// Forward connectivity changes. Going offline takes effect at once; coming
/// back online only triggers a drain once it has held for the debounce.
async fn watch_connectivity(shared: Arc<Shared>, mut rx: watch::Receiver<bool>) {
    let mut last = *rx.borrow_and_update();
    while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if online == last {
            continue;
        }
        last = online;
        shared.on_connectivity(online);
        if !online {
            continue;
        }

        let settle = tokio::time::sleep(shared.config().connectivity_debounce());
        tokio::pin!(settle);
        let held = loop {
            tokio::select! {
                _ = &mut settle => break true,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let now = *rx.borrow_and_update();
                    if now == last {
                        continue;
                    }
                    last = now;
                    shared.on_connectivity(now);
                    if !now {
                        break false;
                    }
                }
            }
        };
        if held {
            shared.on_restored();
        } else {
            trace!("Connectivity flapped inside the debounce window");
        }
    }
}

async fn pump_worker_events(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        shared.on_worker_event(event);
    }
    debug!("Worker event stream closed");
}

/// Periodic trigger for inline mode; the worker runs its own.
async fn run_timer(shared: Arc<Shared>) {
    loop {
        tokio::time::sleep(shared.config().sync_interval()).await;
        let has_work = !shared.inner.lock().log.is_empty();
        if has_work {
            shared.trigger(false);
        }
    }
}

// ============================================================================
// SyncService
// ============================================================================

pub struct SyncService {
    shared: Arc<Shared>,
    mode: DrainMode,
    tasks: Vec<JoinHandle<()>>,
    worker_task: Option<JoinHandle<()>>,
    pump_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("mode", &self.mode)
            .field("status", &self.current_status())
            .finish()
    }
}

impl SyncService {
    /// Load the change log from `store` and start syncing.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        config: SyncConfig,
        store: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteStore>,
        monitor: ConnectivityMonitor,
        mode: DrainMode,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let log = ChangeLog::load(store, config.storage_key.clone());
        let history = SyncHistory::new(config.history_capacity);
        let snapshot = log.all();

        let (backend, worker) = match mode {
            DrainMode::Inline => (Backend::Inline(SyncEngine::new(config.clone(), remote.clone())), None),
            DrainMode::Worker => {
                let (handle, events, task) = spawn_worker(remote.clone());
                (Backend::Worker(handle), Some((events, task)))
            }
        };

        let (status_tx, _) = watch::channel(SyncStatus::default());
        let (passes, _) = broadcast::channel(REPORT_BROADCAST_CAPACITY);
        let shared = Arc::new(Shared {
            inner: Mutex::new(ServiceInner {
                log,
                history,
                resolver: ConflictResolver::new(),
                failed: Vec::new(),
                config: config.clone(),
                last_sync_at: None,
                last_error: None,
                worker_processing: false,
            }),
            status_tx,
            passes,
            monitor: monitor.clone(),
            remote,
            backend,
            closed: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        });

        let mut service = Self { shared: shared.clone(), mode, tasks: Vec::new(), worker_task: None, pump_task: None };

        if let Some((events, task)) = worker {
            shared.notify_worker(WorkerCommand::Init {
                config,
                snapshot: snapshot.clone(),
                online: monitor.current(),
            });
            service.worker_task = Some(task);
            service.pump_task = Some(tokio::spawn(pump_worker_events(shared.clone(), events)));
        } else {
            service.tasks.push(tokio::spawn(run_timer(shared.clone())));
            if !snapshot.is_empty() {
                shared.trigger(false);
            }
        }
        service.tasks.push(tokio::spawn(watch_connectivity(shared.clone(), monitor.subscribe())));

        shared.publish(&shared.inner.lock());
        info!(
            "Sync service started ({} mode, {} pending, {})",
            mode,
            snapshot.len(),
            monitor.state()
        );
        Ok(service)
    }

    pub fn mode(&self) -> DrainMode {
        self.mode
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.shared.monitor
    }

    // ── Queue ────────────────────────────────────────────────────────────

    /// Record a local mutation. Drains right away when it lands in an empty
    /// queue while online.
    pub fn enqueue_change(&self, change: PendingChange) -> EnqueueOutcome {
        let mut inner = self.shared.inner.lock();
        let (outcome, woke) = self.shared.enqueue_locked(&mut inner, change);
        self.shared.publish(&inner);
        drop(inner);

        // The worker wakes itself on the first item.
        if woke && self.mode == DrainMode::Inline {
            self.shared.trigger(false);
        }
        outcome
    }

    /// Record a mutation of a model type.
    pub fn enqueue_entity<T: Syncable>(
        &self,
        entity: &T,
        operation: Operation,
    ) -> Result<EnqueueOutcome, ServiceError> {
        Ok(self.enqueue_change(entity.to_change(operation)?))
    }

    pub fn pending_changes(&self) -> Vec<PendingChange> {
        self.shared.inner.lock().log.all()
    }

    /// Discard every pending change and open conflict. In-flight sends
    /// complete and their results are ignored.
    pub fn clear_pending_changes(&self) {
        let mut inner = self.shared.inner.lock();
        inner.log.clear();
        inner.resolver.clear();
        self.shared.notify_worker(WorkerCommand::ClearQueue);
        self.shared.publish(&inner);
    }

    pub fn export_log(&self) -> String {
        self.shared.inner.lock().log.export_json()
    }

    /// Replace the queue with an exported log. Returns `false` (leaving the
    /// queue untouched) when the input does not parse.
    pub fn import_log(&self, raw: &str) -> bool {
        let mut inner = self.shared.inner.lock();
        if let Err(e) = inner.log.import_json(raw) {
            warn!("Rejected change log import: {}", e);
            return false;
        }
        inner.resolver.clear();
        let has_work = !inner.log.is_empty();
        self.shared.notify_worker(WorkerCommand::Init {
            config: inner.config.clone(),
            snapshot: inner.log.all(),
            online: self.shared.monitor.current(),
        });
        self.shared.publish(&inner);
        drop(inner);

        if has_work && self.mode == DrainMode::Inline {
            self.shared.trigger(false);
        }
        true
    }

    // ── Status ───────────────────────────────────────────────────────────

    pub fn current_status(&self) -> SyncStatus {
        let inner = self.shared.inner.lock();
        self.shared.status_of(&inner)
    }

    /// Receiver holding the latest status; wakes only on actual changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status_tx.subscribe()
    }

    // ── Sync ─────────────────────────────────────────────────────────────

    /// Start a pass that ignores backoff. Returns `false` when offline.
    pub fn force_sync(&self) -> bool {
        if !self.shared.monitor.current() {
            debug!("force_sync ignored while offline");
            return false;
        }
        self.shared.trigger(true);
        true
    }

    /// Run a forced pass and wait for its report.
    pub async fn sync_now(&self) -> Result<DrainReport, ServiceError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ServiceError::Disposed);
        }
        if !self.shared.monitor.current() {
            return Err(ServiceError::Offline);
        }
        match &self.shared.backend {
            Backend::Inline(_) => drain_inline(&self.shared, true).await.ok_or(ServiceError::Busy),
            Backend::Worker(handle) => {
                let mut passes = self.shared.passes.subscribe();
                handle.force_sync()?;
                loop {
                    match passes.recv().await {
                        Ok(Ok(report)) if report.forced => return Ok(report),
                        Ok(Ok(_)) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Ok(Err(reason)) => return Err(ServiceError::SyncRefused(reason)),
                        Err(broadcast::error::RecvError::Closed) => return Err(ServiceError::Disposed),
                    }
                }
            }
        }
    }

    /// Ping the remote and update connectivity with the answer.
    pub async fn test_connection(&self) -> bool {
        self.shared.monitor.test_connection(self.shared.remote.as_ref()).await
    }

    // ── History ──────────────────────────────────────────────────────────

    pub fn history(&self) -> Vec<SyncEvent> {
        self.shared.inner.lock().history.events().cloned().collect()
    }

    /// Live feed of new events. Drop the receiver to unsubscribe.
    pub fn subscribe_history(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.inner.lock().history.subscribe()
    }

    pub fn export_history(&self) -> Result<String, ServiceError> {
        Ok(self.shared.inner.lock().history.export_json()?)
    }

    pub fn clear_history(&self) {
        self.shared.inner.lock().history.clear();
    }

    // ── Conflicts ────────────────────────────────────────────────────────

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.shared.inner.lock().resolver.conflicts().cloned().collect()
    }

    pub fn select_conflict_field(
        &self,
        id: ConflictId,
        field: &str,
        side: Side,
    ) -> Result<(), ServiceError> {
        Ok(self.shared.inner.lock().resolver.select_field(id, field, side)?)
    }

    /// Settle one conflict. Once every open conflict is settled the batch is
    /// committed to the queue.
    pub fn resolve_conflict(
        &self,
        id: ConflictId,
        choice: ResolutionChoice,
    ) -> Result<Value, ServiceError> {
        let mut inner = self.shared.inner.lock();
        let entity = inner.resolver.resolve(id, choice)?;
        let requeued = if inner.resolver.all_resolved() {
            self.commit_locked(&mut inner)?.1
        } else {
            false
        };
        self.shared.publish(&inner);
        drop(inner);

        if requeued {
            self.shared.trigger(false);
        }
        Ok(entity)
    }

    /// Settle every open conflict the same way and commit.
    pub fn resolve_all_conflicts(&self, side: Side) -> Result<usize, ServiceError> {
        let mut inner = self.shared.inner.lock();
        let resolved = inner.resolver.resolve_all(side).len();
        let (_, requeued) = self.commit_locked(&mut inner)?;
        self.shared.publish(&inner);
        drop(inner);

        if requeued {
            self.shared.trigger(false);
        }
        Ok(resolved)
    }

    /// Apply the resolved batch to the queue. Fails while any conflict is
    /// still open.
    pub fn commit_conflicts(&self) -> Result<usize, ServiceError> {
        let mut inner = self.shared.inner.lock();
        let (committed, requeued) = self.commit_locked(&mut inner)?;
        self.shared.publish(&inner);
        drop(inner);

        if requeued {
            self.shared.trigger(false);
        }
        Ok(committed)
    }

    /// Remote wins drop the queued change; local and merged resolutions
    /// replace its payload, rebased on the remote version.
    fn commit_locked(&self, inner: &mut ServiceInner) -> Result<(usize, bool), ServiceError> {
        let resolved = inner.resolver.commit()?;
        let mut requeued = false;
        for r in &resolved {
            match r.choice {
                ResolutionChoice::Remote => {
                    if inner.log.dequeue(r.key.entity_type, &r.key.id).is_some() {
                        self.shared.notify_worker(WorkerCommand::RemoveItem(r.key.clone()));
                    }
                }
                ResolutionChoice::Local | ResolutionChoice::Merge => {
                    let payload = (!r.entity.is_null()).then(|| r.entity.clone());
                    if inner.log.rebase(&r.key, payload, r.remote_version) {
                        if let Some(entry) = inner.log.get(&r.key) {
                            self.shared.notify_worker(WorkerCommand::AddItem(entry.clone()));
                        }
                        requeued = true;
                    }
                }
            }
        }
        if !resolved.is_empty() {
            info!("Committed {} conflict resolution(s)", resolved.len());
        }
        Ok((resolved.len(), requeued))
    }

    // ── Failed changes ───────────────────────────────────────────────────

    pub fn failed_changes(&self) -> Vec<FailedChange> {
        self.shared.inner.lock().failed.clone()
    }

    /// Put failed changes back in the queue with a fresh retry budget.
    /// `None` retries all of them.
    pub fn retry_failed(&self, key: Option<&EntityKey>) -> usize {
        let mut inner = self.shared.inner.lock();
        let (retry, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.failed)
            .into_iter()
            .partition(|f| key.is_none_or(|k| *k == f.change.key()));
        inner.failed = keep;

        let mut woke = false;
        for failed in &retry {
            let mut change = failed.change.clone();
            change.attempts = 0;
            change.last_attempt_at = None;
            change.awaiting_resolution = false;
            change.enqueued_at = now_millis();
            woke |= self.shared.enqueue_locked(&mut inner, change).1;
        }
        if !retry.is_empty() {
            info!("Retrying {} failed change(s)", retry.len());
        }
        self.shared.publish(&inner);
        drop(inner);

        if woke && self.mode == DrainMode::Inline {
            self.shared.trigger(false);
        }
        retry.len()
    }

    /// Forget failed changes. `None` discards all of them.
    pub fn discard_failed(&self, key: Option<&EntityKey>) -> usize {
        let mut inner = self.shared.inner.lock();
        let before = inner.failed.len();
        inner.failed.retain(|f| key.is_some_and(|k| *k != f.change.key()));
        let discarded = before - inner.failed.len();
        self.shared.publish(&inner);
        discarded
    }

    // ── Configuration & lifecycle ────────────────────────────────────────

    pub fn config(&self) -> SyncConfig {
        self.shared.config()
    }

    /// Swap tuning at runtime. The storage key is only read at start.
    pub fn set_config(&self, config: SyncConfig) -> Result<(), ServiceError> {
        config.validate()?;
        let mut inner = self.shared.inner.lock();
        if config.storage_key != inner.config.storage_key {
            warn!("storage_key change takes effect on next start");
        }
        inner.history.set_capacity(config.history_capacity);
        match &self.shared.backend {
            Backend::Inline(engine) => engine.set_config(config.clone()),
            Backend::Worker(_) => self.shared.notify_worker(WorkerCommand::SetConfig(config.clone())),
        }
        inner.config = config;
        Ok(())
    }

    /// Stop the worker and background tasks and flush the change log.
    pub async fn dispose(mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify_worker(WorkerCommand::Shutdown);

        if let Some(task) = self.worker_task.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("Sync worker did not stop within {:?}", SHUTDOWN_TIMEOUT);
            }
        }
        // Settle whatever the worker reported before stopping.
        if let Some(task) = self.pump_task.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("Worker event pump did not stop within {:?}", SHUTDOWN_TIMEOUT);
            }
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }

        let mut inner = self.shared.inner.lock();
        if !inner.log.flush() {
            warn!(
                "Change log not persisted on dispose: {}",
                inner.log.persistence_error().unwrap_or("unknown error")
            );
        }
        info!("Sync service disposed ({} change(s) pending)", inner.log.len());
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if self.worker_task.is_some() {
            self.shared.notify_worker(WorkerCommand::Shutdown);
        }
        for task in self.tasks.drain(..).chain(self.pump_task.take()) {
            task.abort();
        }
    }
}
