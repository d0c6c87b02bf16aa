//! Background sync worker.
//!
//! The worker is a tokio task that owns a mirror of the change log and its
//! own [`SyncEngine`]. It shares no mutable state with the interactive side:
//! everything crosses an mpsc channel in each direction.
//!
//! ```text
//!   WorkerHandle              mpsc            SyncWorker (tokio task)
//!   ┌──────────────────┐  ──────────────▶  ┌──────────────────────────┐
//!   │ .add_item()      │  WorkerCommand    │ QueueMirror              │
//!   │ .force_sync()    │                   │ SyncEngine + interval    │
//!   │ .status()        │  ◀──────────────  │ drains between commands  │
//!   └──────────────────┘   WorkerEvent     └──────────────────────────┘
//! ```
//!
//! Commands that arrive during a pass are applied between items, so a
//! `ClearQueue` stops the remaining sends and going offline ends the pass.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use scrumsync_core::{EntityKey, ItemOutcome, ItemResult, PendingChange, SyncConfig};

use crate::engine::{DrainQueue, DrainReport, SyncEngine};
use crate::remote::RemoteStore;

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker shut down")]
    Shutdown,
}

// ============================================================================
// Protocol
// ============================================================================

/// Messages into the worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// (Re)initialize: replaces the mirror wholesale.
    Init {
        config: SyncConfig,
        snapshot: Vec<PendingChange>,
        online: bool,
    },
    /// Upsert one entry, as it now stands in the change log.
    AddItem(PendingChange),
    RemoveItem(EntityKey),
    /// Drain now, ignoring backoff.
    ForceSync,
    /// Drain now if idle, honouring backoff.
    Sync,
    ClearQueue,
    GetStatus(oneshot::Sender<WorkerStatus>),
    SetConfig(SyncConfig),
    SetOnline(bool),
    Shutdown,
}

/// Messages out of the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    WorkerInitialized { queue_length: usize },
    QueueUpdated(usize),
    SyncStarted { count: usize },
    SyncItemCompleted(ItemOutcome),
    /// Transient failure (still queued) or a dropped change.
    SyncItemFailed(ItemOutcome),
    SyncItemConflict(ItemOutcome),
    SyncCompleted(DrainReport),
    /// A drain was requested but could not run.
    SyncFailed(String),
    StatusUpdate(WorkerStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    pub queue_length: usize,
    pub is_processing: bool,
    pub is_online: bool,
    pub last_sync_at: Option<u64>,
}

// ============================================================================
// WorkerHandle
// ============================================================================

/// Cloneable sender side of the worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    pub fn send(&self, command: WorkerCommand) -> Result<(), WorkerError> {
        self.tx.send(command).map_err(|_| WorkerError::Shutdown)
    }

    pub fn init(
        &self,
        config: SyncConfig,
        snapshot: Vec<PendingChange>,
        online: bool,
    ) -> Result<(), WorkerError> {
        self.send(WorkerCommand::Init { config, snapshot, online })
    }

    pub fn add_item(&self, change: PendingChange) -> Result<(), WorkerError> {
        self.send(WorkerCommand::AddItem(change))
    }

    pub fn remove_item(&self, key: EntityKey) -> Result<(), WorkerError> {
        self.send(WorkerCommand::RemoveItem(key))
    }

    pub fn force_sync(&self) -> Result<(), WorkerError> {
        self.send(WorkerCommand::ForceSync)
    }

    pub fn sync(&self) -> Result<(), WorkerError> {
        self.send(WorkerCommand::Sync)
    }

    pub fn clear_queue(&self) -> Result<(), WorkerError> {
        self.send(WorkerCommand::ClearQueue)
    }

    pub fn set_config(&self, config: SyncConfig) -> Result<(), WorkerError> {
        self.send(WorkerCommand::SetConfig(config))
    }

    pub fn set_online(&self, online: bool) -> Result<(), WorkerError> {
        self.send(WorkerCommand::SetOnline(online))
    }

    pub fn shutdown(&self) -> Result<(), WorkerError> {
        self.send(WorkerCommand::Shutdown)
    }

    /// Ask the worker for its status. Answered between drain items when a
    /// pass is running.
    pub async fn status(&self) -> Result<WorkerStatus, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerCommand::GetStatus(reply))?;
        rx.await.map_err(|_| WorkerError::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// QueueMirror
// ============================================================================

/// The worker's working copy of the change log.
///
/// Entries arrive already coalesced, so the mirror only upserts; it never
/// assigns revisions of its own.
#[derive(Debug, Default)]
pub struct QueueMirror {
    entries: IndexMap<EntityKey, PendingChange>,
}

impl QueueMirror {
    pub fn new(snapshot: Vec<PendingChange>) -> Self {
        let mut mirror = Self::default();
        mirror.replace(snapshot);
        mirror
    }

    pub fn replace(&mut self, snapshot: Vec<PendingChange>) {
        self.entries = snapshot.into_iter().map(|c| (c.key(), c)).collect();
    }

    pub fn upsert(&mut self, change: PendingChange) {
        let key = change.key();
        self.entries.shift_remove(&key);
        self.entries.insert(key, change);
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<PendingChange> {
        self.entries.shift_remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, key: &EntityKey) -> Option<&PendingChange> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn all(&self) -> Vec<PendingChange> {
        let mut all: Vec<PendingChange> = self.entries.values().cloned().collect();
        all.sort_by_key(|c| (c.enqueued_at, c.seq));
        all
    }

    /// Same bookkeeping as the change log, without persistence.
    pub fn apply_outcome(&mut self, outcome: &ItemOutcome) -> bool {
        let key = outcome.key();
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        if entry.seq != outcome.change.seq {
            return false;
        }
        match &outcome.result {
            ItemResult::Synced { .. } | ItemResult::Dropped { .. } => {
                self.entries.shift_remove(&key);
            }
            ItemResult::Retrying { .. } => {
                entry.attempts = outcome.change.attempts;
                entry.last_attempt_at = outcome.change.last_attempt_at;
            }
            ItemResult::Conflict { version, .. } => {
                entry.attempts = outcome.change.attempts;
                entry.last_attempt_at = outcome.change.last_attempt_at;
                entry.awaiting_resolution = true;
                entry.base_version = *version;
            }
        }
        true
    }
}

// ============================================================================
// SyncWorker (internal, runs in a spawned task)
// ============================================================================

struct SyncWorker {
    engine: Arc<SyncEngine>,
    mirror: QueueMirror,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    online: bool,
    initialized: bool,
    last_sync_at: Option<u64>,
    last_status: Option<WorkerStatus>,
    /// Drain requested while busy; `true` when any request was forced.
    trigger: Option<bool>,
    shutting_down: bool,
}

impl SyncWorker {
    fn new(
        remote: Arc<dyn RemoteStore>,
        commands: mpsc::UnboundedReceiver<WorkerCommand>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            engine: Arc::new(SyncEngine::new(SyncConfig::default(), remote)),
            mirror: QueueMirror::default(),
            commands,
            events,
            online: false,
            initialized: false,
            last_sync_at: None,
            last_status: None,
            trigger: None,
            shutting_down: false,
        }
    }

    fn emit(&self, event: WorkerEvent) {
        // Receiver gone means the service is being torn down.
        let _ = self.events.send(event);
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            queue_length: self.mirror.len(),
            is_processing: self.engine.is_draining(),
            is_online: self.online,
            last_sync_at: self.last_sync_at,
        }
    }

    fn emit_status_if_changed(&mut self) {
        let status = self.status();
        if self.last_status.as_ref() != Some(&status) {
            self.last_status = Some(status.clone());
            self.emit(WorkerEvent::StatusUpdate(status));
        }
    }

    fn request_drain(&mut self, force: bool) {
        self.trigger = Some(self.trigger.unwrap_or(false) || force);
    }

    fn queue_updated(&self) {
        self.emit(WorkerEvent::QueueUpdated(self.mirror.len()));
    }

    fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Init { config, snapshot, online } => {
                self.engine.set_config(config);
                self.mirror.replace(snapshot);
                self.online = online;
                self.initialized = true;
                info!("Sync worker initialized with {} queued change(s)", self.mirror.len());
                self.emit(WorkerEvent::WorkerInitialized { queue_length: self.mirror.len() });
                self.queue_updated();
                if self.online && !self.mirror.is_empty() {
                    self.request_drain(false);
                }
            }
            WorkerCommand::AddItem(change) => {
                let was_empty = self.mirror.is_empty();
                trace!("Mirror upsert {} seq {}", change.key(), change.seq);
                self.mirror.upsert(change);
                self.queue_updated();
                // New revisions arriving mid-pass were not in its plan.
                if self.online && (was_empty || self.engine.is_draining()) {
                    self.request_drain(false);
                }
            }
            WorkerCommand::RemoveItem(key) => {
                if self.mirror.remove(&key).is_some() {
                    self.queue_updated();
                }
            }
            WorkerCommand::ForceSync => {
                if self.online {
                    self.request_drain(true);
                } else {
                    self.emit(WorkerEvent::SyncFailed("offline".into()));
                }
            }
            WorkerCommand::Sync => {
                if self.engine.is_draining() {
                    trace!("Sync ignored, pass already running");
                } else if self.online && !self.mirror.is_empty() {
                    self.request_drain(false);
                }
            }
            WorkerCommand::ClearQueue => {
                self.mirror.clear();
                self.queue_updated();
            }
            WorkerCommand::GetStatus(reply) => {
                let _ = reply.send(self.status());
            }
            WorkerCommand::SetConfig(config) => {
                debug!("Sync worker config updated");
                self.engine.set_config(config);
            }
            WorkerCommand::SetOnline(online) => {
                let restored = online && !self.online;
                self.online = online;
                if restored && !self.mirror.is_empty() {
                    self.request_drain(false);
                }
            }
            WorkerCommand::Shutdown => {
                self.shutting_down = true;
            }
        }
        self.emit_status_if_changed();
    }

    async fn drain(&mut self, force: bool) {
        if !self.initialized {
            self.emit(WorkerEvent::SyncFailed("worker not initialized".into()));
            return;
        }
        if !self.online {
            return;
        }
        let engine = self.engine.clone();
        let Some(report) = engine.drain(self, force).await else {
            return;
        };
        if report.synced > 0 {
            self.last_sync_at = Some(report.finished_at);
        }
        self.emit(WorkerEvent::SyncCompleted(report));
        self.emit_status_if_changed();
    }

    fn ticker(period: Duration) -> Interval {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Process commands and timer ticks until shutdown or channel close.
    async fn run(mut self) {
        let mut period = self.engine.config().sync_interval();
        let mut ticker = Self::ticker(period);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = ticker.tick() => {
                    if self.online && !self.mirror.is_empty() {
                        trace!("Periodic sync tick");
                        self.request_drain(false);
                    }
                }
            }

            while let Some(force) = self.trigger.take() {
                if self.shutting_down {
                    break;
                }
                self.drain(force).await;
            }
            if self.shutting_down {
                break;
            }

            let configured = self.engine.config().sync_interval();
            if configured != period {
                period = configured;
                ticker = Self::ticker(period);
            }
        }
        debug!("Sync worker shutting down");
    }
}

impl DrainQueue for SyncWorker {
    fn pending(&self) -> Vec<PendingChange> {
        self.mirror.all()
    }

    fn current_seq(&self, key: &EntityKey) -> Option<u64> {
        self.mirror.get(key).map(|c| c.seq)
    }

    fn apply_outcome(&mut self, outcome: &ItemOutcome) -> bool {
        if !self.mirror.apply_outcome(outcome) {
            return false;
        }
        let event = match outcome.result {
            ItemResult::Synced { .. } => WorkerEvent::SyncItemCompleted(outcome.clone()),
            ItemResult::Conflict { .. } => WorkerEvent::SyncItemConflict(outcome.clone()),
            ItemResult::Retrying { .. } | ItemResult::Dropped { .. } => {
                WorkerEvent::SyncItemFailed(outcome.clone())
            }
        };
        self.emit(event);
        if outcome.removes_change() {
            self.queue_updated();
        }
        true
    }

    fn on_started(&mut self, eligible: usize) {
        self.emit(WorkerEvent::SyncStarted { count: eligible });
        self.emit_status_if_changed();
    }

    fn checkpoint(&mut self) -> ControlFlow<()> {
        while let Ok(cmd) = self.commands.try_recv() {
            // A nested drain request is served after this pass.
            self.handle_command(cmd);
        }
        if self.shutting_down || !self.online {
            debug!("Drain interrupted (shutdown: {}, online: {})", self.shutting_down, self.online);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }
}

// ============================================================================
// Public spawn function
// ============================================================================

/// Spawn a sync worker on the current tokio runtime.
///
/// The worker idles until it receives [`WorkerCommand::Init`]. Dropping
/// every handle (or sending `Shutdown`) stops it; the event receiver then
/// yields `None`.
pub fn spawn_worker(
    remote: Arc<dyn RemoteStore>,
) -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let worker = SyncWorker::new(remote, rx, event_tx);
    let task = tokio::spawn(worker.run());
    (WorkerHandle { tx }, event_rx, task)
}
