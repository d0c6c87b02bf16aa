//! Drain passes: replaying queued changes against the remote.
//!
//! # State Machine
//!
//! ```text
//!            trigger (timer, reconnect, enqueue, force)
//!   ┌──────┐ ─────────────────────────────────────────▶ ┌──────────┐
//!   │ Idle │                                            │ Draining │
//!   └──────┘ ◀───────────────────────────────────────── └──────────┘
//!               pass done (items settled individually)
//! ```
//!
//! A second trigger while draining is ignored unless forced. Forced passes
//! may overlap a running one: each item's outcome carries the log revision
//! it was sent at, and the queue drops outcomes for superseded revisions.
//!
//! The engine never owns the queue. It drains anything implementing
//! [`DrainQueue`], which lets the background worker drain its mirror and
//! the inline fallback drain the change log directly.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{Instrument, debug, info, info_span, warn};

use scrumsync_core::{
    ChangeLog, DropReason, EntityKey, ItemOutcome, ItemResult, PendingChange, RemoteError,
    SyncConfig, now_millis,
};

use crate::remote::RemoteStore;

// ============================================================================
// Queue seam
// ============================================================================

/// A queue a drain pass can read from and settle outcomes into.
pub trait DrainQueue {
    /// Snapshot of everything queued.
    fn pending(&self) -> Vec<PendingChange>;

    /// Revision currently queued for `key`, if any.
    fn current_seq(&self, key: &EntityKey) -> Option<u64>;

    /// Record one send result. Returns `false` when the outcome was stale
    /// and ignored.
    fn apply_outcome(&mut self, outcome: &ItemOutcome) -> bool;

    /// Called once a pass has something to send.
    fn on_started(&mut self, _eligible: usize) {}

    /// Called before each send. `Break` ends the pass early.
    fn checkpoint(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

impl DrainQueue for ChangeLog {
    fn pending(&self) -> Vec<PendingChange> {
        self.all()
    }

    fn current_seq(&self, key: &EntityKey) -> Option<u64> {
        self.get(key).map(|c| c.seq)
    }

    fn apply_outcome(&mut self, outcome: &ItemOutcome) -> bool {
        if ChangeLog::apply_outcome(self, outcome) {
            return true;
        }
        self.reconcile_cancelled(outcome);
        false
    }
}

// ============================================================================
// Plans and reports
// ============================================================================

/// What a pass will send, in send order.
#[derive(Debug, Clone, Default)]
pub struct DrainPlan {
    pub eligible: Vec<PendingChange>,
    /// Still inside their backoff window.
    pub deferred: usize,
    /// Waiting on a conflict resolution.
    pub blocked: usize,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub eligible: usize,
    pub synced: usize,
    pub retrying: usize,
    pub dropped: usize,
    pub conflicts: usize,
    /// Sends whose result was discarded because the entry changed or left
    /// the queue meanwhile.
    pub stale: usize,
    pub deferred: usize,
    pub blocked: usize,
    /// The pass stopped before its last item.
    pub interrupted: bool,
    pub forced: bool,
    pub started_at: u64,
    pub finished_at: u64,
}

impl DrainReport {
    pub fn failures(&self) -> usize {
        self.retrying + self.dropped
    }

    /// Whether the pass deserves a Success event: something reached the
    /// remote. Passes that only hit conflicts or stale entries do not count.
    pub fn is_success(&self) -> bool {
        self.synced > 0
    }
}

// ============================================================================
// SyncEngine
// ============================================================================

/// Held while a pass runs.
#[derive(Debug)]
pub struct DrainGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    config: RwLock<SyncConfig>,
    remote: Arc<dyn RemoteStore>,
    active: AtomicUsize,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &*self.config.read())
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

impl SyncEngine {
    pub fn new(config: SyncConfig, remote: Arc<dyn RemoteStore>) -> Self {
        Self { config: RwLock::new(config), remote, active: AtomicUsize::new(0) }
    }

    pub fn config(&self) -> SyncConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: SyncConfig) {
        *self.config.write() = config;
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn is_draining(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    /// Enter `Draining`. Returns `None` when a pass is already running and
    /// this one is not forced.
    pub fn try_begin(&self, force: bool) -> Option<DrainGuard<'_>> {
        if force {
            self.active.fetch_add(1, Ordering::SeqCst);
        } else if self
            .active
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        Some(DrainGuard { active: &self.active })
    }

    /// Select and order what a pass at `now` would send.
    ///
    /// Order is priority class (creates, then updates and completes, then
    /// deletes), then `enqueued_at`, then `seq`.
    pub fn plan(&self, pending: Vec<PendingChange>, now: u64, force: bool) -> DrainPlan {
        let config = self.config.read();
        let mut plan = DrainPlan::default();
        for change in pending {
            if change.awaiting_resolution {
                plan.blocked += 1;
                continue;
            }
            if !force && change.attempts > 0 {
                let last = change.last_attempt_at.unwrap_or(0);
                if now.saturating_sub(last) < config.backoff_ms(change.attempts) {
                    plan.deferred += 1;
                    continue;
                }
            }
            plan.eligible.push(change);
        }
        plan.eligible.sort_by_key(PendingChange::drain_order);
        plan
    }

    /// Send one change and classify the result.
    ///
    /// The returned outcome carries the change as it stands after the
    /// attempt (counter bumped, timestamp set).
    pub async fn attempt(&self, mut change: PendingChange, now: u64) -> ItemOutcome {
        let max_retries = self.config.read().max_retries;
        change.attempts += 1;
        change.last_attempt_at = Some(now);

        let span = info_span!(
            "sync.item",
            key = %change.key(),
            op = %change.operation,
            attempt = change.attempts,
        );
        let sent = self.remote.send(&change).instrument(span).await;

        let result = match sent {
            Ok(applied) => {
                debug!("Synced {} {}", change.operation, change.key());
                ItemResult::Synced { applied }
            }
            Err(RemoteError::Conflict { remote, version }) => {
                // Conflicts do not count against the retry budget.
                change.attempts -= 1;
                info!("Conflict on {} (remote version {:?})", change.key(), version);
                ItemResult::Conflict { remote, version }
            }
            Err(RemoteError::Transient(error)) if change.attempts >= max_retries => {
                warn!(
                    "Dropping {} {} after {} attempts: {}",
                    change.operation,
                    change.key(),
                    change.attempts,
                    error
                );
                ItemResult::Dropped { reason: DropReason::RetriesExhausted, error }
            }
            Err(RemoteError::Transient(error)) => {
                debug!(
                    "Transient failure for {} (attempt {}/{}): {}",
                    change.key(),
                    change.attempts,
                    max_retries,
                    error
                );
                ItemResult::Retrying { error }
            }
            Err(RemoteError::Fatal(error)) => {
                warn!("Remote rejected {} {}: {}", change.operation, change.key(), error);
                ItemResult::Dropped { reason: DropReason::Fatal, error }
            }
        };
        ItemOutcome { change, result }
    }

    /// Run one pass over `queue`.
    ///
    /// Returns `None` without touching the queue when another pass is
    /// running and `force` is not set.
    pub async fn drain<Q>(&self, queue: &mut Q, force: bool) -> Option<DrainReport>
    where
        Q: DrainQueue + Send + ?Sized,
    {
        let Some(_guard) = self.try_begin(force) else {
            debug!("Drain already in progress, ignoring trigger");
            return None;
        };

        let started_at = now_millis();
        let plan = self.plan(queue.pending(), started_at, force);
        let mut report = DrainReport {
            eligible: plan.eligible.len(),
            deferred: plan.deferred,
            blocked: plan.blocked,
            forced: force,
            started_at,
            ..Default::default()
        };

        let span = info_span!("sync.drain", eligible = report.eligible, forced = force);
        async {
            if plan.eligible.is_empty() {
                debug!(
                    "Nothing eligible ({} deferred, {} blocked)",
                    report.deferred, report.blocked
                );
                return;
            }
            queue.on_started(report.eligible);

            for change in plan.eligible {
                if queue.checkpoint().is_break() {
                    report.interrupted = true;
                    break;
                }
                // Removed or superseded since the plan was made.
                if queue.current_seq(&change.key()) != Some(change.seq) {
                    report.stale += 1;
                    continue;
                }

                let outcome = self.attempt(change, now_millis()).await;
                if !queue.apply_outcome(&outcome) {
                    report.stale += 1;
                    continue;
                }
                match outcome.result {
                    ItemResult::Synced { .. } => report.synced += 1,
                    ItemResult::Retrying { .. } => report.retrying += 1,
                    ItemResult::Dropped { .. } => report.dropped += 1,
                    ItemResult::Conflict { .. } => report.conflicts += 1,
                }
            }

            info!(
                "Drain finished: {} synced, {} retrying, {} dropped, {} conflicts",
                report.synced, report.retrying, report.dropped, report.conflicts
            );
        }
        .instrument(span)
        .await;

        report.finished_at = now_millis();
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemote;
    use scrumsync_core::{EntityType, MemoryStore, Operation};
    use serde_json::json;

    fn engine_with(config: SyncConfig) -> (Arc<InMemoryRemote>, SyncEngine) {
        let remote = Arc::new(InMemoryRemote::new());
        let engine = SyncEngine::new(config, remote.clone());
        (remote, engine)
    }

    fn change(id: &str, op: Operation, t: u64) -> PendingChange {
        PendingChange::at(EntityType::Task, id, op, Some(json!({"title": id})), t)
    }

    fn new_log() -> ChangeLog {
        ChangeLog::load(Arc::new(MemoryStore::new()), "pending_changes")
    }

    #[test]
    fn test_plan_orders_by_priority_then_time() {
        let (_, engine) = engine_with(SyncConfig::default());
        let mut pending = vec![
            change("d1", Operation::Delete, 1),
            change("u2", Operation::Update, 5),
            change("c2", Operation::Create, 9),
            change("u1", Operation::Complete, 2),
            change("c1", Operation::Create, 3),
        ];
        for (i, c) in pending.iter_mut().enumerate() {
            c.seq = i as u64 + 1;
        }

        let plan = engine.plan(pending, 100, false);
        let ids: Vec<_> = plan.eligible.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "u1", "u2", "d1"]);
    }

    #[test]
    fn test_plan_respects_backoff_unless_forced() {
        let (_, engine) = engine_with(SyncConfig {
            initial_backoff_ms: 5000,
            backoff_multiplier: 1.5,
            ..Default::default()
        });
        let mut c = change("a", Operation::Update, 1);
        c.attempts = 3;
        c.last_attempt_at = Some(10_000);

        // attempt 3 waits 11250ms
        assert_eq!(engine.plan(vec![c.clone()], 21_249, false).deferred, 1);
        assert_eq!(engine.plan(vec![c.clone()], 21_250, false).eligible.len(), 1);
        assert_eq!(engine.plan(vec![c.clone()], 10_001, true).eligible.len(), 1);

        let mut blocked = change("b", Operation::Update, 1);
        blocked.awaiting_resolution = true;
        let plan = engine.plan(vec![blocked], 0, true);
        assert_eq!(plan.blocked, 1);
        assert!(plan.eligible.is_empty());
    }

    #[test]
    fn test_try_begin_reentrancy() {
        let (_, engine) = engine_with(SyncConfig::default());
        let first = engine.try_begin(false).unwrap();
        assert!(engine.is_draining());
        assert!(engine.try_begin(false).is_none());

        let forced = engine.try_begin(true);
        assert!(forced.is_some());
        drop(forced);
        drop(first);
        assert!(!engine.is_draining());
    }

    #[tokio::test]
    async fn test_attempt_classifies_results() {
        let (remote, engine) = engine_with(SyncConfig { max_retries: 2, ..Default::default() });
        let c = change("a", Operation::Create, 1);

        remote.fail_next(RemoteError::Transient("timeout".into()));
        let first = engine.attempt(c.clone(), 50).await;
        assert!(matches!(first.result, ItemResult::Retrying { .. }));
        assert_eq!(first.change.attempts, 1);
        assert_eq!(first.change.last_attempt_at, Some(50));

        remote.fail_next(RemoteError::Transient("timeout".into()));
        let second = engine.attempt(first.change, 60).await;
        assert!(matches!(
            second.result,
            ItemResult::Dropped { reason: DropReason::RetriesExhausted, .. }
        ));

        remote.fail_next(RemoteError::Fatal("invalid title".into()));
        let fatal = engine.attempt(c.clone(), 70).await;
        assert!(matches!(fatal.result, ItemResult::Dropped { reason: DropReason::Fatal, .. }));

        remote.fail_next(RemoteError::Conflict { remote: json!({}), version: Some(2) });
        let conflict = engine.attempt(c, 80).await;
        assert!(matches!(conflict.result, ItemResult::Conflict { version: Some(2), .. }));
        assert_eq!(conflict.change.attempts, 0);
    }

    #[tokio::test]
    async fn test_drain_change_log() {
        let (remote, engine) = engine_with(SyncConfig::default());
        let mut log = new_log();
        log.enqueue(change("a", Operation::Create, 1));
        log.enqueue(change("b", Operation::Create, 2));
        log.enqueue(PendingChange::at(EntityType::Task, "ghost", Operation::Update, Some(json!({})), 3));

        let report = engine.drain(&mut log, false).await.unwrap();
        assert_eq!(report.eligible, 3);
        assert_eq!(report.synced, 2);
        // Update of an entity the remote never saw is rejected outright.
        assert_eq!(report.dropped, 1);
        assert!(log.is_empty());
        assert_eq!(remote.count(EntityType::Task), 2);
        assert!(report.finished_at >= report.started_at);
    }

    #[tokio::test]
    async fn test_drain_keeps_transient_failures_queued() {
        let (remote, engine) = engine_with(SyncConfig::default());
        let mut log = new_log();
        log.enqueue(change("a", Operation::Create, 1));
        remote.set_unreachable(true);

        let report = engine.drain(&mut log, false).await.unwrap();
        assert_eq!(report.retrying, 1);
        assert!(!report.is_success());
        let entry = log.all().remove(0);
        assert_eq!(entry.attempts, 1);

        // Inside the backoff window nothing is sent.
        let report = engine.drain(&mut log, false).await.unwrap();
        assert_eq!(report.eligible, 0);
        assert_eq!(report.deferred, 1);

        remote.set_unreachable(false);
        let report = engine.drain(&mut log, true).await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_conflict_only_pass_is_not_success() {
        let (remote, engine) = engine_with(SyncConfig::default());
        let key = EntityKey::new(EntityType::Task, "a");
        remote.seed(key.clone(), json!({"id": "a", "title": "X"}), 1);
        remote.edit(&key, json!({"title": "Y"}));

        let mut log = new_log();
        log.enqueue(change("a", Operation::Update, 1).with_base_version(1));
        let report = engine.drain(&mut log, false).await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.failures(), 0);
        assert!(!report.is_success());
    }

    struct Interrupting {
        log: ChangeLog,
        sends_before_break: usize,
    }

    impl DrainQueue for Interrupting {
        fn pending(&self) -> Vec<PendingChange> {
            self.log.all()
        }

        fn current_seq(&self, key: &EntityKey) -> Option<u64> {
            self.log.get(key).map(|c| c.seq)
        }

        fn apply_outcome(&mut self, outcome: &ItemOutcome) -> bool {
            self.log.apply_outcome(outcome)
        }

        fn checkpoint(&mut self) -> ControlFlow<()> {
            if self.sends_before_break == 0 {
                return ControlFlow::Break(());
            }
            self.sends_before_break -= 1;
            ControlFlow::Continue(())
        }
    }

    #[tokio::test]
    async fn test_checkpoint_break_interrupts_pass() {
        let (remote, engine) = engine_with(SyncConfig::default());
        let mut queue = Interrupting { log: new_log(), sends_before_break: 1 };
        queue.log.enqueue(change("a", Operation::Create, 1));
        queue.log.enqueue(change("b", Operation::Create, 2));

        let report = engine.drain(&mut queue, false).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.synced, 1);
        assert_eq!(queue.log.len(), 1);
        assert_eq!(remote.calls().len(), 1);
    }
}
