//! End-to-end scenarios for the sync service against the in-memory remote.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use scrumsync_client::{
    ConnectivityMonitor, DrainMode, InMemoryRemote, ServiceError, SyncService,
};
use scrumsync_core::{
    EntityKey, EntityType, KvStore, MemoryStore, Operation, PendingChange, ResolutionChoice, Side,
    SqliteStore, SyncConfig, SyncEventKind, SyncStatus, Task,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("scrumsync_client=debug,scrumsync_core=debug")
        .with_test_writer()
        .try_init();
}

fn test_config() -> SyncConfig {
    SyncConfig {
        initial_backoff_ms: 0,
        connectivity_debounce_ms: 10,
        ..Default::default()
    }
}

struct Harness {
    remote: Arc<InMemoryRemote>,
    monitor: ConnectivityMonitor,
    service: SyncService,
}

fn start(mode: DrainMode, online: bool, config: SyncConfig) -> Harness {
    init_tracing();
    let remote = Arc::new(InMemoryRemote::new());
    let monitor = ConnectivityMonitor::new(online);
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let service = SyncService::start(config, store, remote.clone(), monitor.clone(), mode)
        .expect("service should start");
    Harness { remote, monitor, service }
}

async fn wait_for_status<F>(rx: &mut watch::Receiver<SyncStatus>, f: F)
where
    F: FnMut(&SyncStatus) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(f))
        .await
        .expect("timed out waiting for status")
        .map(|_| ())
        .expect("status channel closed");
}

/// Force passes until the queue is empty.
async fn drain_fully(service: &SyncService) {
    for _ in 0..10 {
        if service.current_status().queue_length == 0 {
            return;
        }
        service.sync_now().await.expect("sync pass");
    }
    panic!("queue did not drain: {:?}", service.current_status());
}

fn task_key(id: &str) -> EntityKey {
    EntityKey::new(EntityType::Task, id)
}

/// Poll `f` until it holds, failing after five seconds.
async fn eventually<F>(mut f: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

async fn delete_during_create_send(mode: DrainMode) {
    let h = start(mode, true, test_config());
    h.remote.set_latency(Some(Duration::from_millis(100)));
    let task = Task::new("t1", "Short-lived");

    h.service.enqueue_entity(&task, Operation::Create).unwrap();
    eventually(|| h.service.current_status().is_processing).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.service.enqueue_entity(&task, Operation::Delete).unwrap();

    eventually(|| h.remote.calls().len() == 2 && h.service.current_status().queue_length == 0).await;
    let ops: Vec<_> = h.remote.calls().into_iter().map(|c| c.operation).collect();
    assert_eq!(ops, vec![Operation::Create, Operation::Delete]);
    assert_eq!(h.remote.count(EntityType::Task), 0);
    assert!(h.service.failed_changes().is_empty());
    h.service.dispose().await;
}

#[tokio::test]
async fn offline_enqueue_drains_after_reconnect() {
    let h = start(DrainMode::Worker, false, test_config());
    let mut status = h.service.subscribe_status();

    h.service
        .enqueue_entity(&Task::new("t1", "Write release notes"), Operation::Create)
        .unwrap();
    assert_eq!(h.service.current_status().queue_length, 1);
    assert!(h.remote.calls().is_empty());

    h.monitor.set_online(true);
    wait_for_status(&mut status, |s| s.queue_length == 0 && s.last_sync_at.is_some()).await;

    let history = h.service.history();
    let count = |kind| history.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(SyncEventKind::ConnectivityRestored), 1);
    assert_eq!(count(SyncEventKind::Started), 1);
    assert_eq!(count(SyncEventKind::Success), 1);
    assert_eq!(count(SyncEventKind::Error), 0);
    let success = history.iter().find(|e| e.kind == SyncEventKind::Success).unwrap();
    assert_eq!(success.change_count, Some(1));

    assert_eq!(h.remote.count(EntityType::Task), 1);
    h.service.dispose().await;
}

#[tokio::test]
async fn retries_exhaust_into_one_permanent_failure() {
    let config = SyncConfig { max_retries: 3, ..test_config() };
    let h = start(DrainMode::Inline, true, config);
    h.remote.set_unreachable(true);

    h.service.enqueue_change(PendingChange::new(
        EntityType::Task,
        "t1",
        Operation::Create,
        Some(json!({"title": "never lands"})),
    ));
    drain_fully(&h.service).await;

    let history = h.service.history();
    let errors: Vec<_> = history.iter().filter(|e| e.kind == SyncEventKind::Error).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].entity, Some(task_key("t1")));
    assert!(!history.iter().any(|e| e.kind == SyncEventKind::Success));

    assert_eq!(h.remote.calls().len(), 3);
    let status = h.service.current_status();
    assert_eq!(status.queue_length, 0);
    assert_eq!(status.failed_changes, 1);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn remote_resolution_dequeues_conflicted_change() {
    let h = start(DrainMode::Inline, true, test_config());
    h.remote.seed(task_key("t1"), json!({"id": "t1", "title": "Y"}), 2);

    h.service.enqueue_change(
        PendingChange::new(EntityType::Task, "t1", Operation::Update, Some(json!({"title": "X"})))
            .with_base_version(1),
    );
    h.service.sync_now().await.unwrap();

    let conflicts = h.service.conflicts();
    assert_eq!(conflicts.len(), 1);
    let fields: Vec<_> = conflicts[0].diffs.iter().map(|d| d.field.as_str()).collect();
    assert_eq!(fields, vec!["title"]);
    let status = h.service.current_status();
    assert_eq!(status.pending_conflicts, 1);
    assert_eq!(status.queue_length, 1);

    // Blocked entries are not resent while the conflict is open.
    let calls_before = h.remote.calls().len();
    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.blocked, 1);
    assert_eq!(h.remote.calls().len(), calls_before);

    let resolved = h
        .service
        .resolve_conflict(conflicts[0].id, ResolutionChoice::Remote)
        .unwrap();
    assert_eq!(resolved["title"], "Y");

    let status = h.service.current_status();
    assert_eq!(status.queue_length, 0);
    assert_eq!(status.pending_conflicts, 0);
    assert!(h.service.conflicts().is_empty());
    assert_eq!(h.remote.get(&task_key("t1")).unwrap().0["title"], "Y");
}

#[tokio::test]
async fn merge_resolution_resends_rebased_update() {
    let h = start(DrainMode::Inline, true, test_config());
    h.remote
        .seed(task_key("t1"), json!({"id": "t1", "title": "Y", "story_points": 3}), 2);

    h.service.enqueue_change(
        PendingChange::new(
            EntityType::Task,
            "t1",
            Operation::Update,
            Some(json!({"title": "X", "story_points": 5})),
        )
        .with_base_version(1),
    );
    h.service.sync_now().await.unwrap();
    let conflict = h.service.conflicts().remove(0);
    assert_eq!(conflict.diffs.len(), 2);

    h.service
        .select_conflict_field(conflict.id, "story_points", Side::Remote)
        .unwrap();
    assert!(matches!(
        h.service.select_conflict_field(conflict.id, "color", Side::Remote),
        Err(ServiceError::Conflict(_))
    ));
    let merged = h.service.resolve_conflict(conflict.id, ResolutionChoice::Merge).unwrap();
    assert_eq!(merged, json!({"id": "t1", "title": "X", "story_points": 3}));

    let pending = h.service.pending_changes();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].base_version, Some(2));
    assert!(!pending[0].awaiting_resolution);

    drain_fully(&h.service).await;
    let (entity, version) = h.remote.get(&task_key("t1")).unwrap();
    assert_eq!(entity["title"], "X");
    assert_eq!(entity["story_points"], 3);
    assert_eq!(version, 3);
}

#[tokio::test]
async fn commit_is_all_or_nothing() {
    let h = start(DrainMode::Inline, true, test_config());
    for id in ["a", "b"] {
        h.remote.seed(task_key(id), json!({"id": id, "title": "remote"}), 5);
        h.service.enqueue_change(
            PendingChange::new(EntityType::Task, id, Operation::Update, Some(json!({"title": "local"})))
                .with_base_version(4),
        );
    }
    h.service.sync_now().await.unwrap();
    assert_eq!(h.service.conflicts().len(), 2);

    assert!(matches!(
        h.service.commit_conflicts(),
        Err(ServiceError::Conflict(_))
    ));
    assert_eq!(h.service.resolve_all_conflicts(Side::Local).unwrap(), 2);
    assert!(h.service.conflicts().is_empty());

    drain_fully(&h.service).await;
    assert_eq!(h.remote.get(&task_key("a")).unwrap().0["title"], "local");
    assert_eq!(h.remote.get(&task_key("b")).unwrap().0["title"], "local");
}

#[tokio::test]
async fn replayed_create_is_not_duplicated() {
    let h = start(DrainMode::Inline, true, test_config());
    // The first attempt reached the remote but its response was lost.
    h.remote
        .seed(task_key("t1"), json!({"id": "t1", "title": "Standup notes"}), 1);

    h.service.enqueue_change(PendingChange::new(
        EntityType::Task,
        "t1",
        Operation::Create,
        Some(json!({"title": "Standup notes"})),
    ));
    let report = h.service.sync_now().await.unwrap();

    assert_eq!(report.failures(), 0);
    assert_eq!(h.remote.count(EntityType::Task), 1);
    let status = h.service.current_status();
    assert_eq!(status.queue_length, 0);
    assert!(status.last_error.is_none());
    assert!(!h.service.history().iter().any(|e| e.kind == SyncEventKind::Error));
}

#[tokio::test]
async fn creates_go_before_updates_before_deletes() {
    let h = start(DrainMode::Inline, false, test_config());
    h.remote.seed(task_key("old"), json!({"id": "old"}), 1);
    h.remote.seed(task_key("edit"), json!({"id": "edit"}), 1);

    h.service.enqueue_change(PendingChange::at(EntityType::Task, "old", Operation::Delete, None, 1));
    h.service.enqueue_change(PendingChange::at(
        EntityType::Task,
        "edit",
        Operation::Update,
        Some(json!({"title": "edited"})),
        2,
    ));
    h.service.enqueue_change(PendingChange::at(
        EntityType::Task,
        "new2",
        Operation::Create,
        Some(json!({})),
        4,
    ));
    h.service.enqueue_change(PendingChange::at(
        EntityType::Task,
        "new1",
        Operation::Create,
        Some(json!({})),
        3,
    ));

    h.monitor.set_online(true);
    drain_fully(&h.service).await;

    let order: Vec<_> = h
        .remote
        .calls()
        .into_iter()
        .map(|c| (c.operation, c.key.id))
        .collect();
    assert_eq!(
        order,
        vec![
            (Operation::Create, "new1".to_string()),
            (Operation::Create, "new2".to_string()),
            (Operation::Update, "edit".to_string()),
            (Operation::Delete, "old".to_string()),
        ]
    );
}

#[tokio::test]
async fn create_then_delete_offline_never_reaches_remote() {
    let h = start(DrainMode::Worker, false, test_config());
    let task = Task::new("t1", "Scratch");
    h.service.enqueue_entity(&task, Operation::Create).unwrap();
    h.service.enqueue_entity(&task, Operation::Delete).unwrap();
    assert_eq!(h.service.current_status().queue_length, 0);

    h.monitor.set_online(true);
    let report = h.service.sync_now().await;
    // The worker may still be inside the reconnect debounce.
    if let Ok(report) = report {
        assert_eq!(report.eligible, 0);
    }
    assert!(h.remote.calls().is_empty());
    h.service.dispose().await;
}

#[tokio::test]
async fn history_subscribers_see_live_events() {
    let h = start(DrainMode::Worker, true, test_config());
    let mut events = h.service.subscribe_history();

    h.service.enqueue_change(PendingChange::new(
        EntityType::List,
        "l1",
        Operation::Create,
        Some(json!({"name": "Sprint 12"})),
    ));

    let mut kinds = Vec::new();
    while kinds.last() != Some(&SyncEventKind::Success) {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for history")
            .unwrap();
        kinds.push(event.kind);
    }
    assert_eq!(kinds, vec![SyncEventKind::Started, SyncEventKind::Success]);

    h.monitor.set_online(false);
    let lost = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lost.kind, SyncEventKind::ConnectivityLost);

    let exported: serde_json::Value =
        serde_json::from_str(&h.service.export_history().unwrap()).unwrap();
    assert_eq!(exported.as_array().unwrap().len(), 3);
    h.service.clear_history();
    assert!(h.service.history().is_empty());
    h.service.dispose().await;
}

#[tokio::test]
async fn queue_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let remote = Arc::new(InMemoryRemote::new());

    {
        let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let service = SyncService::start(
            test_config(),
            store,
            remote.clone(),
            ConnectivityMonitor::new(false),
            DrainMode::Worker,
        )
        .unwrap();
        service
            .enqueue_entity(&Task::new("t1", "Survive a restart"), Operation::Create)
            .unwrap();
        service.dispose().await;
    }

    let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let monitor = ConnectivityMonitor::new(true);
    let service =
        SyncService::start(test_config(), store, remote.clone(), monitor, DrainMode::Worker)
            .unwrap();
    let mut status = service.subscribe_status();
    wait_for_status(&mut status, |s| s.queue_length == 0 && s.last_sync_at.is_some()).await;
    assert_eq!(remote.count(EntityType::Task), 1);
    service.dispose().await;
}

#[tokio::test]
async fn connectivity_check_feeds_status() {
    let h = start(DrainMode::Inline, true, test_config());
    h.remote.set_unreachable(true);
    assert!(!h.service.test_connection().await);
    assert!(!h.service.current_status().is_online);

    h.remote.set_unreachable(false);
    assert!(h.service.test_connection().await);
    assert!(h.service.current_status().is_online);
}

#[tokio::test]
async fn delete_during_create_send_removes_remote_copy_inline() {
    delete_during_create_send(DrainMode::Inline).await;
}

#[tokio::test]
async fn delete_during_create_send_removes_remote_copy_worker() {
    delete_during_create_send(DrainMode::Worker).await;
}

#[tokio::test]
async fn going_offline_is_immediate_and_flaps_do_not_drain() {
    let config = SyncConfig { connectivity_debounce_ms: 300, ..test_config() };
    let h = start(DrainMode::Worker, false, config);
    let mut events = h.service.subscribe_history();
    h.service.enqueue_change(PendingChange::new(
        EntityType::Task,
        "t1",
        Operation::Create,
        Some(json!({"title": "Flaky wifi"})),
    ));

    h.monitor.set_online(true);
    let restored = tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
    assert_eq!(restored.kind, SyncEventKind::ConnectivityRestored);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Lost is recorded well inside the restore debounce.
    h.monitor.set_online(false);
    let lost = tokio::time::timeout(Duration::from_millis(100), events.recv())
        .await
        .expect("offline was not handled immediately")
        .unwrap();
    assert_eq!(lost.kind, SyncEventKind::ConnectivityLost);
    assert!(!h.service.current_status().is_online);

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.monitor.set_online(true);
    assert!(h.remote.calls().is_empty());

    let mut status = h.service.subscribe_status();
    wait_for_status(&mut status, |s| s.queue_length == 0).await;

    let history = h.service.history();
    let count = |kind| history.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(SyncEventKind::ConnectivityRestored), 2);
    assert_eq!(count(SyncEventKind::ConnectivityLost), 1);
    assert_eq!(count(SyncEventKind::Started), 1);
    assert_eq!(h.remote.calls().len(), 1);
    h.service.dispose().await;
}

#[tokio::test]
async fn worker_conflict_resolves_with_local_side() {
    let h = start(DrainMode::Worker, true, test_config());
    let mut status = h.service.subscribe_status();
    h.remote.seed(task_key("t1"), json!({"id": "t1", "title": "remote"}), 2);

    h.service.enqueue_change(
        PendingChange::new(EntityType::Task, "t1", Operation::Update, Some(json!({"title": "local"})))
            .with_base_version(1),
    );
    wait_for_status(&mut status, |s| s.pending_conflicts == 1 && !s.is_processing).await;
    assert_eq!(h.service.current_status().queue_length, 1);

    assert_eq!(h.service.resolve_all_conflicts(Side::Local).unwrap(), 1);
    wait_for_status(&mut status, |s| s.queue_length == 0 && s.pending_conflicts == 0).await;

    let (entity, version) = h.remote.get(&task_key("t1")).unwrap();
    assert_eq!(entity["title"], "local");
    assert_eq!(version, 3);
    assert!(h.service.conflicts().is_empty());
    h.service.dispose().await;
}

#[tokio::test]
async fn edit_after_conflict_syncs_against_remote_version() {
    let h = start(DrainMode::Inline, true, test_config());
    h.remote.seed(task_key("t1"), json!({"id": "t1", "title": "Y"}), 2);

    h.service.enqueue_change(
        PendingChange::new(EntityType::Task, "t1", Operation::Update, Some(json!({"title": "X"})))
            .with_base_version(1),
    );
    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.conflicts, 1);

    // A fresh edit replaces the conflicted one instead of resolving it.
    h.service.enqueue_change(PendingChange::new(
        EntityType::Task,
        "t1",
        Operation::Update,
        Some(json!({"title": "Z"})),
    ));
    assert_eq!(h.service.pending_changes()[0].base_version, Some(2));
    drain_fully(&h.service).await;

    let (entity, version) = h.remote.get(&task_key("t1")).unwrap();
    assert_eq!(entity["title"], "Z");
    assert_eq!(version, 3);
    assert!(h.service.conflicts().is_empty());
    assert_eq!(h.service.current_status().pending_conflicts, 0);
}

#[tokio::test]
async fn conflict_only_pass_records_no_success() {
    let h = start(DrainMode::Inline, true, test_config());
    h.remote.seed(task_key("t1"), json!({"id": "t1", "title": "Y"}), 2);

    h.service.enqueue_change(
        PendingChange::new(EntityType::Task, "t1", Operation::Update, Some(json!({"title": "X"})))
            .with_base_version(1),
    );
    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.synced, 0);
    assert_eq!(report.conflicts, 1);

    let history = h.service.history();
    assert!(history.iter().any(|e| e.kind == SyncEventKind::Started));
    assert!(!history.iter().any(|e| e.kind == SyncEventKind::Success));
    assert!(h.service.current_status().last_sync_at.is_none());
}

#[tokio::test]
async fn persistence_failure_shows_in_status() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(InMemoryRemote::new());
    let monitor = ConnectivityMonitor::new(true);
    let service = SyncService::start(
        test_config(),
        store.clone(),
        remote.clone(),
        monitor,
        DrainMode::Inline,
    )
    .unwrap();

    store.set_fail_writes(true);
    service.enqueue_change(PendingChange::new(
        EntityType::Task,
        "t1",
        Operation::Create,
        Some(json!({"title": "kept in memory"})),
    ));
    drain_fully(&service).await;
    // The remote still gets the change; the failure stays visible.
    assert_eq!(remote.count(EntityType::Task), 1);
    let error = service.current_status().last_error.expect("persistence error surfaced");
    assert!(!error.is_empty());

    store.set_fail_writes(false);
    service.enqueue_change(PendingChange::new(
        EntityType::Task,
        "t2",
        Operation::Create,
        Some(json!({"title": "persisted"})),
    ));
    drain_fully(&service).await;
    let status = service.current_status();
    assert_eq!(status.queue_length, 0);
    assert!(status.last_error.is_none());
    service.dispose().await;
}
