//! 离线同步端到端测试：队列、网络恢复、同步周期

use std::sync::Arc;
use std::time::Duration;

use marketsync_sdk::{
    resolve_last_write_wins, ChannelNetworkListener, DrainOutcome, MemoryBackend, MutationKind, MutationStatus,
    OfflineSync, RemoteError, RemoteErrorCode, SkipReason, StaticFetcher, SyncConfig, SyncError, SyncEvent,
};
use serde_json::json;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

struct Harness {
    sdk: Arc<OfflineSync>,
    backend: Arc<MemoryBackend>,
    listener: Arc<ChannelNetworkListener>,
}

async fn start(dir: &TempDir, online: bool, debounce_ms: u64) -> Harness {
    start_with_backend(dir, online, debounce_ms, Arc::new(MemoryBackend::new())).await
}

async fn start_with_backend(dir: &TempDir, online: bool, debounce_ms: u64, backend: Arc<MemoryBackend>) -> Harness {
    let config = SyncConfig::builder()
        .data_dir(dir.path())
        .reconnect_debounce_ms(debounce_ms)
        .auto_retry(false)
        .app_origin("https://app.example.com")
        .build();
    let listener = Arc::new(ChannelNetworkListener::new(online));
    let sdk = OfflineSync::initialize(config, backend.clone(), listener.clone(), Arc::new(StaticFetcher::new()))
        .await
        .unwrap();
    Harness { sdk, backend, listener }
}

async fn wait_until_drained(sdk: &OfflineSync) {
    for _ in 0..150 {
        let counts = sdk.queue_counts().await.unwrap();
        if counts.pending == 0 && counts.in_flight == 0 && !sdk.engine().is_draining() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("queue was not drained in time");
}

#[tokio::test]
async fn test_offline_create_is_replayed_on_reconnect() {
    let dir = TempDir::new().unwrap();
    let h = start(&dir, false, 20).await;

    let payload = json!({"title": "Fix fence", "budget": 50});
    let record = h
        .sdk
        .enqueue(MutationKind::Create, "opportunities", payload.clone())
        .await
        .unwrap();

    let pending = h.sdk.list(Some(MutationStatus::Pending)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, record.id);
    assert!(h.backend.calls().is_empty());

    h.listener.became_online();
    wait_until_drained(&h.sdk).await;

    let inserts = h.backend.calls_for("insert");
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].collection, "opportunities");
    assert_eq!(inserts[0].payload, payload);

    let stored = h.sdk.list(None).await.unwrap();
    assert_eq!(stored[0].status, MutationStatus::Completed);
    h.sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_drain_replays_in_enqueue_order() {
    let dir = TempDir::new().unwrap();
    let h = start(&dir, false, 20).await;

    let titles: Vec<String> = (0..6).map(|i| format!("job-{}", i)).collect();
    for title in &titles {
        h.sdk
            .enqueue(MutationKind::Create, "opportunities", json!({ "title": title }))
            .await
            .unwrap();
    }

    let listed: Vec<String> = h
        .sdk
        .list(None)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.payload["title"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(listed, titles);

    h.listener.became_online();
    wait_until_drained(&h.sdk).await;

    let replayed: Vec<String> = h
        .backend
        .calls_for("insert")
        .into_iter()
        .map(|c| c.payload["title"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(replayed, titles);
    h.sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_simultaneous_reconnect_and_manual_retry_run_one_drain() {
    let dir = TempDir::new().unwrap();
    // 防抖足够长，避免调度器插入第三次触发
    let h = start(&dir, false, 60_000).await;
    h.backend.set_latency(Duration::from_millis(40));
    for i in 0..3 {
        h.sdk
            .enqueue(MutationKind::Create, "chat", json!({"id": format!("m{}", i), "body": "hi"}))
            .await
            .unwrap();
    }
    h.sdk.network().set_online(true);

    let engine = h.sdk.engine().clone();
    let (reconnect, manual) = tokio::join!(engine.on_reconnect(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.sdk.retry_failed_operations().await
    });

    let outcomes = [reconnect.unwrap(), manual.unwrap()];
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, DrainOutcome::Skipped(SkipReason::AlreadyDraining)))
        .count();
    assert_eq!(skipped, 1);
    assert_eq!(h.backend.calls_for("insert").len(), 3);
    h.sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_status_and_retry_count_are_monotonic() {
    let dir = TempDir::new().unwrap();
    let h = start(&dir, true, 20).await;
    let mut events = h.sdk.subscribe_events();

    h.backend.set_reachable(false);
    let record = h
        .sdk
        .enqueue(MutationKind::Create, "tokens", json!({"id": "t1", "amount": 10}))
        .await
        .unwrap();
    h.sdk.wait_idle().await;
    h.sdk.retry_failed_operations().await.unwrap();
    assert_eq!(h.sdk.failed_count().await.unwrap(), 1);

    h.backend.set_reachable(true);
    h.sdk.retry_failed_operations().await.unwrap();

    let done = h.sdk.engine().queue().get(&record.id).await.unwrap().unwrap();
    assert_eq!(done.status, MutationStatus::Completed);
    assert_eq!(done.retry_count, 2);

    let mut last_retry = 0;
    let mut completed_seen = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::MutationStatusChanged {
            id,
            old_status,
            new_status,
            retry_count,
            ..
        } = event
        {
            if id != record.id {
                continue;
            }
            assert!(!completed_seen, "record left Completed");
            assert_ne!(old_status, MutationStatus::Completed);
            assert!(retry_count >= last_retry);
            last_retry = retry_count;
            completed_seen = new_status == MutationStatus::Completed;
        }
    }
    assert!(completed_seen);

    let err = assert_err!(
        h.sdk
            .engine()
            .queue()
            .update_status(&record.id, MutationStatus::Pending, None)
            .await
    );
    assert!(matches!(err, SyncError::InvalidTransition { .. }));
    h.sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_replaying_settled_queue_makes_no_remote_calls() {
    let dir = TempDir::new().unwrap();
    let h = start(&dir, true, 20).await;

    h.sdk
        .enqueue(MutationKind::Create, "opportunities", json!({"id": "o1", "title": "ok"}))
        .await
        .unwrap();
    h.sdk.wait_idle().await;
    h.backend
        .fail_next(RemoteError::new(RemoteErrorCode::Malformed, "invalid input syntax"));
    h.sdk
        .enqueue(MutationKind::Create, "opportunities", json!({"id": "o2", "budget": "abc"}))
        .await
        .unwrap();
    h.sdk.wait_idle().await;

    let counts = h.sdk.queue_counts().await.unwrap();
    assert_eq!((counts.completed, counts.failed), (1, 1));

    h.backend.clear_calls();
    let outcome = assert_ok!(h.sdk.sync_now().await);
    assert_eq!(outcome.report().map(|r| r.processed), Some(0));
    h.listener.became_offline();
    h.listener.became_online();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.backend.calls().is_empty());
    h.sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    let first = start(&dir, false, 20).await;
    first
        .sdk
        .enqueue(MutationKind::Update, "profiles", json!({"id": "u1", "full_name": "Ama"}))
        .await
        .unwrap();
    first.sdk.shutdown().await.unwrap();
    drop(first);

    let backend = Arc::new(MemoryBackend::new());
    backend.seed("profiles", json!({"id": "u1", "full_name": "A."}));
    let second = start_with_backend(&dir, true, 20, backend).await;
    wait_until_drained(&second.sdk).await;

    assert_eq!(second.sdk.queue_counts().await.unwrap().completed, 1);
    assert_eq!(second.backend.row("profiles", "u1").unwrap()["full_name"], "Ama");
    second.sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_foreground_rearms_drain() {
    let dir = TempDir::new().unwrap();
    let h = start(&dir, false, 60_000).await;
    h.sdk
        .enqueue(MutationKind::Delete, "providers", json!({"id": "p9"}))
        .await
        .unwrap();

    // 直接改网络状态，不经过监听器，防抖窗口内不会自动同步
    h.sdk.network().set_online(true);
    assert_ok!(h.sdk.lifecycle().notify_background().await);
    assert_ok!(h.sdk.lifecycle().notify_foreground().await);
    h.sdk.wait_idle().await;

    assert_eq!(h.backend.calls_for("delete").len(), 1);
    // 远端不存在该行，按永久失败处理
    assert_eq!(h.sdk.failed_count().await.unwrap(), 1);
    h.sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_online_conflict_settles_without_another_trigger() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.seed(
        "opportunities",
        json!({"id": "o1", "title": "Remote", "updated_at": "2024-01-01T00:00:00Z"}),
    );
    let h = start_with_backend(&dir, true, 20, backend).await;

    let record = h
        .sdk
        .enqueue(
            MutationKind::Create,
            "opportunities",
            json!({"id": "o1", "title": "Local", "updated_at": "2024-02-01T00:00:00Z"}),
        )
        .await
        .unwrap();
    h.sdk.wait_idle().await;

    let settled = h.sdk.engine().queue().get(&record.id).await.unwrap().unwrap();
    assert_eq!(settled.status, MutationStatus::Completed);
    assert_eq!(settled.kind, MutationKind::Update);
    let verbs: Vec<&str> = h.backend.calls().iter().map(|c| c.verb).collect();
    assert_eq!(verbs, vec!["insert", "select", "update"]);
    assert_eq!(h.backend.row("opportunities", "o1").unwrap()["title"], "Local");
    h.sdk.shutdown().await.unwrap();
}

#[test]
fn test_last_write_wins_round_trip() {
    let older = json!({"updated_at": "2024-03-01T08:00:00Z", "tokens": 5});
    let newer = json!({"updated_at": "2024-03-02T08:00:00Z", "tokens": 8});

    assert_eq!(resolve_last_write_wins(&older, &newer), newer);
    assert_eq!(resolve_last_write_wins(&newer, &older), newer);

    let local = json!({"updated_at": "2024-03-02T08:00:00Z", "tokens": 5});
    let remote = json!({"updated_at": "2024-03-01T08:00:00Z", "tokens": 8});
    assert_eq!(resolve_last_write_wins(&local, &remote), local);
}
