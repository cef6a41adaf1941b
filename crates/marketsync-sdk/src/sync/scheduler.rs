//! 同步调度器
//!
//! - 网络恢复后经过防抖窗口再触发同步；窗口内再次断网则取消
//! - 瞬时失败按退避时间放入 `DelayQueue`，到期且在线时自动重试

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::network::NetworkMonitor;
use crate::queue::MutationStatus;
use crate::sync::engine::{DrainOutcome, ScheduledRetry, SyncEngine};
use crate::utils::TimeFormatter;

/// 同步调度器
#[derive(Debug)]
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    network: Arc<NetworkMonitor>,
    debounce: Duration,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>, network: Arc<NetworkMonitor>, debounce: Duration) -> Self {
        Self {
            engine,
            network,
            debounce,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// 启动重连监听与退避重试任务
    pub async fn start(&self) -> Result<()> {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        self.engine.set_retry_sink(retry_tx.clone());

        // 进程重启前已排好的重试
        let mut restored = 0;
        for record in self.engine.queue().list(Some(MutationStatus::Failed)).await? {
            if let (true, Some(at)) = (record.is_auto_retryable(), record.next_retry_at) {
                if retry_tx.send(ScheduledRetry { id: record.id, at }).is_ok() {
                    restored += 1;
                }
            }
        }
        if restored > 0 {
            info!("🔁 恢复了 {} 条待自动重试的记录", restored);
        }

        self.tasks.spawn(reconnect_loop(
            self.engine.clone(),
            self.network.subscribe(),
            self.network.clone(),
            self.debounce,
            self.shutdown.clone(),
        ));
        self.tasks.spawn(retry_loop(
            self.engine.clone(),
            self.network.clone(),
            retry_rx,
            self.shutdown.clone(),
        ));

        info!("✅ 同步调度器已启动 (防抖 {}ms)", self.debounce.as_millis());
        Ok(())
    }

    /// 停止所有调度任务并等待其结束
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!("同步调度器已停止");
    }
}

async fn wait_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline.as_mut() {
        Some(sleep) => sleep.await,
        None => std::future::pending::<()>().await,
    }
}

async fn reconnect_loop(
    engine: Arc<SyncEngine>,
    mut status: broadcast::Receiver<crate::network::ConnectivityState>,
    network: Arc<NetworkMonitor>,
    debounce: Duration,
    shutdown: CancellationToken,
) {
    let mut deadline: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = status.recv() => {
                let online = match changed {
                    Ok(state) => state.online,
                    Err(broadcast::error::RecvError::Lagged(_)) => network.is_online(),
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if online {
                    debug!("网络恢复，{}ms 后触发同步", debounce.as_millis());
                    deadline = Some(Box::pin(tokio::time::sleep(debounce)));
                } else if deadline.take().is_some() {
                    info!("防抖窗口内再次断网，取消本次同步");
                }
            }
            _ = wait_deadline(&mut deadline) => {
                deadline = None;
                match engine.on_reconnect().await {
                    Ok(DrainOutcome::Completed(report)) => {
                        debug!("重连同步完成: {:?}", report);
                    }
                    Ok(DrainOutcome::Skipped(reason)) => {
                        debug!("重连同步被跳过: {:?}", reason);
                    }
                    Err(e) => error!("重连同步失败: {}", e),
                }
            }
        }
    }
}

async fn retry_loop(
    engine: Arc<SyncEngine>,
    network: Arc<NetworkMonitor>,
    mut requests: mpsc::UnboundedReceiver<ScheduledRetry>,
    shutdown: CancellationToken,
) {
    let mut queue: DelayQueue<String> = DelayQueue::new();
    let mut keys: HashMap<String, delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(request) = requests.recv() => {
                let wait_ms = (request.at - TimeFormatter::now_utc_millis()).max(0) as u64;
                if let Some(previous) = keys.remove(&request.id) {
                    queue.remove(&previous);
                }
                debug!("计划 {}ms 后重试 {}", wait_ms, request.id);
                let key = queue.insert(request.id.clone(), Duration::from_millis(wait_ms));
                keys.insert(request.id, key);
            }
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let id = expired.into_inner();
                keys.remove(&id);
                if !network.is_online() {
                    // 保持 Failed，等待重连时统一重置
                    debug!("离线，推迟自动重试 {}", id);
                    continue;
                }
                match engine.retry_due(&id).await {
                    Ok(DrainOutcome::Skipped(reason)) => debug!("自动重试 {} 被跳过: {:?}", id, reason),
                    Ok(DrainOutcome::Completed(_)) => {}
                    Err(e) => warn!("自动重试 {} 失败: {}", id, e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::EventManager;
    use crate::network::ChannelNetworkListener;
    use crate::queue::{MutationKind, RetryPolicy, SyncQueue};
    use crate::remote::{MemoryBackend, RemoteBridge, RemoteError, RemoteErrorCode};
    use crate::storage::{ErrorLog, Partition, StorageManager};
    use crate::sync::resolver::ConflictResolver;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        queue: Arc<SyncQueue>,
        backend: Arc<MemoryBackend>,
        listener: Arc<ChannelNetworkListener>,
        scheduler: SyncScheduler,
    }

    async fn fixture(online: bool, debounce_ms: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = StorageManager::open(dir.path()).await.unwrap();
        let queue = Arc::new(SyncQueue::new(&storage));
        let backend = Arc::new(MemoryBackend::new());
        let listener = Arc::new(ChannelNetworkListener::new(online));
        let network = Arc::new(NetworkMonitor::new(listener.clone()));
        network.start().await.unwrap();

        let policy = RetryPolicy {
            base_delay_ms: 20,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            RemoteBridge::new(backend.clone(), Duration::from_secs(5)),
            ConflictResolver::default(),
            network.clone(),
            Arc::new(EventManager::new(64)),
            Arc::new(ErrorLog::new(storage.partition(Partition::ErrorLog))),
            policy,
            EngineConfig::default(),
        ));
        let scheduler = SyncScheduler::new(engine, network, Duration::from_millis(debounce_ms));
        scheduler.start().await.unwrap();

        Fixture {
            _dir: dir,
            queue,
            backend,
            listener,
            scheduler,
        }
    }

    async fn wait_for_status(queue: &SyncQueue, id: &str, status: MutationStatus) -> bool {
        for _ in 0..100 {
            if let Ok(Some(record)) = queue.get(id).await {
                if record.status == status {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_reconnect_drains_after_debounce() {
        let f = fixture(false, 50).await;
        let record = f
            .queue
            .enqueue(MutationKind::Create, "opportunities", json!({"title": "Fix fence", "budget": 50}))
            .await
            .unwrap();

        f.listener.became_online();
        assert!(wait_for_status(&f.queue, &record.id, MutationStatus::Completed).await);
        assert_eq!(f.backend.calls_for("insert").len(), 1);
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_flapping_connection_cancels_pending_drain() {
        let f = fixture(false, 300).await;
        f.queue.enqueue(MutationKind::Create, "chat", json!({"body": "hi"})).await.unwrap();

        f.listener.became_online();
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.listener.became_offline();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(f.backend.calls().is_empty());
        assert_eq!(f.queue.counts().await.unwrap().pending, 1);
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_with_backoff() {
        let f = fixture(true, 50).await;
        let record = f.queue.enqueue(MutationKind::Create, "tokens", json!({"amount": 3})).await.unwrap();

        f.backend.fail_next(RemoteError::new(RemoteErrorCode::Server, "bad gateway").with_status(502));
        f.scheduler.engine.trigger(crate::sync::engine::DrainTrigger::Explicit).await.unwrap();
        let failed = f.queue.get(&record.id).await.unwrap().unwrap();
        assert_eq!(failed.status, MutationStatus::Failed);
        assert!(failed.next_retry_at.is_some());

        assert!(wait_for_status(&f.queue, &record.id, MutationStatus::Completed).await);
        assert_eq!(f.backend.calls_for("insert").len(), 2);
        f.scheduler.shutdown().await;
    }
}
