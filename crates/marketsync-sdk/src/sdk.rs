//! 应用上下文 - OfflineSync 主入口
//!
//! 分层架构：
//! ```text
//! OfflineSync (应用上下文)
//!     ├── StorageManager   (本地持久化，sled)
//!     ├── SyncQueue        (待同步变更)
//!     ├── SyncEngine       (串行消费队列)
//!     │     └── RemoteBridge -> RemoteBackend
//!     ├── SyncScheduler    (重连防抖 + 退避重试)
//!     ├── NetworkMonitor   (宿主网络信号)
//!     ├── RequestCacheLayer(页面请求缓存)
//!     └── EventManager     (UI 事件)
//! ```
//!
//! 启动时构造一次，所有存储句柄都由它持有并注入各组件，不使用全局单例。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument};

use crate::cache::{CacheStorage, Fetcher, HttpFetcher, RequestCacheLayer};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventManager, SyncEvent};
use crate::lifecycle::LifecycleManager;
use crate::network::{NetworkMonitor, NetworkStatusListener};
use crate::queue::{MutationKind, MutationRecord, MutationStatus, QueueCounts, SyncQueue};
use crate::remote::{RemoteBackend, RemoteBridge, RestBackend};
use crate::storage::{ErrorLog, ErrorReporter, KvPartition, Partition, StorageManager};
use crate::sync::{ConflictResolver, DrainOutcome, DrainTrigger, SyncEngine, SyncLifecycleHook, SyncScheduler};
use crate::utils::TimeFormatter;

/// 离线同步应用上下文
pub struct OfflineSync {
    config: SyncConfig,
    storage: Arc<StorageManager>,
    queue: Arc<SyncQueue>,
    engine: Arc<SyncEngine>,
    scheduler: SyncScheduler,
    network: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
    cache: Arc<RequestCacheLayer>,
    error_log: ErrorLog,
    lifecycle: LifecycleManager,
    shutting_down: AtomicBool,
    shutdown_token: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for OfflineSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineSync")
            .field("data_dir", &self.config.data_dir)
            .field("online", &self.network.is_online())
            .field("engine", &self.engine)
            .finish()
    }
}

impl OfflineSync {
    /// 初始化应用上下文
    ///
    /// 分层初始化顺序：
    /// 1. 存储层 → 2. 事件/网络层 → 3. 同步层 → 4. 缓存层 → 5. 调度与生命周期
    #[instrument(skip_all, fields(data_dir = %config.data_dir.display()))]
    pub async fn initialize(
        config: SyncConfig,
        backend: Arc<dyn RemoteBackend>,
        listener: Arc<dyn NetworkStatusListener>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 {}...", crate::version::version_string());
        config.validate()?;

        // === 第1层：存储 ===
        let storage = Arc::new(StorageManager::open(&config.data_dir).await?);
        let queue = Arc::new(SyncQueue::new(&storage));
        queue.recover_in_flight().await?;
        let error_log = ErrorLog::new(storage.partition(Partition::ErrorLog));
        let reporter: Arc<dyn ErrorReporter> = Arc::new(error_log.clone());

        // === 第2层：事件与网络 ===
        let events = Arc::new(EventManager::new(config.event_buffer_size));
        let network = Arc::new(NetworkMonitor::new(listener));

        // === 第3层：同步 ===
        let bridge = RemoteBridge::new(backend, Duration::from_secs(config.remote.operation_timeout_secs));
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            bridge,
            ConflictResolver::new(config.conflict_policies.clone()),
            network.clone(),
            events.clone(),
            reporter.clone(),
            config.retry.clone(),
            config.engine.clone(),
        ));
        let scheduler = SyncScheduler::new(
            engine.clone(),
            network.clone(),
            Duration::from_millis(config.engine.reconnect_debounce_ms),
        );

        // === 第4层：请求缓存 ===
        let cache = Arc::new(RequestCacheLayer::new(
            config.cache.clone(),
            CacheStorage::new(storage.db()),
            fetcher,
            reporter,
            events.clone(),
        )?);

        // === 第5层：生命周期 ===
        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(Arc::new(SyncLifecycleHook::new(engine.clone(), storage.clone())));

        let sdk = Arc::new(Self {
            config,
            storage,
            queue,
            engine,
            scheduler,
            network,
            events,
            cache,
            error_log,
            lifecycle,
            shutting_down: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        sdk.spawn_connectivity_events();
        sdk.scheduler.start().await?;
        sdk.network.start().await?;

        if sdk.network.is_online() && sdk.pending_count().await? > 0 {
            sdk.engine.spawn_trigger(DrainTrigger::Explicit);
        }

        info!("✅ OfflineSync 初始化完成 (online: {})", sdk.network.is_online());
        Ok(sdk)
    }

    /// 使用 REST 后端与 HTTP 取数初始化
    pub async fn with_http(config: SyncConfig, listener: Arc<dyn NetworkStatusListener>) -> Result<Arc<Self>> {
        let backend = Arc::new(RestBackend::new(&config.remote, &config.http_client)?);
        let fetcher = Arc::new(HttpFetcher::new(&config.http_client)?);
        Self::initialize(config, backend, listener, fetcher).await
    }

    fn spawn_connectivity_events(&self) {
        let mut status = self.network.subscribe();
        let events = self.events.clone();
        let token = self.shutdown_token.clone();

        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = status.recv() => match changed {
                        Ok(state) => events.emit(SyncEvent::connectivity(state.online)).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(SyncError::ShuttingDown);
        }
        Ok(())
    }

    // ========== 变更队列 ==========

    /// 记录一次本地变更
    ///
    /// 先落盘，确认后才通知 UI 并在在线时触发同步。
    pub async fn enqueue(&self, kind: MutationKind, collection: &str, payload: Value) -> Result<MutationRecord> {
        self.ensure_running()?;
        let record = self.queue.enqueue(kind, collection, payload).await?;

        self.events
            .emit(SyncEvent::MutationQueued {
                id: record.id.clone(),
                kind: record.kind,
                collection: record.collection.clone(),
                timestamp: TimeFormatter::now_utc_millis(),
            })
            .await;

        if self.network.is_online() {
            self.engine.spawn_trigger(DrainTrigger::Enqueue);
        } else {
            debug!("离线，变更等待网络恢复: {}", record.id);
        }
        Ok(record)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.queue.counts().await?.pending)
    }

    pub async fn failed_count(&self) -> Result<usize> {
        Ok(self.queue.counts().await?.failed)
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        self.queue.counts().await
    }

    pub async fn list(&self, filter: Option<MutationStatus>) -> Result<Vec<MutationRecord>> {
        self.queue.list(filter).await
    }

    /// 删除已完成记录
    pub async fn prune_completed(&self) -> Result<usize> {
        self.queue.prune_completed().await
    }

    /// 人工重试全部失败记录
    pub async fn retry_failed_operations(&self) -> Result<DrainOutcome> {
        self.ensure_running()?;
        self.engine.retry_failed_operations().await
    }

    /// 立即执行一个同步周期
    pub async fn sync_now(&self) -> Result<DrainOutcome> {
        self.ensure_running()?;
        self.engine.trigger(DrainTrigger::Explicit).await
    }

    /// 等待所有后台同步与缓存刷新任务结束
    pub async fn wait_idle(&self) {
        self.engine.wait_background().await;
        self.cache.flush_background().await;
    }

    // ========== 本地数据 ==========

    pub fn store(&self, partition: Partition) -> Arc<KvPartition> {
        self.storage.partition(partition)
    }

    /// 会话内的聊天消息，按客户端 `created_at` 排序而非到达顺序
    pub async fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<Value>> {
        let mut messages: Vec<Value> = self
            .store(Partition::Chat)
            .find_by_index("conversation_id", &Value::String(conversation_id.to_string()))
            .await?;
        messages.sort_by(|a, b| {
            let left = (TimeFormatter::parse_timestamp(&a["created_at"]), a["id"].to_string());
            let right = (TimeFormatter::parse_timestamp(&b["created_at"]), b["id"].to_string());
            left.cmp(&right)
        });
        Ok(messages)
    }

    // ========== 组件访问 ==========

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<RequestCacheLayer> {
        &self.cache
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn reporter(&self) -> Arc<dyn ErrorReporter> {
        Arc::new(self.error_log.clone())
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.error_log
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// 关闭：停止调度、等待后台任务、落盘
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("正在关闭 OfflineSync...");

        self.scheduler.shutdown().await;
        self.wait_idle().await;
        self.network.stop().await;

        self.shutdown_token.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        self.storage.flush().await?;
        info!("OfflineSync 关闭完成");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheRequest, CacheResponse, StaticFetcher};
    use crate::network::ChannelNetworkListener;
    use crate::remote::MemoryBackend;
    use serde_json::json;
    use tempfile::TempDir;

    async fn context(dir: &TempDir, online: bool) -> (Arc<OfflineSync>, Arc<MemoryBackend>, Arc<ChannelNetworkListener>) {
        let config = SyncConfig::builder()
            .data_dir(dir.path())
            .reconnect_debounce_ms(20)
            .app_origin("https://app.example.com")
            .build();
        let backend = Arc::new(MemoryBackend::new());
        let listener = Arc::new(ChannelNetworkListener::new(online));
        let fetcher = Arc::new(StaticFetcher::new());
        let sdk = OfflineSync::initialize(config, backend.clone(), listener.clone(), fetcher)
            .await
            .unwrap();
        (sdk, backend, listener)
    }

    #[tokio::test]
    async fn test_online_enqueue_drains_in_background() {
        let dir = TempDir::new().unwrap();
        let (sdk, backend, _) = context(&dir, true).await;

        sdk.enqueue(MutationKind::Create, "opportunities", json!({"title": "Fix fence"}))
            .await
            .unwrap();
        sdk.wait_idle().await;

        assert_eq!(backend.calls_for("insert").len(), 1);
        assert_eq!(sdk.queue_counts().await.unwrap().completed, 1);
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_conversation_messages_ordered_by_client_timestamp() {
        let dir = TempDir::new().unwrap();
        let (sdk, _, _) = context(&dir, false).await;
        let chat = sdk.store(Partition::Chat);

        chat.put(&json!({"id": "m2", "conversation_id": "c1", "created_at": "2024-05-01T10:05:00Z"}))
            .await
            .unwrap();
        chat.put(&json!({"id": "m1", "conversation_id": "c1", "created_at": "2024-05-01T10:00:00Z"}))
            .await
            .unwrap();
        chat.put(&json!({"id": "m3", "conversation_id": "c2", "created_at": "2024-05-01T09:00:00Z"}))
            .await
            .unwrap();

        let ids: Vec<String> = sdk
            .conversation_messages("c1")
            .await
            .unwrap()
            .iter()
            .filter_map(|m| m["id"].as_str().map(str::to_string))
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_mutations() {
        let dir = TempDir::new().unwrap();
        let (sdk, _, _) = context(&dir, false).await;
        sdk.shutdown().await.unwrap();

        let err = sdk
            .enqueue(MutationKind::Create, "chat", json!({"body": "late"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_cache_is_passthrough_before_activation() {
        let dir = TempDir::new().unwrap();
        let (sdk, _, _) = context(&dir, true).await;
        let response = sdk.cache().handle(CacheRequest::get("/api/providers")).await;
        assert_eq!(response, CacheResponse::new(404, "not found"));
        sdk.shutdown().await.unwrap();
    }
}
