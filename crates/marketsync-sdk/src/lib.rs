//! MarketSync SDK - 市场应用的离线优先同步层
//!
//! 本 SDK 提供：
//! - 📥 本地持久化的待同步变更队列
//! - 📡 网络状态监控与重连防抖
//! - 🔁 串行同步引擎：冲突解决、退避重试、人工重试
//! - 🗂️ 页面请求缓存层：外壳预缓存、后台重新验证、离线响应
//! - ⚙️ 事件系统：向 UI 推送队列与网络状态
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use marketsync_sdk::{ChannelNetworkListener, MutationKind, OfflineSync, SyncConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .remote_url("https://project.backend.example.com")
//!         .api_key("anon-key")
//!         .app_origin("https://app.example.com")
//!         .build();
//!
//!     let network = Arc::new(ChannelNetworkListener::new(true));
//!     let sdk = OfflineSync::with_http(config, network.clone()).await?;
//!
//!     // 离线时记录在队列中，网络恢复后自动同步
//!     sdk.enqueue(
//!         MutationKind::Create,
//!         "opportunities",
//!         json!({"title": "Fix fence", "budget": 50}),
//!     )
//!     .await?;
//!
//!     println!("pending: {}", sdk.pending_count().await?);
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod network;
pub mod queue;
pub mod remote;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use cache::{
    CacheRequest, CacheResponse, CacheStorage, ControlMessage, Fetcher, HttpFetcher, RequestCacheLayer, RequestMode,
    ResponseSource, StaticFetcher, StoredResponse, WorkerState,
};
pub use config::{CacheConfig, EngineConfig, HttpClientConfig, RemoteConfig, SyncConfig, SyncConfigBuilder};
pub use error::{ErrorCategory, ErrorSeverity, Result, SyncError};
pub use events::{EventManager, EventStats, SyncEvent};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use logging::init_logging;
pub use network::{ChannelNetworkListener, ConnectivityState, HostNetworkEvent, NetworkMonitor, NetworkStatusListener};
pub use queue::{
    ConflictResolution, FailureReason, MutationKind, MutationRecord, MutationStatus, QueueCounts, ResetFilter,
    RetryPolicy, StatusPatch, SyncQueue,
};
pub use remote::{MemoryBackend, Outcome, RemoteBackend, RemoteBridge, RemoteError, RemoteErrorCode, RestBackend};
pub use sdk::OfflineSync;
pub use storage::{ErrorLog, ErrorReport, ErrorReporter, IndexSpec, KvPartition, Partition, StorageManager};
pub use sync::{
    resolve_last_write_wins, resolve_merge, ConflictPolicy, ConflictResolver, DrainOutcome, DrainReport,
    DrainTrigger, MergeRules, SkipReason, SyncEngine, SyncLifecycleHook, SyncScheduler,
};
pub use utils::TimeFormatter;
pub use version::{BUILD_TIME, GIT_SHA, SDK_VERSION};
