//! 同步状态事件，供 UI 展示队列、网络与缓存状态

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::queue::{ConflictResolution, MutationKind, MutationStatus};
use crate::sync::engine::DrainTrigger;
use crate::utils::TimeFormatter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 变更已入队
    MutationQueued {
        id: String,
        kind: MutationKind,
        collection: String,
        timestamp: i64,
    },
    /// 变更状态流转
    MutationStatusChanged {
        id: String,
        old_status: MutationStatus,
        new_status: MutationStatus,
        retry_count: u32,
        timestamp: i64,
    },
    /// 冲突已解决，记录将在下一周期重试
    ConflictResolved {
        id: String,
        collection: String,
        resolution: ConflictResolution,
        timestamp: i64,
    },
    /// 同步周期开始
    DrainStarted { trigger: DrainTrigger, timestamp: i64 },
    /// 同步周期结束
    DrainFinished {
        trigger: DrainTrigger,
        processed: usize,
        completed: usize,
        failed: usize,
        deferred: usize,
        timestamp: i64,
    },
    /// 网络状态变更
    ConnectivityChanged { online: bool, timestamp: i64 },
    /// 外壳资源缓存完成
    CacheInstalled {
        cache_name: String,
        assets: usize,
        timestamp: i64,
    },
    /// 旧缓存分区已清理
    CacheActivated { removed: Vec<String>, timestamp: i64 },
}

impl SyncEvent {
    /// 稳定的 snake_case 类型名
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::MutationQueued { .. } => "mutation_queued",
            SyncEvent::MutationStatusChanged { .. } => "mutation_status_changed",
            SyncEvent::ConflictResolved { .. } => "conflict_resolved",
            SyncEvent::DrainStarted { .. } => "drain_started",
            SyncEvent::DrainFinished { .. } => "drain_finished",
            SyncEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SyncEvent::CacheInstalled { .. } => "cache_installed",
            SyncEvent::CacheActivated { .. } => "cache_activated",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::MutationQueued { timestamp, .. }
            | SyncEvent::MutationStatusChanged { timestamp, .. }
            | SyncEvent::ConflictResolved { timestamp, .. }
            | SyncEvent::DrainStarted { timestamp, .. }
            | SyncEvent::DrainFinished { timestamp, .. }
            | SyncEvent::ConnectivityChanged { timestamp, .. }
            | SyncEvent::CacheInstalled { timestamp, .. }
            | SyncEvent::CacheActivated { timestamp, .. } => *timestamp,
        }
    }

    pub fn connectivity(online: bool) -> Self {
        SyncEvent::ConnectivityChanged {
            online,
            timestamp: TimeFormatter::now_utc_millis(),
        }
    }
}

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// 运行期统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStats {
    pub emitted: u64,
    /// 按 `event_type()` 计数
    pub by_type: HashMap<&'static str, u64>,
    pub listeners: usize,
    pub last_emitted_at: Option<i64>,
}

/// UI 事件分发
///
/// 两种接收方式：`subscribe()` 拿到广播接收端（可跨任务、可能丢失积压事件），
/// `on()` 注册同步回调（在 `emit` 所在任务内依次调用）。
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    /// `None` 表示接收全部类型
    listeners: RwLock<Vec<(Option<&'static str>, Listener)>>,
    stats: Mutex<EventStats>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(Vec::new()),
            stats: Mutex::new(EventStats::default()),
        }
    }

    /// 广播事件并调用匹配的回调
    pub async fn emit(&self, event: SyncEvent) {
        let kind = event.event_type();
        {
            let mut stats = self.stats.lock();
            stats.emitted += 1;
            *stats.by_type.entry(kind).or_default() += 1;
            stats.last_emitted_at = Some(event.timestamp());
        }

        // 没有接收端时发送失败是常态
        if self.sender.send(event.clone()).is_err() {
            debug!("事件 {} 暂无订阅者", kind);
        }

        let matched: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|(filter, _)| filter.map_or(true, |f| f == kind))
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in matched {
            listener(&event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 注册回调；`event_type` 为 `None` 时接收全部事件
    pub fn on<F>(&self, event_type: Option<&'static str>, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let count = {
            let mut listeners = self.listeners.write();
            listeners.push((event_type, Arc::new(listener)));
            listeners.len()
        };
        self.stats.lock().listeners = count;
        debug!("注册事件回调: {}", event_type.unwrap_or("*"));
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.lock().listeners = 0;
    }

    pub fn stats(&self) -> EventStats {
        self.stats.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_emit_reaches_subscribers_and_filtered_callbacks() {
        let manager = EventManager::new(16);
        let mut rx = manager.subscribe();

        let connectivity = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));
        let counter = connectivity.clone();
        manager.on(Some("connectivity_changed"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = all.clone();
        manager.on(None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.emit(SyncEvent::connectivity(true)).await;
        manager
            .emit(SyncEvent::CacheActivated {
                removed: vec!["marketsync-static-v0".into()],
                timestamp: 1,
            })
            .await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type(), "connectivity_changed");
        assert_eq!(connectivity.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);

        let stats = manager.stats();
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.by_type.get("cache_activated"), Some(&1));
        assert_eq!(stats.listeners, 2);
        assert_eq!(stats.last_emitted_at, Some(1));

        manager.clear_listeners();
        manager.emit(SyncEvent::connectivity(false)).await;
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }
}
