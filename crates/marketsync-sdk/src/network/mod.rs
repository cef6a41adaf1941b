use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::utils::TimeFormatter;

/// 宿主环境的网络事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostNetworkEvent {
    BecameOnline,
    BecameOffline,
}

/// 进程级连通状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub online: bool,
    /// 最近一次状态切换时间（UTC 毫秒）
    pub last_transition_at: i64,
}

/// 网络状态监听器trait（由宿主平台实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 当前是否在线（同步查询）
    fn current_status(&self) -> bool;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<HostNetworkEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 由调用方推送事件的监听器
///
/// 宿主把平台回调接到 [`became_online`](Self::became_online) /
/// [`became_offline`](Self::became_offline) 上即可。
#[derive(Debug)]
pub struct ChannelNetworkListener {
    online: AtomicBool,
    sender: broadcast::Sender<HostNetworkEvent>,
}

impl ChannelNetworkListener {
    pub fn new(initially_online: bool) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            online: AtomicBool::new(initially_online),
            sender,
        }
    }

    pub fn became_online(&self) {
        self.online.store(true, Ordering::SeqCst);
        let _ = self.sender.send(HostNetworkEvent::BecameOnline);
    }

    pub fn became_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        let _ = self.sender.send(HostNetworkEvent::BecameOffline);
    }
}

#[async_trait]
impl NetworkStatusListener for ChannelNetworkListener {
    fn current_status(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<HostNetworkEvent>> {
        Ok(self.sender.subscribe())
    }

    async fn stop_monitoring(&self) {}
}

type ChangeCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// 网络监控管理器
///
/// [`set_online`](Self::set_online) 是唯一的状态修改入口，重复事件会被丢弃，
/// 回调与订阅者在每次状态切换时恰好收到一次通知。
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    state: RwLock<ConnectivityState>,
    status_sender: broadcast::Sender<ConnectivityState>,
    callbacks: RwLock<Vec<ChangeCallback>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("state", &*self.state.read())
            .field("callbacks", &self.callbacks.read().len())
            .finish()
    }
}

impl NetworkMonitor {
    /// 以宿主当前网络状态初始化
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (status_sender, _) = broadcast::channel(100);
        let online = listener.current_status();

        Self {
            listener,
            state: RwLock::new(ConnectivityState {
                online,
                last_transition_at: TimeFormatter::now_utc_millis(),
            }),
            status_sender,
            callbacks: RwLock::new(Vec::new()),
            task: Mutex::new(None),
        }
    }

    /// 启动网络监控
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut receiver = self.listener.start_monitoring().await?;
        let monitor = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                let online = match receiver.recv().await {
                    Ok(HostNetworkEvent::BecameOnline) => true,
                    Ok(HostNetworkEvent::BecameOffline) => false,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("网络事件积压，跳过 {} 条，按当前状态同步", skipped);
                        match monitor.upgrade() {
                            Some(m) => m.listener.current_status(),
                            None => break,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match monitor.upgrade() {
                    Some(m) => {
                        m.set_online(online);
                    }
                    None => break,
                }
            }
            debug!("网络监听任务结束");
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }

        // 监听建立前可能已发生切换
        self.set_online(self.listener.current_status());
        Ok(())
    }

    /// 停止监控
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.listener.stop_monitoring().await;
    }

    pub fn is_online(&self) -> bool {
        self.state.read().online
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.read()
    }

    /// 注册状态切换回调，参数为新的在线状态
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityState> {
        self.status_sender.subscribe()
    }

    /// 更新在线状态，返回是否发生了切换
    pub fn set_online(&self, online: bool) -> bool {
        let new_state = {
            let mut state = self.state.write();
            if state.online == online {
                return false;
            }
            state.online = online;
            state.last_transition_at = TimeFormatter::now_utc_millis();
            *state
        };

        if online {
            info!("🌐 网络已恢复");
        } else {
            info!("📴 网络已断开");
        }

        let callbacks: Vec<ChangeCallback> = self.callbacks.read().clone();
        for callback in callbacks {
            callback(online);
        }
        let _ = self.status_sender.send(new_state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_redundant_events_are_dropped() {
        let listener = Arc::new(ChannelNetworkListener::new(false));
        let monitor = NetworkMonitor::new(listener.clone());
        assert!(!monitor.is_online());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        monitor.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(monitor.set_online(false));
        assert!(!monitor.set_online(false));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_host_events_flow_to_subscribers() {
        let listener = Arc::new(ChannelNetworkListener::new(false));
        let monitor = Arc::new(NetworkMonitor::new(listener.clone()));
        monitor.start().await.unwrap();
        let mut rx = monitor.subscribe();

        listener.became_online();
        listener.became_online();
        listener.became_offline();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(first.online);
        assert!(!second.online);
        assert!(second.last_transition_at >= first.last_transition_at);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_initial_state_from_listener() {
        let listener = Arc::new(ChannelNetworkListener::new(true));
        let monitor = NetworkMonitor::new(listener);
        assert!(monitor.is_online());
        assert!(monitor.state().online);
    }
}
