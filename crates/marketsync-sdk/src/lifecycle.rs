//! 前后台切换
//!
//! 宿主在应用进入后台、回到前台时调用 [`LifecycleManager`]，
//! 由它依次通知注册的 [`LifecycleHook`]。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;

#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// 进入后台前：落盘、暂停后台任务
    async fn on_background(&self) -> Result<()>;

    /// 回到前台：补一次同步等
    async fn on_foreground(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Background,
    Foreground,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Background => f.write_str("background"),
            Phase::Foreground => f.write_str("foreground"),
        }
    }
}

#[derive(Default)]
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager").field("hooks", &self.hooks.len()).finish()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        debug!("lifecycle hook #{} registered", self.hooks.len() - 1);
    }

    pub async fn notify_background(&self) -> Result<()> {
        self.notify(Phase::Background).await
    }

    pub async fn notify_foreground(&self) -> Result<()> {
        self.notify(Phase::Foreground).await
    }

    /// 按注册顺序通知全部 Hook；单个失败不影响后续，返回第一个错误
    async fn notify(&self, phase: Phase) -> Result<()> {
        debug!("🔄 {} -> {} hooks", phase, self.hooks.len());

        let mut first_error = None;
        for (index, hook) in self.hooks.iter().enumerate() {
            let result = match phase {
                Phase::Background => hook.on_background().await,
                Phase::Foreground => hook.on_foreground().await,
            };
            if let Err(e) = result {
                warn!("⚠️ lifecycle hook #{} 处理 {} 失败: {}", index, phase, e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        foreground: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LifecycleHook for CountingHook {
        async fn on_background(&self) -> Result<()> {
            if self.fail {
                return Err(SyncError::Storage("flush failed".into()));
            }
            Ok(())
        }

        async fn on_foreground(&self) -> Result<()> {
            self.foreground.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_stop_others() {
        let failing = Arc::new(CountingHook {
            foreground: AtomicUsize::new(0),
            fail: true,
        });
        let healthy = Arc::new(CountingHook {
            foreground: AtomicUsize::new(0),
            fail: false,
        });

        let mut manager = LifecycleManager::new();
        manager.register_hook(failing.clone());
        manager.register_hook(healthy.clone());
        assert_eq!(manager.hook_count(), 2);

        assert!(matches!(manager.notify_background().await, Err(SyncError::Storage(_))));

        manager.notify_foreground().await.unwrap();
        assert_eq!(failing.foreground.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.foreground.load(Ordering::SeqCst), 1);
    }
}
