//! 离线同步模块
//!
//! 职责：
//! - 串行消费待同步队列（[`engine`]）
//! - 重连防抖与退避重试调度（[`scheduler`]）
//! - 冲突解决策略（[`resolver`]）

pub mod engine;
pub mod resolver;
pub mod scheduler;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

pub use engine::{DrainOutcome, DrainReport, DrainTrigger, ScheduledRetry, SkipReason, SyncEngine};
pub use resolver::{
    last_write_winner, merge_with_rules, resolve_last_write_wins, resolve_merge, ConflictPolicy, ConflictResolver,
    MergeRules, Resolution, Winner,
};
pub use scheduler::SyncScheduler;

use crate::error::Result;
use crate::lifecycle::LifecycleHook;
use crate::storage::StorageManager;

/// 生命周期 Hook：回到前台时补一次同步，进入后台前落盘
pub struct SyncLifecycleHook {
    engine: Arc<SyncEngine>,
    storage: Arc<StorageManager>,
}

impl SyncLifecycleHook {
    pub fn new(engine: Arc<SyncEngine>, storage: Arc<StorageManager>) -> Self {
        Self { engine, storage }
    }
}

#[async_trait]
impl LifecycleHook for SyncLifecycleHook {
    async fn on_background(&self) -> Result<()> {
        debug!("进入后台，刷新本地存储");
        self.storage.flush().await
    }

    async fn on_foreground(&self) -> Result<()> {
        self.engine.spawn_trigger(DrainTrigger::Foreground);
        Ok(())
    }
}
