//! 存储模块 - 离线数据的本地持久化层
//!
//! 采用分区设计：
//! - StorageManager: 统一的存储管理器，持有唯一的 sled 数据库
//! - KvPartition: 每个数据域一个分区，带可选二级索引
//! - ErrorLog: 错误上报的本地落盘实现

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SyncError};

pub mod error_log;
pub mod kv;

pub use error_log::{ErrorLog, ErrorReport, ErrorReporter};
pub use kv::{IndexSpec, KvPartition};

/// KV 分区统计信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvStats {
    pub name: String,
    pub key_count: u64,
    pub estimated_size: u64,
}

/// 数据域分区
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Auth,
    Chat,
    Tokens,
    Opportunities,
    Providers,
    SyncQueue,
    ErrorLog,
}

impl Partition {
    pub const ALL: [Partition; 7] = [
        Partition::Auth,
        Partition::Chat,
        Partition::Tokens,
        Partition::Opportunities,
        Partition::Providers,
        Partition::SyncQueue,
        Partition::ErrorLog,
    ];

    /// sled Tree 名
    pub fn tree_name(&self) -> &'static str {
        match self {
            Partition::Auth => "auth",
            Partition::Chat => "chat",
            Partition::Tokens => "tokens",
            Partition::Opportunities => "opportunities",
            Partition::Providers => "providers",
            Partition::SyncQueue => "sync_queue",
            Partition::ErrorLog => "error_log",
        }
    }

    /// 内置二级索引
    pub fn indexes(&self) -> Vec<IndexSpec> {
        match self {
            Partition::Providers => vec![IndexSpec::on("country"), IndexSpec::on("status")],
            Partition::Opportunities => vec![IndexSpec::on("status"), IndexSpec::on("country")],
            Partition::Chat => vec![IndexSpec::on("conversation_id")],
            Partition::Tokens => vec![IndexSpec::on("user_id")],
            Partition::ErrorLog => vec![IndexSpec::on("category")],
            Partition::Auth | Partition::SyncQueue => Vec::new(),
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tree_name())
    }
}

/// 存储管理器 - 统一的数据访问接口
///
/// 应用启动时构造一次，分区句柄通过 [`StorageManager::partition`] 分发给各组件。
#[derive(Debug)]
pub struct StorageManager {
    base_path: PathBuf,
    db: Arc<sled::Db>,
    /// 按 Partition 判别值顺序存放
    partitions: Vec<Arc<KvPartition>>,
}

impl StorageManager {
    /// 打开数据目录下的数据库并初始化全部分区
    pub async fn open(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| SyncError::Io(format!("创建存储目录失败: {}", e)))?;

        let db = open_db_with_retry(&kv_path).await?;

        let mut partitions = Vec::with_capacity(Partition::ALL.len());
        for partition in Partition::ALL {
            let kv = KvPartition::open(&db, partition.tree_name(), partition.indexes())?;
            partitions.push(Arc::new(kv));
        }

        info!("✅ 本地存储已打开: {}", kv_path.display());

        Ok(Self {
            base_path: base_path.to_path_buf(),
            db: Arc::new(db),
            partitions,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 获取分区句柄
    pub fn partition(&self, partition: Partition) -> Arc<KvPartition> {
        self.partitions[partition as usize].clone()
    }

    /// 底层数据库（请求缓存层在同一数据库中维护自己的 Tree）
    pub fn db(&self) -> Arc<sled::Db> {
        self.db.clone()
    }

    /// 全部分区落盘
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| SyncError::Storage(format!("刷新数据库失败: {}", e)))?;
        Ok(())
    }

    /// 各分区统计
    pub fn stats(&self) -> Vec<KvStats> {
        self.partitions.iter().map(|kv| kv.stats()).collect()
    }
}

/// 打开 sled 数据库（上一个进程可能刚释放锁，重试多次带退避）
async fn open_db_with_retry(path: &Path) -> Result<sled::Db> {
    const MAX_OPEN_RETRIES: u32 = 8;
    const RETRY_DELAY_MS: u64 = 50;

    let mut last_err: Option<sled::Error> = None;
    for attempt in 0..MAX_OPEN_RETRIES {
        match sled::open(path) {
            Ok(db) => return Ok(db),
            Err(e) => {
                let msg = e.to_string();
                let is_lock = msg.contains("could not acquire lock")
                    || msg.contains("Resource temporarily unavailable")
                    || msg.contains("WouldBlock");
                last_err = Some(e);
                if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                    let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                    warn!("sled 数据库被占用，{}ms 后重试 ({}/{})", delay_ms, attempt + 1, MAX_OPEN_RETRIES);
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                } else {
                    break;
                }
            }
        }
    }

    Err(SyncError::Storage(
        last_err
            .map(|e| format!("打开 sled 数据库失败: {}", e))
            .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
    ))
}

/// 持久化的单调递增序号，重启后继续递增
pub fn next_sequence(db: &sled::Db) -> Result<u64> {
    db.generate_id()
        .map_err(|e| SyncError::Storage(format!("生成序号失败: {}", e)))
}
