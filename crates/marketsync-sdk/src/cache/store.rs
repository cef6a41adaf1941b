//! 缓存分区存储
//!
//! 每个缓存分区是同一 sled 数据库里名为 `cache:{name}` 的 Tree，
//! 值为 bincode 编码的 [`StoredResponse`]，键为请求的 SHA-256。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};
use tracing::{debug, warn};

use super::request::{CacheResponse, ResponseSource};
use crate::error::Result;
use crate::utils::TimeFormatter;

const CACHE_TREE_PREFIX: &str = "cache:";

/// 持久化的响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// 写入时间（UTC 毫秒）
    pub stored_at: i64,
    /// 最后一次命中时间，用于 LRU
    pub last_access: i64,
}

impl StoredResponse {
    pub fn from_response(url: &str, response: &CacheResponse) -> Self {
        let now = TimeFormatter::now_utc_millis();
        Self {
            url: url.to_string(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.to_vec(),
            stored_at: now,
            last_access: now,
        }
    }

    pub fn to_response(&self) -> CacheResponse {
        CacheResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: Bytes::from(self.body.clone()),
            source: ResponseSource::Cache,
        }
    }
}

/// 缓存分区存储
#[derive(Debug, Clone)]
pub struct CacheStorage {
    db: Arc<Db>,
}

impl CacheStorage {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    fn tree(&self, name: &str) -> Result<Tree> {
        Ok(self.db.open_tree(format!("{}{}", CACHE_TREE_PREFIX, name))?)
    }

    /// 已存在的缓存分区名
    pub fn list_partitions(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter_map(|raw| {
                let name = String::from_utf8(raw.to_vec()).ok()?;
                name.strip_prefix(CACHE_TREE_PREFIX).map(str::to_string)
            })
            .collect()
    }

    pub fn has_partition(&self, name: &str) -> bool {
        self.list_partitions().iter().any(|p| p == name)
    }

    /// 删除整个分区
    pub async fn delete_partition(&self, name: &str) -> Result<bool> {
        let dropped = self.db.drop_tree(format!("{}{}", CACHE_TREE_PREFIX, name))?;
        self.db.flush_async().await?;
        Ok(dropped)
    }

    /// 读取条目并刷新访问时间
    pub async fn lookup(&self, name: &str, key: &str) -> Result<Option<StoredResponse>> {
        let tree = self.tree(name)?;
        let Some(raw) = tree.get(key)? else {
            return Ok(None);
        };
        let mut entry: StoredResponse = bincode::deserialize(&raw)?;
        entry.last_access = TimeFormatter::now_utc_millis();
        tree.insert(key, bincode::serialize(&entry)?)?;
        Ok(Some(entry))
    }

    pub async fn put(&self, name: &str, key: &str, entry: &StoredResponse) -> Result<()> {
        let tree = self.tree(name)?;
        tree.insert(key, bincode::serialize(entry)?)?;
        Ok(())
    }

    /// 一次性写入多条并落盘；任一条编码失败时整批不写
    pub async fn put_batch(&self, name: &str, entries: &[(String, StoredResponse)]) -> Result<()> {
        let tree = self.tree(name)?;
        let mut batch = Batch::default();
        for (key, entry) in entries {
            batch.insert(key.as_bytes(), bincode::serialize(entry)?);
        }
        tree.apply_batch(batch)?;
        tree.flush_async().await?;
        Ok(())
    }

    pub fn len(&self, name: &str) -> Result<usize> {
        Ok(self.tree(name)?.len())
    }

    pub fn is_empty(&self, name: &str) -> Result<bool> {
        Ok(self.len(name)? == 0)
    }

    /// 先按 TTL 删除过期条目，再按最后访问时间淘汰超出上限的条目
    pub async fn evict(&self, name: &str, max_entries: Option<usize>, max_age: Option<Duration>) -> Result<usize> {
        if max_entries.is_none() && max_age.is_none() {
            return Ok(0);
        }
        let tree = self.tree(name)?;
        let now = TimeFormatter::now_utc_millis();
        let cutoff = max_age.map(|age| now - age.as_millis() as i64);

        let mut live: Vec<(sled::IVec, i64)> = Vec::new();
        let mut removed = 0;
        for item in tree.iter() {
            let (key, raw) = item?;
            let entry: StoredResponse = match bincode::deserialize(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("缓存条目损坏，删除: {}", e);
                    tree.remove(&key)?;
                    removed += 1;
                    continue;
                }
            };
            if cutoff.map(|c| entry.stored_at < c).unwrap_or(false) {
                tree.remove(&key)?;
                removed += 1;
            } else {
                live.push((key, entry.last_access));
            }
        }

        if let Some(max) = max_entries {
            if live.len() > max {
                live.sort_by_key(|(_, last_access)| *last_access);
                let overflow = live.len() - max;
                for (key, _) in live.into_iter().take(overflow) {
                    tree.remove(&key)?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!("缓存分区 {} 淘汰 {} 条", name, removed);
        }
        Ok(removed)
    }
}
