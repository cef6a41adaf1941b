//! KV 存储模块 - 基于 sled 的分区键值存储
//!
//! 本模块提供：
//! - 每个数据域一个分区（sled Tree），记录按 `id` 字段存取
//! - 可声明的二级索引（等值查询），索引存放在伴随 Tree 中
//! - 显式 flush，保证关键写入落盘后才返回

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sled::{Db, Tree};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::storage::KvStats;

/// 索引键中值与 id 的分隔符
const INDEX_SEPARATOR: u8 = 0;

/// 二级索引声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// 索引名
    pub name: String,
    /// 被索引的顶层字段
    pub field: String,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
        }
    }

    /// 以字段名作为索引名
    pub fn on(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: field.clone(),
            field,
        }
    }
}

/// KV 分区
#[derive(Debug, Clone)]
pub struct KvPartition {
    name: String,
    tree: Tree,
    indexes: Vec<(IndexSpec, Tree)>,
}

impl KvPartition {
    /// 打开（或创建）分区及其索引 Tree
    pub fn open(db: &Db, name: &str, indexes: Vec<IndexSpec>) -> Result<Self> {
        let tree = db
            .open_tree(name)
            .map_err(|e| SyncError::Storage(format!("打开分区 {} 失败: {}", name, e)))?;

        let mut opened = Vec::with_capacity(indexes.len());
        for spec in indexes {
            let index_tree_name = format!("{}__idx__{}", name, spec.name);
            let index_tree = db.open_tree(&index_tree_name).map_err(|e| {
                SyncError::Storage(format!("打开索引 {} 失败: {}", index_tree_name, e))
            })?;
            opened.push((spec, index_tree));
        }

        debug!("KV 分区已打开: {} (索引 {} 个)", name, opened.len());

        Ok(Self {
            name: name.to_string(),
            tree,
            indexes: opened,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 已声明的索引名
    pub fn index_names(&self) -> Vec<&str> {
        self.indexes.iter().map(|(spec, _)| spec.name.as_str()).collect()
    }

    /// 写入记录，返回记录 id
    ///
    /// 记录必须是带 `id` 字段（字符串或数字）的 JSON 对象。
    pub async fn put<T: Serialize>(&self, record: &T) -> Result<String> {
        let value = serde_json::to_value(record)
            .map_err(|e| SyncError::Serialization(format!("序列化记录失败: {}", e)))?;
        let id = record_id(&value).ok_or_else(|| {
            SyncError::InvalidInput(format!("分区 {} 的记录缺少 id 字段", self.name))
        })?;
        let bytes = serde_json::to_vec(&value)
            .map_err(|e| SyncError::Serialization(format!("序列化记录失败: {}", e)))?;

        let previous = self
            .tree
            .insert(id.as_bytes(), bytes)
            .map_err(|e| SyncError::Storage(format!("写入 {} 失败: {}", self.name, e)))?;

        let previous_value = match previous {
            Some(old) => serde_json::from_slice::<Value>(&old).ok(),
            None => None,
        };
        self.reindex(&id, previous_value.as_ref(), Some(&value))?;

        Ok(id)
    }

    /// 按 id 读取记录
    pub async fn get<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        let result = self
            .tree
            .get(id.as_bytes())
            .map_err(|e| SyncError::Storage(format!("读取 {} 失败: {}", self.name, e)))?;

        match result {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| SyncError::Serialization(format!("反序列化记录失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 读取全部记录（按 id 的字节序）
    ///
    /// 无法反序列化的记录会被跳过并记录警告。
    pub async fn get_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for item in self.tree.iter() {
            let (key, bytes) =
                item.map_err(|e| SyncError::Storage(format!("遍历 {} 失败: {}", self.name, e)))?;
            match serde_json::from_slice(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "跳过无法解析的记录 {}/{}: {}",
                    self.name,
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(records)
    }

    /// 删除记录，返回记录是否存在
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let previous = self
            .tree
            .remove(id.as_bytes())
            .map_err(|e| SyncError::Storage(format!("删除 {} 失败: {}", self.name, e)))?;

        match previous {
            Some(old) => {
                let old_value = serde_json::from_slice::<Value>(&old).ok();
                self.reindex(id, old_value.as_ref(), None)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 二级索引等值查询
    pub async fn find_by_index<T: DeserializeOwned>(&self, index: &str, value: &Value) -> Result<Vec<T>> {
        let (spec, index_tree) = self
            .indexes
            .iter()
            .find(|(spec, _)| spec.name == index)
            .ok_or_else(|| SyncError::InvalidInput(format!("分区 {} 没有索引 {}", self.name, index)))?;

        let Some(encoded) = encode_index_value(value) else {
            return Ok(Vec::new());
        };
        let mut prefix = encoded.into_bytes();
        prefix.push(INDEX_SEPARATOR);

        let mut records = Vec::new();
        for item in index_tree.scan_prefix(&prefix) {
            let (key, _) =
                item.map_err(|e| SyncError::Storage(format!("扫描索引 {} 失败: {}", index, e)))?;
            let id = String::from_utf8_lossy(&key[prefix.len()..]).to_string();

            let Some(current) = self.get::<Value>(&id).await? else {
                continue;
            };
            // 索引与记录分两步写入，以记录当前值为准
            if current.get(&spec.field).and_then(encode_index_value).as_deref()
                != encode_index_value(value).as_deref()
            {
                continue;
            }
            let record = serde_json::from_value(current)
                .map_err(|e| SyncError::Serialization(format!("反序列化记录失败: {}", e)))?;
            records.push(record);
        }
        Ok(records)
    }

    /// 记录条数
    pub fn count(&self) -> usize {
        self.tree.len()
    }

    /// 清空分区及其索引
    pub async fn clear(&self) -> Result<()> {
        self.tree
            .clear()
            .map_err(|e| SyncError::Storage(format!("清空 {} 失败: {}", self.name, e)))?;
        for (spec, index_tree) in &self.indexes {
            index_tree
                .clear()
                .map_err(|e| SyncError::Storage(format!("清空索引 {} 失败: {}", spec.name, e)))?;
        }
        Ok(())
    }

    /// 落盘
    pub async fn flush(&self) -> Result<()> {
        self.tree
            .flush_async()
            .await
            .map_err(|e| SyncError::Storage(format!("刷新 {} 失败: {}", self.name, e)))?;
        for (_, index_tree) in &self.indexes {
            index_tree
                .flush_async()
                .await
                .map_err(|e| SyncError::Storage(format!("刷新索引失败: {}", e)))?;
        }
        Ok(())
    }

    /// 统计信息
    pub fn stats(&self) -> KvStats {
        let key_count = self.tree.len() as u64;
        KvStats {
            name: self.name.clone(),
            key_count,
            // sled Tree 没有按树统计磁盘占用的接口，按每条 256 字节估算
            estimated_size: key_count * 256,
        }
    }

    fn reindex(&self, id: &str, old: Option<&Value>, new: Option<&Value>) -> Result<()> {
        for (spec, index_tree) in &self.indexes {
            let old_key = old
                .and_then(|v| v.get(&spec.field))
                .and_then(encode_index_value)
                .map(|v| index_key(&v, id));
            let new_key = new
                .and_then(|v| v.get(&spec.field))
                .and_then(encode_index_value)
                .map(|v| index_key(&v, id));

            if old_key == new_key {
                continue;
            }
            if let Some(key) = old_key {
                index_tree
                    .remove(key)
                    .map_err(|e| SyncError::Storage(format!("更新索引 {} 失败: {}", spec.name, e)))?;
            }
            if let Some(key) = new_key {
                index_tree
                    .insert(key, &[])
                    .map_err(|e| SyncError::Storage(format!("更新索引 {} 失败: {}", spec.name, e)))?;
            }
        }
        Ok(())
    }
}

/// 提取记录 id（字符串或整数）
pub(crate) fn record_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn encode_index_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn index_key(encoded: &str, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(encoded.len() + id.len() + 1);
    key.extend_from_slice(encoded.as_bytes());
    key.push(INDEX_SEPARATOR);
    key.extend_from_slice(id.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Provider {
        id: String,
        name: String,
        country: String,
    }

    fn open_partition(dir: &TempDir) -> KvPartition {
        let db = sled::open(dir.path()).unwrap();
        KvPartition::open(&db, "providers", vec![IndexSpec::on("country")]).unwrap()
    }

    #[tokio::test]
    async fn test_kv_partition_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let partition = open_partition(&temp_dir);

        let provider = Provider {
            id: "p1".into(),
            name: "Ama's Plumbing".into(),
            country: "GH".into(),
        };
        let id = partition.put(&provider).await.unwrap();
        assert_eq!(id, "p1");

        let loaded: Provider = partition.get("p1").await.unwrap().unwrap();
        assert_eq!(loaded, provider);
        assert_eq!(partition.count(), 1);

        assert!(partition.delete("p1").await.unwrap());
        assert!(!partition.delete("p1").await.unwrap());
        let missing: Option<Provider> = partition.get("p1").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_put_requires_id() {
        let temp_dir = TempDir::new().unwrap();
        let partition = open_partition(&temp_dir);

        let err = partition.put(&json!({"name": "no id"})).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));

        let numeric = partition.put(&json!({"id": 42, "country": "KE"})).await.unwrap();
        assert_eq!(numeric, "42");
    }

    #[tokio::test]
    async fn test_secondary_index_follows_updates() {
        let temp_dir = TempDir::new().unwrap();
        let partition = open_partition(&temp_dir);

        partition.put(&json!({"id": "a", "country": "GH"})).await.unwrap();
        partition.put(&json!({"id": "b", "country": "GH"})).await.unwrap();
        partition.put(&json!({"id": "c", "country": "NG"})).await.unwrap();

        let ghana: Vec<Value> = partition.find_by_index("country", &json!("GH")).await.unwrap();
        assert_eq!(ghana.len(), 2);

        // 移动到另一个国家后旧索引项应失效
        partition.put(&json!({"id": "a", "country": "NG"})).await.unwrap();
        let ghana: Vec<Value> = partition.find_by_index("country", &json!("GH")).await.unwrap();
        let nigeria: Vec<Value> = partition.find_by_index("country", &json!("NG")).await.unwrap();
        assert_eq!(ghana.len(), 1);
        assert_eq!(nigeria.len(), 2);

        partition.delete("c").await.unwrap();
        let nigeria: Vec<Value> = partition.find_by_index("country", &json!("NG")).await.unwrap();
        assert_eq!(nigeria.len(), 1);

        let unknown = partition.find_by_index::<Value>("status", &json!("open")).await;
        assert!(matches!(unknown, Err(SyncError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_get_all_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let partition = open_partition(&temp_dir);

        for i in 0..3 {
            partition
                .put(&json!({"id": format!("id{}", i), "country": "ZA"}))
                .await
                .unwrap();
        }
        let all: Vec<Value> = partition.get_all().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0]["id"], "id0");

        partition.flush().await.unwrap();
        assert_eq!(partition.stats().key_count, 3);

        partition.clear().await.unwrap();
        assert_eq!(partition.count(), 0);
        let by_country: Vec<Value> = partition.find_by_index("country", &json!("ZA")).await.unwrap();
        assert!(by_country.is_empty());
    }
}
