//! 进程内行存储后端，用于离线演示与测试

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{RemoteBackend, RemoteError, RemoteErrorCode};

/// 一次后端调用记录
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub verb: &'static str,
    pub collection: String,
    pub id: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// collection -> id -> row
    tables: HashMap<String, BTreeMap<String, Value>>,
    /// collection -> 唯一列
    unique_columns: HashMap<String, HashSet<String>>,
    calls: Vec<RemoteCall>,
    injected: VecDeque<RemoteError>,
    unreachable: bool,
    latency: Option<Duration>,
}

/// 内存后端
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明唯一列（`id` 总是唯一）
    pub fn with_unique(self, collection: &str, column: &str) -> Self {
        self.state
            .lock()
            .unique_columns
            .entry(collection.to_string())
            .or_default()
            .insert(column.to_string());
        self
    }

    /// 直接写入一行，不经过调用记录
    pub fn seed(&self, collection: &str, row: Value) {
        if let Some(id) = row_id(&row) {
            self.state
                .lock()
                .tables
                .entry(collection.to_string())
                .or_default()
                .insert(id, row);
        }
    }

    pub fn row(&self, collection: &str, id: &str) -> Option<Value> {
        self.state.lock().tables.get(collection)?.get(id).cloned()
    }

    pub fn rows(&self, collection: &str) -> Vec<Value> {
        self.state
            .lock()
            .tables
            .get(collection)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 全部调用记录（含失败的）
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    /// 指定动词的调用记录
    pub fn calls_for(&self, verb: &str) -> Vec<RemoteCall> {
        self.state.lock().calls.iter().filter(|c| c.verb == verb).cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// 切换可达性；不可达时所有调用返回瞬时错误
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// 下一次调用返回指定错误
    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().injected.push_back(error);
    }

    /// 每次调用的模拟延迟
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// 记录调用并返回预设故障
    async fn begin(&self, verb: &'static str, collection: &str, id: Option<&str>, payload: &Value) -> Result<(), RemoteError> {
        let latency = {
            let mut state = self.state.lock();
            state.calls.push(RemoteCall {
                verb,
                collection: collection.to_string(),
                id: id.map(str::to_string),
                payload: payload.clone(),
            });
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if state.unreachable {
            return Err(RemoteError::new(RemoteErrorCode::Transient, "backend unreachable"));
        }
        if let Some(error) = state.injected.pop_front() {
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn insert(&self, collection: &str, record: &Value) -> Result<Value, RemoteError> {
        let id = row_id(record);
        self.begin("insert", collection, id.as_deref(), record).await?;

        let Value::Object(fields) = record else {
            return Err(RemoteError::new(RemoteErrorCode::Malformed, "record must be an object"));
        };
        let mut row = fields.clone();
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        row.insert("id".to_string(), Value::String(id.clone()));

        let mut state = self.state.lock();
        let state = &mut *state;
        let table = state.tables.entry(collection.to_string()).or_default();
        if table.contains_key(&id) {
            return Err(RemoteError::new(
                RemoteErrorCode::UniqueViolation,
                format!("duplicate key value violates unique constraint \"{}_pkey\"", collection),
            ));
        }
        check_unique(state.unique_columns.get(collection), table, &id, &row)?;

        let row = Value::Object(row);
        table.insert(id, row.clone());
        Ok(row)
    }

    async fn update(&self, collection: &str, id: &str, patch: &Value) -> Result<Value, RemoteError> {
        self.begin("update", collection, Some(id), patch).await?;

        let Value::Object(fields) = patch else {
            return Err(RemoteError::new(RemoteErrorCode::Malformed, "patch must be an object"));
        };

        let mut state = self.state.lock();
        let state = &mut *state;
        let table = state.tables.entry(collection.to_string()).or_default();
        let Some(Value::Object(existing)) = table.get(id) else {
            return Err(RemoteError::new(RemoteErrorCode::NotFound, format!("{}/{} not found", collection, id)));
        };

        let mut row = existing.clone();
        for (key, value) in fields {
            if key != "id" {
                row.insert(key.clone(), value.clone());
            }
        }
        check_unique(state.unique_columns.get(collection), table, id, &row)?;

        let row = Value::Object(row);
        table.insert(id.to_string(), row.clone());
        Ok(row)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<Value, RemoteError> {
        self.begin("delete", collection, Some(id), &Value::Null).await?;

        let mut state = self.state.lock();
        match state.tables.get_mut(collection).and_then(|t| t.remove(id)) {
            Some(row) => Ok(row),
            None => Err(RemoteError::new(RemoteErrorCode::NotFound, format!("{}/{} not found", collection, id))),
        }
    }

    async fn select(&self, collection: &str, filter: &[(&str, Value)]) -> Result<Value, RemoteError> {
        let filter_value = Value::Object(
            filter
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<Map<String, Value>>(),
        );
        self.begin("select", collection, None, &filter_value).await?;

        let state = self.state.lock();
        let rows = state
            .tables
            .get(collection)
            .map(|table| {
                table
                    .values()
                    .filter(|row| filter.iter().all(|(k, v)| row.get(*k) == Some(v)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(Value::Array(rows))
    }
}

fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn check_unique(
    columns: Option<&HashSet<String>>,
    table: &BTreeMap<String, Value>,
    id: &str,
    row: &Map<String, Value>,
) -> Result<(), RemoteError> {
    let Some(columns) = columns else {
        return Ok(());
    };
    for column in columns {
        let Some(value) = row.get(column) else {
            continue;
        };
        let taken = table
            .iter()
            .any(|(other_id, other)| other_id != id && other.get(column) == Some(value));
        if taken {
            return Err(RemoteError::new(
                RemoteErrorCode::UniqueViolation,
                format!("duplicate value for unique column {}", column),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_id_and_enforces_unique() {
        let backend = MemoryBackend::new().with_unique("profiles", "email");

        let row = backend.insert("profiles", &json!({"email": "a@x.io"})).await.unwrap();
        assert!(row["id"].is_string());

        let dup = backend.insert("profiles", &json!({"email": "a@x.io"})).await.unwrap_err();
        assert_eq!(dup.code, RemoteErrorCode::UniqueViolation);
        assert_eq!(backend.rows("profiles").len(), 1);
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let backend = MemoryBackend::new();
        backend.seed("opportunities", json!({"id": "o1", "title": "Fix fence", "budget": 50}));

        let row = backend
            .update("opportunities", "o1", &json!({"id": "o1", "budget": 80}))
            .await
            .unwrap();
        assert_eq!(row, json!({"id": "o1", "title": "Fix fence", "budget": 80}));

        let selected = backend.select("opportunities", &[("budget", json!(80))]).await.unwrap();
        assert_eq!(selected.as_array().map(Vec::len), Some(1));
        assert_eq!(backend.calls_for("update").len(), 1);
    }

    #[tokio::test]
    async fn test_injected_errors_are_one_shot() {
        let backend = MemoryBackend::new();
        backend.fail_next(RemoteError::new(RemoteErrorCode::AuthFailure, "jwt expired"));

        let first = backend.insert("chat", &json!({"body": "a"})).await;
        let second = backend.insert("chat", &json!({"body": "b"})).await;
        assert_eq!(first.unwrap_err().code, RemoteErrorCode::AuthFailure);
        assert!(second.is_ok());
        assert_eq!(backend.calls().len(), 2);

        let missing = backend.delete("chat", "ghost").await.unwrap_err();
        assert_eq!(missing.code, RemoteErrorCode::NotFound);
    }
}
