//! 同步队列 - 持久化的待同步变更列表
//!
//! 所有变更记录由 [`SyncQueue`] 独占管理；UI 只能提交新记录或读取队列状态。
//! 读-改-写操作经由一把异步互斥锁串行化。

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::storage::{next_sequence, KvPartition, Partition, StorageManager};
use crate::utils::TimeFormatter;

pub mod mutation;
pub mod retry_policy;

pub use mutation::{ConflictResolution, MutationKind, MutationRecord, MutationStatus, StatusPatch};
pub use retry_policy::{FailureReason, RetryPolicy};

/// 各状态记录数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    /// 失败且超过重试上限的记录
    pub requires_manual: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.completed + self.failed
    }
}

/// 重置失败记录的范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetFilter {
    /// 全部失败记录（人工重试）
    All,
    /// 仅瞬时失败且未超过上限的记录（网络恢复、自动重试）
    AutoRetryable,
}

/// 同步队列
#[derive(Debug)]
pub struct SyncQueue {
    partition: Arc<KvPartition>,
    db: Arc<sled::Db>,
    write_lock: Mutex<()>,
}

impl SyncQueue {
    pub fn new(storage: &StorageManager) -> Self {
        Self {
            partition: storage.partition(Partition::SyncQueue),
            db: storage.db(),
            write_lock: Mutex::new(()),
        }
    }

    /// 创建并持久化一条新的待同步记录
    ///
    /// 返回前记录已落盘；落盘失败时记录不可见并返回 `SyncError::Storage`。
    pub async fn enqueue(&self, kind: MutationKind, collection: &str, payload: Value) -> Result<MutationRecord> {
        validate_mutation(kind, collection, &payload)?;

        let _guard = self.write_lock.lock().await;
        let seq = next_sequence(&self.db)?;
        let record = MutationRecord::new(seq, kind, collection, payload);

        self.partition.put(&record).await?;
        if let Err(e) = self.partition.flush().await {
            // 未确认落盘的记录不能留在队列中
            let _ = self.partition.delete(&record.id).await;
            return Err(e);
        }

        info!("📥 变更已入队: {}", record.details());
        Ok(record)
    }

    /// 按入队顺序列出记录，可按状态过滤
    pub async fn list(&self, filter: Option<MutationStatus>) -> Result<Vec<MutationRecord>> {
        let mut records: Vec<MutationRecord> = self.partition.get_all().await?;
        if let Some(status) = filter {
            records.retain(|r| r.status == status);
        }
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }

    pub async fn get(&self, id: &str) -> Result<Option<MutationRecord>> {
        self.partition.get(id).await
    }

    /// 状态流转并合并附加字段
    ///
    /// 记录不存在时只记日志并返回 `Ok(None)`；非法流转返回 `SyncError::InvalidTransition`。
    pub async fn update_status(
        &self,
        id: &str,
        new_status: MutationStatus,
        patch: Option<StatusPatch>,
    ) -> Result<Option<MutationRecord>> {
        let _guard = self.write_lock.lock().await;

        let Some(mut record) = self.partition.get::<MutationRecord>(id).await? else {
            warn!("更新状态时记录不存在，忽略: {} -> {}", id, new_status);
            return Ok(None);
        };

        if !record.status.can_transition_to(new_status) {
            return Err(SyncError::InvalidTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let from = record.status;
        record.status = new_status;
        if let Some(patch) = patch {
            patch.apply(&mut record);
        }
        record.updated_at = TimeFormatter::now_utc_millis();

        self.partition.put(&record).await?;
        self.partition.flush().await?;

        debug!("变更状态 {} : {} -> {}", id, from, new_status);
        Ok(Some(record))
    }

    /// 永久删除记录
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let removed = self.partition.delete(id).await?;
        if removed {
            self.partition.flush().await?;
        }
        Ok(removed)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let records: Vec<MutationRecord> = self.partition.get_all().await?;
        let mut counts = QueueCounts::default();
        for record in &records {
            match record.status {
                MutationStatus::Pending => counts.pending += 1,
                MutationStatus::InFlight => counts.in_flight += 1,
                MutationStatus::Completed => counts.completed += 1,
                MutationStatus::Failed => {
                    counts.failed += 1;
                    if record.requires_manual {
                        counts.requires_manual += 1;
                    }
                }
            }
        }
        Ok(counts)
    }

    /// 将失败记录重新置为 Pending，返回被重置的记录 id（按入队顺序）
    pub async fn reset_failed(&self, filter: ResetFilter) -> Result<Vec<MutationRecord>> {
        let failed = self.list(Some(MutationStatus::Failed)).await?;
        let mut reset = Vec::new();

        for record in failed {
            let eligible = match filter {
                ResetFilter::All => true,
                ResetFilter::AutoRetryable => record.is_auto_retryable(),
            };
            if !eligible {
                continue;
            }

            let mut patch = StatusPatch::new().next_retry_at(None);
            if filter == ResetFilter::All {
                patch = patch.requires_manual(false).conflict_count(0);
            }
            if let Some(updated) = self.update_status(&record.id, MutationStatus::Pending, Some(patch)).await? {
                reset.push(updated);
            }
        }

        if !reset.is_empty() {
            info!("🔁 已重置 {} 条失败记录 ({:?})", reset.len(), filter);
        }
        Ok(reset)
    }

    /// 删除全部已完成记录
    pub async fn prune_completed(&self) -> Result<usize> {
        let completed = self.list(Some(MutationStatus::Completed)).await?;
        let mut removed = 0;
        for record in completed {
            if self.remove(&record.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// 进程中断后遗留的 InFlight 记录回到 Pending
    pub async fn recover_in_flight(&self) -> Result<usize> {
        let in_flight = self.list(Some(MutationStatus::InFlight)).await?;
        let mut recovered = 0;
        for record in in_flight {
            if self
                .update_status(&record.id, MutationStatus::Pending, None)
                .await?
                .is_some()
            {
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!("恢复了 {} 条中断的 InFlight 记录", recovered);
        }
        Ok(recovered)
    }
}

fn validate_mutation(kind: MutationKind, collection: &str, payload: &Value) -> Result<()> {
    if collection.trim().is_empty() {
        return Err(SyncError::InvalidInput("collection 不能为空".to_string()));
    }
    if !payload.is_object() {
        return Err(SyncError::InvalidInput("payload 必须是 JSON 对象".to_string()));
    }
    if matches!(kind, MutationKind::Update | MutationKind::Delete) {
        let has_id = match payload.get("id") {
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Number(_)) => true,
            _ => false,
        };
        if !has_id {
            return Err(SyncError::InvalidInput(format!("{} 操作的 payload 缺少 id", kind)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_queue(dir: &TempDir) -> SyncQueue {
        let storage = StorageManager::open(dir.path()).await.unwrap();
        SyncQueue::new(&storage)
    }

    #[tokio::test]
    async fn test_enqueue_and_list_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open_queue(&temp_dir).await;

        let mut ids = Vec::new();
        for i in 0..5 {
            let record = queue
                .enqueue(MutationKind::Create, "opportunities", json!({"title": format!("job {}", i)}))
                .await
                .unwrap();
            assert_eq!(record.status, MutationStatus::Pending);
            assert_eq!(record.retry_count, 0);
            ids.push(record.id);
        }

        let listed: Vec<String> = queue.list(None).await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn test_sequence_continues_after_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let before = {
            let queue = open_queue(&temp_dir).await;
            queue.enqueue(MutationKind::Create, "chat", json!({"body": "a"})).await.unwrap()
        };

        let queue = open_queue(&temp_dir).await;
        let after = queue.enqueue(MutationKind::Create, "chat", json!({"body": "b"})).await.unwrap();
        assert!(after.seq > before.seq);

        let listed: Vec<String> = queue.list(None).await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![before.id, after.id]);
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open_queue(&temp_dir).await;

        let empty = queue.enqueue(MutationKind::Create, "", json!({})).await;
        assert!(matches!(empty, Err(SyncError::InvalidInput(_))));

        let no_id = queue.enqueue(MutationKind::Update, "profiles", json!({"name": "x"})).await;
        assert!(matches!(no_id, Err(SyncError::InvalidInput(_))));

        let not_object = queue.enqueue(MutationKind::Create, "profiles", json!([1, 2])).await;
        assert!(not_object.is_err());
        assert_eq!(queue.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_update_status_transitions() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open_queue(&temp_dir).await;
        let record = queue
            .enqueue(MutationKind::Update, "profiles", json!({"id": "u1", "name": "Ama"}))
            .await
            .unwrap();

        queue.update_status(&record.id, MutationStatus::InFlight, None).await.unwrap();
        let done = queue
            .update_status(&record.id, MutationStatus::Completed, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, MutationStatus::Completed);

        let err = queue
            .update_status(&record.id, MutationStatus::Pending, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));

        // 不存在的记录静默忽略
        let missing = queue.update_status("nope", MutationStatus::InFlight, None).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_reset_failed_filters() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open_queue(&temp_dir).await;

        let transient = queue.enqueue(MutationKind::Create, "chat", json!({"body": "a"})).await.unwrap();
        let permanent = queue.enqueue(MutationKind::Create, "chat", json!({"body": "b"})).await.unwrap();

        for (record, reason) in [
            (&transient, FailureReason::Timeout),
            (&permanent, FailureReason::Malformed),
        ] {
            queue.update_status(&record.id, MutationStatus::InFlight, None).await.unwrap();
            queue
                .update_status(
                    &record.id,
                    MutationStatus::Failed,
                    Some(StatusPatch::new().retry_count(1).failure(reason, "boom")),
                )
                .await
                .unwrap();
        }

        let auto = queue.reset_failed(ResetFilter::AutoRetryable).await.unwrap();
        assert_eq!(auto.len(), 1);
        assert_eq!(auto[0].id, transient.id);
        assert_eq!(queue.counts().await.unwrap().failed, 1);

        let manual = queue.reset_failed(ResetFilter::All).await.unwrap();
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].id, permanent.id);

        let reset = queue.get(&permanent.id).await.unwrap().unwrap();
        assert_eq!(reset.status, MutationStatus::Pending);
        assert_eq!(reset.retry_count, 1);
    }

    #[tokio::test]
    async fn test_prune_and_recover() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open_queue(&temp_dir).await;

        let a = queue.enqueue(MutationKind::Create, "tokens", json!({"amount": 5})).await.unwrap();
        let b = queue.enqueue(MutationKind::Create, "tokens", json!({"amount": 6})).await.unwrap();

        queue.update_status(&a.id, MutationStatus::InFlight, None).await.unwrap();
        queue.update_status(&a.id, MutationStatus::Completed, None).await.unwrap();
        queue.update_status(&b.id, MutationStatus::InFlight, None).await.unwrap();

        assert_eq!(queue.prune_completed().await.unwrap(), 1);
        assert_eq!(queue.recover_in_flight().await.unwrap(), 1);

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 1);
        assert!(queue.remove(&b.id).await.unwrap());
        assert!(!queue.remove(&b.id).await.unwrap());
    }
}
