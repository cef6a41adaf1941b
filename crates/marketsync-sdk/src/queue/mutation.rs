use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::queue::retry_policy::FailureReason;
use crate::utils::TimeFormatter;

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Create => write!(f, "create"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

/// 变更记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationStatus {
    /// 等待同步
    Pending,
    /// 正在提交到远端
    InFlight,
    /// 已完成
    Completed,
    /// 失败，等待重试
    Failed,
}

impl MutationStatus {
    /// 状态流转表
    ///
    /// `InFlight -> Pending` 仅用于冲突解决后的延迟重试，
    /// `Pending -> Failed` 用于提交前即判定失败的记录。
    pub fn can_transition_to(&self, next: MutationStatus) -> bool {
        use MutationStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Pending, Failed)
                | (InFlight, Completed)
                | (InFlight, Failed)
                | (InFlight, Pending)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationStatus::Pending => write!(f, "pending"),
            MutationStatus::InFlight => write!(f, "in_flight"),
            MutationStatus::Completed => write!(f, "completed"),
            MutationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// 冲突解决方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictResolution {
    PreferLocal,
    PreferRemote,
    Merge,
}

/// 待同步的变更记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: String,
    /// 持久化序号，决定处理顺序
    pub seq: u64,
    pub kind: MutationKind,
    pub collection: String,
    pub payload: Value,
    /// 入队时间（UTC 毫秒）
    pub enqueued_at: i64,
    pub retry_count: u32,
    pub status: MutationStatus,
    pub conflict_resolution: Option<ConflictResolution>,
    #[serde(default)]
    pub conflict_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_failure: Option<FailureReason>,
    /// 下次自动重试时间（UTC 毫秒）
    #[serde(default)]
    pub next_retry_at: Option<i64>,
    /// 超过重试上限，只能人工重试
    #[serde(default)]
    pub requires_manual: bool,
    pub updated_at: i64,
}

impl MutationRecord {
    pub fn new(seq: u64, kind: MutationKind, collection: impl Into<String>, payload: Value) -> Self {
        let now = TimeFormatter::now_utc_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq,
            kind,
            collection: collection.into(),
            payload,
            enqueued_at: now,
            retry_count: 0,
            status: MutationStatus::Pending,
            conflict_resolution: None,
            conflict_count: 0,
            last_error: None,
            last_failure: None,
            next_retry_at: None,
            requires_manual: false,
            updated_at: now,
        }
    }

    /// 载荷中的目标记录 id
    pub fn target_id(&self) -> Option<String> {
        match self.payload.get("id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// 网络恢复时是否可被自动重新排队
    pub fn is_auto_retryable(&self) -> bool {
        self.status == MutationStatus::Failed
            && !self.requires_manual
            && self.last_failure.as_ref().map(FailureReason::is_transient).unwrap_or(false)
    }

    pub fn details(&self) -> String {
        format!(
            "Mutation(id={}, seq={}, {} {}, status={}, retry={}, conflicts={})",
            self.id, self.seq, self.kind, self.collection, self.status, self.retry_count, self.conflict_count
        )
    }
}

/// 状态更新时附带合并的字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub retry_count: Option<u32>,
    pub conflict_resolution: Option<ConflictResolution>,
    pub payload: Option<Value>,
    pub kind: Option<MutationKind>,
    pub conflict_count: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub last_failure: Option<Option<FailureReason>>,
    pub next_retry_at: Option<Option<i64>>,
    pub requires_manual: Option<bool>,
}

impl StatusPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn conflict_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = Some(resolution);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn kind(mut self, kind: MutationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn conflict_count(mut self, count: u32) -> Self {
        self.conflict_count = Some(count);
        self
    }

    /// 记录失败原因
    pub fn failure(mut self, reason: FailureReason, message: impl Into<String>) -> Self {
        self.last_failure = Some(Some(reason));
        self.last_error = Some(Some(message.into()));
        self
    }

    /// 清除失败信息与重试计划
    pub fn clear_failure(mut self) -> Self {
        self.last_failure = Some(None);
        self.last_error = Some(None);
        self.next_retry_at = Some(None);
        self
    }

    pub fn next_retry_at(mut self, at: Option<i64>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn requires_manual(mut self, value: bool) -> Self {
        self.requires_manual = Some(value);
        self
    }

    /// 合并到记录上；retry_count 只增不减
    pub fn apply(self, record: &mut MutationRecord) {
        if let Some(count) = self.retry_count {
            record.retry_count = record.retry_count.max(count);
        }
        if let Some(resolution) = self.conflict_resolution {
            record.conflict_resolution = Some(resolution);
        }
        if let Some(payload) = self.payload {
            record.payload = payload;
        }
        if let Some(kind) = self.kind {
            record.kind = kind;
        }
        if let Some(count) = self.conflict_count {
            record.conflict_count = count;
        }
        if let Some(error) = self.last_error {
            record.last_error = error;
        }
        if let Some(failure) = self.last_failure {
            record.last_failure = failure;
        }
        if let Some(at) = self.next_retry_at {
            record.next_retry_at = at;
        }
        if let Some(value) = self.requires_manual {
            record.requires_manual = value;
        }
    }
}
