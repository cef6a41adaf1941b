//! 远端桥接 - 把变更记录翻译成远端 CRUD 调用
//!
//! 同步相关的网络 I/O 只发生在这里。后端实现 [`RemoteBackend`]，
//! [`RemoteBridge`] 负责超时、错误分类以及冲突时拉取远端当前版本。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::queue::{FailureReason, MutationKind};

pub mod memory;
pub mod rest;

pub use memory::MemoryBackend;
pub use rest::RestBackend;

/// 远端错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteErrorCode {
    /// 唯一性约束冲突
    UniqueViolation,
    /// 外键（引用完整性）冲突
    ForeignKeyViolation,
    NotFound,
    AuthFailure,
    Malformed,
    /// 连接失败、超时等
    Transient,
    RateLimited,
    /// 5xx
    Server,
}

/// 远端调用错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub message: String,
    /// HTTP 状态码（若有）
    pub status: Option<u16>,
}

impl RemoteError {
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self.code,
            RemoteErrorCode::UniqueViolation | RemoteErrorCode::ForeignKeyViolation
        )
    }

    pub fn failure_reason(&self) -> FailureReason {
        match self.code {
            RemoteErrorCode::UniqueViolation | RemoteErrorCode::ForeignKeyViolation => {
                FailureReason::Conflict
            }
            RemoteErrorCode::NotFound => FailureReason::NotFound,
            RemoteErrorCode::AuthFailure => FailureReason::AuthFailure,
            RemoteErrorCode::Malformed => FailureReason::Malformed,
            RemoteErrorCode::Transient => FailureReason::NetworkUnavailable,
            RemoteErrorCode::RateLimited => FailureReason::RateLimited,
            RemoteErrorCode::Server => FailureReason::ServerError(self.status.unwrap_or(500)),
        }
    }
}

/// 远端行存储接口
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn insert(&self, collection: &str, record: &Value) -> Result<Value, RemoteError>;

    async fn update(&self, collection: &str, id: &str, patch: &Value) -> Result<Value, RemoteError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<Value, RemoteError>;

    /// 等值过滤查询，返回 JSON 数组
    async fn select(&self, collection: &str, filter: &[(&str, Value)]) -> Result<Value, RemoteError>;
}

/// 一次远端执行的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok(Value),
    /// 约束冲突；`remote` 为远端当前版本（查不到时为 None）
    Conflict {
        remote: Option<Value>,
        code: RemoteErrorCode,
        message: String,
    },
    TransientError {
        reason: FailureReason,
        message: String,
    },
    PermanentError {
        reason: FailureReason,
        message: String,
    },
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }
}

/// 远端桥接
#[derive(Clone)]
pub struct RemoteBridge {
    backend: Arc<dyn RemoteBackend>,
    timeout: Duration,
}

impl std::fmt::Debug for RemoteBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBridge").field("timeout", &self.timeout).finish()
    }
}

impl RemoteBridge {
    pub fn new(backend: Arc<dyn RemoteBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// 执行一条变更
    #[instrument(skip(self, payload), fields(timeout_ms = self.timeout.as_millis() as u64))]
    pub async fn execute(&self, kind: MutationKind, collection: &str, payload: &Value) -> Outcome {
        let target_id = payload_id(payload);

        let call = async {
            match kind {
                MutationKind::Create => self.backend.insert(collection, payload).await,
                MutationKind::Update | MutationKind::Delete => {
                    let Some(id) = target_id.as_deref() else {
                        return Err(RemoteError::new(
                            RemoteErrorCode::Malformed,
                            format!("{} 操作缺少目标 id", kind),
                        ));
                    };
                    if kind == MutationKind::Update {
                        self.backend.update(collection, id, payload).await
                    } else {
                        self.backend.delete(collection, id).await
                    }
                }
            }
        };

        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!("远端操作超时: {} {}", kind, collection);
                return Outcome::TransientError {
                    reason: FailureReason::Timeout,
                    message: format!("operation timed out after {:?}", self.timeout),
                };
            }
        };

        match result {
            Ok(value) => {
                debug!("远端操作成功: {} {}", kind, collection);
                Outcome::Ok(value)
            }
            Err(err) if err.is_conflict() => {
                let remote = match target_id.as_deref() {
                    Some(id) => self.fetch_remote(collection, id).await,
                    None => None,
                };
                Outcome::Conflict {
                    remote,
                    code: err.code,
                    message: err.message,
                }
            }
            Err(err) => {
                let reason = err.failure_reason();
                if reason.is_transient() {
                    Outcome::TransientError {
                        reason,
                        message: err.message,
                    }
                } else {
                    Outcome::PermanentError {
                        reason,
                        message: err.message,
                    }
                }
            }
        }
    }

    /// 按 id 读取远端当前版本
    pub async fn fetch_remote(&self, collection: &str, id: &str) -> Option<Value> {
        let filter = [("id", Value::String(id.to_string()))];
        match tokio::time::timeout(self.timeout, self.backend.select(collection, &filter)).await {
            Ok(Ok(Value::Array(mut rows))) if !rows.is_empty() => Some(rows.swap_remove(0)),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!("读取远端记录 {}/{} 失败: {}", collection, id, e);
                None
            }
            Err(_) => {
                warn!("读取远端记录 {}/{} 超时", collection, id);
                None
            }
        }
    }
}

fn payload_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
