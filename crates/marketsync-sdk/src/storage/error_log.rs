//! 错误上报
//!
//! 永久性失败与关键异常通过 [`ErrorReporter`] 上报。默认实现 [`ErrorLog`]
//! 写入 tracing 日志并落盘到 `error_log` 分区，供宿主应用后续转发到遥测端。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{ErrorCategory, ErrorSeverity, Result, SyncError};
use crate::storage::KvPartition;
use crate::utils::TimeFormatter;

/// 一条错误上报记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub id: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    /// 附加上下文（记录 id、集合名、URL 等）
    #[serde(default)]
    pub context: Value,
    pub created_at: i64,
}

impl ErrorReport {
    pub fn new(category: ErrorCategory, severity: ErrorSeverity, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message: message.into(),
            context: Value::Null,
            created_at: TimeFormatter::now_utc_millis(),
        }
    }

    /// 按错误自身的分类与默认严重级别构造
    pub fn from_error(err: &SyncError) -> Self {
        Self::new(err.category(), err.severity(), err.to_string())
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// 错误上报接口
///
/// 上报本身不能失败：实现方自行处理内部错误。
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, report: ErrorReport);
}

/// 本地错误日志
#[derive(Debug, Clone)]
pub struct ErrorLog {
    partition: Arc<KvPartition>,
}

impl ErrorLog {
    pub fn new(partition: Arc<KvPartition>) -> Self {
        Self { partition }
    }

    /// 最近的 `limit` 条记录（新的在前）
    pub async fn recent(&self, limit: usize) -> Result<Vec<ErrorReport>> {
        let mut reports: Vec<ErrorReport> = self.partition.get_all().await?;
        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        reports.truncate(limit);
        Ok(reports)
    }

    pub async fn by_category(&self, category: ErrorCategory) -> Result<Vec<ErrorReport>> {
        self.partition
            .find_by_index("category", &Value::String(category.as_str().to_string()))
            .await
    }

    pub async fn clear(&self) -> Result<()> {
        self.partition.clear().await
    }
}

#[async_trait]
impl ErrorReporter for ErrorLog {
    async fn report(&self, report: ErrorReport) {
        match report.severity {
            ErrorSeverity::Critical | ErrorSeverity::High => error!(
                category = %report.category,
                severity = %report.severity,
                context = %report.context,
                "{}",
                report.message
            ),
            ErrorSeverity::Medium => warn!(
                category = %report.category,
                severity = %report.severity,
                "{}",
                report.message
            ),
            ErrorSeverity::Low => info!(
                category = %report.category,
                severity = %report.severity,
                "{}",
                report.message
            ),
        }

        if let Err(e) = self.partition.put(&report).await {
            warn!("错误日志落盘失败: {}", e);
        }
    }
}
