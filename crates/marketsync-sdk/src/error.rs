use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误上报分类（与外部日志/遥测汇聚端约定一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Validation,
    Network,
    Auth,
    Sync,
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Network => "network",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Sync => "sync",
            ErrorCategory::System => "system",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "low"),
            ErrorSeverity::Medium => write!(f, "medium"),
            ErrorSeverity::High => write!(f, "high"),
            ErrorSeverity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// 本地持久化存储不可用或写入失败
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 连接问题导致的远端调用失败，可重试
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// 远端检测到唯一性/引用完整性冲突
    #[error("Conflict: {0}")]
    Conflict(String),

    /// 载荷非法、引用实体不存在、鉴权失败等，不可盲目重试
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// 缓存未命中（仅请求缓存层内部使用）
    #[error("Cache miss: {0}")]
    CacheMiss(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Install failed for asset {asset}: {reason}")]
    InstallFailed { asset: String, reason: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("SDK is shutting down")]
    ShuttingDown,
}

impl SyncError {
    /// 映射到错误上报分类
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::InvalidInput(_) | SyncError::Serialization(_) => ErrorCategory::Validation,
            SyncError::TransientNetwork(_) | SyncError::Http(_) | SyncError::CacheMiss(_) => {
                ErrorCategory::Network
            }
            SyncError::Conflict(_)
            | SyncError::Permanent(_)
            | SyncError::InvalidTransition { .. } => ErrorCategory::Sync,
            SyncError::Storage(_)
            | SyncError::InstallFailed { .. }
            | SyncError::Config(_)
            | SyncError::Io(_)
            | SyncError::ShuttingDown => ErrorCategory::System,
        }
    }

    /// 默认严重级别，上报方可自行覆盖
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SyncError::Storage(_) => ErrorSeverity::Critical,
            SyncError::Permanent(_) | SyncError::InstallFailed { .. } => ErrorSeverity::High,
            SyncError::TransientNetwork(_) | SyncError::Http(_) | SyncError::Conflict(_) => {
                ErrorSeverity::Low
            }
            SyncError::CacheMiss(_) => ErrorSeverity::Low,
            _ => ErrorSeverity::Medium,
        }
    }

    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_) | SyncError::Http(_))
    }
}

impl From<sled::Error> for SyncError {
    fn from(error: sled::Error) -> Self {
        SyncError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl From<bincode::Error> for SyncError {
    fn from(error: bincode::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        SyncError::Io(error.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            SyncError::TransientNetwork(error.to_string())
        } else {
            SyncError::Http(error.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_mapping() {
        assert_eq!(SyncError::InvalidInput("x".into()).category(), ErrorCategory::Validation);
        assert_eq!(SyncError::TransientNetwork("x".into()).category(), ErrorCategory::Network);
        assert_eq!(SyncError::Permanent("x".into()).category(), ErrorCategory::Sync);
        assert_eq!(SyncError::Storage("x".into()).category(), ErrorCategory::System);
        assert_eq!(SyncError::ShuttingDown.category(), ErrorCategory::System);
        assert_eq!(SyncError::ShuttingDown.to_string(), "SDK is shutting down");
    }

    #[test]
    fn test_error_severity_and_transient() {
        assert_eq!(SyncError::Storage("disk".into()).severity(), ErrorSeverity::Critical);
        assert!(ErrorSeverity::Critical > ErrorSeverity::High);
        assert!(SyncError::TransientNetwork("timeout".into()).is_transient());
        assert!(!SyncError::Permanent("bad payload".into()).is_transient());
    }

    #[test]
    fn test_category_serializes_lowercase() {
        let json = serde_json::to_string(&ErrorCategory::Auth).unwrap();
        assert_eq!(json, "\"auth\"");
    }
}
