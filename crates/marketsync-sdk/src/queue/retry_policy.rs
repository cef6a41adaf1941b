use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::TimeFormatter;

/// 同步失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureReason {
    /// 远端操作超时 - 可重试
    Timeout,
    /// 网络不可用 - 等待恢复后重试
    NetworkUnavailable,
    /// 服务端错误 - 5xx 可重试
    ServerError(u16),
    /// 限流 - 延迟重试
    RateLimited,
    /// 认证/授权失败 - 需要用户处理
    AuthFailure,
    /// 载荷非法 - 不重试
    Malformed,
    /// 目标记录或引用实体不存在 - 不重试
    NotFound,
    /// 冲突次数超过上限
    Conflict,
    /// 未知错误
    Unknown(String),
}

impl FailureReason {
    /// 是否为瞬时失败（网络恢复或退避后可自动重试）
    pub fn is_transient(&self) -> bool {
        match self {
            FailureReason::Timeout => true,
            FailureReason::NetworkUnavailable => true,
            FailureReason::ServerError(code) => (500..600).contains(code),
            FailureReason::RateLimited => true,
            FailureReason::AuthFailure => false,
            FailureReason::Malformed => false,
            FailureReason::NotFound => false,
            FailureReason::Conflict => false,
            FailureReason::Unknown(_) => true, // 保守策略：未知错误可重试
        }
    }

    /// 重试延迟倍数
    pub fn delay_multiplier(&self) -> f64 {
        match self {
            FailureReason::NetworkUnavailable => 2.0,
            FailureReason::ServerError(_) => 1.5,
            FailureReason::RateLimited => 3.0, // 限流需要更长延迟
            _ => 1.0,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::NetworkUnavailable => write!(f, "network unavailable"),
            FailureReason::ServerError(code) => write!(f, "server error {}", code),
            FailureReason::RateLimited => write!(f, "rate limited"),
            FailureReason::AuthFailure => write!(f, "auth failure"),
            FailureReason::Malformed => write!(f, "malformed payload"),
            FailureReason::NotFound => write!(f, "not found"),
            FailureReason::Conflict => write!(f, "conflict limit reached"),
            FailureReason::Unknown(msg) => write!(f, "unknown: {}", msg),
        }
    }
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大尝试次数，达到后需要人工重试
    pub max_attempts: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 300_000, // 5分钟
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 重试次数是否已达上限
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_attempts
    }

    /// 是否还可以自动重试
    pub fn should_retry(&self, retry_count: u32, reason: &FailureReason) -> bool {
        !self.is_exhausted(retry_count) && reason.is_transient()
    }

    /// 第 `retry_count` 次失败后的退避时长
    pub fn backoff_delay(&self, retry_count: u32, reason: &FailureReason) -> Duration {
        // base_delay * (backoff_factor ^ (retry_count - 1))
        let exponent = retry_count.saturating_sub(1) as f64;
        let base_delay = self.base_delay_ms as f64 * self.backoff_factor.powf(exponent);

        let adjusted_delay = base_delay * reason.delay_multiplier();
        let capped_delay = adjusted_delay.min(self.max_delay_ms as f64);

        let jitter = capped_delay * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// 下次自动重试的 UTC 毫秒时间戳；不应重试时返回 None
    pub fn next_retry_at(&self, retry_count: u32, reason: &FailureReason) -> Option<i64> {
        if !self.should_retry(retry_count, reason) {
            return None;
        }
        let delay = self.backoff_delay(retry_count, reason);
        Some(TimeFormatter::now_utc_millis() + delay.as_millis() as i64)
    }
}
