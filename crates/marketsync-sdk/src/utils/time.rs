//! 时间处理工具模块
//!
//! # 设计原则
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳
//! - **业务层**: 统一使用 `now_utc_millis()` 生成时间
//! - **记录层**: 远端记录中的时间字段可能是 RFC 3339 字符串，也可能是毫秒时间戳，统一解析为 UTC

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// 时间工具
pub struct TimeFormatter;

impl TimeFormatter {
    /// 当前 UTC 毫秒时间戳
    pub fn now_utc_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// 毫秒时间戳格式化为 ISO 8601（RFC 3339）
    pub fn format_iso8601(utc_timestamp_ms: i64) -> String {
        match Utc.timestamp_millis_opt(utc_timestamp_ms).single() {
            Some(dt) => dt.to_rfc3339(),
            None => String::new(),
        }
    }

    /// 距今经过的秒数
    pub fn seconds_since(utc_timestamp_ms: i64) -> i64 {
        (Self::now_utc_millis() - utc_timestamp_ms) / 1000
    }

    /// 解析记录中的时间字段
    ///
    /// 支持：
    /// - RFC 3339 字符串（`2024-05-01T10:00:00Z`、`2024-05-01T10:00:00.123+08:00`）
    /// - 不带时区的 `2024-05-01T10:00:00` / `2024-05-01 10:00:00`（按 UTC 处理）
    /// - 整数毫秒时间戳
    pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
        match value {
            Value::String(s) => Self::parse_timestamp_str(s),
            Value::Number(n) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            _ => None,
        }
    }

    fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
                return Some(Utc.from_utc_datetime(&naive));
            }
        }
        None
    }

    /// 读取记录的"最后修改时间"：优先 `updated_at`，回退 `created_at`
    pub fn record_timestamp(record: &Value) -> Option<DateTime<Utc>> {
        record
            .get("updated_at")
            .and_then(Self::parse_timestamp)
            .or_else(|| record.get("created_at").and_then(Self::parse_timestamp))
    }
}
