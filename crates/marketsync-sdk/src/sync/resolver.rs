//! 冲突解决
//!
//! 纯函数：给定本地与远端两个版本，按集合策略选出胜者或逐字段合并。
//! 时间戳取 `updated_at`，缺失时回退 `created_at`；相等或双方都缺失时本地胜出。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::queue::ConflictResolution;
use crate::utils::TimeFormatter;

/// 逐字段合并规则
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRules {
    /// 用户输入的字段，以本地为准
    #[serde(default)]
    pub local_fields: Vec<String>,
    /// 数值计数器，取两者较大值
    #[serde(default)]
    pub max_fields: Vec<String>,
    /// 服务端维护的字段，以远端为准
    #[serde(default)]
    pub remote_fields: Vec<String>,
}

impl MergeRules {
    /// 用户资料类集合的内置规则
    pub fn profiles() -> Self {
        fn owned(fields: &[&str]) -> Vec<String> {
            fields.iter().map(|f| f.to_string()).collect()
        }
        Self {
            local_fields: owned(&["full_name", "name", "phone", "bio", "avatar_url", "location"]),
            max_fields: owned(&["tokens", "token_balance"]),
            remote_fields: owned(&[
                "id",
                "role",
                "is_admin",
                "is_verified",
                "created_at",
                "updated_at",
                "email",
            ]),
        }
    }
}

/// 集合级冲突策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    LastWriteWins,
    PreferLocal,
    PreferRemote,
    Merge(MergeRules),
}

/// 胜出方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// 冲突解决结果
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub payload: Value,
    pub tag: ConflictResolution,
}

/// 按时间戳判定胜者
pub fn last_write_winner(local: &Value, remote: &Value) -> Winner {
    let local_ts = TimeFormatter::record_timestamp(local);
    let remote_ts = TimeFormatter::record_timestamp(remote);
    match (local_ts, remote_ts) {
        (Some(l), Some(r)) if r > l => Winner::Remote,
        (None, Some(_)) => Winner::Remote,
        _ => Winner::Local,
    }
}

/// 时间戳较新的一方整体胜出，另一方被丢弃
pub fn resolve_last_write_wins(local: &Value, remote: &Value) -> Value {
    match last_write_winner(local, remote) {
        Winner::Local => local.clone(),
        Winner::Remote => remote.clone(),
    }
}

/// 按集合内置规则合并；未知集合回退到最后写入者胜出
pub fn resolve_merge(local: &Value, remote: &Value, collection: &str) -> Value {
    match builtin_rules(collection) {
        Some(rules) => merge_with_rules(local, remote, &rules),
        None => resolve_last_write_wins(local, remote),
    }
}

/// 以最后写入者为底，按规则逐字段覆盖
pub fn merge_with_rules(local: &Value, remote: &Value, rules: &MergeRules) -> Value {
    let (Value::Object(local_map), Value::Object(remote_map)) = (local, remote) else {
        return resolve_last_write_wins(local, remote);
    };

    let mut merged: Map<String, Value> = match last_write_winner(local, remote) {
        Winner::Local => local_map.clone(),
        Winner::Remote => remote_map.clone(),
    };

    for field in &rules.local_fields {
        if let Some(value) = local_map.get(field) {
            merged.insert(field.clone(), value.clone());
        }
    }
    for field in &rules.remote_fields {
        if let Some(value) = remote_map.get(field) {
            merged.insert(field.clone(), value.clone());
        }
    }
    for field in &rules.max_fields {
        let larger = match (local_map.get(field), remote_map.get(field)) {
            (Some(l), Some(r)) => {
                match (l.as_f64(), r.as_f64()) {
                    (Some(lv), Some(rv)) if rv > lv => Some(r),
                    (Some(_), _) => Some(l),
                    (None, Some(_)) => Some(r),
                    (None, None) => None,
                }
            }
            (Some(l), None) => Some(l),
            (None, Some(r)) => Some(r),
            (None, None) => None,
        };
        if let Some(value) = larger {
            merged.insert(field.clone(), value.clone());
        }
    }

    Value::Object(merged)
}

fn builtin_rules(collection: &str) -> Option<MergeRules> {
    match collection {
        "profiles" => Some(MergeRules::profiles()),
        _ => None,
    }
}

/// 带集合策略表的冲突解决器
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policies: HashMap<String, ConflictPolicy>,
}

impl ConflictResolver {
    pub fn new(policies: HashMap<String, ConflictPolicy>) -> Self {
        Self { policies }
    }

    /// 配置优先，其次内置规则，最后是最后写入者胜出
    pub fn policy_for(&self, collection: &str) -> ConflictPolicy {
        if let Some(policy) = self.policies.get(collection) {
            return policy.clone();
        }
        match builtin_rules(collection) {
            Some(rules) => ConflictPolicy::Merge(rules),
            None => ConflictPolicy::LastWriteWins,
        }
    }

    /// 解决一次冲突；远端版本缺失时保留本地版本
    pub fn resolve(&self, collection: &str, local: &Value, remote: Option<&Value>) -> Resolution {
        let Some(remote) = remote else {
            return Resolution {
                payload: local.clone(),
                tag: ConflictResolution::PreferLocal,
            };
        };

        match self.policy_for(collection) {
            ConflictPolicy::LastWriteWins => match last_write_winner(local, remote) {
                Winner::Local => Resolution {
                    payload: local.clone(),
                    tag: ConflictResolution::PreferLocal,
                },
                Winner::Remote => Resolution {
                    payload: remote.clone(),
                    tag: ConflictResolution::PreferRemote,
                },
            },
            ConflictPolicy::PreferLocal => Resolution {
                payload: local.clone(),
                tag: ConflictResolution::PreferLocal,
            },
            ConflictPolicy::PreferRemote => Resolution {
                payload: remote.clone(),
                tag: ConflictResolution::PreferRemote,
            },
            ConflictPolicy::Merge(rules) => Resolution {
                payload: merge_with_rules(local, remote, &rules),
                tag: ConflictResolution::Merge,
            },
        }
    }
}
