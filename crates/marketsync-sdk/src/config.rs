//! SDK 配置
//!
//! 所有组件的参数集中在 [`SyncConfig`] 中，应用启动时构造一次，
//! 通过 [`SyncConfig::builder()`] 链式设置。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::queue::retry_policy::RetryPolicy;
use crate::sync::resolver::ConflictPolicy;

/// SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 数据存储目录（sled 数据库所在目录）
    pub data_dir: PathBuf,
    /// 远端服务配置
    pub remote: RemoteConfig,
    /// 失败重试策略
    pub retry: RetryPolicy,
    /// 同步引擎配置
    pub engine: EngineConfig,
    /// 请求缓存层配置
    pub cache: CacheConfig,
    /// HTTP 客户端配置
    pub http_client: HttpClientConfig,
    /// 事件缓冲区大小
    pub event_buffer_size: usize,
    /// 按集合声明的冲突处理策略（未声明的集合使用内置规则）
    pub conflict_policies: HashMap<String, ConflictPolicy>,
    /// 调试模式
    pub debug_mode: bool,
}

/// 远端服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// 远端服务基础 URL，例如：https://project.backend.example.com
    pub base_url: String,
    /// 匿名/服务 API Key
    pub api_key: Option<String>,
    /// 用户会话令牌（登录后设置）
    pub access_token: Option<String>,
    /// 单次远端操作超时（秒），超时按瞬时网络错误处理
    pub operation_timeout_secs: u64,
}

/// 同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 网络恢复后触发同步前的防抖时间（毫秒）
    pub reconnect_debounce_ms: u64,
    /// 是否按退避策略自动重试瞬时失败
    pub auto_retry: bool,
    /// 同一记录连续冲突的上限，超过后需要人工处理
    pub max_conflict_retries: u32,
}

/// 请求缓存层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 缓存分区名前缀
    pub cache_prefix: String,
    /// 缓存版本号，升级后旧版本分区在 activate 时被清理
    pub cache_version: String,
    /// 应用源地址，例如：https://app.example.com
    pub app_origin: String,
    /// 外壳资源（安装时预缓存）
    pub shell_assets: Vec<String>,
    /// 导航请求离线时回退的外壳入口
    pub shell_entry: String,
    /// 动态缓存最大条目数（LRU），None 表示不限制
    pub dynamic_max_entries: Option<usize>,
    /// 动态缓存条目最长保留时间（秒），None 表示不过期
    pub dynamic_max_age_secs: Option<u64>,
    /// 不经过缓存、直接走网络的 URL 规则（正则）
    pub bypass_patterns: Vec<String>,
}

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            api_key: None,
            access_token: None,
            operation_timeout_secs: 30,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect_debounce_ms: 1500,
            auto_retry: true,
            max_conflict_retries: 3,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "marketsync".to_string(),
            cache_version: "v1".to_string(),
            app_origin: "http://localhost:8080".to_string(),
            shell_assets: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/favicon.ico".to_string(),
            ],
            shell_entry: "/index.html".to_string(),
            dynamic_max_entries: Some(200),
            dynamic_max_age_secs: Some(7 * 24 * 3600),
            bypass_patterns: vec![r"/auth/v1/".to_string()],
        }
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            remote: RemoteConfig::default(),
            retry: RetryPolicy::default(),
            engine: EngineConfig::default(),
            cache: CacheConfig::default(),
            http_client: HttpClientConfig::default(),
            event_buffer_size: 1000,
            conflict_policies: HashMap::new(),
            debug_mode: false,
        }
    }
}

/// 获取默认数据目录 ~/.marketsync/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".marketsync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".marketsync")
    } else {
        PathBuf::from("./marketsync_data")
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// 校验配置，启动时调用一次
    pub fn validate(&self) -> Result<()> {
        if self.remote.base_url.trim().is_empty() {
            return Err(SyncError::Config("remote.base_url 不能为空".to_string()));
        }
        if self.remote.operation_timeout_secs == 0 {
            return Err(SyncError::Config("remote.operation_timeout_secs 必须大于 0".to_string()));
        }
        if self.cache.shell_assets.is_empty() {
            return Err(SyncError::Config("cache.shell_assets 不能为空".to_string()));
        }
        if !self.cache.shell_assets.iter().all(|p| p.starts_with('/')) {
            return Err(SyncError::Config("cache.shell_assets 必须是以 / 开头的路径".to_string()));
        }
        if self.cache.cache_prefix.is_empty() || self.cache.cache_version.is_empty() {
            return Err(SyncError::Config("缓存前缀与版本号不能为空".to_string()));
        }
        if self.cache.dynamic_max_entries == Some(0) {
            return Err(SyncError::Config("cache.dynamic_max_entries 不能为 0".to_string()));
        }
        RegexSet::new(&self.cache.bypass_patterns)
            .map_err(|e| SyncError::Config(format!("bypass_patterns 无效: {}", e)))?;
        if self.retry.backoff_factor < 1.0 {
            return Err(SyncError::Config("retry.backoff_factor 不能小于 1.0".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(SyncError::Config("event_buffer_size 必须大于 0".to_string()));
        }
        Ok(())
    }
}

/// SDK 配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn remote_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.remote.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn api_key<S: Into<String>>(mut self, key: S) -> Self {
        self.config.remote.api_key = Some(key.into());
        self
    }

    pub fn access_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.remote.access_token = Some(token.into());
        self
    }

    pub fn operation_timeout(mut self, secs: u64) -> Self {
        self.config.remote.operation_timeout_secs = secs;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn engine_config(mut self, config: EngineConfig) -> Self {
        self.config.engine = config;
        self
    }

    /// 设置网络恢复后的防抖时间（毫秒）
    pub fn reconnect_debounce_ms(mut self, ms: u64) -> Self {
        self.config.engine.reconnect_debounce_ms = ms;
        self
    }

    pub fn auto_retry(mut self, enabled: bool) -> Self {
        self.config.engine.auto_retry = enabled;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    pub fn app_origin<S: Into<String>>(mut self, origin: S) -> Self {
        self.config.cache.app_origin = origin.into().trim_end_matches('/').to_string();
        self
    }

    pub fn cache_version<S: Into<String>>(mut self, version: S) -> Self {
        self.config.cache.cache_version = version.into();
        self
    }

    /// 设置外壳资源列表
    pub fn shell_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.cache.shell_assets = assets.into_iter().map(Into::into).collect();
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client = config;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    /// 为指定集合声明冲突处理策略
    pub fn conflict_policy<S: Into<String>>(mut self, collection: S, policy: ConflictPolicy) -> Self {
        self.config.conflict_policies.insert(collection.into(), policy);
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
