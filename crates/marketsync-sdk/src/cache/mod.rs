//! 请求缓存层
//!
//! 拦截页面级 HTTP 请求，按请求形态选择策略：
//! - 导航请求：缓存优先，后台重新验证（stale-while-revalidate）
//! - 外壳资源：缓存优先
//! - 其他 GET：网络优先，失败回退缓存，再失败合成离线响应
//! - 非 GET：仅走网络，失败合成离线响应
//!
//! 与同步队列相互独立：失败的写请求不会进入同步队列。

pub mod fetcher;
pub mod request;
pub mod store;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use regex::RegexSet;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

pub use fetcher::{Fetcher, HttpFetcher, StaticFetcher};
pub use request::{CacheRequest, CacheResponse, RequestMode, ResponseSource};
pub use store::{CacheStorage, StoredResponse};

use crate::config::CacheConfig;
use crate::error::{ErrorCategory, ErrorSeverity, Result, SyncError};
use crate::events::{EventManager, SyncEvent};
use crate::storage::{ErrorReport, ErrorReporter};
use crate::utils::TimeFormatter;

const OFFLINE_MESSAGE: &str = "You are offline and this content is not available in the cache.";
const OFFLINE_ACTION_MESSAGE: &str = "This action requires an internet connection. Please try again when you are back online.";

/// 缓存层生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    Parsed,
    Installing,
    /// 安装完成，等待激活
    Installed,
    Activating,
    Activated,
    /// 安装失败，不再使用
    Redundant,
}

/// 宿主发来的控制消息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// 立即应用等待中的新版本
    SkipWaiting,
}

/// 请求缓存层
pub struct RequestCacheLayer {
    config: CacheConfig,
    origin: Url,
    static_name: String,
    dynamic_name: String,
    shell_urls: HashSet<String>,
    bypass: RegexSet,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    reporter: Arc<dyn ErrorReporter>,
    events: Arc<EventManager>,
    state: RwLock<WorkerState>,
    skip_waiting: AtomicBool,
    background: TaskTracker,
}

impl std::fmt::Debug for RequestCacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCacheLayer")
            .field("static", &self.static_name)
            .field("dynamic", &self.dynamic_name)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl RequestCacheLayer {
    pub fn new(
        config: CacheConfig,
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
        reporter: Arc<dyn ErrorReporter>,
        events: Arc<EventManager>,
    ) -> Result<Self> {
        let origin = Url::parse(&config.app_origin)
            .map_err(|e| SyncError::Config(format!("app_origin 无效 ({}): {}", config.app_origin, e)))?;
        let bypass = RegexSet::new(&config.bypass_patterns)
            .map_err(|e| SyncError::Config(format!("bypass_patterns 无效: {}", e)))?;

        let mut shell_urls = HashSet::new();
        for asset in &config.shell_assets {
            let url = origin
                .join(asset)
                .map_err(|e| SyncError::Config(format!("外壳资源路径无效 ({}): {}", asset, e)))?;
            shell_urls.insert(url.to_string());
        }

        Ok(Self {
            static_name: format!("{}-static-{}", config.cache_prefix, config.cache_version),
            dynamic_name: format!("{}-dynamic-{}", config.cache_prefix, config.cache_version),
            config,
            origin,
            shell_urls,
            bypass,
            storage,
            fetcher,
            reporter,
            events,
            state: RwLock::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            background: TaskTracker::new(),
        })
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    pub fn static_cache_name(&self) -> &str {
        &self.static_name
    }

    pub fn dynamic_cache_name(&self) -> &str {
        &self.dynamic_name
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
        debug!("缓存层状态 -> {:?}", state);
    }

    /// 安装：预缓存全部外壳资源，任一失败则整体失败
    #[instrument(skip(self))]
    pub async fn install(&self) -> Result<usize> {
        self.set_state(WorkerState::Installing);

        let mut entries = Vec::with_capacity(self.config.shell_assets.len());
        for asset in &self.config.shell_assets {
            let url = match self.origin.join(asset) {
                Ok(url) => url.to_string(),
                Err(e) => return self.fail_install(asset, e.to_string()).await,
            };
            let request = CacheRequest::get(url.clone());
            match self.fetcher.fetch(&request).await {
                Ok(response) if response.is_success() => {
                    entries.push((request.cache_key(), StoredResponse::from_response(&url, &response)));
                }
                Ok(response) => {
                    return self.fail_install(asset, format!("HTTP {}", response.status)).await;
                }
                Err(e) => return self.fail_install(asset, e.to_string()).await,
            }
        }

        if let Err(e) = self.storage.put_batch(&self.static_name, &entries).await {
            return self.fail_install(&self.static_name, e.to_string()).await;
        }

        self.set_state(WorkerState::Installed);
        info!("✅ 外壳资源已缓存: {} ({} 项)", self.static_name, entries.len());
        self.events
            .emit(SyncEvent::CacheInstalled {
                cache_name: self.static_name.clone(),
                assets: entries.len(),
                timestamp: TimeFormatter::now_utc_millis(),
            })
            .await;

        if self.skip_waiting.load(Ordering::Acquire) {
            self.activate().await?;
        }
        Ok(entries.len())
    }

    async fn fail_install(&self, asset: &str, reason: String) -> Result<usize> {
        self.set_state(WorkerState::Redundant);
        error!("外壳资源缓存失败 {}: {}", asset, reason);
        self.reporter
            .report(
                ErrorReport::new(
                    ErrorCategory::System,
                    ErrorSeverity::High,
                    format!("缓存安装失败: {}", reason),
                )
                .with_context(json!({ "asset": asset, "cache": self.static_name })),
            )
            .await;
        Err(SyncError::InstallFailed {
            asset: asset.to_string(),
            reason,
        })
    }

    /// 激活：删除所有非当前版本的缓存分区，返回被删除的分区名
    #[instrument(skip(self))]
    pub async fn activate(&self) -> Result<Vec<String>> {
        match self.state() {
            WorkerState::Installed | WorkerState::Activated => {}
            other => {
                return Err(SyncError::InvalidInput(format!("缓存层处于 {:?}，无法激活", other)));
            }
        }
        self.set_state(WorkerState::Activating);

        let mut removed = Vec::new();
        for name in self.storage.list_partitions() {
            if name == self.static_name || name == self.dynamic_name {
                continue;
            }
            match self.storage.delete_partition(&name).await {
                Ok(_) => removed.push(name),
                Err(e) => {
                    self.set_state(WorkerState::Installed);
                    return Err(e);
                }
            }
        }

        self.set_state(WorkerState::Activated);
        info!("✅ 缓存层已激活，清理旧分区 {} 个", removed.len());
        self.events
            .emit(SyncEvent::CacheActivated {
                removed: removed.clone(),
                timestamp: TimeFormatter::now_utc_millis(),
            })
            .await;
        Ok(removed)
    }

    /// 处理宿主控制消息
    pub async fn post_message(&self, message: ControlMessage) -> Result<WorkerState> {
        match message {
            ControlMessage::SkipWaiting => {
                self.skip_waiting.store(true, Ordering::Release);
                if self.state() == WorkerState::Installed {
                    self.activate().await?;
                }
            }
        }
        Ok(self.state())
    }

    /// 处理一个被拦截的请求
    ///
    /// 总是返回响应：内部存储错误按缓存未命中处理。
    pub async fn handle(&self, request: CacheRequest) -> CacheResponse {
        let url = match self.resolve(&request.url) {
            Some(url) => url,
            None => {
                warn!("无法解析请求 URL: {}", request.url);
                return self.network_only(&request, OFFLINE_MESSAGE).await;
            }
        };
        let request = CacheRequest {
            url: url.to_string(),
            ..request
        };

        let cacheable_scheme = matches!(url.scheme(), "http" | "https");
        if !cacheable_scheme || self.bypass.is_match(url.as_str()) {
            debug!("旁路请求: {} {}", request.method, request.url);
            return self.network_only(&request, OFFLINE_MESSAGE).await;
        }

        if !request.is_get() {
            return self.network_only(&request, OFFLINE_ACTION_MESSAGE).await;
        }

        if self.state() != WorkerState::Activated {
            return self.network_only(&request, OFFLINE_MESSAGE).await;
        }

        if request.is_navigation() {
            self.navigation(request).await
        } else if self.shell_urls.contains(&request.url) {
            self.cache_first(request).await
        } else {
            self.network_first(request).await
        }
    }

    /// 等待后台重新验证任务全部结束
    pub async fn flush_background(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    fn resolve(&self, raw: &str) -> Option<Url> {
        Url::parse(raw).or_else(|_| self.origin.join(raw)).ok()
    }

    async fn lookup(&self, partition: &str, url: &str) -> Option<CacheResponse> {
        let key = request::cache_key("GET", url);
        match self.storage.lookup(partition, &key).await {
            Ok(entry) => entry.map(|e| e.to_response()),
            Err(e) => {
                warn!("读取缓存 {} 失败: {}", partition, e);
                None
            }
        }
    }

    async fn lookup_any(&self, url: &str) -> Option<CacheResponse> {
        match self.lookup(&self.static_name, url).await {
            Some(hit) => Some(hit),
            None => self.lookup(&self.dynamic_name, url).await,
        }
    }

    async fn navigation(&self, request: CacheRequest) -> CacheResponse {
        let mut candidates = vec![request.url.clone()];
        for fallback in [self.config.shell_entry.as_str(), "/"] {
            if let Ok(url) = self.origin.join(fallback) {
                candidates.push(url.to_string());
            }
        }

        for candidate in &candidates {
            if let Some(hit) = self.lookup_any(candidate).await {
                debug!("导航命中缓存: {} (via {})", request.url, candidate);
                self.spawn_revalidate(request);
                return hit;
            }
        }

        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                if response.is_success() {
                    store_dynamic(&self.storage, &self.dynamic_name, &self.config, &request.url, &response).await;
                }
                response
            }
            Err(e) => {
                debug!("导航请求离线且无缓存外壳: {}", e);
                CacheResponse::offline(OFFLINE_MESSAGE)
            }
        }
    }

    fn spawn_revalidate(&self, request: CacheRequest) {
        let fetcher = self.fetcher.clone();
        let storage = self.storage.clone();
        let dynamic = self.dynamic_name.clone();
        let config = self.config.clone();

        self.background.spawn(async move {
            match fetcher.fetch(&request).await {
                Ok(response) if response.is_success() => {
                    store_dynamic(&storage, &dynamic, &config, &request.url, &response).await;
                    debug!("后台刷新完成: {}", request.url);
                }
                Ok(response) => debug!("后台刷新返回 {}: {}", response.status, request.url),
                Err(e) => debug!("后台刷新失败: {}", e),
            }
        });
    }

    async fn cache_first(&self, request: CacheRequest) -> CacheResponse {
        if let Some(hit) = self.lookup(&self.static_name, &request.url).await {
            return hit;
        }

        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                if response.is_success() {
                    let entry = StoredResponse::from_response(&request.url, &response);
                    if let Err(e) = self.storage.put(&self.static_name, &request.cache_key(), &entry).await {
                        warn!("写入外壳缓存失败: {}", e);
                    }
                }
                response
            }
            Err(_) => CacheResponse::offline(OFFLINE_MESSAGE),
        }
    }

    async fn network_first(&self, request: CacheRequest) -> CacheResponse {
        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                if response.is_success() {
                    store_dynamic(&self.storage, &self.dynamic_name, &self.config, &request.url, &response).await;
                }
                response
            }
            Err(e) => {
                debug!("网络失败，回退缓存: {}", e);
                match self.lookup_any(&request.url).await {
                    Some(hit) => hit,
                    None => CacheResponse::offline(OFFLINE_MESSAGE),
                }
            }
        }
    }

    async fn network_only(&self, request: &CacheRequest, offline_message: &str) -> CacheResponse {
        match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("网络请求失败 {} {}: {}", request.method, request.url, e);
                CacheResponse::offline(offline_message)
            }
        }
    }
}

/// 写入动态缓存并按配置淘汰
async fn store_dynamic(storage: &CacheStorage, partition: &str, config: &CacheConfig, url: &str, response: &CacheResponse) {
    let entry = StoredResponse::from_response(url, response);
    if let Err(e) = storage.put(partition, &request::cache_key("GET", url), &entry).await {
        warn!("写入动态缓存失败: {}", e);
        return;
    }
    let max_age = config.dynamic_max_age_secs.map(Duration::from_secs);
    if let Err(e) = storage.evict(partition, config.dynamic_max_entries, max_age).await {
        warn!("动态缓存淘汰失败: {}", e);
    }
}
