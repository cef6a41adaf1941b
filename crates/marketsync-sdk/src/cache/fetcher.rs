//! 网络取数接口

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Method};
use tracing::debug;

use super::request::{CacheRequest, CacheResponse, ResponseSource};
use crate::config::HttpClientConfig;
use crate::error::{Result, SyncError};

/// 页面资源取数
///
/// 只有传输层失败才返回错误；非 2xx 响应照常返回，由缓存层决定是否缓存。
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &CacheRequest) -> Result<CacheResponse>;
}

/// 基于 reqwest 的取数实现
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| SyncError::Http(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &CacheRequest) -> Result<CacheResponse> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| SyncError::InvalidInput(format!("无效的 HTTP 方法: {}", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SyncError::TransientNetwork(format!("{} {}: {}", request.method, request.url, e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| SyncError::TransientNetwork(format!("读取响应体失败: {}", e)))?;

        debug!("{} {} -> {}", request.method, request.url, status);
        Ok(CacheResponse {
            status,
            headers,
            body,
            source: ResponseSource::Network,
        })
    }
}

/// 进程内资源表，用于离线演示与测试
#[derive(Debug, Default)]
pub struct StaticFetcher {
    state: Mutex<StaticState>,
}

#[derive(Debug, Default)]
struct StaticState {
    routes: HashMap<String, CacheResponse>,
    unreachable: bool,
    requests: Vec<String>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记 URL 对应的响应
    pub fn route(&self, url: impl Into<String>, response: CacheResponse) {
        self.state.lock().routes.insert(url.into(), response);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// 收到过的请求（`METHOD url`）
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().requests.clone()
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: &CacheRequest) -> Result<CacheResponse> {
        let mut state = self.state.lock();
        state.requests.push(format!("{} {}", request.method, request.url));
        if state.unreachable {
            return Err(SyncError::TransientNetwork(format!("{} unreachable", request.url)));
        }
        Ok(state
            .routes
            .get(&request.url)
            .cloned()
            .unwrap_or_else(|| CacheResponse::new(404, "not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_fetcher_returns_status_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.html"))
            .and(header("Accept", "text/html"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html>shell</html>", "text/html"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&HttpClientConfig::default()).unwrap();
        let request = CacheRequest::get(format!("{}/index.html", server.uri())).with_header("Accept", "text/html");
        let response = fetcher.fetch(&request).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("text/html"));
        assert_eq!(&response.body[..], b"<html>shell</html>");
        assert_eq!(response.source, ResponseSource::Network);
    }

    #[tokio::test]
    async fn test_http_fetcher_passes_non_success_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&HttpClientConfig::default()).unwrap();
        let response = fetcher
            .fetch(&CacheRequest::get(format!("{}/api/missing", server.uri())))
            .await
            .unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_connection_failure_is_transient() {
        let fetcher = HttpFetcher::new(&HttpClientConfig::default()).unwrap();
        let err = fetcher
            .fetch(&CacheRequest::get("http://127.0.0.1:9/index.html"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TransientNetwork(_)));
    }
}
