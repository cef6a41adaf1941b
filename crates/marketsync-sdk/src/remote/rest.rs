//! PostgREST 风格的 HTTP 后端
//!
//! 托管后端以 `{base}/rest/v1/{table}` 暴露表，过滤条件写成 `column=eq.value`，
//! 错误体为 `{code, message, details, hint}`，其中 `code` 是 Postgres 错误码。

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{RemoteBackend, RemoteError, RemoteErrorCode};
use crate::config::{HttpClientConfig, RemoteConfig};
use crate::error::{Result, SyncError};

/// 远端返回的错误体
#[derive(Debug, Default, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// REST 后端
#[derive(Debug)]
pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    access_token: RwLock<Option<String>>,
}

impl RestBackend {
    /// 创建新的 REST 后端
    pub fn new(remote: &RemoteConfig, http: &HttpClientConfig) -> Result<Self> {
        let mut builder = Client::builder();

        if let Some(timeout) = http.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        if let Some(timeout) = http.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| SyncError::Http(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = remote.base_url.trim_end_matches('/').to_string();
        info!("✅ REST 后端已创建 (base_url: {})", base_url);

        Ok(Self {
            client,
            base_url,
            api_key: remote.api_key.clone(),
            access_token: RwLock::new(remote.access_token.clone()),
        })
    }

    /// 登录/登出后更新会话令牌
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }

    fn table_url(&self, collection: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection)
    }

    fn request(&self, method: Method, collection: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, self.table_url(collection))
            .header("Accept", "application/json")
            .header("Prefer", "return=representation");

        if let Some(key) = &self.api_key {
            builder = builder.header("apikey", key);
        }
        let bearer = self.access_token.read().clone().or_else(|| self.api_key.clone());
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> std::result::Result<Value, RemoteError> {
        let response = builder.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_transport_error)?;

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body).map_err(|e| {
                RemoteError::new(RemoteErrorCode::Server, format!("invalid response body: {}", e))
                    .with_status(status.as_u16())
            });
        }

        let parsed: PostgrestError = serde_json::from_str(&body).unwrap_or_default();
        let code = classify_status(status, parsed.code.as_deref());
        let message = parsed.message.unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), body));
        debug!("远端返回错误: {} {:?} {}", status, code, message);
        Err(RemoteError::new(code, message).with_status(status.as_u16()))
    }

    /// `return=representation` 返回数组，取第一行；空数组表示没有匹配行
    fn single_row(collection: &str, id: &str, value: Value) -> std::result::Result<Value, RemoteError> {
        match value {
            Value::Array(mut rows) => {
                if rows.is_empty() {
                    Err(RemoteError::new(
                        RemoteErrorCode::NotFound,
                        format!("{}/{} not found", collection, id),
                    ))
                } else {
                    Ok(rows.swap_remove(0))
                }
            }
            other => Ok(other),
        }
    }
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn insert(&self, collection: &str, record: &Value) -> std::result::Result<Value, RemoteError> {
        let value = self.send(self.request(Method::POST, collection).json(record)).await?;
        match value {
            Value::Array(mut rows) if !rows.is_empty() => Ok(rows.swap_remove(0)),
            Value::Array(_) | Value::Null => Ok(record.clone()),
            other => Ok(other),
        }
    }

    async fn update(&self, collection: &str, id: &str, patch: &Value) -> std::result::Result<Value, RemoteError> {
        let builder = self
            .request(Method::PATCH, collection)
            .query(&[("id", format!("eq.{}", id))])
            .json(patch);
        let value = self.send(builder).await?;
        Self::single_row(collection, id, value)
    }

    async fn delete(&self, collection: &str, id: &str) -> std::result::Result<Value, RemoteError> {
        let builder = self
            .request(Method::DELETE, collection)
            .query(&[("id", format!("eq.{}", id))]);
        let value = self.send(builder).await?;
        Self::single_row(collection, id, value)
    }

    async fn select(&self, collection: &str, filter: &[(&str, Value)]) -> std::result::Result<Value, RemoteError> {
        let query: Vec<(String, String)> = filter
            .iter()
            .map(|(column, value)| (column.to_string(), format!("eq.{}", filter_literal(value))))
            .collect();
        let builder = self
            .request(Method::GET, collection)
            .query(&[("select", "*")])
            .query(&query);
        self.send(builder).await
    }
}

fn filter_literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn classify_transport_error(error: reqwest::Error) -> RemoteError {
    RemoteError::new(RemoteErrorCode::Transient, error.to_string())
}

/// Postgres 错误码优先，其次按 HTTP 状态码
fn classify_status(status: StatusCode, pg_code: Option<&str>) -> RemoteErrorCode {
    match pg_code {
        Some("23505") => return RemoteErrorCode::UniqueViolation,
        Some("23503") => return RemoteErrorCode::ForeignKeyViolation,
        Some("PGRST116") => return RemoteErrorCode::NotFound,
        Some("42501") => return RemoteErrorCode::AuthFailure,
        _ => {}
    }

    match status.as_u16() {
        401 | 403 => RemoteErrorCode::AuthFailure,
        404 => RemoteErrorCode::NotFound,
        408 => RemoteErrorCode::Transient,
        409 => RemoteErrorCode::UniqueViolation,
        429 => RemoteErrorCode::RateLimited,
        500..=599 => RemoteErrorCode::Server,
        _ => RemoteErrorCode::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend_for(server: &MockServer) -> RestBackend {
        let remote = RemoteConfig {
            base_url: server.uri(),
            api_key: Some("anon-key".to_string()),
            ..RemoteConfig::default()
        };
        RestBackend::new(&remote, &HttpClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_insert_posts_record_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/opportunities"))
            .and(header("apikey", "anon-key"))
            .and(header("Prefer", "return=representation"))
            .and(body_json(json!({"title": "Fix fence", "budget": 50})))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!([{"id": "o1", "title": "Fix fence", "budget": 50}])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let row = backend
            .insert("opportunities", &json!({"title": "Fix fence", "budget": 50}))
            .await
            .unwrap();
        assert_eq!(row["id"], "o1");
    }

    #[tokio::test]
    async fn test_postgres_codes_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/profiles"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({"code": "23505", "message": "duplicate key"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/messages"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({"code": "23503", "message": "fk violation"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/tokens"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let unique = backend.insert("profiles", &json!({"id": "u1"})).await.unwrap_err();
        assert_eq!(unique.code, RemoteErrorCode::UniqueViolation);
        assert_eq!(unique.message, "duplicate key");

        let fk = backend.insert("messages", &json!({"body": "x"})).await.unwrap_err();
        assert_eq!(fk.code, RemoteErrorCode::ForeignKeyViolation);

        let server_error = backend.insert("tokens", &json!({"amount": 1})).await.unwrap_err();
        assert_eq!(server_error.code, RemoteErrorCode::Server);
        assert_eq!(server_error.status, Some(503));
    }

    #[tokio::test]
    async fn test_update_with_no_matching_row_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/profiles"))
            .and(query_param("id", "eq.u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let err = backend.update("profiles", "u1", &json!({"name": "Ama"})).await.unwrap_err();
        assert_eq!(err.code, RemoteErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_select_uses_eq_filters_and_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/providers"))
            .and(query_param("country", "eq.GH"))
            .and(header("Authorization", "Bearer user-jwt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "p1", "country": "GH"}])))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        backend.set_access_token(Some("user-jwt".to_string()));
        let rows = backend.select("providers", &[("country", json!("GH"))]).await.unwrap();
        assert_eq!(rows.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let remote = RemoteConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..RemoteConfig::default()
        };
        let backend = RestBackend::new(&remote, &HttpClientConfig::default()).unwrap();
        let err = backend.delete("chat", "m1").await.unwrap_err();
        assert_eq!(err.code, RemoteErrorCode::Transient);
    }

    #[test]
    fn test_status_fallbacks() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED, None), RemoteErrorCode::AuthFailure);
        assert_eq!(classify_status(StatusCode::FORBIDDEN, Some("42501")), RemoteErrorCode::AuthFailure);
        assert_eq!(classify_status(StatusCode::NOT_ACCEPTABLE, Some("PGRST116")), RemoteErrorCode::NotFound);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS, None), RemoteErrorCode::RateLimited);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT, None), RemoteErrorCode::Transient);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST, Some("22P02")), RemoteErrorCode::Malformed);
    }
}
