//! HTTP transport for cloud APIs.

use async_trait::async_trait;
use reqwest::{Client, header};
use std::time::Duration;
use tracing::{debug, trace};

use super::transport::{ApiRequest, ApiResponse, Transport};
use crate::error::{ProviderError, ProviderResult, ReconcilerError, Result};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Header carrying the idempotency token.
const CLIENT_TOKEN_HEADER: &str = "x-client-request-token";

/// Transport sending JSON requests with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    token: String,
}

impl HttpTransport {
    /// Creates a transport for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: &str) -> Result<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a transport with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, token: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ReconcilerError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.endpoint)
        } else {
            format!("{}/{path}", self.endpoint)
        }
    }
}

/// Parses a `Retry-After` header given in seconds.
fn retry_after(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> ProviderResult<ApiResponse> {
        let url = self.url(&request.path);
        trace!("{} {url}", request.method);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::ACCEPT, "application/json");

        if let Some(token) = &request.client_token {
            builder = builder.header(CLIENT_TOKEN_HEADER, token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            // Connection failures and timeouts never reached a decision point.
            ProviderError::transient(format!("Request to {url} failed: {e}"))
        })?;

        let status = response.status().as_u16();
        let hint = retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::transient(format!("Failed to read response from {url}: {e}")))?;

        if !(200..300).contains(&status) {
            debug!("{} {url} returned {status}", request.method);
            let message = if status == 404 {
                request.resource.clone()
            } else if text.is_empty() {
                format!("{} {}", request.method, request.path)
            } else {
                text
            };
            return Err(ProviderError::from_status(status, message, hint));
        }

        let body = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                ProviderError::permanent(status, format!("Invalid JSON from {url}: {e}"))
            })?
        };

        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeId, ResourceKind};
    use crate::provider::transport::Operation;
    use reqwest::Method;
    use serde_json::json;
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(op: Operation, m: Method, p: &str) -> ApiRequest {
        ApiRequest {
            node: NodeId::new(ResourceKind::Cluster, "prod"),
            operation: op,
            method: m,
            path: p.to_string(),
            resource: p.to_string(),
            body: Some(json!({"name": "prod"})),
            client_token: Some(String::from("tok-1")),
            envelope: None,
            outputs: &[],
        }
    }

    #[tokio::test]
    async fn test_success_parses_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/clusters"))
            .and(header_eq("authorization", "Bearer secret"))
            .and(header_eq(CLIENT_TOKEN_HEADER, "tok-1"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"cluster": {"arn": "a"}})))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&server.uri(), "secret").unwrap();
        let response = transport
            .send(request(Operation::Create, Method::POST, "/clusters"))
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.body["cluster"]["arn"], json!("a"));
    }

    #[tokio::test]
    async fn test_throttling_is_transient_with_hint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clusters/prod"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&server.uri(), "secret").unwrap();
        let err = transport
            .send(request(Operation::Read, Method::GET, "/clusters/prod"))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(err.retry_after_secs(), Some(7));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/clusters/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/clusters"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad version"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/clusters/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&server.uri(), "secret").unwrap();

        let gone = transport
            .send(request(Operation::Delete, Method::DELETE, "/clusters/gone"))
            .await
            .unwrap_err();
        assert_eq!(gone, ProviderError::not_found("/clusters/gone"));

        let bad = transport
            .send(request(Operation::Create, Method::POST, "/clusters"))
            .await
            .unwrap_err();
        assert_eq!(bad, ProviderError::permanent(400, "bad version"));

        let flaky = transport
            .send(request(Operation::Read, Method::GET, "/clusters/flaky"))
            .await
            .unwrap_err();
        assert!(flaky.is_transient());
    }

    #[tokio::test]
    async fn test_connection_error_is_transient() {
        let transport = HttpTransport::with_timeout("http://127.0.0.1:1", "secret", 1).unwrap();
        let err = transport
            .send(request(Operation::Read, Method::GET, "/clusters/prod"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_empty_body_is_null() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/clusters/prod"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&server.uri(), "secret").unwrap();
        let response = transport
            .send(request(Operation::Delete, Method::DELETE, "/clusters/prod"))
            .await
            .unwrap();
        assert_eq!(response.body, serde_json::Value::Null);
    }
}
