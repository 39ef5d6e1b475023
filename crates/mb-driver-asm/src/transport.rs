//! Request/response transport to the ASM REST API.
//!
//! [`AsmTransport`] is the seam used for mock injection: the real driver uses
//! [`HttpTransport`], tests and `--simulate` runs use
//! [`crate::simulator::SimulatedAsm`].

use crate::error::{AsmError, AsmResult};
use async_trait::async_trait;
use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::{header, Body, Client, Method, Request, StatusCode, Uri};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::timeout;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// HTTP methods used by the ASM API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
}

/// One call to the ASM. `path` is relative to the host URL and may carry a
/// query string.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Endpoint path relative to the host URL.
    pub path: String,
    /// JSON body, if any.
    pub body: Option<serde_json::Value>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl ApiRequest {
    /// GET request without a body.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            body: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// POST request without a body.
    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            ..Self::get(path)
        }
    }

    /// Attach a JSON body.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Override the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Raw answer from the ASM.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Raw body.
    pub body: Bytes,
}

impl ApiResponse {
    /// Build a response, deriving the reason phrase from the status code.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        let reason = StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("")
            .to_string();
        Self {
            status,
            reason,
            body: body.into(),
        }
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> AsmResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as text, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Trait for ASM transports (allows mock injection)
#[async_trait]
pub trait AsmTransport: Send + Sync {
    /// Base URL the request paths are relative to.
    fn base_url(&self) -> &str;

    /// Send one request and return whatever the ASM answered.
    async fn send(&self, request: ApiRequest) -> AsmResult<ApiResponse>;
}

// =============================================================================
// HttpTransport
// =============================================================================

/// HTTP/1.1 transport over a pooled keep-alive client.
///
/// Connections are reused across calls and re-established transparently
/// when the ASM closes them.
pub struct HttpTransport {
    client: Client<HttpConnector>,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for a host URL such as `http://localhost:8080/v2`.
    pub fn new(base_url: impl Into<String>) -> AsmResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        base_url.parse::<Uri>().map_err(|e| {
            AsmError::Configuration(format!("Invalid ASM host URL '{}': {}", base_url, e))
        })?;

        let mut connector = HttpConnector::new();
        // Disable Nagle's algorithm for low latency
        connector.set_nodelay(true);

        Ok(Self {
            client: Client::builder().build(connector),
            base_url,
        })
    }
}

#[async_trait]
impl AsmTransport for HttpTransport {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: ApiRequest) -> AsmResult<ApiResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let uri: Uri = url
            .parse()
            .map_err(|e| AsmError::Configuration(format!("Invalid request URL '{}': {}", url, e)))?;

        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };
        let builder = Request::builder().method(method).uri(uri);
        let http_request = match &request.body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(body)?)),
            None => builder.body(Body::empty()),
        }
        .map_err(|e| AsmError::Configuration(format!("Invalid request to '{}': {}", url, e)))?;

        let exchange = async {
            let response = self.client.request(http_request).await?;
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, hyper::Error>((status, body))
        };

        let (status, body) = timeout(request.timeout, exchange)
            .await
            .map_err(|_| {
                AsmError::Timeout(format!(
                    "No answer from {} within {:?}",
                    url, request.timeout
                ))
            })?
            .map_err(|e| AsmError::Connectivity(format!("Request to {} failed: {}", url, e)))?;

        tracing::debug!("ASM {} -> {}", url, status);

        Ok(ApiResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            body,
        })
    }
}
