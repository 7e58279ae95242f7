//! Streamable HTTP transport.
//!
//! Requests go out as HTTP POST; the server answers either with plain JSON or
//! with an SSE stream carrying the response. A 401 surfaces as
//! [`McpError::AuthRequired`], and when an authorization provider is attached
//! the interactive flow is kicked off before the error propagates.

use crate::error::{McpError, McpResult};
use crate::oauth::AuthorizationProvider;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const SESSION_HEADER: &str = "mcp-session-id";

/// Configuration shared by the streamable-HTTP and SSE transports.
/// Headers are expected to be fully resolved.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub server_name: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(server_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            url: url.into(),
            headers: HashMap::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Streamable HTTP transport.
pub struct HttpTransport {
    config: HttpTransportConfig,
    client: reqwest::Client,
    provider: Option<Arc<dyn AuthorizationProvider>>,
    bearer: RwLock<Option<String>>,
    session_id: RwLock<Option<String>>,
    connected: AtomicBool,
}

impl HttpTransport {
    pub fn new(
        config: HttpTransportConfig,
        provider: Option<Arc<dyn AuthorizationProvider>>,
    ) -> McpResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| McpError::connection_failed(format!("HTTP client: {e}")))?;
        Ok(Self {
            config,
            client,
            provider,
            bearer: RwLock::new(None),
            session_id: RwLock::new(None),
            connected: AtomicBool::new(false),
        })
    }

    async fn build_request(&self, body: String, accept: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("Accept", accept)
            .body(body);
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }
        let has_auth_header = self
            .config
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("authorization"));
        if !has_auth_header {
            if let Some(token) = self.bearer.read().await.clone() {
                request = request.header("Authorization", format!("Bearer {token}"));
            }
        }
        if let Some(session) = self.session_id.read().await.clone() {
            request = request.header(SESSION_HEADER, session);
        }
        request
    }

    async fn send(
        &self,
        body: String,
        accept: &str,
    ) -> McpResult<reqwest::Response> {
        let response = self
            .build_request(body, accept)
            .await
            .send()
            .await
            .map_err(|e| request_error(&self.config.server_name, self.config.timeout, e))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().await = Some(session.to_string());
        }

        if response.status() == StatusCode::UNAUTHORIZED {
            self.start_authorization_if_possible().await;
            return Err(McpError::AuthRequired);
        }
        Ok(response)
    }

    /// Kick off the interactive flow on a 401. Errors are swallowed here;
    /// the connect loop diagnoses a flow that never started.
    async fn start_authorization_if_possible(&self) {
        let Some(provider) = &self.provider else {
            return;
        };
        if let Err(e) = provider.ensure_authorization_started().await {
            warn!(
                server = %self.config.server_name,
                error = %e,
                "Could not start OAuth authorization"
            );
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let body = serde_json::to_string(&request)?;
        debug!(server = %self.config.server_name, id = request.id, method = %request.method, "HTTP request");
        let response = self
            .send(body, "application/json, text/event-stream")
            .await?;
        let result = read_rpc_response(response).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(result)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let body = serde_json::to_string(&notification)?;
        let response = self
            .send(body, "application/json, text/event-stream")
            .await?;
        if !response.status().is_success() {
            warn!(
                server = %self.config.server_name,
                status = %response.status(),
                "Notification returned non-success status"
            );
        }
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        debug!(server = %self.config.server_name, "Closed streamable HTTP transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn finish_auth(&self, code: &str) -> McpResult<()> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            McpError::AuthFailed("no authorization provider attached".to_string())
        })?;
        let token = provider.finish_authorization(code).await?;
        *self.bearer.write().await = Some(token);
        Ok(())
    }
}

/// Map a reqwest failure, flattening the source chain so the classifier
/// sees the underlying connect/DNS phrasing.
pub(crate) fn request_error(
    server_name: &str,
    timeout: std::time::Duration,
    e: reqwest::Error,
) -> McpError {
    if e.is_timeout() {
        return McpError::Timeout {
            operation: format!("talking to '{server_name}'"),
            after_ms: timeout.as_millis() as u64,
        };
    }
    let mut message = e.to_string();
    let mut source = std::error::Error::source(&e);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    if e.is_connect() {
        McpError::connection_failed(format!("Connection failed: {message}"))
    } else {
        McpError::protocol_error(format!("Request failed: {message}"))
    }
}

/// Read a JSON-RPC response from an HTTP response that may be plain JSON or
/// an SSE stream.
pub(crate) async fn read_rpc_response(response: reqwest::Response) -> McpResult<JsonRpcResponse> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(McpError::protocol_error(format!(
            "Server returned {status}: {text}"
        )));
    }

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.contains("text/event-stream") {
        read_sse_response(response).await
    } else {
        let text = response.text().await.map_err(|e| {
            McpError::protocol_error(format!("Failed to read response: {e}"))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| McpError::protocol_error(format!("Invalid JSON response: {e}")))
    }
}

/// Scan an SSE stream for the first data frame carrying a JSON-RPC response.
pub(crate) async fn read_sse_response(response: reqwest::Response) -> McpResult<JsonRpcResponse> {
    use futures::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| McpError::protocol_error(format!("Stream error: {e}")))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        for line in buffer.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                // Streams may interleave server notifications; only a frame
                // with an id and no method is the reply.
                let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                    continue;
                };
                if value.get("id").is_some() && value.get("method").is_none() {
                    if let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value) {
                        return Ok(response);
                    }
                }
            }
        }

        // Keep only the trailing incomplete line.
        if let Some(last_newline) = buffer.rfind('\n') {
            buffer = buffer[last_newline + 1..].to_string();
        }
    }

    Err(McpError::protocol_error("SSE stream ended without response"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(url: &str) -> HttpTransport {
        let mut config = HttpTransportConfig::new("test", url);
        config.timeout = Duration::from_secs(1);
        HttpTransport::new(config, None).unwrap()
    }

    #[tokio::test]
    async fn test_connection_refused_is_offline() {
        let t = transport("http://127.0.0.1:1/mcp");
        let err = t
            .request(JsonRpcRequest::new(1, "initialize", None))
            .await
            .unwrap_err();
        assert_eq!(crate::error::ErrorKind::of(&err), crate::error::ErrorKind::Offline);
    }

    #[tokio::test]
    async fn test_finish_auth_without_provider_fails() {
        let t = transport("http://127.0.0.1:1/mcp");
        assert!(t.finish_auth("code").await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let t = transport("http://127.0.0.1:1/mcp");
        t.close().await.unwrap();
        t.close().await.unwrap();
        assert!(!t.is_connected());
    }
}
