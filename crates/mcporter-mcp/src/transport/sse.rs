//! SSE transport: the legacy fallback when streamable HTTP is refused.
//!
//! Same POST envelope as the streamable transport, but the reply is always
//! expected on an event stream.

use crate::error::{McpError, McpResult};
use crate::oauth::AuthorizationProvider;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::http::{read_rpc_response, request_error, HttpTransportConfig};
use crate::transport::Transport;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// SSE fallback transport.
pub struct SseTransport {
    config: HttpTransportConfig,
    client: reqwest::Client,
    provider: Option<Arc<dyn AuthorizationProvider>>,
    bearer: RwLock<Option<String>>,
    connected: AtomicBool,
}

impl SseTransport {
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
            connected: AtomicBool::new(false),
        })
    }

    async fn send(&self, body: String) -> McpResult<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
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

        let response = request
            .send()
            .await
            .map_err(|e| request_error(&self.config.server_name, self.config.timeout, e))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(provider) = &self.provider {
                if let Err(e) = provider.ensure_authorization_started().await {
                    warn!(
                        server = %self.config.server_name,
                        error = %e,
                        "Could not start OAuth authorization"
                    );
                }
            }
            return Err(McpError::AuthRequired);
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let body = serde_json::to_string(&request)?;
        debug!(server = %self.config.server_name, id = request.id, method = %request.method, "SSE request");
        let response = self.send(body).await?;
        let result = read_rpc_response(response).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(result)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let body = serde_json::to_string(&notification)?;
        let response = self.send(body).await?;
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
        debug!(server = %self.config.server_name, "Closed SSE transport");
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connection_refused_is_offline() {
        let mut config = HttpTransportConfig::new("test", "http://127.0.0.1:1/mcp");
        config.timeout = Duration::from_secs(1);
        let t = SseTransport::new(config, None).unwrap();
        let err = t
            .request(JsonRpcRequest::new(1, "initialize", None))
            .await
            .unwrap_err();
        assert_eq!(
            crate::error::ErrorKind::of(&err),
            crate::error::ErrorKind::Offline
        );
    }
}
