//! MCP transports.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;

pub mod http;
pub mod sse;
pub mod stdio;

pub use http::{HttpTransport, HttpTransportConfig};
pub use sse::SseTransport;
pub use stdio::{StdioTransport, StdioTransportConfig};

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its response.
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse>;

    /// Send a notification (no response expected).
    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()>;

    /// Close the transport. Idempotent.
    async fn close(&self) -> McpResult<()>;

    /// Whether the transport has successfully carried traffic.
    fn is_connected(&self) -> bool;

    /// Complete an interactive authorization with the received code.
    /// Transports without that capability refuse.
    async fn finish_auth(&self, _code: &str) -> McpResult<()> {
        Err(McpError::protocol_error(
            "transport cannot complete authorization",
        ))
    }
}
