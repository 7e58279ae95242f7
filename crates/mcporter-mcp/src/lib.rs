//! MCP client runtime for mcporter.
//!
//! Given a server definition, this crate yields a live authenticated RPC
//! client able to list and invoke tools, with transport selection, OAuth
//! bootstrap and refresh, cancellation, and resource teardown.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐     ┌──────────────────┐     ┌─────────────┐
//! │  caller   │────▶│    McpRuntime    │────▶│ MCP servers │
//! │  (CLI)    │◀────│ contexts + vault │◀────│   (tools)   │
//! └───────────┘     └──────────────────┘     └─────────────┘
//! ```
//!
//! The runtime caches one [`context::ClientContext`] per server name. A
//! context is produced by the builder: stdio definitions spawn a subprocess;
//! HTTP definitions try streamable HTTP, fall back to SSE, and negotiate
//! OAuth (discovery, dynamic registration, PKCE, loopback callback) when the
//! server demands it.
//!
//! # Example
//!
//! ```no_run
//! use mcporter_mcp::definition::ServerDefinition;
//! use mcporter_mcp::runtime::{ListToolsOptions, McpRuntime};
//!
//! # async fn example() -> mcporter_mcp::error::McpResult<()> {
//! let runtime = McpRuntime::with_defaults();
//! runtime
//!     .register_definition(
//!         ServerDefinition::http("linear", "https://mcp.linear.app/mcp"),
//!         false,
//!     )
//!     .await?;
//!
//! let tools = runtime.list_tools("linear", ListToolsOptions::default()).await?;
//! let result = runtime
//!     .call_tool("linear", "search_issues", Some(serde_json::json!({"query": "bug"})))
//!     .await?;
//! # let _ = (tools, result);
//! runtime.close(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod connect;
pub mod context;
pub mod definition;
pub mod discovery;
pub mod error;
pub mod oauth;
pub mod placeholder;
pub mod projection;
pub mod protocol;
pub mod refresh;
pub mod runtime;
pub mod session;
pub mod transport;
pub mod vault;

pub use connect::{connect_with_auth, ConnectOptions};
pub use context::{build_client_context, BuildOptions, ClientContext};
pub use definition::{
    parse_definitions, AuthScheme, CommandSpec, Lifecycle, ServerDefinition, Source,
};
pub use error::{ErrorKind, McpError, McpResult};
pub use oauth::AuthorizationProvider;
pub use protocol::{McpTool, ToolCallResult, ToolContent};
pub use runtime::{ListToolsOptions, McpRuntime, RuntimeOptions};
pub use session::OAuthSession;
pub use transport::Transport;
pub use vault::{TokenSet, TokenVault, VaultScope};
