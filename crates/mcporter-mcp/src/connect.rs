//! Connect loop: drives the initialize handshake, converting bounded runs of
//! unauthorized failures into one interactive OAuth round-trip each.

use crate::error::{ErrorKind, McpError, McpResult};
use crate::oauth::AuthorizationProvider;
use crate::protocol::{
    InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
};
use crate::transport::Transport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Unauthorized-triggered reconnects allowed per connect.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Interactive authorization wait budget.
pub const DEFAULT_OAUTH_TIMEOUT: Duration = Duration::from_secs(60);

/// Env vars overriding the authorization wait budget, in milliseconds.
pub const OAUTH_TIMEOUT_MS_ENV: &str = "MCPORTER_OAUTH_TIMEOUT_MS";
pub const OAUTH_TIMEOUT_ALIAS_ENV: &str = "MCPORTER_OAUTH_TIMEOUT";

/// The authorization wait budget, honoring the env overrides.
pub fn oauth_timeout_from_env() -> Duration {
    [OAUTH_TIMEOUT_MS_ENV, OAUTH_TIMEOUT_ALIAS_ENV]
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_OAUTH_TIMEOUT)
}

/// Options for one connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub server_name: String,
    pub max_attempts: u32,
    pub oauth_timeout: Duration,
}

impl ConnectOptions {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            oauth_timeout: oauth_timeout_from_env(),
        }
    }
}

/// Run the MCP initialize handshake over a transport.
pub async fn initialize(
    transport: &dyn Transport,
    next_id: &AtomicU64,
) -> McpResult<InitializeResult> {
    let id = next_id.fetch_add(1, Ordering::SeqCst);
    let request = JsonRpcRequest::new(
        id,
        "initialize",
        Some(serde_json::to_value(InitializeParams::default())?),
    );
    let response = transport.request(request).await?;
    if let Some(error) = response.error {
        return Err(McpError::connection_failed(error.message));
    }
    let init: InitializeResult = serde_json::from_value(
        response
            .result
            .ok_or_else(|| McpError::protocol_error("Missing initialize result"))?,
    )
    .map_err(|e| McpError::protocol_error(e.to_string()))?;
    transport
        .notify(JsonRpcNotification::new("notifications/initialized", None))
        .await?;
    Ok(init)
}

/// Connect, retrying on unauthorized through the authorization provider.
///
/// At most `max_attempts` unauthorized failures are converted into
/// interactive rounds; every other failure short-circuits.
pub async fn connect_with_auth(
    transport: &Arc<dyn Transport>,
    provider: Option<&Arc<dyn AuthorizationProvider>>,
    next_id: &AtomicU64,
    options: &ConnectOptions,
) -> McpResult<InitializeResult> {
    let mut attempt: u32 = 0;
    loop {
        let err = match initialize(transport.as_ref(), next_id).await {
            Ok(init) => return Ok(init),
            Err(err) => err,
        };

        let Some(provider) = provider else {
            return Err(err);
        };
        if !ErrorKind::of(&err).is_auth() {
            return Err(err);
        }

        attempt += 1;
        if attempt > options.max_attempts {
            return Err(err);
        }

        if !provider.did_start_authorization() {
            // The transport should have kicked off the flow on 401; reaching
            // here usually means dynamic registration failed.
            return Err(McpError::AuthFailed(format!(
                "OAuth flow failed before a browser authorization could begin: {err}"
            )));
        }

        debug!(
            server = %options.server_name,
            attempt,
            "Waiting for browser authorization"
        );
        let code = match tokio::time::timeout(
            options.oauth_timeout,
            provider.wait_for_authorization_code(),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(McpError::OAuthTimeout {
                    server_name: options.server_name.clone(),
                    timeout_ms: options.oauth_timeout.as_millis() as u64,
                })
            }
        };
        transport.finish_auth(&code).await?;
    }
}
