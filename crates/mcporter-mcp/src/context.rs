//! Client context: a live, authenticated connection to one server, and the
//! builder that produces it with transport selection, OAuth promotion, and
//! cached-token fast paths.

use crate::connect::{self, ConnectOptions};
use crate::definition::{CommandSpec, ServerDefinition};
use crate::discovery;
use crate::error::{ErrorKind, McpError, McpResult};
use crate::oauth::AuthorizationProvider;
use crate::placeholder::{self, ProcessEnv};
use crate::protocol::{
    CallToolParams, InitializeResult, JsonRpcRequest, ListToolsResult, McpTool, ToolCallResult,
};
use crate::refresh;
use crate::session::{BrowserOpener, OAuthSession};
use crate::transport::{
    HttpTransport, HttpTransportConfig, SseTransport, StdioTransport, StdioTransportConfig,
    Transport,
};
use crate::vault::TokenVault;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Callback invoked when a definition is promoted to OAuth.
pub type PromotionHook = Arc<dyn Fn(&ServerDefinition) + Send + Sync>;

/// Options controlling a context build.
#[derive(Clone)]
pub struct BuildOptions {
    /// Try refresh / cached tokens before any interactive flow.
    pub allow_cached_auth: bool,
    /// Unauthorized-triggered reconnects allowed; zero disables OAuth
    /// sessions entirely.
    pub max_oauth_attempts: u32,
    /// Interactive authorization wait budget.
    pub oauth_timeout: Duration,
    /// Per-request transport deadline.
    pub request_timeout: Duration,
    /// Notified when a 401 probe promotes the definition.
    pub on_definition_promoted: Option<PromotionHook>,
    /// Browser launcher handed to OAuth sessions.
    pub browser: Option<BrowserOpener>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            allow_cached_auth: true,
            max_oauth_attempts: connect::DEFAULT_MAX_ATTEMPTS,
            oauth_timeout: connect::oauth_timeout_from_env(),
            request_timeout: Duration::from_secs(60),
            on_definition_promoted: None,
            browser: None,
        }
    }
}

impl std::fmt::Debug for BuildOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOptions")
            .field("allow_cached_auth", &self.allow_cached_auth)
            .field("max_oauth_attempts", &self.max_oauth_attempts)
            .field("oauth_timeout", &self.oauth_timeout)
            .finish()
    }
}

/// A live connection to one server.
pub struct ClientContext {
    pub definition: ServerDefinition,
    pub transport: Arc<dyn Transport>,
    /// Kept alive for the lifetime of the context; closed with it.
    pub session: Option<Arc<OAuthSession>>,
    pub init: InitializeResult,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("definition", &self.definition)
            .field("init", &self.init)
            .finish()
    }
}

impl ClientContext {
    fn new(
        definition: ServerDefinition,
        transport: Arc<dyn Transport>,
        session: Option<Arc<OAuthSession>>,
        init: InitializeResult,
        next_id: AtomicU64,
    ) -> Self {
        Self {
            definition,
            transport,
            session,
            init,
            next_id,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Enumerate the server's tools.
    pub async fn list_tools(&self) -> McpResult<Vec<McpTool>> {
        let request = JsonRpcRequest::new(self.next_id(), "tools/list", None);
        let response = self.transport.request(request).await?;
        if let Some(error) = response.error {
            return Err(McpError::protocol_error(error.message));
        }
        let result: ListToolsResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| McpError::protocol_error("Missing tools/list result"))?,
        )
        .map_err(|e| McpError::protocol_error(e.to_string()))?;
        Ok(result.tools)
    }

    /// Invoke one tool.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<serde_json::Value>,
    ) -> McpResult<ToolCallResult> {
        let params = CallToolParams {
            name: tool.to_string(),
            arguments,
        };
        let request = JsonRpcRequest::new(
            self.next_id(),
            "tools/call",
            Some(serde_json::to_value(&params)?),
        );
        let response = self.transport.request(request).await?;
        if let Some(error) = response.error {
            // Tool-level failures (including unknown tools) pass through.
            return Err(McpError::tool_error(error.message));
        }
        let result: ToolCallResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| McpError::protocol_error("Missing tools/call result"))?,
        )
        .map_err(|e| McpError::protocol_error(e.to_string()))?;
        Ok(result)
    }

    /// Close transport and session. Close errors are suppressed.
    pub async fn close(&self) {
        if let Err(e) = self.transport.close().await {
            debug!(server = %self.definition.name, error = %e, "Transport close error suppressed");
        }
        if let Some(session) = &self.session {
            session.close().await;
        }
    }
}

/// Scoped env override: applies a definition's env to the process, restores
/// the previous values on drop regardless of outcome.
struct EnvGuard {
    saved: Vec<(String, Option<String>)>,
}

impl EnvGuard {
    fn apply(env: &HashMap<String, String>) -> Self {
        let mut saved = Vec::with_capacity(env.len());
        for (key, value) in env {
            saved.push((key.clone(), std::env::var(key).ok()));
            std::env::set_var(key, value);
        }
        Self { saved }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, previous) in self.saved.drain(..) {
            match previous {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Promote a definition to OAuth when the server can actually authorize:
/// ad-hoc definitions promote directly, configured ones only after the
/// protected-resource probe advertises an authorization server.
pub async fn maybe_enable_oauth(definition: &ServerDefinition) -> Option<ServerDefinition> {
    if definition.wants_oauth() {
        return None;
    }
    let url = definition.url()?;
    if definition.source.is_adhoc() {
        info!(server = %definition.name, "Promoting ad-hoc definition to OAuth");
        return Some(definition.promoted());
    }
    let client = reqwest::Client::new();
    if discovery::advertises_authorization(&client, url).await {
        info!(server = %definition.name, "Server advertises OAuth; promoting definition");
        Some(definition.promoted())
    } else {
        None
    }
}

/// Build a live context for a definition.
pub async fn build_client_context(
    definition: &ServerDefinition,
    options: &BuildOptions,
) -> McpResult<ClientContext> {
    let mut definition = definition.clone();
    let mut cached_bearer = false;

    // Non-interactive happy path: silently upgrade a stale token or reuse a
    // fresh one before any browser gets involved.
    if options.allow_cached_auth && definition.wants_oauth() && definition.is_http() {
        let vault = TokenVault::for_definition(&definition);
        let token = match refresh::refresh_access_token(&definition, &vault).await {
            Some(token) => Some(token),
            None => vault.read_cached_access_token().await,
        };
        if let Some(token) = token {
            if let CommandSpec::Http { headers, .. } = &mut definition.command {
                if !headers.keys().any(|k| k.eq_ignore_ascii_case("authorization")) {
                    headers.insert("Authorization".to_string(), format!("Bearer {token}"));
                    cached_bearer = true;
                    debug!(server = %definition.name, "Using cached access token");
                }
            }
        }
    }

    match definition.command.clone() {
        CommandSpec::Stdio { env, .. } => {
            let _guard = EnvGuard::apply(&env);
            build_stdio_context(definition).await
        }
        CommandSpec::Http { .. } => build_http_context(definition, options, cached_bearer).await,
    }
}

async fn build_stdio_context(definition: ServerDefinition) -> McpResult<ClientContext> {
    let CommandSpec::Stdio {
        exe,
        args,
        cwd,
        env,
    } = definition.command.clone()
    else {
        unreachable!("stdio build invoked for HTTP definition");
    };
    let resolved_env = placeholder::resolve_map(&env, &ProcessEnv)?;
    let transport: Arc<dyn Transport> = Arc::new(StdioTransport::spawn(StdioTransportConfig {
        server_name: definition.name.clone(),
        exe,
        args,
        cwd,
        env: resolved_env,
    })?);

    let next_id = AtomicU64::new(1);
    match connect::initialize(transport.as_ref(), &next_id).await {
        Ok(init) => Ok(ClientContext::new(definition, transport, None, init, next_id)),
        Err(e) => {
            let _ = transport.close().await;
            Err(e)
        }
    }
}

async fn build_http_context(
    mut definition: ServerDefinition,
    options: &BuildOptions,
    mut cached_bearer: bool,
) -> McpResult<ClientContext> {
    loop {
        let CommandSpec::Http { url, headers } = definition.command.clone() else {
            unreachable!("HTTP build invoked for stdio definition");
        };
        let resolved_headers = placeholder::resolve_map(&headers, &ProcessEnv)?;

        // A cached bearer rides without a session; one is only opened when
        // interactive authorization can actually be needed.
        let session = if definition.wants_oauth() && options.max_oauth_attempts != 0 && !cached_bearer
        {
            Some(match &options.browser {
                Some(browser) => {
                    OAuthSession::create_with_browser(&definition, Arc::clone(browser)).await?
                }
                None => OAuthSession::create(&definition).await?,
            })
        } else {
            None
        };
        let provider: Option<Arc<dyn AuthorizationProvider>> = session
            .clone()
            .map(|s| s as Arc<dyn AuthorizationProvider>);

        let connect_options = ConnectOptions {
            server_name: definition.name.clone(),
            max_attempts: options.max_oauth_attempts,
            oauth_timeout: options.oauth_timeout,
        };
        let config = HttpTransportConfig {
            server_name: definition.name.clone(),
            url: url.clone(),
            headers: resolved_headers.clone(),
            timeout: options.request_timeout,
        };

        // Streamable HTTP first.
        let transport: Arc<dyn Transport> =
            Arc::new(HttpTransport::new(config.clone(), provider.clone())?);
        let next_id = AtomicU64::new(1);
        match connect::connect_with_auth(&transport, provider.as_ref(), &next_id, &connect_options)
            .await
        {
            Ok(init) => {
                return Ok(ClientContext::new(
                    definition, transport, session, init, next_id,
                ))
            }
            Err(err @ McpError::OAuthTimeout { .. }) => {
                let _ = transport.close().await;
                close_session(&session).await;
                return Err(err);
            }
            Err(err) if ErrorKind::of(&err).is_auth() => {
                let _ = transport.close().await;
                close_session(&session).await;
                if cached_bearer {
                    // The cached token is stale; drop it and go interactive.
                    if let CommandSpec::Http { headers, .. } = &mut definition.command {
                        headers.remove("Authorization");
                    }
                    cached_bearer = false;
                    debug!(server = %definition.name, "Cached token rejected, retrying interactively");
                    continue;
                }
                if let Some(promoted) = maybe_enable_oauth(&definition).await {
                    notify_promoted(options, &promoted);
                    definition = promoted;
                    continue;
                }
                return Err(err);
            }
            Err(err) => {
                let _ = transport.close().await;
                debug!(server = %definition.name, error = %err, "Streamable HTTP failed, trying SSE");
            }
        }

        // SSE fallback, reusing the session.
        let sse: Arc<dyn Transport> = Arc::new(SseTransport::new(config, provider.clone())?);
        let next_id = AtomicU64::new(1);
        match connect::connect_with_auth(&sse, provider.as_ref(), &next_id, &connect_options).await
        {
            Ok(init) => {
                return Ok(ClientContext::new(definition, sse, session, init, next_id))
            }
            Err(err)
                if ErrorKind::of(&err).is_auth() && options.max_oauth_attempts != 0 =>
            {
                let _ = sse.close().await;
                close_session(&session).await;
                if cached_bearer {
                    if let CommandSpec::Http { headers, .. } = &mut definition.command {
                        headers.remove("Authorization");
                    }
                    cached_bearer = false;
                    continue;
                }
                if let Some(promoted) = maybe_enable_oauth(&definition).await {
                    notify_promoted(options, &promoted);
                    definition = promoted;
                    continue;
                }
                return Err(err);
            }
            Err(err) => {
                let _ = sse.close().await;
                close_session(&session).await;
                return Err(err);
            }
        }
    }
}

async fn close_session(session: &Option<Arc<OAuthSession>>) {
    if let Some(session) = session {
        session.close().await;
    }
}

fn notify_promoted(options: &BuildOptions, definition: &ServerDefinition) {
    if let Some(hook) = &options.on_definition_promoted {
        hook(definition);
    } else {
        warn!(server = %definition.name, "Definition promoted to OAuth");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Source;

    #[tokio::test]
    async fn test_maybe_enable_oauth_noop_when_already_oauth() {
        let def = ServerDefinition::http("x", "http://127.0.0.1:1/mcp").with_oauth();
        assert!(maybe_enable_oauth(&def).await.is_none());
    }

    #[tokio::test]
    async fn test_maybe_enable_oauth_noop_for_stdio() {
        let def = ServerDefinition::stdio("x", "node", vec!["s.js"]);
        assert!(maybe_enable_oauth(&def).await.is_none());
    }

    #[tokio::test]
    async fn test_maybe_enable_oauth_adhoc_promotes_without_probe() {
        // Unreachable URL: an ad-hoc definition still promotes directly.
        let def = ServerDefinition::http("x", "http://127.0.0.1:1/mcp")
            .with_source(Source::adhoc());
        let promoted = maybe_enable_oauth(&def).await.unwrap();
        assert!(promoted.wants_oauth());
    }

    #[tokio::test]
    async fn test_maybe_enable_oauth_probe_failure_does_not_promote() {
        let def = ServerDefinition::http("x", "http://127.0.0.1:1/mcp")
            .with_source(Source::local("/cfg.json"));
        assert!(maybe_enable_oauth(&def).await.is_none());
    }

    #[tokio::test]
    async fn test_env_guard_restores_on_drop() {
        std::env::set_var("MCPORTER_GUARD_KEEP", "original");
        std::env::remove_var("MCPORTER_GUARD_FRESH");

        let mut env = HashMap::new();
        env.insert("MCPORTER_GUARD_KEEP".to_string(), "override".to_string());
        env.insert("MCPORTER_GUARD_FRESH".to_string(), "set".to_string());
        {
            let _guard = EnvGuard::apply(&env);
            assert_eq!(std::env::var("MCPORTER_GUARD_KEEP").unwrap(), "override");
            assert_eq!(std::env::var("MCPORTER_GUARD_FRESH").unwrap(), "set");
        }
        assert_eq!(std::env::var("MCPORTER_GUARD_KEEP").unwrap(), "original");
        assert!(std::env::var("MCPORTER_GUARD_FRESH").is_err());
    }

    #[tokio::test]
    async fn test_stdio_build_spawn_failure_propagates() {
        let def = ServerDefinition::stdio("x", "definitely-not-a-real-binary", vec!["a"]);
        let err = build_client_context(&def, &BuildOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ProcessError(_)));
    }

    #[tokio::test]
    async fn test_http_build_offline_propagates_without_session() {
        let mut options = BuildOptions::default();
        options.request_timeout = Duration::from_secs(1);
        let def = ServerDefinition::http("x", "http://127.0.0.1:1/mcp");
        let err = build_client_context(&def, &options).await.unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Offline);
    }
}
