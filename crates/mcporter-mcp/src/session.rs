//! OAuth session: loopback callback listener plus the interactive
//! authorization flow for one server.
//!
//! A session's lifetime is bounded by one authorization attempt. It owns a
//! TCP listener on the loopback interface, a pending-code rendezvous resolved
//! by the HTTP handler, and the vault holding the server's OAuth artifacts.

use crate::definition::ServerDefinition;
use crate::discovery::{self, Discovered};
use crate::error::{McpError, McpResult};
use crate::oauth::{self, AuthorizationProvider, ClientMetadata, RegistrationFetch};
use crate::vault::{TokenVault, VaultScope};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Stable loopback port tried first for the OAuth callback.
pub const DEFAULT_CALLBACK_PORT: u16 = 33418;

const CALLBACK_HOST: &str = "127.0.0.1";

const HTML_SUCCESS: &str =
    "<html><body><p>Authorization complete. You can close this window and return to mcporter.</p></body></html>";

fn html_failure(message: &str) -> String {
    format!(
        "<html><body><p>Authorization failed.</p><pre>{}</pre></body></html>",
        html_escape(message)
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

type CodeResult = Result<String, String>;

/// Best-effort browser launcher, injectable for tests.
pub type BrowserOpener = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Shared with the accept loop.
struct HandlerShared {
    server_name: String,
    expected_path: String,
    vault: TokenVault,
    pending_tx: Mutex<Option<oneshot::Sender<CodeResult>>>,
}

/// One interactive authorization attempt for one server.
pub struct OAuthSession {
    server_name: String,
    vault: TokenVault,
    http: reqwest::Client,
    discovered: Option<Discovered>,
    scope: String,
    client_metadata: ClientMetadata,
    redirect_url: String,
    port: u16,
    started: AtomicBool,
    closed: AtomicBool,
    access: RwLock<Option<String>>,
    shared: Arc<HandlerShared>,
    pending_rx: Mutex<Option<oneshot::Receiver<CodeResult>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    browser: BrowserOpener,
}

impl OAuthSession {
    /// Create a session for an HTTP definition: bind the loopback listener,
    /// run discovery, compose client metadata, install the callback handler.
    pub async fn create(definition: &ServerDefinition) -> McpResult<Arc<Self>> {
        Self::create_with_browser(definition, Arc::new(|url| open::that(url).is_ok())).await
    }

    /// As [`create`], with an injectable browser launcher.
    pub async fn create_with_browser(
        definition: &ServerDefinition,
        browser: BrowserOpener,
    ) -> McpResult<Arc<Self>> {
        let server_url = definition
            .url()
            .ok_or_else(|| {
                McpError::invalid_config(format!(
                    "server '{}': OAuth requires an HTTP definition",
                    definition.name
                ))
            })?
            .to_string();

        let vault = TokenVault::for_definition(definition);
        let http = reqwest::Client::new();

        // Listener. Caller-supplied redirect wins; otherwise the stable
        // loopback port, with an OS-assigned fallback when it is taken.
        let (listener, port, path, using_defaults) = match &definition.oauth_redirect_url {
            Some(redirect) => {
                let parsed = url::Url::parse(redirect).map_err(|e| {
                    McpError::invalid_config(format!("bad oauthRedirectUrl '{redirect}': {e}"))
                })?;
                let host = parsed.host_str().unwrap_or(CALLBACK_HOST).to_string();
                let port = parsed.port().unwrap_or(DEFAULT_CALLBACK_PORT);
                let path = match parsed.path() {
                    "" => "/".to_string(),
                    p => p.to_string(),
                };
                let listener = TcpListener::bind((host.as_str(), port)).await?;
                let port = listener.local_addr()?.port();
                (listener, port, path, false)
            }
            None => {
                match TcpListener::bind((CALLBACK_HOST, DEFAULT_CALLBACK_PORT)).await {
                    Ok(listener) => (listener, DEFAULT_CALLBACK_PORT, "/".to_string(), true),
                    Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                        debug!(server = %definition.name, "Stable callback port in use, falling back");
                        let listener = TcpListener::bind((CALLBACK_HOST, 0)).await?;
                        let port = listener.local_addr()?.port();
                        (listener, port, "/".to_string(), true)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let host = definition
            .oauth_redirect_url
            .as_ref()
            .and_then(|r| url::Url::parse(r).ok())
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| CALLBACK_HOST.to_string());
        let redirect_url = format!("http://{host}:{port}{path}");

        let discovered = discovery::discover(&http, &server_url).await;
        let scope = discovery::resolve_oauth_scope(
            discovered.as_ref().and_then(|d| d.resource.as_ref()),
            discovered.as_ref().and_then(|d| d.auth_server.as_ref()),
            None,
        );
        let grant_types = discovered
            .as_ref()
            .map(Discovered::grant_types)
            .unwrap_or_else(|| {
                vec![
                    "authorization_code".to_string(),
                    "refresh_token".to_string(),
                ]
            });

        // Registrations made against the stable-port default also record the
        // bare loopback URIs so they survive the OS-assigned fallback.
        let mut redirect_uris = vec![redirect_url.clone()];
        if using_defaults {
            for uri in [
                "http://127.0.0.1/".to_string(),
                format!("http://127.0.0.1:{DEFAULT_CALLBACK_PORT}/"),
            ] {
                if !redirect_uris.contains(&uri) {
                    redirect_uris.push(uri);
                }
            }
        }

        let client_metadata = ClientMetadata {
            client_name: definition.oauth_client_name(),
            client_uri: oauth::DEFAULT_CLIENT_URI.to_string(),
            redirect_uris,
            grant_types,
            response_types: vec!["code".to_string()],
            token_endpoint_auth_method: "none".to_string(),
            application_type: "native".to_string(),
            scope: Some(scope.clone()),
        };

        let shared = Arc::new(HandlerShared {
            server_name: definition.name.clone(),
            expected_path: path,
            vault: vault.clone(),
            pending_tx: Mutex::new(None),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(accept_loop(listener, Arc::clone(&shared), shutdown_rx));
        info!(server = %definition.name, %redirect_url, "OAuth callback listener bound");

        Ok(Arc::new(Self {
            server_name: definition.name.clone(),
            vault,
            http,
            discovered,
            scope,
            client_metadata,
            redirect_url,
            port,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            access: RwLock::new(None),
            shared,
            pending_rx: Mutex::new(None),
            shutdown: Mutex::new(Some(shutdown_tx)),
            browser,
        }))
    }

    /// Port the callback listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Metadata sent with dynamic registrations.
    pub fn client_metadata(&self) -> &ClientMetadata {
        &self.client_metadata
    }

    /// Resolved OAuth scope for this server.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The vault backing this session.
    pub fn vault(&self) -> &TokenVault {
        &self.vault
    }

    /// Persisted state nonce, generated and persisted on first use.
    pub async fn state(&self) -> McpResult<String> {
        if let Some(state) = self.vault.read_state().await {
            return Ok(state);
        }
        let state = oauth::generate_state();
        self.vault.save_state(&state).await?;
        Ok(state)
    }

    fn discovered(&self) -> McpResult<&Discovered> {
        self.discovered.as_ref().ok_or_else(|| {
            McpError::AuthFailed(format!(
                "OAuth discovery failed for '{}'",
                self.server_name
            ))
        })
    }

    /// Replace the pending rendezvous with a fresh one.
    async fn fresh_pending(&self) {
        let (tx, rx) = oneshot::channel();
        *self.shared.pending_tx.lock().await = Some(tx);
        *self.pending_rx.lock().await = Some(rx);
    }

    /// Record that authorization started, arm a fresh pending code, launch
    /// the browser best-effort, and surface the URL for manual use.
    pub async fn redirect_to_authorization(&self, url: &str) {
        self.started.store(true, Ordering::SeqCst);
        self.fresh_pending().await;
        let opened = (self.browser)(url);
        if opened {
            info!(server = %self.server_name, "Opened browser for authorization");
        } else {
            warn!(server = %self.server_name, "Could not launch a browser");
        }
        eprintln!("Authorize '{}' by visiting:\n  {url}", self.server_name);
    }
}

#[async_trait]
impl AuthorizationProvider for OAuthSession {
    fn redirect_url(&self) -> String {
        self.redirect_url.clone()
    }

    fn did_start_authorization(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn access_token(&self) -> Option<String> {
        if let Some(token) = self.access.read().await.clone() {
            return Some(token);
        }
        self.vault.read_cached_access_token().await
    }

    async fn ensure_authorization_started(&self) -> McpResult<()> {
        if self.did_start_authorization() {
            return Ok(());
        }
        let discovered = self.discovered()?;

        let client = match self.vault.read_client_info().await {
            Some(client) => client,
            None => {
                let fetch = RegistrationFetch::from_env();
                let client = fetch
                    .register(
                        &self.http,
                        &discovered.registration_endpoint(),
                        &self.client_metadata,
                    )
                    .await?;
                self.vault.save_client_info(&client).await?;
                client
            }
        };

        let state = self.state().await?;
        let verifier = oauth::generate_code_verifier();
        self.vault.save_code_verifier(&verifier).await?;
        let challenge = oauth::code_challenge(&verifier);

        let url = oauth::build_auth_url(
            &discovered.authorization_endpoint(),
            &client.client_id,
            &self.redirect_url,
            Some(&self.scope),
            &state,
            &challenge,
        );
        self.redirect_to_authorization(&url).await;
        Ok(())
    }

    async fn wait_for_authorization_code(&self) -> McpResult<String> {
        let rx = {
            let mut slot = self.pending_rx.lock().await;
            if slot.is_none() {
                drop(slot);
                self.fresh_pending().await;
                slot = self.pending_rx.lock().await;
            }
            slot.take()
        };
        let Some(rx) = rx else {
            return Err(McpError::AuthFailed(
                "No pending authorization for this session".to_string(),
            ));
        };
        match rx.await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(message)) => Err(McpError::AuthFailed(message)),
            Err(_) => Err(McpError::AuthFailed(
                "OAuth session closed before receiving authorization code".to_string(),
            )),
        }
    }

    async fn finish_authorization(&self, code: &str) -> McpResult<String> {
        let discovered = self.discovered()?;
        let client = self.vault.read_client_info().await.ok_or_else(|| {
            McpError::AuthFailed(format!(
                "No registered client for '{}'",
                self.server_name
            ))
        })?;
        let verifier = self.vault.read_code_verifier().await.ok_or_else(|| {
            McpError::AuthFailed(format!(
                "No PKCE verifier persisted for '{}'",
                self.server_name
            ))
        })?;

        let tokens = oauth::exchange_code(
            &self.http,
            &discovered.token_endpoint(),
            &client,
            code,
            &self.redirect_url,
            &verifier,
        )
        .await?;

        self.vault.save_tokens(&tokens).await?;
        // The verifier is single-use; never keep it past a successful exchange.
        self.vault.clear(VaultScope::Verifier).await?;
        *self.access.write().await = Some(tokens.access_token.clone());
        info!(server = %self.server_name, vault = %self.vault.describe(), "Saved OAuth tokens");
        Ok(tokens.access_token)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shared.pending_tx.lock().await.take() {
            let _ = tx.send(Err(
                "OAuth session closed before receiving authorization code".to_string(),
            ));
        }
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        debug!(server = %self.server_name, "OAuth session closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<HandlerShared>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, shared).await {
                                warn!(error = %e, "Error handling OAuth callback");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Error accepting callback connection"),
                }
            }
            _ = &mut shutdown => {
                debug!("OAuth callback listener shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, shared: Arc<HandlerShared>) -> McpResult<()> {
    let mut buffer = [0u8; 4096];
    let n = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..n]);

    let first_line = request.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let (_method, target) = match (parts.next(), parts.next()) {
        (Some(m), Some(t)) => (m, t),
        _ => {
            respond(&mut stream, 400, "text/plain", "Bad Request").await;
            return Ok(());
        }
    };

    let parsed = match url::Url::parse(&format!("http://{CALLBACK_HOST}{target}")) {
        Ok(u) => u,
        Err(_) => {
            respond(&mut stream, 400, "text/plain", "Bad Request").await;
            return Ok(());
        }
    };

    let path_ok = parsed.path() == shared.expected_path
        || (shared.expected_path == "/" && parsed.path() == "/callback");
    if !path_ok {
        respond(&mut stream, 404, "text/plain", "Not Found").await;
        return Ok(());
    }

    let params: HashMap<String, String> = parsed
        .query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let code = params.get("code");
    let error = params.get("error");
    let state = params.get("state");

    debug!(
        server = %shared.server_name,
        has_code = code.is_some(),
        error = ?error,
        "Received OAuth callback"
    );

    if let Some(state) = state {
        let persisted = shared.vault.read_state().await;
        if persisted.as_deref() != Some(state.as_str()) {
            reject(&shared, "Invalid OAuth state").await;
            respond(
                &mut stream,
                400,
                "text/html",
                &html_failure("Invalid OAuth state"),
            )
            .await;
            return Ok(());
        }
    }

    if let Some(code) = code {
        if let Some(tx) = shared.pending_tx.lock().await.take() {
            let _ = tx.send(Ok(code.clone()));
        } else {
            warn!(server = %shared.server_name, "Authorization code arrived with no pending wait");
        }
        respond(&mut stream, 200, "text/html", HTML_SUCCESS).await;
        return Ok(());
    }

    if let Some(error) = error {
        let message = params
            .get("error_description")
            .cloned()
            .unwrap_or_else(|| error.clone());
        reject(&shared, &message).await;
        respond(&mut stream, 400, "text/html", &html_failure(&message)).await;
        return Ok(());
    }

    reject(&shared, "Missing authorization code").await;
    respond(
        &mut stream,
        400,
        "text/html",
        &html_failure("Missing authorization code"),
    )
    .await;
    Ok(())
}

async fn reject(shared: &HandlerShared, message: &str) {
    if let Some(tx) = shared.pending_tx.lock().await.take() {
        let _ = tx.send(Err(message.to_string()));
    }
}

async fn respond(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Unknown",
    };
    let response = format!(
        "HTTP/1.1 {status} {status_text}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ServerDefinition;
    use tempfile::TempDir;

    fn definition(dir: &TempDir) -> ServerDefinition {
        ServerDefinition::http("test", "http://127.0.0.1:1/mcp")
            .with_oauth()
            .with_token_cache_dir(dir.path())
    }

    async fn session(dir: &TempDir) -> Arc<OAuthSession> {
        OAuthSession::create_with_browser(&definition(dir), Arc::new(|_| true))
            .await
            .unwrap()
    }

    async fn get(url: &str) -> (u16, String) {
        let response = reqwest::get(url).await.unwrap();
        let status = response.status().as_u16();
        let body = response.text().await.unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn test_create_requires_http_definition() {
        let def = ServerDefinition::stdio("local", "node", vec!["s.js"]);
        assert!(OAuthSession::create_with_browser(&def, Arc::new(|_| true))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stable_port_fallback_registers_both_uris() {
        let dir = TempDir::new().unwrap();
        let first = session(&dir).await;
        // Second session finds the stable port taken and falls back.
        let second = session(&dir).await;
        if first.port() == DEFAULT_CALLBACK_PORT {
            assert_ne!(second.port(), DEFAULT_CALLBACK_PORT);
        }
        let uris = &second.client_metadata().redirect_uris;
        assert!(uris.contains(&second.redirect_url()));
        assert!(uris.contains(&"http://127.0.0.1/".to_string()));
        assert!(uris.contains(&format!("http://127.0.0.1:{DEFAULT_CALLBACK_PORT}/")));
        first.close().await;
        second.close().await;
    }

    #[tokio::test]
    async fn test_state_persists_across_reads() {
        let dir = TempDir::new().unwrap();
        let s = session(&dir).await;
        let first = s.state().await.unwrap();
        let second = s.state().await.unwrap();
        assert_eq!(first, second);
        s.close().await;
    }

    #[tokio::test]
    async fn test_callback_resolves_pending_code() {
        let dir = TempDir::new().unwrap();
        let s = session(&dir).await;
        let state = s.state().await.unwrap();
        s.redirect_to_authorization("https://as.test/authorize?x=1")
            .await;

        let url = format!(
            "http://127.0.0.1:{}/?code=abc123&state={state}",
            s.port()
        );
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait_for_authorization_code().await })
        };
        let (status, body) = get(&url).await;
        assert_eq!(status, 200);
        assert!(body.contains("Authorization complete"));
        assert_eq!(waiter.await.unwrap().unwrap(), "abc123");
        assert!(s.did_start_authorization());
        s.close().await;
    }

    #[tokio::test]
    async fn test_callback_wait_before_redirect() {
        let dir = TempDir::new().unwrap();
        let s = session(&dir).await;
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait_for_authorization_code().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let (status, _) = get(&format!("http://127.0.0.1:{}/?code=later", s.port())).await;
        assert_eq!(status, 200);
        assert_eq!(waiter.await.unwrap().unwrap(), "later");
        s.close().await;
    }

    #[tokio::test]
    async fn test_callback_rejects_bad_state() {
        let dir = TempDir::new().unwrap();
        let s = session(&dir).await;
        s.state().await.unwrap();
        s.redirect_to_authorization("https://as.test/a").await;

        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait_for_authorization_code().await })
        };
        let (status, body) =
            get(&format!("http://127.0.0.1:{}/?code=x&state=wrong", s.port())).await;
        assert_eq!(status, 400);
        assert!(body.contains("Invalid OAuth state"));
        assert!(waiter.await.unwrap().is_err());
        s.close().await;
    }

    #[tokio::test]
    async fn test_callback_path_mismatch_404() {
        let dir = TempDir::new().unwrap();
        let s = session(&dir).await;
        let (status, _) = get(&format!("http://127.0.0.1:{}/nope", s.port())).await;
        assert_eq!(status, 404);
        // `/callback` is accepted as an alias of the root path.
        let (status, _) = get(&format!(
            "http://127.0.0.1:{}/callback?code=ok",
            s.port()
        ))
        .await;
        assert_eq!(status, 200);
        s.close().await;
    }

    #[tokio::test]
    async fn test_callback_missing_code_rejected() {
        let dir = TempDir::new().unwrap();
        let s = session(&dir).await;
        s.redirect_to_authorization("https://as.test/a").await;
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait_for_authorization_code().await })
        };
        let (status, body) = get(&format!("http://127.0.0.1:{}/", s.port())).await;
        assert_eq!(status, 400);
        assert!(body.contains("Missing authorization code"));
        assert!(waiter.await.unwrap().is_err());
        s.close().await;
    }

    #[tokio::test]
    async fn test_callback_error_param_rejected() {
        let dir = TempDir::new().unwrap();
        let s = session(&dir).await;
        s.redirect_to_authorization("https://as.test/a").await;
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait_for_authorization_code().await })
        };
        let (status, body) = get(&format!(
            "http://127.0.0.1:{}/?error=access_denied&error_description=nope",
            s.port()
        ))
        .await;
        assert_eq!(status, 400);
        assert!(body.contains("nope"));
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("nope"));
        s.close().await;
    }

    #[tokio::test]
    async fn test_close_rejects_pending_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let s = session(&dir).await;
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait_for_authorization_code().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        s.close().await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err
            .to_string()
            .contains("OAuth session closed before receiving authorization code"));
        // Idempotent.
        s.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_listener() {
        let dir = TempDir::new().unwrap();
        let mut def = definition(&dir);
        // OS-assigned port keeps this test independent of the stable port.
        def.oauth_redirect_url = Some("http://127.0.0.1:0/".to_string());
        let s = OAuthSession::create_with_browser(&def, Arc::new(|_| true))
            .await
            .unwrap();
        let port = s.port();
        s.close().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // The port can be bound again once the session is closed.
        let rebound = TcpListener::bind((CALLBACK_HOST, port)).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_caller_supplied_redirect_url() {
        let dir = TempDir::new().unwrap();
        let mut def = definition(&dir);
        def.oauth_redirect_url = Some("http://127.0.0.1:0/oauth/done".to_string());
        let s = OAuthSession::create_with_browser(&def, Arc::new(|_| true))
            .await
            .unwrap();
        assert!(s.redirect_url().ends_with("/oauth/done"));
        let (status, _) = get(&format!(
            "http://127.0.0.1:{}/oauth/done?code=ok",
            s.port()
        ))
        .await;
        assert_eq!(status, 200);
        s.close().await;
    }
}
