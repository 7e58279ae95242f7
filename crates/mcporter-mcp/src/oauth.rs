//! OAuth 2.0 primitives: PKCE, dynamic client registration, code exchange.

use crate::error::{McpError, McpResult};
use crate::vault::{RegisteredClient, TokenSet};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Client URI sent with dynamic registrations.
pub const DEFAULT_CLIENT_URI: &str = "https://github.com/wonop-io/mcporter";

/// Env var naming the header used to authenticate registration requests.
pub const REGISTRATION_HEADER_ENV: &str = "MCPORTER_OAUTH_REGISTRATION_HEADER";
/// Env var holding the registration token.
pub const REGISTRATION_TOKEN_ENV: &str = "MCPORTER_OAUTH_REGISTRATION_TOKEN";

/// Generate a PKCE code verifier (43 chars of base64url).
pub fn generate_code_verifier() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Derive the S256 code challenge for a verifier.
pub fn code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate a state nonce.
pub fn generate_state() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// RFC 7591 client metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ClientMetadata {
    pub client_name: String,
    pub client_uri: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub application_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Build the authorization URL for the code + PKCE flow.
pub fn build_auth_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: Option<&str>,
    state: &str,
    challenge: &str,
) -> String {
    let mut url = format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
        auth_endpoint,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(challenge),
    );
    if let Some(scope) = scope {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }
    url
}

/// Exchange an authorization code for tokens.
pub async fn exchange_code(
    http: &reqwest::Client,
    token_endpoint: &str,
    client: &RegisteredClient,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> McpResult<TokenSet> {
    let mut params = vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", code.to_string()),
        ("redirect_uri", redirect_uri.to_string()),
        ("client_id", client.client_id.clone()),
        ("code_verifier", code_verifier.to_string()),
    ];
    if let Some(secret) = &client.client_secret {
        params.push(("client_secret", secret.clone()));
    }

    let response = http
        .post(token_endpoint)
        .form(&params)
        .send()
        .await
        .map_err(|e| McpError::AuthFailed(format!("Token request failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(McpError::AuthFailed(format!(
            "Token exchange failed ({status}): {text}"
        )));
    }

    response
        .json()
        .await
        .map_err(|e| McpError::AuthFailed(format!("Invalid token response: {e}")))
}

/// HTTP surface for dynamic client registration. Registration POSTs carry an
/// operator-configured bearer when one is present in the environment.
pub struct RegistrationFetch {
    header: String,
    token: Option<String>,
}

impl RegistrationFetch {
    /// Read registration credentials from the environment.
    pub fn from_env() -> Self {
        Self {
            header: std::env::var(REGISTRATION_HEADER_ENV)
                .unwrap_or_else(|_| "Authorization".to_string()),
            token: std::env::var(REGISTRATION_TOKEN_ENV).ok(),
        }
    }

    fn header_value(&self) -> Option<(String, String)> {
        let token = self.token.as_ref()?;
        let value = if self.header.eq_ignore_ascii_case("Authorization") {
            format!("Bearer {token}")
        } else {
            token.clone()
        };
        Some((self.header.clone(), value))
    }

    /// POST client metadata to the registration endpoint.
    pub async fn register(
        &self,
        http: &reqwest::Client,
        endpoint: &str,
        metadata: &ClientMetadata,
    ) -> McpResult<RegisteredClient> {
        let payload = serde_json::to_string(metadata)?;
        let preview: String = payload.chars().take(500).collect();
        debug!(endpoint, payload = %preview, "Registering OAuth client");

        let mut request = http.post(endpoint).json(metadata);
        if let Some((name, value)) = self.header_value() {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| McpError::AuthFailed(format!("Registration request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::AuthFailed(format!(
                "Dynamic client registration failed ({status}): {text}"
            )));
        }

        let client: RegisteredClient = response
            .json()
            .await
            .map_err(|e| McpError::AuthFailed(format!("Invalid registration response: {e}")))?;
        info!(endpoint, client_id = %client.client_id, "Registered OAuth client");
        Ok(client)
    }
}

/// The capability set HTTP transports need from an authorization source.
/// Implemented by [`crate::session::OAuthSession`] and by test fakes.
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    /// Redirect URI the provider listens on.
    fn redirect_url(&self) -> String;

    /// Whether a browser authorization has been started.
    fn did_start_authorization(&self) -> bool;

    /// A usable bearer token, when one is already held.
    async fn access_token(&self) -> Option<String>;

    /// Kick off the interactive flow: discovery, registration, browser.
    /// Idempotent once authorization has started.
    async fn ensure_authorization_started(&self) -> McpResult<()>;

    /// Wait for the authorization code delivered to the callback.
    async fn wait_for_authorization_code(&self) -> McpResult<String>;

    /// Exchange the code, persist tokens, and return the access token.
    async fn finish_authorization(&self, code: &str) -> McpResult<String>;

    /// Release the callback listener. Idempotent.
    async fn close(&self);
}
