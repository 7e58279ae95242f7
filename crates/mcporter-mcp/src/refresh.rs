//! Silent access-token refresh.
//!
//! The fast path before any interactive flow: exchange a persisted refresh
//! token for a fresh access token. Failures are never raised; they yield
//! "no cached token" and let the interactive path run.

use crate::definition::ServerDefinition;
use crate::discovery;
use crate::vault::{TokenSet, TokenVault};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Candidate token endpoints for a server. The AS-advertised endpoint wins
/// when discovery succeeds; the hardcoded list is the fallback when metadata
/// is unavailable.
async fn candidate_endpoints(
    client: &reqwest::Client,
    definition: &ServerDefinition,
) -> Vec<String> {
    let Some(url) = definition.url() else {
        return Vec::new();
    };
    if let Some(discovered) = discovery::discover(client, url).await {
        if discovered
            .auth_server
            .as_ref()
            .and_then(|m| m.token_endpoint.as_ref())
            .is_some()
        {
            return vec![discovered.token_endpoint()];
        }
    }
    let Some(origin) = definition.origin() else {
        return Vec::new();
    };
    vec![
        format!("{origin}/oauth2/token"),
        format!("{origin}/token"),
        format!("{origin}/.well-known/oauth-authorization-server"),
    ]
}

/// Try to refresh the persisted access token. Returns the new access token,
/// or `None` when refresh is not possible or not applicable.
pub async fn refresh_access_token(
    definition: &ServerDefinition,
    vault: &TokenVault,
) -> Option<String> {
    if !definition.is_http() {
        return None;
    }
    let tokens = vault.read_tokens().await?;
    let refresh_token = tokens.refresh_token.clone()?;
    let client_info = vault.read_client_info().await?;

    let client = reqwest::Client::new();
    for endpoint in candidate_endpoints(&client, definition).await {
        let mut params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
            ("client_id", client_info.client_id.clone()),
        ];
        if let Some(secret) = &client_info.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        let response = match client.post(&endpoint).form(&params).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(server = %definition.name, endpoint, error = %e, "Refresh request failed");
                continue;
            }
        };
        if !response.status().is_success() {
            debug!(server = %definition.name, endpoint, status = %response.status(), "Refresh rejected");
            continue;
        }
        let refreshed: RefreshResponse = match response.json().await {
            Ok(r) => r,
            Err(e) => {
                debug!(server = %definition.name, endpoint, error = %e, "Refresh response unreadable");
                continue;
            }
        };

        let new_tokens = TokenSet {
            access_token: refreshed.access_token.clone(),
            // Servers may omit the refresh token on rotation; keep the old one.
            refresh_token: refreshed.refresh_token.or(Some(refresh_token.clone())),
            expires_in: refreshed.expires_in,
            token_type: refreshed.token_type,
            scope: refreshed.scope,
        };
        if let Err(e) = vault.save_tokens(&new_tokens).await {
            warn!(server = %definition.name, error = %e, "Could not persist refreshed tokens");
        }
        debug!(server = %definition.name, endpoint, "Refreshed access token");
        return Some(refreshed.access_token);
    }

    None
}
