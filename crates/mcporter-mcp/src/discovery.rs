//! OAuth server discovery.
//!
//! Fetches RFC 9728 protected-resource metadata and RFC 8414
//! authorization-server metadata. Discovery is best-effort: every fetch runs
//! under a short deadline and failures degrade to `None`.

use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Deadline applied to each discovery GET.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Scope requested when the server advertises nothing usable.
pub const DEFAULT_SCOPE: &str = "mcp:tools";

const PROTECTED_RESOURCE_PATH: &str = "/.well-known/oauth-protected-resource";
const AUTH_SERVER_METADATA_PATH: &str = "/.well-known/oauth-authorization-server";

/// RFC 9728 protected-resource metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProtectedResourceMetadata {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub authorization_servers: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

/// RFC 8414 authorization-server metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthServerMetadata {
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
}

/// Outcome of discovery against one server.
#[derive(Debug, Clone)]
pub struct Discovered {
    /// Base URL of the authorization server (advertised, or the server's own
    /// origin when no resource metadata exists).
    pub auth_server_url: String,
    pub resource: Option<ProtectedResourceMetadata>,
    pub auth_server: Option<AuthServerMetadata>,
}

impl Discovered {
    pub fn authorization_endpoint(&self) -> String {
        self.auth_server
            .as_ref()
            .and_then(|m| m.authorization_endpoint.clone())
            .unwrap_or_else(|| format!("{}/authorize", self.auth_server_url))
    }

    pub fn token_endpoint(&self) -> String {
        self.auth_server
            .as_ref()
            .and_then(|m| m.token_endpoint.clone())
            .unwrap_or_else(|| format!("{}/token", self.auth_server_url))
    }

    pub fn registration_endpoint(&self) -> String {
        self.auth_server
            .as_ref()
            .and_then(|m| m.registration_endpoint.clone())
            .unwrap_or_else(|| format!("{}/register", self.auth_server_url))
    }

    /// Grant types to register, intersected with what this client can drive.
    pub fn grant_types(&self) -> Vec<String> {
        let supported = ["authorization_code", "refresh_token"];
        let declared = self
            .auth_server
            .as_ref()
            .map(|m| m.grant_types_supported.as_slice())
            .unwrap_or_default();
        let intersection: Vec<String> = supported
            .iter()
            .filter(|g| declared.iter().any(|d| d == *g))
            .map(|g| g.to_string())
            .collect();
        if intersection.is_empty() {
            supported.iter().map(|g| g.to_string()).collect()
        } else {
            intersection
        }
    }
}

fn origin_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let mut origin = format!("{}://{}", parsed.scheme(), parsed.host_str()?);
    if let Some(port) = parsed.port() {
        origin.push_str(&format!(":{port}"));
    }
    Some(origin)
}

async fn fetch_json<T: for<'de> Deserialize<'de>>(
    client: &reqwest::Client,
    url: &str,
) -> Option<T> {
    let response = client
        .get(url)
        .timeout(DISCOVERY_TIMEOUT)
        .send()
        .await
        .map_err(|e| debug!(url, error = %e, "Discovery fetch failed"))
        .ok()?;
    if !response.status().is_success() {
        debug!(url, status = %response.status(), "Discovery fetch non-success");
        return None;
    }
    response
        .json()
        .await
        .map_err(|e| warn!(url, error = %e, "Discovery document unreadable"))
        .ok()
}

/// Fetch the protected-resource document for a server URL.
pub async fn fetch_protected_resource(
    client: &reqwest::Client,
    server_url: &str,
) -> Option<ProtectedResourceMetadata> {
    let origin = origin_of(server_url)?;
    fetch_json(client, &format!("{origin}{PROTECTED_RESOURCE_PATH}")).await
}

/// Run full discovery for a server URL. Never raises.
pub async fn discover(client: &reqwest::Client, server_url: &str) -> Option<Discovered> {
    let origin = origin_of(server_url)?;

    let resource = fetch_protected_resource(client, server_url).await;
    let auth_server_url = resource
        .as_ref()
        .and_then(|r| r.authorization_servers.first().cloned())
        .map(|u| u.trim_end_matches('/').to_string())
        .unwrap_or_else(|| origin.clone());

    let auth_server: Option<AuthServerMetadata> = fetch_json(
        client,
        &format!("{auth_server_url}{AUTH_SERVER_METADATA_PATH}"),
    )
    .await;

    if let (Some(r), Some(a)) = (&resource, &auth_server) {
        let shared: Vec<&String> = r
            .scopes_supported
            .iter()
            .filter(|s| a.scopes_supported.contains(s))
            .collect();
        debug!(server = server_url, scopes = ?shared, "Scopes advertised by both documents");
    }

    Some(Discovered {
        auth_server_url,
        resource,
        auth_server,
    })
}

/// Probe whether a server advertises at least one authorization server.
/// Used by the OAuth promotion decision.
pub async fn advertises_authorization(client: &reqwest::Client, server_url: &str) -> bool {
    fetch_protected_resource(client, server_url)
        .await
        .map(|r| !r.authorization_servers.is_empty())
        .unwrap_or(false)
}

/// Pick the effective OAuth scope. Total: always returns a non-empty scope.
pub fn resolve_oauth_scope(
    resource: Option<&ProtectedResourceMetadata>,
    auth_server: Option<&AuthServerMetadata>,
    fallback: Option<&str>,
) -> String {
    let mut advertised: Vec<&str> = Vec::new();
    if let Some(r) = resource {
        advertised.extend(r.scopes_supported.iter().map(String::as_str));
    }
    if let Some(a) = auth_server {
        advertised.extend(a.scopes_supported.iter().map(String::as_str));
    }

    for preferred in ["mcp:tools", "mcp:connect"] {
        if advertised.contains(&preferred) {
            return preferred.to_string();
        }
    }
    if let Some(first) = advertised.iter().find(|s| !s.is_empty()) {
        return (*first).to_string();
    }
    fallback
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SCOPE)
        .to_string()
}
