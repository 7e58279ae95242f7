//! Durable, per-server storage of OAuth artifacts.
//!
//! Each artifact is an independent file under `tokenCacheDir/<server>/`:
//! `tokens.json`, `client.json`, `verifier`, `state`. Files are written with
//! owner-only permissions.

use crate::definition::ServerDefinition;
use crate::error::McpResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

const TOKENS_FILE: &str = "tokens.json";
const CLIENT_FILE: &str = "client.json";
const VERIFIER_FILE: &str = "verifier";
const STATE_FILE: &str = "state";

/// Freshness margin when judging token expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Tokens as returned by the authorization server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Client credentials from dynamic registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredClient {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect_uris: Vec<String>,
}

/// Which artifacts `clear` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultScope {
    All,
    Client,
    Tokens,
    Verifier,
}

/// Per-server OAuth artifact store.
#[derive(Debug, Clone)]
pub struct TokenVault {
    dir: PathBuf,
}

impl TokenVault {
    /// Vault for a definition, honoring its `token_cache_dir`.
    pub fn for_definition(definition: &ServerDefinition) -> Self {
        let root = definition
            .token_cache_dir
            .clone()
            .unwrap_or_else(default_cache_dir);
        Self {
            dir: root.join(&definition.name),
        }
    }

    /// Vault rooted at an explicit directory.
    pub fn at(root: impl Into<PathBuf>, server_name: &str) -> Self {
        Self {
            dir: root.into().join(server_name),
        }
    }

    /// Human-readable location for logs.
    pub fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    pub async fn read_tokens(&self) -> Option<TokenSet> {
        self.read_json(TOKENS_FILE).await
    }

    pub async fn save_tokens(&self, tokens: &TokenSet) -> McpResult<()> {
        self.write_json(TOKENS_FILE, tokens).await
    }

    pub async fn read_client_info(&self) -> Option<RegisteredClient> {
        self.read_json(CLIENT_FILE).await
    }

    pub async fn save_client_info(&self, client: &RegisteredClient) -> McpResult<()> {
        self.write_json(CLIENT_FILE, client).await
    }

    pub async fn read_code_verifier(&self) -> Option<String> {
        self.read_raw(VERIFIER_FILE).await
    }

    pub async fn save_code_verifier(&self, verifier: &str) -> McpResult<()> {
        self.write_raw(VERIFIER_FILE, verifier).await
    }

    pub async fn read_state(&self) -> Option<String> {
        self.read_raw(STATE_FILE).await
    }

    pub async fn save_state(&self, state: &str) -> McpResult<()> {
        self.write_raw(STATE_FILE, state).await
    }

    /// Delete exactly the artifacts implied by `scope`.
    pub async fn clear(&self, scope: VaultScope) -> McpResult<()> {
        let files: &[&str] = match scope {
            VaultScope::All => &[TOKENS_FILE, CLIENT_FILE, VERIFIER_FILE, STATE_FILE],
            VaultScope::Client => &[CLIENT_FILE],
            VaultScope::Tokens => &[TOKENS_FILE],
            VaultScope::Verifier => &[VERIFIER_FILE],
        };
        for file in files {
            match tokio::fs::remove_file(self.dir.join(file)).await {
                Ok(()) => debug!(vault = %self.describe(), file, "Cleared artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// A non-expired persisted access token, if any. Expiry is judged by
    /// `expires_in` plus the tokens file mtime, with a 60 s margin.
    pub async fn read_cached_access_token(&self) -> Option<String> {
        let tokens = self.read_tokens().await?;
        let Some(expires_in) = tokens.expires_in else {
            return Some(tokens.access_token);
        };
        let mtime = tokio::fs::metadata(self.dir.join(TOKENS_FILE))
            .await
            .ok()?
            .modified()
            .ok()?;
        let expires_at = mtime + Duration::from_secs(expires_in);
        if SystemTime::now() + EXPIRY_SKEW < expires_at {
            Some(tokens.access_token)
        } else {
            debug!(vault = %self.describe(), "Cached access token expired");
            None
        }
    }

    async fn read_raw(&self, file: &str) -> Option<String> {
        let content = tokio::fs::read_to_string(self.dir.join(file)).await.ok()?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(&self, file: &str) -> Option<T> {
        let content = tokio::fs::read_to_string(self.dir.join(file)).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(vault = %self.describe(), file, error = %e, "Skipping unreadable artifact");
                None
            }
        }
    }

    async fn write_json<T: Serialize>(&self, file: &str, value: &T) -> McpResult<()> {
        let content = serde_json::to_string_pretty(value)?;
        self.write_raw(file, &content).await
    }

    async fn write_raw(&self, file: &str, content: &str) -> McpResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(file);
        tokio::fs::write(&path, content).await?;
        restrict_permissions(&path).await?;
        debug!(vault = %self.describe(), file, "Wrote artifact");
        Ok(())
    }
}

async fn restrict_permissions(path: &Path) -> McpResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Default token cache location.
pub fn default_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".mcporter")
        .join("tokens")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vault() -> (TokenVault, TempDir) {
        let dir = TempDir::new().unwrap();
        let vault = TokenVault::at(dir.path(), "test-server");
        (vault, dir)
    }

    fn tokens() -> TokenSet {
        TokenSet {
            access_token: "access123".to_string(),
            refresh_token: Some("refresh456".to_string()),
            expires_in: Some(3600),
            token_type: Some("Bearer".to_string()),
            scope: Some("mcp:tools".to_string()),
        }
    }

    #[tokio::test]
    async fn test_tokens_roundtrip() {
        let (vault, _dir) = vault();
        assert!(vault.read_tokens().await.is_none());

        vault.save_tokens(&tokens()).await.unwrap();
        assert_eq!(vault.read_tokens().await.unwrap(), tokens());
    }

    #[tokio::test]
    async fn test_client_info_roundtrip() {
        let (vault, _dir) = vault();
        let client = RegisteredClient {
            client_id: "cid".to_string(),
            client_secret: None,
            client_id_issued_at: Some(1),
            client_secret_expires_at: None,
            redirect_uris: vec!["http://127.0.0.1:33418/".to_string()],
        };
        vault.save_client_info(&client).await.unwrap();
        assert_eq!(vault.read_client_info().await.unwrap(), client);
    }

    #[tokio::test]
    async fn test_verifier_and_state_roundtrip() {
        let (vault, _dir) = vault();
        vault.save_code_verifier("ver").await.unwrap();
        vault.save_state("st").await.unwrap();
        assert_eq!(vault.read_code_verifier().await.unwrap(), "ver");
        assert_eq!(vault.read_state().await.unwrap(), "st");
    }

    #[tokio::test]
    async fn test_clear_scopes_delete_exactly_their_files() {
        let (vault, _dir) = vault();
        vault.save_tokens(&tokens()).await.unwrap();
        vault
            .save_client_info(&RegisteredClient {
                client_id: "cid".to_string(),
                client_secret: None,
                client_id_issued_at: None,
                client_secret_expires_at: None,
                redirect_uris: vec![],
            })
            .await
            .unwrap();
        vault.save_code_verifier("ver").await.unwrap();
        vault.save_state("st").await.unwrap();

        vault.clear(VaultScope::Verifier).await.unwrap();
        assert!(vault.read_code_verifier().await.is_none());
        assert!(vault.read_tokens().await.is_some());
        assert!(vault.read_client_info().await.is_some());
        assert!(vault.read_state().await.is_some());

        vault.clear(VaultScope::Tokens).await.unwrap();
        assert!(vault.read_tokens().await.is_none());
        assert!(vault.read_client_info().await.is_some());

        vault.clear(VaultScope::Client).await.unwrap();
        assert!(vault.read_client_info().await.is_none());
        assert!(vault.read_state().await.is_some());

        vault.save_tokens(&tokens()).await.unwrap();
        vault.clear(VaultScope::All).await.unwrap();
        assert!(vault.read_tokens().await.is_none());
        assert!(vault.read_state().await.is_none());
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let (vault, _dir) = vault();
        vault.clear(VaultScope::All).await.unwrap();
        vault.clear(VaultScope::All).await.unwrap();
    }

    #[tokio::test]
    async fn test_cached_access_token_fresh() {
        let (vault, _dir) = vault();
        vault.save_tokens(&tokens()).await.unwrap();
        assert_eq!(vault.read_cached_access_token().await.unwrap(), "access123");
    }

    #[tokio::test]
    async fn test_cached_access_token_nearly_expired() {
        let (vault, _dir) = vault();
        let mut t = tokens();
        // Inside the 60 s freshness margin.
        t.expires_in = Some(30);
        vault.save_tokens(&t).await.unwrap();
        assert!(vault.read_cached_access_token().await.is_none());
    }

    #[tokio::test]
    async fn test_cached_access_token_without_expiry_is_valid() {
        let (vault, _dir) = vault();
        let mut t = tokens();
        t.expires_in = None;
        vault.save_tokens(&t).await.unwrap();
        assert!(vault.read_cached_access_token().await.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let (vault, dir) = vault();
        vault.save_tokens(&tokens()).await.unwrap();
        let mode = std::fs::metadata(dir.path().join("test-server").join("tokens.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_corrupt_artifact_reads_as_none() {
        let (vault, dir) = vault();
        let path = dir.path().join("test-server");
        tokio::fs::create_dir_all(&path).await.unwrap();
        tokio::fs::write(path.join("tokens.json"), "not json")
            .await
            .unwrap();
        assert!(vault.read_tokens().await.is_none());
    }
}
