//! Server definitions: the immutable entities the runtime is keyed by.

use crate::error::{McpError, McpResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Sentinel path marking a definition constructed on the fly (e.g. from a
/// bare URL on the command line) rather than loaded from configuration.
pub const ADHOC_PATH: &str = "<adhoc>";

/// How the server is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandSpec {
    /// Local subprocess speaking JSON-RPC over stdio.
    Stdio {
        exe: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
        env: HashMap<String, String>,
    },
    /// Remote server over streamable HTTP (with SSE fallback).
    Http {
        url: String,
        headers: HashMap<String, String>,
    },
}

/// Authentication demanded by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    OAuth,
}

/// Connection lifecycle for a cached context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum Lifecycle {
    /// Context persists across calls until closed.
    #[serde(rename_all = "camelCase")]
    KeepAlive {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idle_timeout_ms: Option<u64>,
    },
    /// Context is closed after every call.
    Ephemeral,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::KeepAlive {
            idle_timeout_ms: None,
        }
    }
}

/// Where a definition came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Global,
}

/// Provenance of a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub kind: SourceKind,
    pub path: String,
}

impl Source {
    /// A definition loaded from a local config file.
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Local,
            path: path.into(),
        }
    }

    /// An unconfigured, URL-driven definition.
    pub fn adhoc() -> Self {
        Self::local(ADHOC_PATH)
    }

    /// Whether this definition was constructed ad hoc.
    pub fn is_adhoc(&self) -> bool {
        self.kind == SourceKind::Local && self.path == ADHOC_PATH
    }
}

impl Default for Source {
    fn default() -> Self {
        Self::adhoc()
    }
}

/// Projection applied to a tool's JSON result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMapping {
    /// Dotted JSON field paths to keep.
    #[serde(default)]
    pub pick: Vec<String>,
}

/// A named MCP server, immutable after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub name: String,
    pub command: CommandSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthScheme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_cache_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_redirect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub result_mapping: HashMap<String, ResultMapping>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub source: Source,
}

impl ServerDefinition {
    /// Create a stdio definition.
    pub fn stdio(
        name: impl Into<String>,
        exe: impl Into<String>,
        args: Vec<impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            command: CommandSpec::Stdio {
                exe: exe.into(),
                args: args.into_iter().map(|a| a.into()).collect(),
                cwd: None,
                env: HashMap::new(),
            },
            auth: None,
            token_cache_dir: None,
            client_name: None,
            oauth_redirect_url: None,
            allowed_tools: None,
            blocked_tools: None,
            result_mapping: HashMap::new(),
            lifecycle: Lifecycle::default(),
            source: Source::default(),
        }
    }

    /// Create an HTTP definition.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: CommandSpec::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
            auth: None,
            token_cache_dir: None,
            client_name: None,
            oauth_redirect_url: None,
            allowed_tools: None,
            blocked_tools: None,
            result_mapping: HashMap::new(),
            lifecycle: Lifecycle::default(),
            source: Source::default(),
        }
    }

    /// Add a header (HTTP definitions).
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let CommandSpec::Http { headers, .. } = &mut self.command {
            headers.insert(key.into(), value.into());
        }
        self
    }

    /// Add an environment variable (stdio definitions).
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let CommandSpec::Stdio { env, .. } = &mut self.command {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Demand OAuth.
    #[must_use]
    pub fn with_oauth(mut self) -> Self {
        self.auth = Some(AuthScheme::OAuth);
        self
    }

    #[must_use]
    pub fn with_token_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.token_cache_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_result_mapping(mut self, tool: impl Into<String>, mapping: ResultMapping) -> Self {
        self.result_mapping.insert(tool.into(), mapping);
        self
    }

    /// Whether the server is reached over HTTP.
    pub fn is_http(&self) -> bool {
        matches!(self.command, CommandSpec::Http { .. })
    }

    /// The server URL, for HTTP definitions.
    pub fn url(&self) -> Option<&str> {
        match &self.command {
            CommandSpec::Http { url, .. } => Some(url),
            CommandSpec::Stdio { .. } => None,
        }
    }

    /// Scheme + authority of the server URL.
    pub fn origin(&self) -> Option<String> {
        let parsed = url::Url::parse(self.url()?).ok()?;
        let mut origin = format!("{}://{}", parsed.scheme(), parsed.host_str()?);
        if let Some(port) = parsed.port() {
            origin.push_str(&format!(":{port}"));
        }
        Some(origin)
    }

    /// OAuth client name, defaulting to `mcporter (<server>)`.
    pub fn oauth_client_name(&self) -> String {
        self.client_name
            .clone()
            .unwrap_or_else(|| format!("mcporter ({})", self.name))
    }

    /// Whether this definition demands OAuth.
    pub fn wants_oauth(&self) -> bool {
        self.auth == Some(AuthScheme::OAuth)
    }

    /// Return a copy with `auth` promoted to OAuth.
    #[must_use]
    pub fn promoted(&self) -> Self {
        let mut def = self.clone();
        def.auth = Some(AuthScheme::OAuth);
        def
    }
}

/// One entry of the `mcpServers` map as found in configuration files.
/// Accepts both camelCase and snake_case spellings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawServerEntry {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthScheme>,
    #[serde(default, alias = "token_cache_dir")]
    pub token_cache_dir: Option<PathBuf>,
    #[serde(default, alias = "client_name")]
    pub client_name: Option<String>,
    #[serde(default, alias = "oauth_redirect_url")]
    pub oauth_redirect_url: Option<String>,
    #[serde(default, alias = "allowed_tools")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, alias = "blocked_tools")]
    pub blocked_tools: Option<Vec<String>>,
    #[serde(default, alias = "result_mapping")]
    pub result_mapping: HashMap<String, ResultMapping>,
    #[serde(default)]
    pub lifecycle: Option<Lifecycle>,
}

#[derive(Debug, Deserialize)]
struct ServersFile {
    #[serde(default, rename = "mcpServers", alias = "mcp_servers")]
    mcp_servers: HashMap<String, RawServerEntry>,
}

impl RawServerEntry {
    /// Build a definition from a raw config entry.
    pub fn into_definition(self, name: &str, source: Source) -> McpResult<ServerDefinition> {
        let command = match (self.url, self.command) {
            (Some(url), None) => CommandSpec::Http {
                url,
                headers: self.headers,
            },
            (None, Some(command)) => {
                // Whitespace split keeps config entries simple; quoting
                // belongs in the args array.
                let mut parts = command.split_whitespace().map(str::to_string);
                let exe = parts.next().ok_or_else(|| {
                    McpError::invalid_config(format!("server '{name}': empty command"))
                })?;
                let mut args: Vec<String> = parts.collect();
                args.extend(self.args);
                CommandSpec::Stdio {
                    exe,
                    args,
                    cwd: self.cwd,
                    env: self.env,
                }
            }
            (Some(_), Some(_)) => {
                return Err(McpError::invalid_config(format!(
                    "server '{name}': both url and command given"
                )))
            }
            (None, None) => {
                return Err(McpError::invalid_config(format!(
                    "server '{name}': needs url or command"
                )))
            }
        };

        Ok(ServerDefinition {
            name: name.to_string(),
            command,
            auth: self.auth,
            token_cache_dir: self.token_cache_dir,
            client_name: self.client_name,
            oauth_redirect_url: self.oauth_redirect_url,
            allowed_tools: self.allowed_tools,
            blocked_tools: self.blocked_tools,
            result_mapping: self.result_mapping,
            lifecycle: self.lifecycle.unwrap_or_default(),
            source,
        })
    }
}

/// Parse a config document with a top-level `mcpServers` map.
pub fn parse_definitions(json: &str, config_path: &str) -> McpResult<Vec<ServerDefinition>> {
    let file: ServersFile = serde_json::from_str(json)?;
    let mut defs: Vec<ServerDefinition> = file
        .mcp_servers
        .into_iter()
        .map(|(name, entry)| entry.into_definition(&name, Source::local(config_path)))
        .collect::<McpResult<_>>()?;
    defs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(defs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdio_builder() {
        let def = ServerDefinition::stdio("echo", "node", vec!["echo.js"]);
        assert_eq!(def.name, "echo");
        assert!(!def.is_http());
        match &def.command {
            CommandSpec::Stdio { exe, args, .. } => {
                assert_eq!(exe, "node");
                assert_eq!(args, &["echo.js"]);
            }
            CommandSpec::Http { .. } => panic!("expected stdio"),
        }
    }

    #[test]
    fn test_http_builder_and_origin() {
        let def = ServerDefinition::http("api", "https://mcp.example.com:8443/v1/mcp")
            .with_header("X-Key", "$KEY");
        assert!(def.is_http());
        assert_eq!(def.origin().unwrap(), "https://mcp.example.com:8443");
    }

    #[test]
    fn test_adhoc_source() {
        assert!(Source::adhoc().is_adhoc());
        assert!(!Source::local("/home/me/mcporter.json").is_adhoc());
    }

    #[test]
    fn test_oauth_client_name_default() {
        let def = ServerDefinition::http("linear", "https://mcp.linear.app/mcp");
        assert_eq!(def.oauth_client_name(), "mcporter (linear)");
    }

    #[test]
    fn test_promoted_copy() {
        let def = ServerDefinition::http("x", "https://x.test/mcp");
        assert!(!def.wants_oauth());
        let promoted = def.promoted();
        assert!(promoted.wants_oauth());
        assert!(!def.wants_oauth());
    }

    #[test]
    fn test_parse_definitions_camel_and_snake() {
        let json = r#"{
            "mcpServers": {
                "remote": {
                    "url": "https://mcp.example.com/mcp",
                    "auth": "oauth",
                    "tokenCacheDir": "/tmp/a",
                    "allowed_tools": ["one"]
                },
                "local": {
                    "command": "node server.js --port 3000",
                    "env": {"API_KEY": "$KEY"}
                }
            }
        }"#;

        let defs = parse_definitions(json, "/cfg/mcporter.json").unwrap();
        assert_eq!(defs.len(), 2);

        let local = &defs[0];
        assert_eq!(local.name, "local");
        match &local.command {
            CommandSpec::Stdio { exe, args, env, .. } => {
                assert_eq!(exe, "node");
                assert_eq!(args, &["server.js", "--port", "3000"]);
                assert_eq!(env.get("API_KEY").unwrap(), "$KEY");
            }
            CommandSpec::Http { .. } => panic!("expected stdio"),
        }

        let remote = &defs[1];
        assert_eq!(remote.auth, Some(AuthScheme::OAuth));
        assert_eq!(remote.token_cache_dir.as_deref().unwrap().to_str(), Some("/tmp/a"));
        assert_eq!(remote.allowed_tools.as_deref().unwrap(), ["one"]);
        assert_eq!(remote.source.path, "/cfg/mcporter.json");
    }

    #[test]
    fn test_parse_rejects_ambiguous_entry() {
        let json = r#"{"mcpServers": {"x": {"url": "https://a", "command": "b"}}}"#;
        assert!(parse_definitions(json, "p").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_entry() {
        let json = r#"{"mcpServers": {"x": {}}}"#;
        assert!(parse_definitions(json, "p").is_err());
    }

    #[test]
    fn test_lifecycle_parsing() {
        let json = r#"{
            "mcpServers": {
                "a": {"url": "https://a/mcp", "lifecycle": {"mode": "ephemeral"}},
                "b": {"url": "https://b/mcp", "lifecycle": {"mode": "keep-alive", "idleTimeoutMs": 5000}}
            }
        }"#;
        let defs = parse_definitions(json, "p").unwrap();
        assert_eq!(defs[0].lifecycle, Lifecycle::Ephemeral);
        assert_eq!(
            defs[1].lifecycle,
            Lifecycle::KeepAlive {
                idle_timeout_ms: Some(5000)
            }
        );
    }

    #[test]
    fn test_result_mapping_parsing() {
        let json = r#"{
            "mcpServers": {
                "a": {
                    "url": "https://a/mcp",
                    "resultMapping": {"getUser": {"pick": ["id", "profile.email"]}}
                }
            }
        }"#;
        let defs = parse_definitions(json, "p").unwrap();
        let mapping = defs[0].result_mapping.get("getUser").unwrap();
        assert_eq!(mapping.pick, ["id", "profile.email"]);
    }
}
