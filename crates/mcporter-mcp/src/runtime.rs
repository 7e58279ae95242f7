//! Process-wide runtime: the map of server name to live client context.
//!
//! Operations on one server are serialized through a per-server slot; work
//! across servers runs fully concurrently.

use crate::context::{self, BuildOptions, ClientContext};
use crate::definition::{Lifecycle, ServerDefinition};
use crate::error::{McpError, McpResult};
use crate::projection;
use crate::protocol::{McpTool, ToolCallResult, ToolContent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Env var bounding `tools/list`, in milliseconds.
pub const LIST_TIMEOUT_ENV: &str = "MCPORTER_LIST_TIMEOUT";
/// Env var bounding `tools/call`, in milliseconds.
pub const CALL_TIMEOUT_ENV: &str = "MCPORTER_CALL_TIMEOUT";

const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

fn timeout_from_env(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub list_timeout: Duration,
    pub call_timeout: Duration,
    pub build: BuildOptions,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            list_timeout: timeout_from_env(LIST_TIMEOUT_ENV, DEFAULT_LIST_TIMEOUT),
            call_timeout: timeout_from_env(CALL_TIMEOUT_ENV, DEFAULT_CALL_TIMEOUT),
            build: BuildOptions::default(),
        }
    }
}

/// Options for `list_tools`.
#[derive(Debug, Clone)]
pub struct ListToolsOptions {
    /// Allow the interactive OAuth flow when the server demands it.
    pub auto_authorize: bool,
    /// Include input/output schemas in the result.
    pub include_schema: bool,
}

impl Default for ListToolsOptions {
    fn default() -> Self {
        Self {
            auto_authorize: true,
            include_schema: false,
        }
    }
}

type ContextSlot = Arc<Mutex<Option<Arc<ClientContext>>>>;

#[derive(Clone)]
struct ServerEntry {
    definition: ServerDefinition,
    slot: ContextSlot,
}

/// The control plane's connection cache and uniform tool surface.
pub struct McpRuntime {
    servers: RwLock<HashMap<String, ServerEntry>>,
    options: RuntimeOptions,
}

impl McpRuntime {
    pub fn new(options: RuntimeOptions) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            options,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RuntimeOptions::default())
    }

    /// Add or replace a definition. Replacing closes any cached context.
    pub async fn register_definition(
        &self,
        definition: ServerDefinition,
        overwrite: bool,
    ) -> McpResult<()> {
        // The map lock is never held across a slot lock.
        let replaced = {
            let mut servers = self.servers.write().await;
            if servers.contains_key(&definition.name) && !overwrite {
                return Err(McpError::invalid_config(format!(
                    "server '{}' is already registered",
                    definition.name
                )));
            }
            debug!(server = %definition.name, "Registered definition");
            servers.insert(
                definition.name.clone(),
                ServerEntry {
                    definition: definition.clone(),
                    slot: Arc::new(Mutex::new(None)),
                },
            )
        };
        if let Some(old) = replaced {
            if let Some(context) = old.slot.lock().await.take() {
                context.close().await;
            }
        }
        Ok(())
    }

    /// All registered definitions, sorted by name.
    pub async fn get_definitions(&self) -> Vec<ServerDefinition> {
        let servers = self.servers.read().await;
        let mut defs: Vec<ServerDefinition> =
            servers.values().map(|e| e.definition.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// The current (post-promotion) definition for a name.
    pub async fn get_definition(&self, name: &str) -> Option<ServerDefinition> {
        let servers = self.servers.read().await;
        servers.get(name).map(|e| e.definition.clone())
    }

    async fn entry(&self, name: &str) -> McpResult<ServerEntry> {
        let servers = self.servers.read().await;
        servers
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))
    }

    /// Get or build the context for an entry. Caller holds the slot lock.
    async fn ensure_context(
        &self,
        name: &str,
        slot: &mut Option<Arc<ClientContext>>,
        definition: &ServerDefinition,
        auto_authorize: bool,
    ) -> McpResult<Arc<ClientContext>> {
        if let Some(context) = slot.as_ref() {
            return Ok(Arc::clone(context));
        }
        let mut build = self.options.build.clone();
        if !auto_authorize {
            build.max_oauth_attempts = 0;
        }
        let context = Arc::new(context::build_client_context(definition, &build).await?);

        // A promoted definition replaces the stored one so later connects
        // skip the probe.
        if context.definition.auth != definition.auth {
            let mut servers = self.servers.write().await;
            if let Some(entry) = servers.get_mut(name) {
                entry.definition = context.definition.clone();
            }
            info!(server = %name, "Cached promoted definition");
        }

        *slot = Some(Arc::clone(&context));
        Ok(context)
    }

    async fn finish_ephemeral(
        &self,
        definition: &ServerDefinition,
        slot: &mut Option<Arc<ClientContext>>,
    ) {
        if definition.lifecycle == Lifecycle::Ephemeral {
            if let Some(context) = slot.take() {
                context.close().await;
            }
        }
    }

    /// List a server's tools, applying its filters.
    pub async fn list_tools(
        &self,
        name: &str,
        options: ListToolsOptions,
    ) -> McpResult<Vec<McpTool>> {
        let entry = self.entry(name).await?;
        let mut slot = entry.slot.lock().await;
        let context = self
            .ensure_context(name, &mut slot, &entry.definition, options.auto_authorize)
            .await?;

        let tools = match tokio::time::timeout(self.options.list_timeout, context.list_tools())
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                // Deadline expired: tear the transport down, children included.
                if let Some(context) = slot.take() {
                    context.close().await;
                }
                return Err(McpError::Timeout {
                    operation: format!("listing tools on '{name}'"),
                    after_ms: self.options.list_timeout.as_millis() as u64,
                });
            }
        };

        self.finish_ephemeral(&entry.definition, &mut slot).await;

        let mut tools = apply_tool_filters(tools, &entry.definition);
        if !options.include_schema {
            for tool in &mut tools {
                tool.input_schema = None;
                tool.output_schema = None;
            }
        }
        Ok(tools)
    }

    /// Invoke a tool and return the server's response, projected when the
    /// definition maps this tool.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        args: Option<serde_json::Value>,
    ) -> McpResult<ToolCallResult> {
        let entry = self.entry(name).await?;
        let mut slot = entry.slot.lock().await;
        let context = self
            .ensure_context(name, &mut slot, &entry.definition, true)
            .await?;

        let result =
            match tokio::time::timeout(self.options.call_timeout, context.call_tool(tool, args))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    if let Some(context) = slot.take() {
                        context.close().await;
                    }
                    return Err(McpError::Timeout {
                        operation: format!("calling '{tool}' on '{name}'"),
                        after_ms: self.options.call_timeout.as_millis() as u64,
                    });
                }
            };

        self.finish_ephemeral(&entry.definition, &mut slot).await;

        Ok(apply_result_mapping(&entry.definition, tool, result))
    }

    /// Close one cached context, or all of them.
    pub async fn close(&self, name: Option<&str>) -> McpResult<()> {
        match name {
            Some(name) => {
                let entry = self.entry(name).await?;
                if let Some(context) = entry.slot.lock().await.take() {
                    context.close().await;
                    debug!(server = %name, "Closed context");
                }
                Ok(())
            }
            None => {
                let entries: Vec<ServerEntry> = {
                    let servers = self.servers.read().await;
                    servers.values().cloned().collect()
                };
                for entry in entries {
                    if let Some(context) = entry.slot.lock().await.take() {
                        context.close().await;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Allow list wins over block list; names outside the allow list are
/// silently dropped.
fn apply_tool_filters(tools: Vec<McpTool>, definition: &ServerDefinition) -> Vec<McpTool> {
    if let Some(allowed) = &definition.allowed_tools {
        tools
            .into_iter()
            .filter(|t| allowed.contains(&t.name))
            .collect()
    } else if let Some(blocked) = &definition.blocked_tools {
        tools
            .into_iter()
            .filter(|t| !blocked.contains(&t.name))
            .collect()
    } else {
        tools
    }
}

/// Project JSON text content through the tool's configured pick paths.
fn apply_result_mapping(
    definition: &ServerDefinition,
    tool: &str,
    result: ToolCallResult,
) -> ToolCallResult {
    let Some(mapping) = definition.result_mapping.get(tool) else {
        return result;
    };
    if mapping.pick.is_empty() {
        return result;
    }
    let content = result
        .content
        .into_iter()
        .map(|item| match item {
            ToolContent::Text { text } => match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(value) => {
                    let projected = projection::project(&value, &mapping.pick);
                    match serde_json::to_string_pretty(&projected) {
                        Ok(text) => ToolContent::Text { text },
                        Err(_) => ToolContent::Text { text },
                    }
                }
                Err(_) => ToolContent::Text { text },
            },
            other => other,
        })
        .collect();
    ToolCallResult {
        content,
        is_error: result.is_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ResultMapping;
    use serde_json::json;

    fn tool(name: &str) -> McpTool {
        McpTool {
            name: name.to_string(),
            description: None,
            input_schema: Some(json!({"type": "object"})),
            output_schema: None,
        }
    }

    #[test]
    fn test_allow_list_wins_over_block_list() {
        let mut def = ServerDefinition::http("x", "https://x/mcp");
        def.allowed_tools = Some(vec!["keep".to_string()]);
        def.blocked_tools = Some(vec!["keep".to_string(), "other".to_string()]);

        let tools = apply_tool_filters(vec![tool("keep"), tool("other"), tool("third")], &def);
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["keep"]);
    }

    #[test]
    fn test_block_list_removes_names() {
        let mut def = ServerDefinition::http("x", "https://x/mcp");
        def.blocked_tools = Some(vec!["bad".to_string()]);

        let tools = apply_tool_filters(vec![tool("good"), tool("bad")], &def);
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["good"]);
    }

    #[test]
    fn test_no_filters_pass_through() {
        let def = ServerDefinition::http("x", "https://x/mcp");
        assert_eq!(apply_tool_filters(vec![tool("a"), tool("b")], &def).len(), 2);
    }

    #[test]
    fn test_result_mapping_projects_json_text() {
        let def = ServerDefinition::http("x", "https://x/mcp").with_result_mapping(
            "getUser",
            ResultMapping {
                pick: vec!["id".to_string(), "profile.email".to_string()],
            },
        );
        let result = ToolCallResult {
            content: vec![ToolContent::Text {
                text: json!({
                    "id": 1,
                    "profile": {"email": "a@b.c", "phone": "x"},
                    "noise": true
                })
                .to_string(),
            }],
            is_error: false,
        };

        let mapped = apply_result_mapping(&def, "getUser", result);
        let ToolContent::Text { text } = &mapped.content[0] else {
            panic!("expected text content");
        };
        let value: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(value, json!({"id": 1, "profile": {"email": "a@b.c"}}));
    }

    #[test]
    fn test_result_mapping_leaves_non_json_text() {
        let def = ServerDefinition::http("x", "https://x/mcp").with_result_mapping(
            "getUser",
            ResultMapping {
                pick: vec!["id".to_string()],
            },
        );
        let result = ToolCallResult {
            content: vec![ToolContent::Text {
                text: "plain prose".to_string(),
            }],
            is_error: false,
        };
        let mapped = apply_result_mapping(&def, "getUser", result);
        let ToolContent::Text { text } = &mapped.content[0] else {
            panic!("expected text content");
        };
        assert_eq!(text, "plain prose");
    }

    #[test]
    fn test_result_mapping_only_for_mapped_tool() {
        let def = ServerDefinition::http("x", "https://x/mcp").with_result_mapping(
            "other",
            ResultMapping {
                pick: vec!["id".to_string()],
            },
        );
        let text = json!({"id": 1, "extra": 2}).to_string();
        let result = ToolCallResult {
            content: vec![ToolContent::Text { text: text.clone() }],
            is_error: false,
        };
        let mapped = apply_result_mapping(&def, "getUser", result);
        let ToolContent::Text { text: out } = &mapped.content[0] else {
            panic!("expected text content");
        };
        assert_eq!(out, &text);
    }

    #[tokio::test]
    async fn test_register_and_get_roundtrip() {
        let runtime = McpRuntime::with_defaults();
        let def = ServerDefinition::http("a", "https://a/mcp");
        runtime.register_definition(def.clone(), false).await.unwrap();
        assert_eq!(runtime.get_definition("a").await.unwrap(), def);

        // Re-registering without overwrite is refused.
        assert!(runtime.register_definition(def.clone(), false).await.is_err());
        // With overwrite it replaces.
        let replacement = def.clone().with_oauth();
        runtime
            .register_definition(replacement.clone(), true)
            .await
            .unwrap();
        assert_eq!(runtime.get_definition("a").await.unwrap(), replacement);
    }

    #[tokio::test]
    async fn test_definitions_sorted() {
        let runtime = McpRuntime::with_defaults();
        for name in ["zeta", "alpha", "mid"] {
            runtime
                .register_definition(ServerDefinition::http(name, "https://x/mcp"), false)
                .await
                .unwrap();
        }
        let names: Vec<String> = runtime
            .get_definitions()
            .await
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_unknown_server_errors() {
        let runtime = McpRuntime::with_defaults();
        let err = runtime
            .list_tools("ghost", ListToolsOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound(_)));
        assert!(runtime.close(Some("ghost")).await.is_err());
    }

    #[tokio::test]
    async fn test_close_all_on_empty_runtime() {
        let runtime = McpRuntime::with_defaults();
        runtime.close(None).await.unwrap();
    }
}
