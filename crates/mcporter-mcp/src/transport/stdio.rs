//! Stdio transport: a local subprocess speaking line-delimited JSON-RPC.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Env var enabling per-frame tracing.
pub const STDIO_TRACE_ENV: &str = "MCPORTER_STDIO_TRACE";
/// Env var passing the child's stderr through to the terminal.
pub const STDIO_LOGS_ENV: &str = "MCPORTER_STDIO_LOGS";

/// Grace period between stdin EOF and force-kill.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Spawn parameters, with env already resolved and blanks filtered.
#[derive(Debug, Clone)]
pub struct StdioTransportConfig {
    pub server_name: String,
    pub exe: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Merged over the parent environment.
    pub env: HashMap<String, String>,
}

struct StdioInner {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Transport over a spawned child process.
pub struct StdioTransport {
    server_name: String,
    inner: Mutex<Option<StdioInner>>,
    connected: AtomicBool,
    trace: bool,
}

impl StdioTransport {
    /// Spawn the server process.
    pub fn spawn(config: StdioTransportConfig) -> McpResult<Self> {
        let mut command = Command::new(&config.exe);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        if std::env::var_os(STDIO_LOGS_ENV).is_some() {
            command.stderr(Stdio::inherit());
        } else {
            command.stderr(Stdio::null());
        }

        let mut child = command.spawn().map_err(|e| {
            McpError::ProcessError(format!(
                "failed to spawn '{}' for server '{}': {e}",
                config.exe, config.server_name
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::ProcessError("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| McpError::ProcessError("child stdout unavailable".to_string()))?;

        debug!(server = %config.server_name, exe = %config.exe, "Spawned stdio server");

        Ok(Self {
            server_name: config.server_name,
            inner: Mutex::new(Some(StdioInner {
                child,
                stdin,
                stdout,
            })),
            connected: AtomicBool::new(false),
            trace: std::env::var_os(STDIO_TRACE_ENV).is_some(),
        })
    }

    async fn write_frame(&self, inner: &mut StdioInner, frame: &str) -> McpResult<()> {
        if self.trace {
            debug!(server = %self.server_name, frame, "stdio >>");
        }
        inner.stdin.write_all(frame.as_bytes()).await?;
        inner.stdin.write_all(b"\n").await?;
        inner.stdin.flush().await?;
        Ok(())
    }

    /// Read frames until the response matching `id` arrives. Server-initiated
    /// notifications and requests are skipped.
    async fn read_response(&self, inner: &mut StdioInner, id: u64) -> McpResult<JsonRpcResponse> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = inner.stdout.read_line(&mut line).await?;
            if n == 0 {
                self.connected.store(false, Ordering::SeqCst);
                return Err(McpError::ProcessError(format!(
                    "server '{}' closed its stdout",
                    self.server_name
                )));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if self.trace {
                debug!(server = %self.server_name, frame = trimmed, "stdio <<");
            }
            let value: serde_json::Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(e) => {
                    warn!(server = %self.server_name, error = %e, "Skipping unparseable frame");
                    continue;
                }
            };
            if value.get("id").and_then(serde_json::Value::as_u64) == Some(id)
                && value.get("method").is_none()
            {
                return Ok(serde_json::from_value(value)?);
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or_else(|| {
            McpError::connection_failed(format!("server '{}' is closed", self.server_name))
        })?;
        let frame = serde_json::to_string(&request)?;
        self.write_frame(inner, &frame).await?;
        let response = self.read_response(inner, request.id).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(response)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or_else(|| {
            McpError::connection_failed(format!("server '{}' is closed", self.server_name))
        })?;
        let frame = serde_json::to_string(&notification)?;
        self.write_frame(inner, &frame).await
    }

    async fn close(&self) -> McpResult<()> {
        let Some(inner) = self.inner.lock().await.take() else {
            return Ok(());
        };
        self.connected.store(false, Ordering::SeqCst);

        let StdioInner {
            mut child, stdin, ..
        } = inner;
        // Stdin EOF is the graceful shutdown signal for stdio servers.
        drop(stdin);
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(_) => {
                debug!(server = %self.server_name, "Stdio server exited");
            }
            Err(_) => {
                kill_tree(&mut child).await;
                debug!(server = %self.server_name, "Stdio server force-killed");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn kill_tree(child: &mut Child) {
    #[cfg(windows)]
    if let Some(pid) = child.id() {
        // Windows has no process groups to signal; take the tree down.
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output();
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(exe: &str, args: Vec<&str>) -> StdioTransportConfig {
        StdioTransportConfig {
            server_name: "test".to_string(),
            exe: exe.to_string(),
            args: args.into_iter().map(str::to_string).collect(),
            cwd: None,
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let result = StdioTransport::spawn(config("definitely-not-a-real-binary", vec![]));
        assert!(matches!(result, Err(McpError::ProcessError(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_is_graceful_and_idempotent() {
        // `cat` exits on stdin EOF, exercising the graceful path.
        let transport = StdioTransport::spawn(config("cat", vec![])).unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_after_close_fails() {
        let transport = StdioTransport::spawn(config("cat", vec![])).unwrap();
        transport.close().await.unwrap();
        let result = transport
            .request(JsonRpcRequest::new(1, "tools/list", None))
            .await;
        assert!(matches!(result, Err(McpError::ConnectionFailed(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_kills_stubborn_child() {
        // Ignores stdin EOF; must be force-killed within the grace window.
        let transport =
            StdioTransport::spawn(config("sh", vec!["-c", "trap '' TERM; sleep 60"])).unwrap();
        let started = std::time::Instant::now();
        transport.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_finish_auth_unsupported() {
        let transport = StdioTransport::spawn(config("cat", vec![]));
        if let Ok(transport) = transport {
            assert!(transport.finish_auth("code").await.is_err());
            transport.close().await.unwrap();
        }
    }
}
