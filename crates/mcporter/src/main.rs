//! mcporter - command-line control plane for MCP servers.

use clap::{Parser, Subcommand};
use mcporter_mcp::definition::{self, ServerDefinition, Source};
use mcporter_mcp::error::ErrorKind;
use mcporter_mcp::runtime::{ListToolsOptions, McpRuntime, RuntimeOptions};
use mcporter_mcp::vault::{TokenVault, VaultScope};
use mcporter_mcp::ToolContent;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Env var suppressing the forced exit that defeats lingering child waiters.
const NO_FORCE_EXIT_ENV: &str = "MCPORTER_NO_FORCE_EXIT";

#[derive(Parser)]
#[command(name = "mcporter")]
#[command(author, version, about = "Command-line control plane for MCP servers", long_about = None)]
struct Cli {
    /// Path to a config file with an `mcpServers` map
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured servers and their status
    List,
    /// List the tools of one server (name or ad-hoc URL)
    Tools {
        /// Server name, or a bare URL for an unconfigured server
        server: String,
        /// Include input/output schemas
        #[arg(long)]
        schemas: bool,
    },
    /// Call a tool on a server
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },
    /// Run the interactive OAuth flow for a server
    Auth { server: String },
    /// Drop cached OAuth credentials for a server
    Logout { server: String },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        "mcporter=debug,mcporter_mcp=debug"
    } else {
        "mcporter=info,mcporter_mcp=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    let local = PathBuf::from("mcporter.json");
    if local.exists() {
        return Some(local);
    }
    let home = dirs::home_dir()?.join(".mcporter").join("mcporter.json");
    home.exists().then_some(home)
}

async fn load_definitions(cli: &Cli, runtime: &McpRuntime) -> anyhow::Result<()> {
    let Some(path) = config_path(cli) else {
        debug!("No config file found");
        return Ok(());
    };
    let json = tokio::fs::read_to_string(&path).await?;
    let defs = definition::parse_definitions(&json, &path.display().to_string())?;
    for def in defs {
        runtime.register_definition(def, true).await?;
    }
    Ok(())
}

/// Resolve a CLI server argument: a configured name, or a bare URL that
/// registers an ad-hoc definition on the fly.
async fn resolve_server(runtime: &McpRuntime, server: &str) -> anyhow::Result<String> {
    if runtime.get_definition(server).await.is_some() {
        return Ok(server.to_string());
    }
    if server.starts_with("http://") || server.starts_with("https://") {
        let name = url::host_name(server).unwrap_or_else(|| "adhoc".to_string());
        let def = ServerDefinition::http(&name, server).with_source(Source::adhoc());
        runtime.register_definition(def, true).await?;
        return Ok(name);
    }
    anyhow::bail!("unknown server '{server}' (not configured, not a URL)");
}

mod url {
    /// Hostname of a URL, for naming ad-hoc servers.
    pub fn host_name(url: &str) -> Option<String> {
        let rest = url.split_once("://")?.1;
        let host = rest.split(['/', ':', '?']).next()?;
        if host.is_empty() {
            None
        } else {
            Some(host.to_string())
        }
    }
}

/// Status label and exit code for a failed operation.
fn describe_failure(err: &mcporter_mcp::McpError) -> (String, i32) {
    match ErrorKind::of(err) {
        ErrorKind::Auth => ("auth required".to_string(), 3),
        ErrorKind::Offline => ("offline".to_string(), 4),
        ErrorKind::Http(code) => (format!("HTTP {code}"), 5),
        ErrorKind::Other => (err.to_string(), 1),
    }
}

async fn cmd_list(runtime: &McpRuntime) -> anyhow::Result<i32> {
    let defs = runtime.get_definitions().await;
    if defs.is_empty() {
        println!("No MCP servers configured.");
        return Ok(0);
    }

    println!("{:<20} {:<8} {}", "NAME", "TOOLS", "STATUS");
    println!("{}", "-".repeat(60));

    // All servers probed concurrently; list never authorizes interactively.
    let rows = futures::future::join_all(defs.iter().map(|def| async {
        let result = runtime
            .list_tools(
                &def.name,
                ListToolsOptions {
                    auto_authorize: false,
                    include_schema: false,
                },
            )
            .await;
        (def.name.clone(), result)
    }))
    .await;

    for (name, result) in rows {
        match result {
            Ok(tools) => println!("{:<20} {:<8} ok", name, tools.len()),
            Err(err) => {
                let (label, _) = describe_failure(&err);
                println!("{:<20} {:<8} {label}", name, "-");
            }
        }
    }
    runtime.close(None).await?;
    Ok(0)
}

async fn cmd_tools(runtime: &McpRuntime, server: &str, schemas: bool) -> anyhow::Result<i32> {
    let name = resolve_server(runtime, server).await?;
    let tools = runtime
        .list_tools(
            &name,
            ListToolsOptions {
                auto_authorize: true,
                include_schema: schemas,
            },
        )
        .await?;

    for tool in tools {
        match tool.description {
            Some(description) => println!("{:<30} {description}", tool.name),
            None => println!("{}", tool.name),
        }
        if schemas {
            if let Some(schema) = tool.input_schema {
                println!("  input:  {}", serde_json::to_string(&schema)?);
            }
            if let Some(schema) = tool.output_schema {
                println!("  output: {}", serde_json::to_string(&schema)?);
            }
        }
    }
    runtime.close(None).await?;
    Ok(0)
}

async fn cmd_call(
    runtime: &McpRuntime,
    server: &str,
    tool: &str,
    args: Option<String>,
) -> anyhow::Result<i32> {
    let name = resolve_server(runtime, server).await?;
    let args = match args {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };
    let result = runtime.call_tool(&name, tool, args).await?;

    for item in result.content {
        match item {
            ToolContent::Text { text } => println!("{text}"),
            other => println!("{}", serde_json::to_string(&other)?),
        }
    }
    runtime.close(None).await?;
    Ok(i32::from(result.is_error))
}

async fn cmd_auth(runtime: &McpRuntime, server: &str) -> anyhow::Result<i32> {
    let name = resolve_server(runtime, server).await?;
    let tools = runtime
        .list_tools(
            &name,
            ListToolsOptions {
                auto_authorize: true,
                include_schema: false,
            },
        )
        .await?;
    println!("✓ Authorized '{name}' ({} tools available)", tools.len());
    runtime.close(None).await?;
    Ok(0)
}

async fn cmd_logout(runtime: &McpRuntime, server: &str) -> anyhow::Result<i32> {
    let Some(def) = runtime.get_definition(server).await else {
        anyhow::bail!("unknown server '{server}'");
    };
    let vault = TokenVault::for_definition(&def);
    vault.clear(VaultScope::All).await?;
    println!("✓ Cleared OAuth credentials for '{server}' ({})", vault.describe());
    Ok(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = Arc::new(McpRuntime::new(RuntimeOptions::default()));
    load_definitions(&cli, &runtime).await?;

    let result = match &cli.command {
        Commands::List => cmd_list(&runtime).await,
        Commands::Tools { server, schemas } => cmd_tools(&runtime, server, *schemas).await,
        Commands::Call { server, tool, args } => {
            cmd_call(&runtime, server, tool, args.clone()).await
        }
        Commands::Auth { server } => cmd_auth(&runtime, server).await,
        Commands::Logout { server } => cmd_logout(&runtime, server).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(err) => {
            let code = match err.downcast_ref::<mcporter_mcp::McpError>() {
                Some(mcp_err) => {
                    let (label, code) = describe_failure(mcp_err);
                    eprintln!("error: {label}");
                    code
                }
                None => {
                    eprintln!("error: {err}");
                    1
                }
            };
            let _ = runtime.close(None).await;
            code
        }
    };

    // Stdio servers can leave waiters behind; force the exit unless asked
    // not to.
    if std::env::var_os(NO_FORCE_EXIT_ENV).is_none() {
        std::process::exit(code);
    }
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
