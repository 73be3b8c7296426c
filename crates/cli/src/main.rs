mod commands;
mod config;
mod error;
mod prompt;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mcp::ConnectionState;
use policy::{KindState, PermissionConfig, PermissionGate, RiskKind};
use runtime::{
    Agent, AnthropicBackend, CapabilityManager, EventStream, RejectAll, ServerStatus, ToolResult,
    TurnEvent, TurnOutcome, event_channel,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use commands::Command;
use config::{Config, MCP_JSON_FILE};
use error::{Error, Result};
use prompt::{Input, StdinApprover};

const SYSTEM_PROMPT: &str = "You are Coxswain, a coding assistant working in the user's \
project directory. Use the available tools to inspect and change files. Be concise and direct.";

#[derive(Parser)]
#[command(name = "coxswain")]
#[command(about = "A terminal coding agent with pluggable capability servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: ./coxswain.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Model to use, overriding config and COXSWAIN_MODEL
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// API root for a proxy or gateway
    #[arg(short = 'u', long, global = true)]
    base_url: Option<String>,

    /// Working directory for tools and config discovery
    #[arg(short = 'd', long, global = true)]
    directory: Option<PathBuf>,

    /// Maximum model rounds per turn
    #[arg(long, global = true)]
    max_rounds: Option<u32>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat,
    /// Run a single prompt without asking for permissions
    Run {
        #[arg(short, long)]
        prompt: String,
    },
    /// Connect the configured capability servers and list their tools
    Servers,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<i32> {
    if let Some(dir) = &cli.directory {
        std::env::set_current_dir(dir).map_err(|e| {
            Error::Usage(format!("cannot change directory to {}: {e}", dir.display()))
        })?;
    }
    let mut config = Config::discover(cli.config.as_deref())?;
    config.apply_env(|name| std::env::var(name).ok());
    let merged = config.merge_mcp_json(MCP_JSON_FILE)?;
    if merged > 0 {
        info!(servers = merged, "merged {MCP_JSON_FILE}");
    }
    if let Some(model) = cli.model {
        config.backend.model = model;
    }
    if let Some(max_rounds) = cli.max_rounds {
        config.agent.max_rounds = max_rounds;
    }
    if let Some(url) = cli.base_url {
        config.backend.base_url = Some(url);
    }
    config.validate()?;

    match cli.command {
        Some(Commands::Chat) | None => cmd_chat(config).await.map(|()| 0),
        Some(Commands::Run { prompt }) => cmd_run(config, &prompt).await,
        Some(Commands::Servers) => cmd_servers(config).await.map(|()| 0),
    }
}

fn backend(config: &Config) -> Result<AnthropicBackend> {
    let system = config.backend.system.as_deref().unwrap_or(SYSTEM_PROMPT);
    let mut builder = AnthropicBackend::builder(config.api_key()?, &config.backend.model)
        .max_tokens(config.backend.max_tokens)
        .system(system);
    if let Some(url) = &config.backend.base_url {
        builder = builder.base_url(url);
    }
    Ok(builder.build())
}

/// Build the manager and connect every configured server.
async fn capabilities(config: &Config) -> Result<Arc<CapabilityManager>> {
    let manager = CapabilityManager::builder()
        .builtin_tools()
        .servers(config.servers.iter().cloned())
        .build();
    if !config.servers.is_empty() {
        let report = manager.reload().await?;
        for (name, reason) in &report.failed {
            eprintln!("warning: capability server '{name}' failed to connect: {reason}");
        }
    }
    Ok(Arc::new(manager))
}

async fn cmd_chat(config: Config) -> Result<()> {
    let backend = backend(&config)?;
    println!("coxswain v{}", env!("CARGO_PKG_VERSION"));
    println!("Model: {}", config.backend.model);

    let capabilities = capabilities(&config).await?;
    let gate = Arc::new(PermissionGate::from_config(&config.permissions));
    let input = Arc::new(Input::stdin());
    let approver = Arc::new(StdinApprover::new(Arc::clone(&input)));

    let mut agent = Agent::new(
        backend,
        Arc::clone(&capabilities),
        Arc::clone(&gate),
        approver,
        config.agent.to_agent_config(),
    );

    println!(
        "{} tools available. Type /help for commands, Ctrl+C to interrupt, Ctrl+D to exit.\n",
        capabilities.get_tools().len()
    );

    loop {
        // SIGINT stops exiting the process once a turn installs a handler.
        let read = tokio::select! {
            line = input.read_line("> ") => line?,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n(type /quit or press Ctrl+D to exit)");
                continue;
            }
        };
        let Some(line) = read else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match commands::parse(line) {
            Some(Ok(Command::Quit)) => break,
            Some(Ok(command)) => {
                if let Err(e) = handle_command(command, &mut agent, &capabilities).await {
                    eprintln!("Error: {e}");
                }
            }
            Some(Err(e)) => eprintln!("{e}"),
            None => {
                let outcome = drive_turn(&mut agent, line, true).await;
                if let TurnOutcome::Aborted { reason } = &outcome {
                    eprintln!("\n[turn aborted: {reason}]");
                }
                println!();
            }
        }
    }

    capabilities.shutdown().await;
    println!("\nSession ended.");
    Ok(())
}

/// Run one turn with Ctrl-C wired to cancellation.
async fn drive_turn(
    agent: &mut Agent<AnthropicBackend>,
    text: &str,
    show_tools: bool,
) -> TurnOutcome {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let (sink, events) = event_channel();
    let printer = tokio::spawn(print_events(events, show_tools));
    let outcome = agent.process_turn(text, sink, cancel).await;
    watcher.abort();
    if let Err(e) = printer.await {
        warn!("event printer failed: {e}");
    }
    outcome
}

async fn print_events(mut events: EventStream, show_tools: bool) {
    let mut stdout = io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            TurnEvent::ContentDelta(text) => {
                print!("{text}");
                let _ = stdout.flush();
            }
            TurnEvent::ToolCallsRequested(calls) if show_tools => {
                for call in calls {
                    eprintln!("\n-> {} {}", call.name, call.input);
                }
            }
            TurnEvent::ToolResult(result) if show_tools => match &result {
                ToolResult::Success { output, .. } => {
                    let first = output.lines().next().unwrap_or_default();
                    eprintln!("<- ok: {first}");
                }
                ToolResult::Failure { error, .. } => eprintln!("<- failed: {error}"),
            },
            TurnEvent::RoundLimitExceeded { rounds } => {
                eprintln!("\n[stopped after {rounds} rounds]");
            }
            _ => {}
        }
    }
}

async fn handle_command(
    command: Command,
    agent: &mut Agent<AnthropicBackend>,
    capabilities: &CapabilityManager,
) -> Result<()> {
    match command {
        Command::McpList => {
            let servers = capabilities.servers();
            if servers.is_empty() {
                println!("No capability servers configured.");
            }
            for status in &servers {
                print_server(status);
            }
        }
        Command::McpAdd(server) => {
            let status = capabilities.add_server(server).await?;
            println!("Connected '{}' ({} tools).", status.name, status.tool_count);
        }
        Command::McpRemove(name) => {
            capabilities.remove_server(&name).await?;
            println!("Removed '{name}'.");
        }
        Command::McpReload => {
            let report = capabilities.reload().await?;
            println!("Reconnected {} server(s).", report.connected.len());
            for (name, reason) in report.failed {
                println!("  {name}: {reason}");
            }
        }
        Command::ApproveAll => {
            let enabled = agent.gate().toggle_all_operations();
            println!(
                "Approve-all {}.",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        Command::Permissions => {
            let flags = agent.gate().flags();
            println!("approve-all: {}", flags.all_operations);
            for kind in RiskKind::ALL {
                let state = match flags.state(kind) {
                    KindState::Unset => "ask",
                    KindState::SessionApproved => "approved",
                    KindState::SessionDenied => "denied",
                };
                println!("  {kind:<16} {state}");
            }
        }
        Command::Reset => {
            agent.clear();
            println!("Conversation and permissions cleared.");
        }
        Command::Help => println!("{}", commands::HELP),
        Command::Quit => {}
    }
    Ok(())
}

fn print_server(status: &ServerStatus) {
    let since = status
        .connected_at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into());
    println!(
        "{:<20} {:<6} {:<9} {:>3} tools  since {since}  {}",
        status.name,
        status.transport,
        status.state,
        status.tool_count,
        status.server.as_deref().unwrap_or_default()
    );
    if status.state == ConnectionState::Dead
        && let Some(error) = &status.last_error
    {
        println!("{:<20} last error: {error}", "");
    }
}

async fn cmd_run(config: Config, prompt: &str) -> Result<i32> {
    let backend = backend(&config)?;
    let capabilities = capabilities(&config).await?;
    let gate = Arc::new(PermissionGate::from_config(&PermissionConfig::headless()));

    let mut agent = Agent::new(
        backend,
        Arc::clone(&capabilities),
        gate,
        Arc::new(RejectAll),
        config.agent.to_agent_config(),
    );

    let outcome = drive_turn(&mut agent, prompt, false).await;
    println!();
    capabilities.shutdown().await;

    Ok(match outcome {
        TurnOutcome::Done => 0,
        TurnOutcome::Aborted { reason } => {
            eprintln!("aborted: {reason}");
            1
        }
        TurnOutcome::RoundLimitExceeded { .. } => 1,
    })
}

async fn cmd_servers(config: Config) -> Result<()> {
    if config.servers.is_empty() {
        println!("No capability servers configured.");
        return Ok(());
    }
    let capabilities = capabilities(&config).await?;
    for status in capabilities.servers() {
        print_server(&status);
    }

    println!();
    for tool in capabilities.get_tools().definitions() {
        if let runtime::ToolOrigin::Capability { .. } = tool.origin {
            println!("{:<32} {}", tool.name, tool.description);
        }
    }
    capabilities.shutdown().await;
    Ok(())
}
