//! Slash commands understood by the chat REPL.

use mcp::ServerConfig;

use crate::error::{Error, Result};

pub const HELP: &str = "\
Commands:
  /mcp list                          Show capability servers and their state
  /mcp add <name> <command> [args..] Connect a stdio server
  /mcp add-sse <name> <url>          Connect an SSE server
  /mcp remove <name>                 Disconnect a server
  /mcp reload                        Reconnect every server
  /approve-all                       Toggle approving every operation
  /permissions                       Show session permissions
  /reset                             Clear conversation and permissions
  /help                              Show this help
  /quit                              Exit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    McpList,
    McpAdd(ServerConfig),
    McpRemove(String),
    McpReload,
    ApproveAll,
    Permissions,
    Reset,
    Help,
    Quit,
}

/// Parse a REPL line. `None` means the line is a message for the model.
pub fn parse(line: &str) -> Option<Result<Command>> {
    let line = line.trim();
    if !line.starts_with('/') {
        return None;
    }
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    let parsed = match (command, args.as_slice()) {
        ("/quit" | "/exit" | "/q", _) => Ok(Command::Quit),
        ("/help" | "/h" | "/?", _) => Ok(Command::Help),
        ("/approve-all", []) => Ok(Command::ApproveAll),
        ("/permissions", []) => Ok(Command::Permissions),
        ("/reset" | "/clear", []) => Ok(Command::Reset),
        ("/mcp", rest) => parse_mcp(rest),
        (other, _) if is_known(other) => Err(usage(other)),
        (other, _) => Err(Error::Usage(format!(
            "unknown command {other}, try /help"
        ))),
    };
    Some(parsed)
}

fn parse_mcp(args: &[&str]) -> Result<Command> {
    match args {
        [] | ["list"] => Ok(Command::McpList),
        ["reload"] => Ok(Command::McpReload),
        ["remove", name] => Ok(Command::McpRemove(name.to_string())),
        ["add", name, command, rest @ ..] => Ok(Command::McpAdd(ServerConfig::stdio(
            *name,
            *command,
            rest.iter().copied(),
        ))),
        ["add-sse", name, url] => Ok(Command::McpAdd(ServerConfig::sse(*name, *url))),
        [sub, ..] => Err(Error::Usage(format!("bad /mcp {sub} usage, try /help"))),
    }
}

fn is_known(command: &str) -> bool {
    matches!(
        command,
        "/approve-all" | "/permissions" | "/reset" | "/clear"
    )
}

fn usage(command: &str) -> Error {
    Error::Usage(format!("{command} takes no arguments"))
}
