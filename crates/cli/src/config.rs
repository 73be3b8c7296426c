//! Configuration loading from coxswain.toml.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use mcp::ServerConfig;
use policy::PermissionConfig;
use runtime::AgentConfig;
use serde::Deserialize;

pub const CONFIG_FILE: &str = "coxswain.toml";
pub const MCP_JSON_FILE: &str = ".mcp.json";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub agent: AgentSettings,

    /// Startup permission flags.
    #[serde(default)]
    pub permissions: PermissionConfig,

    /// Capability servers connected at startup.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Backend provider configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Provider name (currently only "anthropic" supported).
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Anthropic API key. `ANTHROPIC_API_KEY` takes precedence.
    pub api_key: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// System prompt sent with every request.
    pub system: Option<String>,

    /// API root for a proxy or gateway. `ANTHROPIC_BASE_URL` takes precedence.
    pub base_url: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            max_tokens: default_max_tokens(),
            system: None,
            base_url: None,
        }
    }
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

/// Loop limits, in config-file units.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentSettings {
    pub max_rounds: u32,
    pub tool_timeout_secs: u64,
    pub provider_timeout_secs: u64,
    pub max_concurrent_tools: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        let defaults = AgentConfig::default();
        Self {
            max_rounds: defaults.max_rounds,
            tool_timeout_secs: defaults.tool_timeout.as_secs(),
            provider_timeout_secs: defaults.provider_timeout.as_secs(),
            max_concurrent_tools: defaults.max_concurrent_tools,
        }
    }
}

impl AgentSettings {
    pub fn to_agent_config(&self) -> AgentConfig {
        AgentConfig {
            max_rounds: self.max_rounds,
            tool_timeout: Duration::from_secs(self.tool_timeout_secs),
            provider_timeout: Duration::from_secs(self.provider_timeout_secs),
            max_concurrent_tools: self.max_concurrent_tools,
        }
    }
}

/// One entry of `.mcp.json`'s `mcpServers` object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum McpJsonServer {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
    },
}

#[derive(Debug, Deserialize)]
struct McpJson {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: BTreeMap<String, McpJsonServer>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load `path` if given, else `coxswain.toml` when present, else defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(CONFIG_FILE).exists() => Self::load(CONFIG_FILE),
            None => Ok(Self::default()),
        }
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.provider != "anthropic" {
            return Err(ConfigError::Invalid(format!(
                "unsupported provider '{}'",
                self.backend.provider
            )));
        }
        if let Some(url) = &self.backend.base_url
            && let Err(e) = reqwest::Url::parse(url)
        {
            return Err(ConfigError::Invalid(format!("backend.base_url '{url}': {e}")));
        }
        if self.agent.max_concurrent_tools == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_concurrent_tools must be at least 1".into(),
            ));
        }
        self.permissions.validate()?;
        let mut names = HashSet::new();
        for server in &self.servers {
            server
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "server '{}' is configured twice",
                    server.name
                )));
            }
        }
        Ok(())
    }

    /// Apply environment overrides; `var` looks a variable up.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("ANTHROPIC_API_KEY").filter(|k| !k.is_empty()) {
            self.backend.api_key = Some(key);
        }
        if let Some(model) = var("COXSWAIN_MODEL").filter(|m| !m.is_empty()) {
            self.backend.model = model;
        }
        if let Some(url) = var("ANTHROPIC_BASE_URL").filter(|u| !u.is_empty()) {
            self.backend.base_url = Some(url);
        }
    }

    /// Merge servers from a `.mcp.json` file if it exists. Its entries
    /// replace same-named servers from the TOML file.
    pub fn merge_mcp_json(&mut self, path: impl AsRef<Path>) -> Result<usize, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(path)?;
        let parsed: McpJson = serde_json::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;

        let count = parsed.mcp_servers.len();
        for (name, entry) in parsed.mcp_servers {
            let server = match entry {
                McpJsonServer::Stdio { command, args, env } => {
                    let mut server = ServerConfig::stdio(&name, command, args);
                    if let mcp::TransportConfig::Stdio { env: slot, .. } = &mut server.transport {
                        *slot = env;
                    }
                    server
                }
                McpJsonServer::Sse { url } => ServerConfig::sse(&name, url),
            };
            server
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            match self.servers.iter_mut().find(|s| s.name == name) {
                Some(existing) => *existing = server,
                None => self.servers.push(server),
            }
        }
        Ok(count)
    }

    pub fn api_key(&self) -> Result<&str, ConfigError> {
        self.backend
            .api_key
            .as_deref()
            .ok_or(ConfigError::MissingApiKey)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Permissions(#[from] policy::Error),

    #[error("no API key: set ANTHROPIC_API_KEY or backend.api_key")]
    MissingApiKey,
}
