//! Capability server management.
//!
//! The manager owns every [`Connection`] and publishes the merged tool set
//! as an immutable [`ToolRegistry`] snapshot. Readers clone the `Arc` and
//! keep using it for a whole round; writers build a new registry and swap
//! it in with a single store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mcp::{CallToolResult, ConnectOptions, Connection, ConnectionState, DeadHook, ServerConfig};
use serde_json::Value;
use tracing::{info, warn};

use crate::tools::{LocalTool, Plugin, RegisteredTool, ToolRegistry, builtin_tools};
use crate::{Error, Result};

/// Status of one configured server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub name: String,
    pub transport: &'static str,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Name and version the server reported during the handshake.
    pub server: Option<String>,
}

/// Outcome of [`CapabilityManager::reload`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub connected: Vec<String>,
    /// Server name and the reason it failed to connect.
    pub failed: Vec<(String, String)>,
}

struct ServerEntry {
    config: ServerConfig,
    id: u64,
    connection: Option<Arc<Connection>>,
    connected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl ServerEntry {
    fn status(&self) -> ServerStatus {
        let (state, tool_count) = match &self.connection {
            Some(conn) => (conn.state(), conn.tools().len()),
            None => (ConnectionState::Dead, 0),
        };
        let server = self
            .connection
            .as_ref()
            .and_then(|conn| conn.server_info())
            .and_then(|info| info.server_info)
            .map(|info| match info.version {
                Some(version) => format!("{} {version}", info.name),
                None => info.name,
            });
        ServerStatus {
            name: self.config.name.clone(),
            transport: self.config.transport_kind(),
            state,
            tool_count,
            connected_at: self.connected_at,
            last_error: self.last_error.clone(),
            server,
        }
    }
}

struct Inner {
    local: Vec<Arc<dyn LocalTool>>,
    plugins: Vec<Plugin>,
    servers: Mutex<Vec<ServerEntry>>,
    registry: RwLock<Arc<ToolRegistry>>,
    next_id: AtomicU64,
    reloading: AtomicBool,
}

impl Inner {
    fn servers(&self) -> MutexGuard<'_, Vec<ServerEntry>> {
        self.servers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Build a fresh registry from the current table and publish it.
    ///
    /// Merge order: local tools, then servers in configured order, then
    /// plugins. Dead connections contribute nothing.
    fn rebuild(&self) {
        let mut tools: Vec<RegisteredTool> = self
            .local
            .iter()
            .cloned()
            .map(RegisteredTool::local)
            .collect();

        {
            let servers = self.servers();
            for entry in servers.iter() {
                let Some(conn) = &entry.connection else {
                    continue;
                };
                if conn.state() == ConnectionState::Dead {
                    continue;
                }
                for tool in conn.tools() {
                    tools.push(RegisteredTool::capability(&entry.config.name, &tool));
                }
            }
        }

        for plugin in &self.plugins {
            for tool in plugin.tools() {
                tools.push(RegisteredTool::plugin(&plugin.name, Arc::clone(tool)));
            }
        }

        let registry = Arc::new(ToolRegistry::new(tools));
        match self.registry.write() {
            Ok(mut slot) => *slot = registry,
            Err(poisoned) => *poisoned.into_inner() = registry,
        }
    }

    /// Connections that are not (or no longer) in the table are ignored.
    fn connection_died(&self, name: &str, id: u64, reason: &str) {
        {
            let mut servers = self.servers();
            let Some(entry) = servers.iter_mut().find(|e| e.id == id) else {
                return;
            };
            entry.last_error = Some(reason.to_string());
        }
        warn!(server = %name, %reason, "removing tools of dead capability server");
        if !self.reloading.load(Ordering::SeqCst) {
            self.rebuild();
        }
    }
}

/// Builder for a [`CapabilityManager`].
#[derive(Default)]
pub struct CapabilityManagerBuilder {
    local: Vec<Arc<dyn LocalTool>>,
    plugins: Vec<Plugin>,
    servers: Vec<ServerConfig>,
    options: ConnectOptions,
}

impl CapabilityManagerBuilder {
    pub fn local_tool(mut self, tool: Arc<dyn LocalTool>) -> Self {
        self.local.push(tool);
        self
    }

    /// Register `bash`, `read_file`, `write_file` and `list_dir`.
    pub fn builtin_tools(mut self) -> Self {
        self.local.extend(builtin_tools());
        self
    }

    pub fn plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Servers to connect on the first [`CapabilityManager::reload`].
    /// A name that is already taken is skipped.
    pub fn servers(mut self, servers: impl IntoIterator<Item = ServerConfig>) -> Self {
        self.servers.extend(servers);
        self
    }

    pub fn connect_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> CapabilityManager {
        let inner = Arc::new(Inner {
            local: self.local,
            plugins: self.plugins,
            servers: Mutex::new(Vec::new()),
            registry: RwLock::new(Arc::new(ToolRegistry::default())),
            next_id: AtomicU64::new(1),
            reloading: AtomicBool::new(false),
        });
        {
            let mut servers = inner.servers();
            for config in self.servers {
                if servers.iter().any(|e| e.config.name == config.name) {
                    warn!(server = %config.name, "ignoring duplicate server config");
                    continue;
                }
                let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
                servers.push(ServerEntry {
                    config,
                    id,
                    connection: None,
                    connected_at: None,
                    last_error: Some("not connected".to_string()),
                });
            }
        }
        inner.rebuild();
        CapabilityManager {
            inner,
            admin: tokio::sync::Mutex::new(()),
            options: self.options,
        }
    }
}

/// Owns the capability servers and the tool registry seen by the loop.
pub struct CapabilityManager {
    inner: Arc<Inner>,
    /// Serializes add/remove/reload/shutdown.
    admin: tokio::sync::Mutex<()>,
    options: ConnectOptions,
}

impl CapabilityManager {
    pub fn builder() -> CapabilityManagerBuilder {
        CapabilityManagerBuilder::default()
    }

    /// Current tool snapshot. Never torn: it reflects a settled table.
    pub fn get_tools(&self) -> Arc<ToolRegistry> {
        match self.inner.registry.read() {
            Ok(registry) => Arc::clone(&registry),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Connect a new server and merge its tools.
    ///
    /// Nothing changes if the name is taken or the connection fails.
    pub async fn add_server(&self, config: ServerConfig) -> Result<ServerStatus> {
        let _admin = self.admin.lock().await;
        config.validate()?;
        if self.inner.servers().iter().any(|e| e.config.name == config.name) {
            return Err(Error::DuplicateServer(config.name));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = self.connect(&config, id).await?;
        let entry = ServerEntry {
            config,
            id,
            connection: Some(Arc::new(connection)),
            connected_at: Some(Utc::now()),
            last_error: None,
        };
        let status = entry.status();
        self.inner.servers().push(entry);
        self.inner.rebuild();

        info!(server = %status.name, tools = status.tool_count, "capability server added");
        Ok(status)
    }

    /// Disconnect a server and drop its tools in one registry swap.
    ///
    /// Calls still in flight on it fail with "connection lost".
    pub async fn remove_server(&self, name: &str) -> Result<()> {
        let _admin = self.admin.lock().await;
        let entry = {
            let mut servers = self.inner.servers();
            let index = servers
                .iter()
                .position(|e| e.config.name == name)
                .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
            servers.remove(index)
        };
        self.inner.rebuild();

        if let Some(conn) = entry.connection {
            conn.close();
        }
        info!(server = %name, "capability server removed");
        Ok(())
    }

    /// Close and reconnect every configured server, one after another,
    /// then publish the new registry once.
    ///
    /// Servers that fail stay configured and contribute no tools.
    pub async fn reload(&self) -> Result<ReloadReport> {
        let _admin = self.admin.lock().await;
        self.inner.reloading.store(true, Ordering::SeqCst);

        let configs: Vec<ServerConfig> = {
            let servers = self.inner.servers();
            for entry in servers.iter() {
                if let Some(conn) = &entry.connection {
                    conn.close();
                }
            }
            servers.iter().map(|e| e.config.clone()).collect()
        };

        let mut report = ReloadReport::default();
        let mut entries = Vec::with_capacity(configs.len());
        for config in configs {
            let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
            let mut entry = ServerEntry {
                config,
                id,
                connection: None,
                connected_at: None,
                last_error: None,
            };
            match self.connect(&entry.config, id).await {
                Ok(conn) => {
                    report.connected.push(entry.config.name.clone());
                    entry.connection = Some(Arc::new(conn));
                    entry.connected_at = Some(Utc::now());
                }
                Err(e) => {
                    warn!(server = %entry.config.name, "reconnect failed: {e}");
                    report.failed.push((entry.config.name.clone(), e.to_string()));
                    entry.last_error = Some(e.to_string());
                }
            }
            entries.push(entry);
        }

        *self.inner.servers() = entries;
        self.inner.reloading.store(false, Ordering::SeqCst);
        self.inner.rebuild();

        info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            "capability servers reloaded"
        );
        Ok(report)
    }

    /// Call `tool` on `server` (the tool's own name, not the namespaced one).
    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<CallToolResult> {
        let connection = {
            let servers = self.inner.servers();
            let entry = servers
                .iter()
                .find(|e| e.config.name == server)
                .ok_or_else(|| Error::ServerNotFound(server.to_string()))?;
            entry.connection.clone()
        };
        let Some(connection) = connection else {
            return Err(mcp::Error::ConnectionLost(format!("server '{server}' is not connected")).into());
        };
        Ok(connection.invoke(tool, arguments, timeout).await?)
    }

    /// Status of every configured server, in configured order.
    pub fn servers(&self) -> Vec<ServerStatus> {
        self.inner.servers().iter().map(ServerEntry::status).collect()
    }

    /// Close every connection. Servers stay configured.
    pub async fn shutdown(&self) {
        let _admin = self.admin.lock().await;
        {
            let mut servers = self.inner.servers();
            for entry in servers.iter_mut() {
                if let Some(conn) = entry.connection.take() {
                    conn.close();
                }
            }
        }
        self.inner.rebuild();
        info!("capability servers shut down");
    }

    async fn connect(&self, config: &ServerConfig, id: u64) -> Result<Connection> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let name = config.name.clone();
        let hook: DeadHook = Box::new(move |reason| {
            if let Some(inner) = weak.upgrade() {
                inner.connection_died(&name, id, &reason);
            }
        });
        Ok(Connection::connect_with_hook(config.clone(), self.options, Some(hook)).await?)
    }
}

impl std::fmt::Debug for CapabilityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityManager")
            .field("servers", &self.servers())
            .field("tools", &self.get_tools().len())
            .finish()
    }
}
