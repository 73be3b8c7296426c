use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Coarse classification of what a tool can do to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskKind {
    BashExec,
    FileWrite,
    FileRead,
    NetworkCall,
    CapabilityCall,
}

impl RiskKind {
    pub const ALL: [RiskKind; 5] = [
        RiskKind::BashExec,
        RiskKind::FileWrite,
        RiskKind::FileRead,
        RiskKind::NetworkCall,
        RiskKind::CapabilityCall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskKind::BashExec => "bash-exec",
            RiskKind::FileWrite => "file-write",
            RiskKind::FileRead => "file-read",
            RiskKind::NetworkCall => "network-call",
            RiskKind::CapabilityCall => "capability-call",
        }
    }
}

impl fmt::Display for RiskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RiskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RiskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownKind(s.to_string()))
    }
}

/// A request to run one tool, as seen by the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRequest {
    pub kind: RiskKind,
    /// Registry name of the tool being called.
    pub tool: String,
    pub scope: Option<String>, // command, path, URL or server
}

impl PermissionRequest {
    pub fn new(kind: RiskKind, tool: impl Into<String>) -> Self {
        Self {
            kind,
            tool: tool.into(),
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn bash(tool: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(RiskKind::BashExec, tool).with_scope(command)
    }

    pub fn file_write(tool: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(RiskKind::FileWrite, tool).with_scope(path)
    }

    pub fn file_read(tool: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(RiskKind::FileRead, tool).with_scope(path)
    }

    pub fn network(tool: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(RiskKind::NetworkCall, tool).with_scope(url)
    }

    pub fn capability(tool: impl Into<String>, server: impl Into<String>) -> Self {
        Self::new(RiskKind::CapabilityCall, tool).with_scope(server)
    }
}

impl fmt::Display for PermissionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.tool, self.kind)?;
        if let Some(scope) = &self.scope {
            write!(f, ": {scope}")?;
        }
        Ok(())
    }
}
