//! Permission configuration loaded from TOML.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, RiskKind};

/// Startup permissions, read from the `[permissions]` table.
///
/// ```toml
/// [permissions]
/// auto_approve_all = false
/// approve = ["file-read"]
/// deny = ["network-call"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionConfig {
    /// Approve every operation without asking.
    #[serde(default)]
    pub auto_approve_all: bool,

    /// Kinds approved for the whole session.
    #[serde(default)]
    pub approve: BTreeSet<RiskKind>,

    /// Kinds denied for the whole session.
    #[serde(default)]
    pub deny: BTreeSet<RiskKind>,
}

impl PermissionConfig {
    /// Load permissions from a TOML file containing just the table body.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse permissions from a TOML string.
    pub fn parse(toml: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml).map_err(|e| Error::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Headless callers approve everything up front.
    pub fn headless() -> Self {
        Self {
            auto_approve_all: true,
            ..Default::default()
        }
    }

    /// A kind may not be both approved and denied.
    pub fn validate(&self) -> Result<()> {
        if let Some(kind) = self.approve.intersection(&self.deny).next() {
            return Err(Error::Invalid(format!(
                "{kind} is listed in both approve and deny"
            )));
        }
        Ok(())
    }
}
