//! Session-scoped approval state and the per-call decision.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::{PermissionConfig, PermissionRequest, RiskKind};

/// Standing decision for one risk kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum KindState {
    /// Ask every time.
    #[default]
    Unset,
    SessionApproved,
    /// Only reachable through an explicit "reject and remember".
    SessionDenied,
}

/// Approval flags for one interactive session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPermissionFlags {
    pub all_operations: bool,
    pub per_kind: HashMap<RiskKind, KindState>,
}

impl SessionPermissionFlags {
    pub fn state(&self, kind: RiskKind) -> KindState {
        self.per_kind.get(&kind).copied().unwrap_or_default()
    }
}

impl From<&PermissionConfig> for SessionPermissionFlags {
    fn from(config: &PermissionConfig) -> Self {
        let mut per_kind = HashMap::new();
        for kind in &config.approve {
            per_kind.insert(*kind, KindState::SessionApproved);
        }
        for kind in &config.deny {
            per_kind.insert(*kind, KindState::SessionDenied);
        }
        Self {
            all_operations: config.auto_approve_all,
            per_kind,
        }
    }
}

/// Result of consulting the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny { reason: String },
    /// The caller must obtain a decision out of band.
    AskUser,
}

impl Decision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Decision::Approve)
    }
}

/// The caller's answer to an [`Decision::AskUser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserDecision {
    pub approved: bool,
    /// Apply this answer to every later call of the same kind.
    pub remember: bool,
}

impl UserDecision {
    pub fn once(approved: bool) -> Self {
        Self {
            approved,
            remember: false,
        }
    }

    pub fn always(approved: bool) -> Self {
        Self {
            approved,
            remember: true,
        }
    }
}

/// Decides whether a tool call may run.
///
/// Shared between the loop (reader) and the session's command surface
/// (writer). Holds no notion of interactive or headless operation.
#[derive(Debug, Default)]
pub struct PermissionGate {
    flags: RwLock<SessionPermissionFlags>,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate pre-seeded from configuration.
    pub fn from_config(config: &PermissionConfig) -> Self {
        Self {
            flags: RwLock::new(SessionPermissionFlags::from(config)),
        }
    }

    pub fn decide(&self, request: &PermissionRequest) -> Decision {
        let flags = self.read();
        if flags.all_operations {
            return Decision::Approve;
        }
        let decision = match flags.state(request.kind) {
            KindState::Unset => Decision::AskUser,
            KindState::SessionApproved => Decision::Approve,
            KindState::SessionDenied => Decision::Deny {
                reason: format!("{} is denied for this session", request.kind),
            },
        };
        debug!(tool = %request.tool, kind = %request.kind, ?decision, "permission decision");
        decision
    }

    /// Apply the caller's answer. Only remembered answers change state.
    pub fn record(&self, kind: RiskKind, decision: UserDecision) {
        if !decision.remember {
            return;
        }
        let state = if decision.approved {
            KindState::SessionApproved
        } else {
            KindState::SessionDenied
        };
        info!(%kind, ?state, "remembering permission");
        self.write().per_kind.insert(kind, state);
    }

    pub fn set_all_operations(&self, enabled: bool) {
        info!(enabled, "approve-all changed");
        self.write().all_operations = enabled;
    }

    /// Flip approve-all and return the new value.
    pub fn toggle_all_operations(&self) -> bool {
        let mut flags = self.write();
        flags.all_operations = !flags.all_operations;
        info!(enabled = flags.all_operations, "approve-all toggled");
        flags.all_operations
    }

    /// Every kind back to `Unset`, approve-all off.
    pub fn reset_session(&self) {
        info!("permission session reset");
        *self.write() = SessionPermissionFlags::default();
    }

    pub fn flags(&self) -> SessionPermissionFlags {
        self.read().clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionPermissionFlags> {
        self.flags.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionPermissionFlags> {
        self.flags.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
