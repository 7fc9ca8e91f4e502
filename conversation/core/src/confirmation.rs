//! Confirmation Workflow
//!
//! With confirmation mode on, an agent that produced actions stops before
//! executing them and sets [`AgentStatus::WaitingForConfirmation`]. The
//! caller then either runs again (implicit approval) or rejects the pending
//! actions, which records a `UserRejectObservation` for each.
//!
//! The policy decides which actions need approval; confirmation mode is
//! simply "the policy is not [`ConfirmationPolicy::NeverConfirm`]".

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::events::{Event, EventKind, SecurityRisk};
use crate::state::{AgentStatus, ConversationState, StateError, StateFields};

/// Tool whose sole invocation ends a run; it never needs approval
pub const FINISH_TOOL_NAME: &str = "finish";

/// Which actions require user approval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ConfirmationPolicy {
    /// Run everything without asking
    #[default]
    NeverConfirm,
    /// Ask before every action
    AlwaysConfirm,
    /// Ask for actions at or above `threshold`
    ConfirmRisky {
        /// Lowest risk that needs approval
        threshold: SecurityRisk,
        /// Whether unassessed actions need approval
        confirm_unknown: bool,
    },
}

impl ConfirmationPolicy {
    /// Whether an action of the given risk needs approval
    #[must_use]
    pub fn should_confirm(&self, risk: SecurityRisk) -> bool {
        match self {
            Self::NeverConfirm => false,
            Self::AlwaysConfirm => true,
            Self::ConfirmRisky {
                threshold,
                confirm_unknown,
            } => match risk {
                SecurityRisk::Unknown => *confirm_unknown,
                known => known >= *threshold,
            },
        }
    }

    /// Whether this policy can ever pause a run
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::NeverConfirm)
    }

    /// Policy equivalent to a plain on/off confirmation mode
    #[must_use]
    pub fn from_mode(enabled: bool) -> Self {
        if enabled {
            Self::AlwaysConfirm
        } else {
            Self::NeverConfirm
        }
    }
}

impl fmt::Display for ConfirmationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeverConfirm => write!(f, "never confirm"),
            Self::AlwaysConfirm => write!(f, "always confirm"),
            Self::ConfirmRisky { threshold, .. } => write!(f, "confirm risk >= {threshold:?}"),
        }
    }
}

/// Whether `actions` must wait for approval under `fields`
#[must_use]
pub fn requires_confirmation(fields: &StateFields, actions: &[Event]) -> bool {
    if !fields.confirmation_mode {
        return false;
    }
    if let [only] = actions {
        if only.tool_name() == Some(FINISH_TOOL_NAME) {
            return false;
        }
    }
    // Mode switched on without a policy (legacy snapshots) confirms everything
    let policy = match fields.confirmation_policy {
        ConfirmationPolicy::NeverConfirm => ConfirmationPolicy::AlwaysConfirm,
        policy => policy,
    };
    actions.iter().any(|event| match &event.kind {
        EventKind::Action { security_risk, .. } => policy.should_confirm(*security_risk),
        _ => false,
    })
}

impl ConversationState {
    /// Store a new policy and keep `confirmation_mode` in step with it
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn set_confirmation_policy(&self, policy: ConfirmationPolicy) -> Result<(), StateError> {
        self.mutate(|f| {
            f.confirmation_policy = policy;
            f.confirmation_mode = policy.is_active();
        })
    }

    /// Switch confirmation mode on (confirm everything) or off
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn set_confirmation_mode(&self, enabled: bool) -> Result<(), StateError> {
        self.set_confirmation_policy(ConfirmationPolicy::from_mode(enabled))
    }

    /// Whether freshly produced `actions` must wait for approval
    #[must_use]
    pub fn requires_confirmation(&self, actions: &[Event]) -> bool {
        self.read(|fields| requires_confirmation(fields, actions))
    }

    /// Park the run if `actions` need approval.
    ///
    /// Returns `true` (and sets [`AgentStatus::WaitingForConfirmation`]) when
    /// the agent must not execute them yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn await_confirmation_if_required(&self, actions: &[Event]) -> Result<bool, StateError> {
        if !self.requires_confirmation(actions) {
            return Ok(false);
        }
        self.set_agent_status(AgentStatus::WaitingForConfirmation)?;
        tracing::info!(
            conversation_id = %self.id(),
            actions = actions.len(),
            "Waiting for user confirmation"
        );
        Ok(true)
    }
}
