//! Conversation Events
//!
//! Immutable records appended to the [`EventLog`](crate::event_log::EventLog).
//! Every event carries a stable id, a timestamp and a source; the payload is
//! a tagged [`EventKind`] so consumers match on it exhaustively.
//!
//! # Wire Format
//!
//! Events serialize to a flat JSON object with a `kind` discriminator:
//!
//! ```json
//! {"id":"…","timestamp":"…","source":"agent","kind":"action","tool_name":"bash",…}
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Identity
// ============================================================================

/// Stable unique identifier of an event
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id can be embedded in an event file name.
    ///
    /// Only ASCII letters, digits, `-` and `_` are allowed, which covers
    /// every id produced by [`EventId::new`].
    #[must_use]
    pub fn is_file_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Who produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// The human (or client) driving the conversation
    User,
    /// The agent itself
    Agent,
    /// Tool executors and the runtime
    Environment,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::Environment => write!(f, "environment"),
        }
    }
}

/// Risk an agent attributes to an action, ordered from least to most risky
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityRisk {
    /// No assessment available
    #[default]
    Unknown,
    /// Read-only or trivially reversible
    Low,
    /// Modifies local state
    Medium,
    /// Destructive or externally visible
    High,
}

// ============================================================================
// Payloads
// ============================================================================

/// Variant-specific event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// System prompt and tool schema the agent was initialised with
    SystemPrompt {
        /// Prompt text
        system_prompt: String,
        /// Tool definitions offered to the model
        #[serde(default)]
        tools: Vec<Value>,
    },

    /// A chat message from the user or the agent
    Message {
        /// Message text
        content: String,
        /// Knowledge microagents triggered by this message
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        activated_microagents: Vec<String>,
        /// Extra content appended by triggered microagents
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        extended_content: Vec<String>,
    },

    /// The agent wants to run a tool
    Action {
        /// Tool to invoke
        tool_name: String,
        /// Model-assigned call id
        tool_call_id: String,
        /// Tool arguments
        #[serde(default)]
        arguments: Value,
        /// Reasoning the model gave alongside the call
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
        /// Risk attributed to the call
        #[serde(default)]
        security_risk: SecurityRisk,
    },

    /// Result of executing an action
    Observation {
        /// The action this observation resolves
        action_id: EventId,
        /// Tool that ran
        tool_name: String,
        /// Call id of the resolved action
        tool_call_id: String,
        /// Tool output
        content: String,
    },

    /// The user declined to run an action
    UserRejectObservation {
        /// The action this rejection resolves
        action_id: EventId,
        /// Tool that would have run
        tool_name: String,
        /// Call id of the resolved action
        tool_call_id: String,
        /// Why the user declined
        rejection_reason: String,
    },

    /// The agent failed to produce a valid action
    AgentError {
        /// Tool the failed call targeted, if known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        /// Call id of the failed call, if known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        /// Error description fed back to the model
        error: String,
    },

    /// Execution was paused by the user
    Pause,

    /// Older events were summarised away
    Condensation {
        /// Events no longer sent to the model
        forgotten_event_ids: Vec<EventId>,
        /// Summary replacing them
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    /// Ask the agent to condense its history on the next step
    CondensationRequest,

    /// Partial model output while a completion is streaming; never persisted
    StreamingDelta {
        /// Text fragment
        content: String,
    },
}

impl EventKind {
    /// Short name used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SystemPrompt { .. } => "system_prompt",
            Self::Message { .. } => "message",
            Self::Action { .. } => "action",
            Self::Observation { .. } => "observation",
            Self::UserRejectObservation { .. } => "user_reject_observation",
            Self::AgentError { .. } => "agent_error",
            Self::Pause => "pause",
            Self::Condensation { .. } => "condensation",
            Self::CondensationRequest => "condensation_request",
            Self::StreamingDelta { .. } => "streaming_delta",
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// An immutable conversation event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stable unique id
    pub id: EventId,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Producer
    pub source: EventSource,
    /// Payload
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Create an event with a fresh id stamped now
    #[must_use]
    pub fn new(source: EventSource, kind: EventKind) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            source,
            kind,
        }
    }

    /// A plain text message
    #[must_use]
    pub fn message(source: EventSource, content: impl Into<String>) -> Self {
        Self::new(
            source,
            EventKind::Message {
                content: content.into(),
                activated_microagents: Vec::new(),
                extended_content: Vec::new(),
            },
        )
    }

    /// An agent tool call
    #[must_use]
    pub fn action(
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self::new(
            EventSource::Agent,
            EventKind::Action {
                tool_name: tool_name.into(),
                tool_call_id: tool_call_id.into(),
                arguments,
                thought: None,
                security_risk: SecurityRisk::Unknown,
            },
        )
    }

    /// Observation resolving `action`, or `None` if `action` is not an action
    #[must_use]
    pub fn observation_for(action: &Event, content: impl Into<String>) -> Option<Self> {
        let EventKind::Action {
            tool_name,
            tool_call_id,
            ..
        } = &action.kind
        else {
            return None;
        };
        Some(Self::new(
            EventSource::Environment,
            EventKind::Observation {
                action_id: action.id.clone(),
                tool_name: tool_name.clone(),
                tool_call_id: tool_call_id.clone(),
                content: content.into(),
            },
        ))
    }

    /// User rejection of `action`, or `None` if `action` is not an action
    #[must_use]
    pub fn rejection_for(action: &Event, reason: impl Into<String>) -> Option<Self> {
        let EventKind::Action {
            tool_name,
            tool_call_id,
            ..
        } = &action.kind
        else {
            return None;
        };
        Some(Self::new(
            EventSource::User,
            EventKind::UserRejectObservation {
                action_id: action.id.clone(),
                tool_name: tool_name.clone(),
                tool_call_id: tool_call_id.clone(),
                rejection_reason: reason.into(),
            },
        ))
    }

    /// An agent error not tied to a specific tool call
    #[must_use]
    pub fn agent_error(error: impl Into<String>) -> Self {
        Self::new(
            EventSource::Agent,
            EventKind::AgentError {
                tool_name: None,
                tool_call_id: None,
                error: error.into(),
            },
        )
    }

    /// Replace the id (used when replaying events with known ids)
    #[must_use]
    pub fn with_id(mut self, id: impl Into<EventId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the risk of an action; other kinds are returned unchanged
    #[must_use]
    pub fn with_security_risk(mut self, risk: SecurityRisk) -> Self {
        if let EventKind::Action { security_risk, .. } = &mut self.kind {
            *security_risk = risk;
        }
        self
    }

    /// Whether this is a tool call
    #[must_use]
    pub fn is_action(&self) -> bool {
        matches!(self.kind, EventKind::Action { .. })
    }

    /// Whether this is a message typed by the user
    #[must_use]
    pub fn is_user_message(&self) -> bool {
        self.source == EventSource::User && matches!(self.kind, EventKind::Message { .. })
    }

    /// The action id resolved by an observation or rejection
    #[must_use]
    pub fn resolves_action(&self) -> Option<&EventId> {
        match &self.kind {
            EventKind::Observation { action_id, .. }
            | EventKind::UserRejectObservation { action_id, .. } => Some(action_id),
            _ => None,
        }
    }

    /// Tool name of an action, observation, rejection or error
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Action { tool_name, .. }
            | EventKind::Observation { tool_name, .. }
            | EventKind::UserRejectObservation { tool_name, .. } => Some(tool_name),
            EventKind::AgentError { tool_name, .. } => tool_name.as_deref(),
            _ => None,
        }
    }

    /// Whether the event is only meant for live observers
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, EventKind::StreamingDelta { .. })
    }

    /// Compare content, ignoring identity and call bookkeeping.
    ///
    /// Ids, timestamps, tool call ids and resolved action ids differ between
    /// otherwise identical repetitions, so they are left out.
    #[must_use]
    pub fn same_content(&self, other: &Event) -> bool {
        if self.source != other.source {
            return false;
        }
        match (&self.kind, &other.kind) {
            (
                EventKind::Action {
                    tool_name: a_tool,
                    arguments: a_args,
                    thought: a_thought,
                    ..
                },
                EventKind::Action {
                    tool_name: b_tool,
                    arguments: b_args,
                    thought: b_thought,
                    ..
                },
            ) => a_tool == b_tool && a_args == b_args && a_thought == b_thought,
            (
                EventKind::Observation {
                    tool_name: a_tool,
                    content: a_content,
                    ..
                },
                EventKind::Observation {
                    tool_name: b_tool,
                    content: b_content,
                    ..
                },
            ) => a_tool == b_tool && a_content == b_content,
            (
                EventKind::AgentError {
                    tool_name: a_tool,
                    error: a_error,
                    ..
                },
                EventKind::AgentError {
                    tool_name: b_tool,
                    error: b_error,
                    ..
                },
            ) => a_tool == b_tool && a_error == b_error,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, {})", self.kind.name(), self.source, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_event_serializes_flat_with_kind_tag() {
        let event = Event::action("bash", "call-1", json!({"command": "ls"}))
            .with_id("a1")
            .with_security_risk(SecurityRisk::Medium);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["id"], "a1");
        assert_eq!(value["kind"], "action");
        assert_eq!(value["source"], "agent");
        assert_eq!(value["tool_name"], "bash");
        assert_eq!(value["security_risk"], "MEDIUM");
        assert!(value.get("thought").is_none());

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_unit_variant_roundtrip() {
        let event = Event::new(EventSource::User, EventKind::Pause);
        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains("\"kind\":\"pause\""));
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back.kind, EventKind::Pause);
    }

    #[test]
    fn test_observation_and_rejection_reference_action() {
        let action = Event::action("editor", "call-7", json!({}));
        let obs = Event::observation_for(&action, "ok").unwrap();
        let reject = Event::rejection_for(&action, "no").unwrap();

        assert_eq!(obs.resolves_action(), Some(&action.id));
        assert_eq!(reject.resolves_action(), Some(&action.id));
        assert_eq!(reject.source, EventSource::User);
        assert_eq!(obs.tool_name(), Some("editor"));
        assert!(action.resolves_action().is_none());
    }

    #[test]
    fn test_observation_for_non_action_is_none() {
        let msg = Event::message(EventSource::User, "hi");
        assert!(Event::observation_for(&msg, "x").is_none());
        assert!(Event::rejection_for(&msg, "x").is_none());
    }

    #[test]
    fn test_same_content_ignores_ids() {
        let a = Event::action("bash", "call-1", json!({"command": "ls"}));
        let b = Event::action("bash", "call-2", json!({"command": "ls"}));
        let c = Event::action("bash", "call-3", json!({"command": "pwd"}));
        assert!(a.same_content(&b));
        assert!(!a.same_content(&c));

        let oa = Event::observation_for(&a, "file").unwrap();
        let ob = Event::observation_for(&b, "file").unwrap();
        assert!(oa.same_content(&ob));
        assert_ne!(oa, ob);
    }

    #[test]
    fn test_security_risk_ordering() {
        assert!(SecurityRisk::Unknown < SecurityRisk::Low);
        assert!(SecurityRisk::Low < SecurityRisk::Medium);
        assert!(SecurityRisk::Medium < SecurityRisk::High);
    }
}
