//! Agent Interface
//!
//! The agent is an external collaborator: it owns the LLM client and tool
//! executors and advances the conversation one [`Agent::step`] at a time,
//! emitting events through the [`EventPipeline`].
//!
//! The core only needs three things from it:
//!
//! - an [`AgentSpec`] describing its persisted configuration
//! - reconciliation of that spec against a persisted one on resume
//! - optional [`AgentContext`] with knowledge microagents triggered by user
//!   messages

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::EventPipeline;
use crate::state::{ConversationState, StateError};

// ============================================================================
// Agent spec
// ============================================================================

/// Serializable description of an agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Agent implementation name
    pub kind: String,

    /// Persisted configuration (model, prompts, tool names, ...)
    #[serde(default)]
    pub config: BTreeMap<String, Value>,

    /// Runtime-only values such as credentials; never persisted
    #[serde(skip)]
    pub runtime: BTreeMap<String, Value>,
}

impl AgentSpec {
    /// Spec for an agent of the given kind with empty configuration
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Add a persisted configuration entry
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Add a runtime-only entry
    #[must_use]
    pub fn with_runtime(mut self, key: impl Into<String>, value: Value) -> Self {
        self.runtime.insert(key.into(), value);
        self
    }

    /// Merge this (live) spec with a `persisted` one.
    ///
    /// The result carries the persisted configuration and this spec's
    /// runtime values.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::AgentMismatch`] naming every differing key when
    /// the kinds or configurations disagree.
    pub fn reconcile(&self, persisted: &AgentSpec) -> Result<AgentSpec, StateError> {
        let mut differences = Vec::new();
        if self.kind != persisted.kind {
            differences.push("kind".to_string());
        }

        let keys: BTreeSet<&String> = self.config.keys().chain(persisted.config.keys()).collect();
        for key in keys {
            if self.config.get(key) != persisted.config.get(key) {
                differences.push(format!("config.{key}"));
            }
        }

        if !differences.is_empty() {
            return Err(StateError::AgentMismatch { differences });
        }

        Ok(AgentSpec {
            kind: persisted.kind.clone(),
            config: persisted.config.clone(),
            runtime: self.runtime.clone(),
        })
    }
}

// ============================================================================
// Agent context
// ============================================================================

/// Extra knowledge injected into a user message when one of its triggers
/// appears in the text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeMicroagent {
    /// Unique name
    pub name: String,
    /// Keywords, matched case-insensitively as substrings
    pub triggers: Vec<String>,
    /// Text appended to the message
    pub content: String,
}

impl KnowledgeMicroagent {
    /// The first trigger found in `text_lower`
    fn match_trigger(&self, text_lower: &str) -> Option<&str> {
        self.triggers
            .iter()
            .find(|t| !t.is_empty() && text_lower.contains(&t.to_lowercase()))
            .map(String::as_str)
    }
}

/// Knowledge available to an agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContext {
    /// Keyword-triggered microagents
    #[serde(default)]
    pub knowledge_microagents: Vec<KnowledgeMicroagent>,
}

impl AgentContext {
    /// Context with the given microagents
    #[must_use]
    pub fn new(knowledge_microagents: Vec<KnowledgeMicroagent>) -> Self {
        Self {
            knowledge_microagents,
        }
    }

    /// Content to append to a user message, and the microagents it came from.
    ///
    /// Microagents named in `skip` already fired earlier and are ignored.
    /// Returns `None` when nothing matches.
    #[must_use]
    pub fn user_message_suffix(
        &self,
        message: &str,
        skip: &[String],
    ) -> Option<(String, Vec<String>)> {
        let text = message.to_lowercase();
        let mut blocks = Vec::new();
        let mut names = Vec::new();

        for agent in &self.knowledge_microagents {
            if skip.contains(&agent.name) {
                continue;
            }
            if let Some(trigger) = agent.match_trigger(&text) {
                blocks.push(format!(
                    "<EXTRA_INFO>\nThe following information has been included based on a keyword match for \"{trigger}\".\n{}\n</EXTRA_INFO>",
                    agent.content.trim()
                ));
                names.push(agent.name.clone());
            }
        }

        (!names.is_empty()).then(|| (blocks.join("\n\n"), names))
    }
}

// ============================================================================
// Agent trait
// ============================================================================

/// An agent driving a conversation
pub trait Agent: Send + Sync {
    /// Persisted description of this agent
    fn spec(&self) -> AgentSpec;

    /// Reconcile with the agent found in a snapshot.
    ///
    /// The default keeps the persisted configuration, carries over this
    /// agent's runtime values and rejects configuration drift.
    fn resolve_diff_from_deserialized(&self, persisted: &AgentSpec) -> Result<AgentSpec, StateError> {
        self.spec().reconcile(persisted)
    }

    /// Prepare a new or resumed conversation, e.g. emit the system prompt.
    ///
    /// Called once with the conversation lock held.
    fn init_state(&self, state: &ConversationState, on_event: &EventPipeline) -> anyhow::Result<()>;

    /// Advance the conversation by one step.
    ///
    /// Called with the conversation lock held. May emit any number of events
    /// and change the agent status.
    fn step(&self, state: &ConversationState, on_event: &EventPipeline) -> anyhow::Result<()>;

    /// Knowledge microagents, if any
    fn context(&self) -> Option<&AgentContext> {
        None
    }

    /// Release tool executors and other resources
    fn close(&self) {}
}
