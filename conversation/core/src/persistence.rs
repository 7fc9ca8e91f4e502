//! Persisted Layout
//!
//! ```text
//! <root>/
//! ├── base_state.json               snapshot of every field except events
//! └── events/
//!     ├── event-00000-<id>.json     one file per event (current)
//!     └── event-00001.json          legacy name, id only inside the file
//! ```
//!
//! Event files are written once and never rewritten. The snapshot is
//! replaced on every field mutation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::EventId;
use crate::state::{AgentStatus, ConversationId, StateFields};

/// Snapshot file name at the persistence root
pub const BASE_STATE: &str = "base_state.json";

/// Directory holding one file per event
pub const EVENTS_DIR: &str = "events";

/// Current snapshot schema
pub const SCHEMA_VERSION: u32 = 2;

const EVENT_PREFIX: &str = "event-";
const EVENT_SUFFIX: &str = ".json";

// ============================================================================
// Event file names
// ============================================================================

/// File name of the event at `index` with the given id
#[must_use]
pub fn event_file_name(index: usize, id: &EventId) -> String {
    format!("{EVENT_PREFIX}{index:05}-{id}{EVENT_SUFFIX}")
}

/// Legacy file name of the event at `index`
#[must_use]
pub fn legacy_event_file_name(index: usize) -> String {
    format!("{EVENT_PREFIX}{index:05}{EVENT_SUFFIX}")
}

/// A recognised event file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFileName {
    /// Position in the log
    pub index: usize,
    /// Id embedded in the name; `None` for legacy names
    pub id: Option<EventId>,
}

impl EventFileName {
    /// Parse `event-NNNNN-<id>.json` or `event-NNNNN.json`
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_prefix(EVENT_PREFIX)?.strip_suffix(EVENT_SUFFIX)?;
        let digits = stem.bytes().take_while(u8::is_ascii_digit).count();
        if digits < 5 {
            return None;
        }
        let index = stem[..digits].parse().ok()?;
        match &stem[digits..] {
            "" => Some(Self { index, id: None }),
            rest => {
                let id = rest.strip_prefix('-').filter(|id| !id.is_empty())?;
                Some(Self {
                    index,
                    id: Some(EventId::from(id)),
                })
            }
        }
    }

    /// Whether this is the legacy name without an id
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.id.is_none()
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Contents of `base_state.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseState {
    /// Snapshot schema version
    pub schema_version: u32,
    /// Conversation identity
    pub id: ConversationId,
    /// Every persisted scalar field
    #[serde(flatten)]
    pub fields: StateFields,
}

impl BaseState {
    /// Snapshot of the given fields at the current schema version
    #[must_use]
    pub fn new(id: ConversationId, fields: StateFields) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            id,
            fields,
        }
    }

    /// Serialize compactly
    ///
    /// # Errors
    ///
    /// Returns an error if a field cannot be represented as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a snapshot of any known schema version
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid snapshot.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        serde_json::from_value(migrate_snapshot(value))
    }
}

/// Bring a snapshot up to [`SCHEMA_VERSION`].
///
/// Version 1 snapshots have no `schema_version` and track the agent's
/// progress with boolean flags instead of `agent_status`.
#[must_use]
pub fn migrate_snapshot(mut value: Value) -> Value {
    let Some(map) = value.as_object_mut() else {
        return value;
    };
    if map.contains_key("schema_version") {
        return value;
    }

    let flag = |map: &serde_json::Map<String, Value>, key: &str| {
        map.get(key).and_then(Value::as_bool).unwrap_or(false)
    };
    let status = if flag(map, "agent_finished") {
        AgentStatus::Finished
    } else if flag(map, "agent_waiting_for_confirmation") {
        AgentStatus::WaitingForConfirmation
    } else if flag(map, "agent_paused") {
        AgentStatus::Paused
    } else {
        AgentStatus::Idle
    };

    for key in [
        "agent_finished",
        "agent_waiting_for_confirmation",
        "agent_paused",
    ] {
        map.remove(key);
    }
    if !map.contains_key("agent_status") {
        if let Ok(status) = serde_json::to_value(status) {
            map.insert("agent_status".to_string(), status);
        }
    }
    map.insert("schema_version".to_string(), Value::from(SCHEMA_VERSION));

    tracing::info!(status = %status, "Migrated legacy conversation snapshot");
    value
}
