//! Conversation State
//!
//! The aggregate every conversation operation works on: identity, a
//! [`FairLock`], the [`EventLog`] and the scalar fields describing where the
//! agent is in its run.
//!
//! # Design Philosophy
//!
//! Field writes go through [`ConversationState::mutate`]. The closure edits a
//! plain [`StateFields`] value; afterwards every changed field is written to
//! the base-state snapshot and announced as a [`StateChange`], in that order.
//! Persistence is therefore visible at each call site instead of hiding in
//! assignment.
//!
//! The event log persists itself per append and is not part of the snapshot.
//!
//! # State Machine
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │ new input
//!   IDLE ──► RUNNING ──► FINISHED | PAUSED | ERROR | STUCK ─┘
//!               │  ▲
//!               ▼  │ run() again
//!     WAITING_FOR_CONFIRMATION
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agent::{Agent, AgentSpec};
use crate::confirmation::ConfirmationPolicy;
use crate::event_log::{EventLog, EventLogError};
use crate::events::{Event, EventId};
use crate::fair_lock::{FairLock, FairLockGuard, LockError};
use crate::file_store::{FileStore, FileStoreError, InMemoryFileStore};
use crate::persistence::{BaseState, BASE_STATE, EVENTS_DIR};

// ============================================================================
// Errors
// ============================================================================

/// Errors from [`ConversationState`]
#[derive(Debug, Error)]
pub enum StateError {
    /// Resume requested with an id that differs from the snapshot
    #[error("conversation id mismatch: requested {requested}, persisted state has {persisted}")]
    IdMismatch {
        /// Id the caller asked for
        requested: ConversationId,
        /// Id found in the snapshot
        persisted: ConversationId,
    },

    /// The caller's agent configuration drifted from the persisted one
    #[error("agent configuration differs from persisted agent: {}", differences.join(", "))]
    AgentMismatch {
        /// Configuration keys that differ
        differences: Vec<String>,
    },

    /// No snapshot to resume and no agent to start from
    #[error("an agent is required to create a new conversation")]
    MissingAgent,

    /// Snapshot storage failure
    #[error(transparent)]
    Store(#[from] FileStoreError),

    /// Event log failure
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    /// Snapshot could not be (de)serialized
    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// Identity and status
// ============================================================================

/// Unique conversation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(Uuid);

impl ConversationId {
    /// Generate a fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ConversationId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for ConversationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where the agent is in its run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Waiting for input
    #[default]
    Idle,
    /// Stepping
    Running,
    /// Paused by the user
    Paused,
    /// Pending actions need approval
    WaitingForConfirmation,
    /// Produced a final answer
    Finished,
    /// The last step failed
    Error,
    /// Repeating itself without progress
    Stuck,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::WaitingForConfirmation => "waiting_for_confirmation",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Stuck => "stuck",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Fields
// ============================================================================

fn default_max_iterations() -> usize {
    500
}

fn default_true() -> bool {
    true
}

/// Every persisted scalar field of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFields {
    /// Run status
    #[serde(default)]
    pub agent_status: AgentStatus,

    /// Which actions need approval
    #[serde(default)]
    pub confirmation_policy: ConfirmationPolicy,

    /// Whether actions pause for approval
    #[serde(default)]
    pub confirmation_mode: bool,

    /// Knowledge microagents already triggered, in activation order
    #[serde(default)]
    pub activated_knowledge_microagents: Vec<String>,

    /// Persisted agent configuration
    #[serde(default)]
    pub agent: AgentSpec,

    /// Directory tools operate in
    #[serde(default)]
    pub working_dir: String,

    /// Where the conversation is persisted, if anywhere
    #[serde(default)]
    pub persistence_dir: Option<String>,

    /// Step budget per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Whether repetition detection is on
    #[serde(default = "default_true")]
    pub stuck_detection: bool,
}

impl StateFields {
    /// Fresh fields for `agent`
    #[must_use]
    pub fn new(agent: AgentSpec) -> Self {
        Self {
            agent_status: AgentStatus::Idle,
            confirmation_policy: ConfirmationPolicy::default(),
            confirmation_mode: false,
            activated_knowledge_microagents: Vec::new(),
            agent,
            working_dir: String::new(),
            persistence_dir: None,
            max_iterations: default_max_iterations(),
            stuck_detection: true,
        }
    }

    /// Whether the agent is paused for approval
    #[must_use]
    pub fn waiting_for_confirmation(&self) -> bool {
        self.agent_status == AgentStatus::WaitingForConfirmation
    }
}

/// One field changed by a mutation
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// Field name as it appears in the snapshot
    pub field: String,
    /// Value before the mutation
    pub old: Value,
    /// Value after the mutation
    pub new: Value,
}

/// Callback invoked for every [`StateChange`]
pub type StateChangeListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// How to open a [`ConversationState`]
#[derive(Clone, Default)]
pub struct StateOptions {
    /// Backing store; `None` keeps everything in memory and skips snapshots
    pub store: Option<Arc<dyn FileStore>>,
    /// Directory tools operate in
    pub working_dir: String,
    /// Recorded persistence location
    pub persistence_dir: Option<String>,
    /// Step budget per run
    pub max_iterations: Option<usize>,
    /// Whether repetition detection is on
    pub stuck_detection: Option<bool>,
}

impl StateOptions {
    /// Options with no persistence
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist into `store`
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the working directory
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Record the persistence location
    #[must_use]
    pub fn with_persistence_dir(mut self, dir: impl Into<String>) -> Self {
        self.persistence_dir = Some(dir.into());
        self
    }

    /// Set the step budget
    #[must_use]
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = Some(max);
        self
    }

    /// Enable or disable repetition detection
    #[must_use]
    pub fn with_stuck_detection(mut self, enabled: bool) -> Self {
        self.stuck_detection = Some(enabled);
        self
    }
}

impl fmt::Debug for StateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateOptions")
            .field("persisted", &self.store.is_some())
            .field("working_dir", &self.working_dir)
            .field("persistence_dir", &self.persistence_dir)
            .field("max_iterations", &self.max_iterations)
            .field("stuck_detection", &self.stuck_detection)
            .finish()
    }
}

// ============================================================================
// ConversationState
// ============================================================================

/// Lock, event log and fields of one conversation
pub struct ConversationState {
    id: ConversationId,
    lock: FairLock,
    fields: RwLock<StateFields>,
    // Held from a field change until its snapshot and notifications are out
    publish: ReentrantMutex<()>,
    events: EventLog,
    snapshot_store: Option<Arc<dyn FileStore>>,
    autosave: AtomicBool,
    listener: RwLock<Option<StateChangeListener>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StateChange>>>,
}

impl fmt::Debug for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationState")
            .field("id", &self.id)
            .field("agent_status", &self.agent_status())
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl ConversationState {
    /// Resume the conversation persisted in `options.store`, or create it.
    ///
    /// On resume the snapshot's id must equal `id` and `agent` is reconciled
    /// against the persisted configuration. Auto-persistence is switched on
    /// only after reconciliation, so it never writes a half-built state.
    ///
    /// # Errors
    ///
    /// - [`StateError::IdMismatch`] if the snapshot belongs to another id
    /// - [`StateError::AgentMismatch`] if the agent configuration drifted
    /// - [`StateError::MissingAgent`] if nothing is persisted and `agent` is `None`
    pub fn create(
        id: ConversationId,
        agent: Option<&dyn Agent>,
        options: StateOptions,
    ) -> Result<Self, StateError> {
        let persisted = options.store.is_some();
        let store: Arc<dyn FileStore> = match &options.store {
            Some(store) => Arc::clone(store),
            None => Arc::new(InMemoryFileStore::new()),
        };

        let snapshot = match store.read(BASE_STATE) {
            Ok(text) => Some(BaseState::from_json(&text)?),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let state = match snapshot {
            Some(base) => {
                if base.id != id {
                    return Err(StateError::IdMismatch {
                        requested: id,
                        persisted: base.id,
                    });
                }
                let mut fields = base.fields;
                if let Some(agent) = agent {
                    fields.agent = agent.resolve_diff_from_deserialized(&fields.agent)?;
                }
                let state = Self::assemble(id, fields, &store, persisted)?;
                state.enable_autosave();
                state.mutate(|f| {
                    if let Some(max) = options.max_iterations {
                        f.max_iterations = max;
                    }
                    if let Some(enabled) = options.stuck_detection {
                        f.stuck_detection = enabled;
                    }
                })?;
                tracing::info!(
                    conversation_id = %id,
                    events = state.events.len(),
                    status = %state.agent_status(),
                    "Resumed conversation from persistent storage"
                );
                state
            }
            None => {
                let agent = agent.ok_or(StateError::MissingAgent)?;
                let mut fields = StateFields::new(agent.spec());
                fields.working_dir = options.working_dir;
                fields.persistence_dir = options.persistence_dir;
                if let Some(max) = options.max_iterations {
                    fields.max_iterations = max;
                }
                if let Some(enabled) = options.stuck_detection {
                    fields.stuck_detection = enabled;
                }
                let state = Self::assemble(id, fields, &store, persisted)?;
                state.save_base_state()?;
                state.enable_autosave();
                tracing::info!(conversation_id = %id, persisted, "Created new conversation");
                state
            }
        };

        Ok(state)
    }

    fn assemble(
        id: ConversationId,
        fields: StateFields,
        store: &Arc<dyn FileStore>,
        persisted: bool,
    ) -> Result<Self, StateError> {
        Ok(Self {
            id,
            lock: FairLock::new(),
            fields: RwLock::new(fields),
            publish: ReentrantMutex::new(()),
            events: EventLog::open(Arc::clone(store), EVENTS_DIR)?,
            snapshot_store: persisted.then(|| Arc::clone(store)),
            autosave: AtomicBool::new(false),
            listener: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    fn enable_autosave(&self) {
        self.autosave.store(true, Ordering::Release);
    }

    /// Conversation id
    #[must_use]
    pub fn id(&self) -> ConversationId {
        self.id
    }

    // ------------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------------

    /// Block until this thread holds the conversation lock
    pub fn lock(&self) -> FairLockGuard<'_> {
        self.lock.lock()
    }

    /// Wait at most `timeout` for the conversation lock
    pub fn try_lock_for(&self, timeout: Duration) -> Option<FairLockGuard<'_>> {
        self.lock.try_lock_for(timeout)
    }

    /// Acquire without a guard; pair with [`ConversationState::release`]
    pub fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> bool {
        self.lock.acquire(blocking, timeout)
    }

    /// Release one level of a manual [`ConversationState::acquire`]
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotOwner`] if this thread does not hold the lock.
    pub fn release(&self) -> Result<(), LockError> {
        self.lock.release()
    }

    /// Whether any thread holds the lock
    #[must_use]
    pub fn locked(&self) -> bool {
        self.lock.locked()
    }

    /// Whether this thread holds the lock
    #[must_use]
    pub fn owned(&self) -> bool {
        self.lock.owned()
    }

    /// Threads queued for the lock
    #[must_use]
    pub fn lock_waiters(&self) -> usize {
        self.lock.waiting()
    }

    // ------------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------------

    /// Read the fields without cloning them
    pub fn read<R>(&self, f: impl FnOnce(&StateFields) -> R) -> R {
        f(&self.fields.read())
    }

    /// Copy of all fields
    #[must_use]
    pub fn fields(&self) -> StateFields {
        self.fields.read().clone()
    }

    /// Current run status
    #[must_use]
    pub fn agent_status(&self) -> AgentStatus {
        self.fields.read().agent_status
    }

    /// Whether pending actions await approval
    #[must_use]
    pub fn waiting_for_confirmation(&self) -> bool {
        self.fields.read().waiting_for_confirmation()
    }

    /// Whether actions pause for approval
    #[must_use]
    pub fn confirmation_mode(&self) -> bool {
        self.fields.read().confirmation_mode
    }

    /// Active confirmation policy
    #[must_use]
    pub fn confirmation_policy(&self) -> ConfirmationPolicy {
        self.fields.read().confirmation_policy
    }

    /// Persisted agent configuration (without runtime fields)
    #[must_use]
    pub fn agent(&self) -> AgentSpec {
        self.fields.read().agent.clone()
    }

    /// Knowledge microagents already triggered
    #[must_use]
    pub fn activated_knowledge_microagents(&self) -> Vec<String> {
        self.fields.read().activated_knowledge_microagents.clone()
    }

    /// Set the run status
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn set_agent_status(&self, status: AgentStatus) -> Result<(), StateError> {
        self.mutate(|f| f.agent_status = status)
    }

    /// Change fields, then persist and announce what changed.
    ///
    /// Nothing is written or announced when the closure leaves every field
    /// as it was, or before initialization has finished. Concurrent
    /// mutations are published one at a time, so the snapshot on disk and
    /// the order subscribers see both follow the order of the changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written. The in-memory
    /// change is kept.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut StateFields) -> R) -> Result<R, StateError> {
        let _publish = self.publish.lock();
        let (result, changes) = {
            let mut fields = self.fields.write();
            let before = serde_json::to_value(&*fields)?;
            let result = f(&mut fields);
            let after = serde_json::to_value(&*fields)?;
            (result, diff_fields(before, after))
        };

        if changes.is_empty() || !self.autosave.load(Ordering::Acquire) {
            return Ok(result);
        }

        self.save_base_state()?;
        for change in &changes {
            tracing::debug!(
                conversation_id = %self.id,
                field = %change.field,
                new = %change.new,
                "State changed"
            );
            self.notify(change);
        }
        Ok(result)
    }

    /// Register (or clear) the state-change listener
    pub fn set_on_state_change(&self, listener: Option<StateChangeListener>) {
        *self.listener.write() = listener;
    }

    /// Receive every subsequent [`StateChange`] in mutation order
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn notify(&self, change: &StateChange) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(change);
        }
        self.subscribers
            .lock()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Write the snapshot now, if persistence is configured
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_base_state(&self) -> Result<(), StateError> {
        let Some(store) = &self.snapshot_store else {
            return Ok(());
        };
        let _publish = self.publish.lock();
        let snapshot = BaseState::new(self.id, self.fields());
        store.write(BASE_STATE, snapshot.to_json()?.as_bytes())?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// The event log
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Append one event to the log
    ///
    /// # Errors
    ///
    /// Returns an error on id conflict or storage failure.
    pub fn append_event(&self, event: &Event) -> Result<usize, StateError> {
        Ok(self.events.append(event)?)
    }

    /// Actions in the log without an observation or rejection
    #[must_use]
    pub fn pending_actions(&self) -> Vec<Event> {
        Self::get_unmatched_actions(&self.events.to_vec())
    }

    /// Actions in `events` not resolved by a later observation or rejection,
    /// in chronological order.
    #[must_use]
    pub fn get_unmatched_actions(events: &[Event]) -> Vec<Event> {
        let mut resolved: std::collections::HashSet<&EventId> = std::collections::HashSet::new();
        let mut unmatched = std::collections::VecDeque::new();

        for event in events.iter().rev() {
            if let Some(action_id) = event.resolves_action() {
                resolved.insert(action_id);
            } else if event.is_action() && !resolved.contains(&event.id) {
                unmatched.push_front(event.clone());
            }
        }
        unmatched.into()
    }
}

fn diff_fields(before: Value, after: Value) -> Vec<StateChange> {
    let (Value::Object(mut before), Value::Object(after)) = (before, after) else {
        return Vec::new();
    };
    after
        .into_iter()
        .filter_map(|(field, new)| {
            let old = before.remove(&field).unwrap_or(Value::Null);
            (old != new).then_some(StateChange { field, old, new })
        })
        .collect()
}
