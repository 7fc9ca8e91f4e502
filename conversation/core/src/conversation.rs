//! Conversation Orchestrator
//!
//! Ties an [`Agent`] to a [`ConversationState`] and drives it.
//!
//! # Event Pipeline
//!
//! Every event the agent (or the conversation itself) produces passes through
//! a fixed chain:
//!
//! ```text
//!   visualizer ──► caller callbacks ──► append to event log
//! ```
//!
//! Observers therefore see an event before it is durable and must not assume
//! it is already in the log.
//!
//! # Locking
//!
//! `send_message`, each iteration of `run`, `reject_pending_actions` and
//! `pause` hold the state's FIFO lock for their whole duration, including a
//! full agent step. Concurrent callers are served in the order they asked.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::agent::Agent;
use crate::confirmation::ConfirmationPolicy;
use crate::config::ConversationConfig;
use crate::context::RuntimeContext;
use crate::event_log::EventLogError;
use crate::events::{Event, EventKind, EventSource};
use crate::fair_lock::LockError;
use crate::file_store::FileStore;
use crate::secrets::{SecretRegistry, SecretValue};
use crate::state::{AgentStatus, ConversationId, ConversationState, StateError, StateOptions};
use crate::stuck_detector::StuckDetector;
use crate::visualizer::TracingVisualizer;

/// Errors surfaced by [`Conversation`]
#[derive(Debug, Error)]
pub enum ConversationError {
    /// State creation, persistence or reconciliation failed
    #[error(transparent)]
    State(#[from] StateError),

    /// The event log rejected an operation
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    /// Lock misuse
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The agent failed while initialising or stepping
    #[error("agent failed: {0:#}")]
    Agent(anyhow::Error),
}

/// Observer of every event passing through the pipeline
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

// ============================================================================
// Event pipeline
// ============================================================================

/// Observers followed by the append-to-log step
#[derive(Clone)]
pub struct EventPipeline {
    observers: Vec<EventCallback>,
    state: Arc<ConversationState>,
}

impl EventPipeline {
    /// Pipeline running `observers` in order, then appending to `state`
    #[must_use]
    pub fn new(observers: Vec<EventCallback>, state: Arc<ConversationState>) -> Self {
        Self { observers, state }
    }

    /// Show `event` to every observer, then append it.
    ///
    /// Transient events (streaming deltas) are observed but never stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the append fails; observers have already run.
    pub fn emit(&self, event: Event) -> Result<(), StateError> {
        for observer in &self.observers {
            observer(&event);
        }
        if event.is_transient() {
            return Ok(());
        }
        self.state.append_event(&event)?;
        Ok(())
    }

    /// State events are appended to
    #[must_use]
    pub fn state(&self) -> &ConversationState {
        &self.state
    }
}

impl fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPipeline")
            .field("observers", &self.observers.len())
            .field("conversation_id", &self.state.id())
            .finish()
    }
}

// ============================================================================
// Options
// ============================================================================

/// How to build a [`Conversation`]
#[derive(Clone)]
pub struct ConversationOptions {
    /// Resume this id, or create it; a fresh id when `None`
    pub id: Option<ConversationId>,
    /// Explicit backing store; otherwise derived from the runtime context
    pub store: Option<Arc<dyn FileStore>>,
    /// Caller observers, run after the visualizer
    pub callbacks: Vec<EventCallback>,
    /// Step budget of one `run()`; zero is treated as one
    pub max_iteration_per_run: usize,
    /// Stop runs that repeat themselves
    pub stuck_detection: bool,
    /// Put the tracing visualizer at the head of the pipeline
    pub visualize: bool,
    /// Pause before executing actions
    pub confirmation_mode: bool,
    /// Directory tools operate in
    pub working_dir: String,
}

impl Default for ConversationOptions {
    fn default() -> Self {
        Self::from_config(&ConversationConfig::default())
    }
}

impl ConversationOptions {
    /// Options seeded from loaded configuration
    #[must_use]
    pub fn from_config(config: &ConversationConfig) -> Self {
        Self {
            id: None,
            store: None,
            callbacks: Vec::new(),
            max_iteration_per_run: config.max_iteration_per_run.max(1),
            stuck_detection: config.stuck_detection,
            visualize: config.visualize,
            confirmation_mode: config.confirmation_mode,
            working_dir: String::new(),
        }
    }

    /// Use a specific conversation id
    #[must_use]
    pub fn with_id(mut self, id: ConversationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Persist into `store`
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add an observer
    #[must_use]
    pub fn with_callback(mut self, callback: EventCallback) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Set the step budget, at least one step
    #[must_use]
    pub fn with_max_iteration_per_run(mut self, max: usize) -> Self {
        self.max_iteration_per_run = max.max(1);
        self
    }

    /// Enable or disable stuck detection
    #[must_use]
    pub fn with_stuck_detection(mut self, enabled: bool) -> Self {
        self.stuck_detection = enabled;
        self
    }

    /// Enable or disable the visualizer
    #[must_use]
    pub fn with_visualize(mut self, enabled: bool) -> Self {
        self.visualize = enabled;
        self
    }

    /// Enable or disable confirmation mode
    #[must_use]
    pub fn with_confirmation_mode(mut self, enabled: bool) -> Self {
        self.confirmation_mode = enabled;
        self
    }

    /// Set the working directory
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }
}

impl fmt::Debug for ConversationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationOptions")
            .field("id", &self.id)
            .field("persisted", &self.store.is_some())
            .field("callbacks", &self.callbacks.len())
            .field("max_iteration_per_run", &self.max_iteration_per_run)
            .field("stuck_detection", &self.stuck_detection)
            .field("visualize", &self.visualize)
            .field("confirmation_mode", &self.confirmation_mode)
            .finish()
    }
}

// ============================================================================
// Conversation
// ============================================================================

/// A running conversation between a user and an agent
pub struct Conversation {
    agent: Arc<dyn Agent>,
    state: Arc<ConversationState>,
    pipeline: EventPipeline,
    secrets: Arc<SecretRegistry>,
    stuck_detector: Option<StuckDetector>,
    max_iteration_per_run: usize,
    closed: AtomicBool,
}

impl Conversation {
    /// Create a conversation, or resume the one persisted for `options.id`.
    ///
    /// Calls [`Agent::init_state`] once under the conversation lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be created or resumed, or if the
    /// agent fails to initialise.
    pub fn new(
        agent: Arc<dyn Agent>,
        options: ConversationOptions,
        ctx: &RuntimeContext,
    ) -> Result<Self, ConversationError> {
        let id = options.id.unwrap_or_default();

        let mut state_options = StateOptions::new()
            .with_working_dir(options.working_dir.clone())
            .with_max_iterations(options.max_iteration_per_run.max(1))
            .with_stuck_detection(options.stuck_detection);
        match &options.store {
            Some(store) => state_options = state_options.with_store(Arc::clone(store)),
            None => {
                if let Some((store, dir)) = ctx.store_for(id).map_err(StateError::from)? {
                    state_options = state_options
                        .with_store(store)
                        .with_persistence_dir(dir.display().to_string());
                }
            }
        }

        let state = Arc::new(ConversationState::create(
            id,
            Some(agent.as_ref()),
            state_options,
        )?);
        if options.confirmation_mode && !state.confirmation_mode() {
            state.set_confirmation_mode(true)?;
        }

        let mut observers: Vec<EventCallback> = Vec::new();
        if options.visualize {
            observers.push(TracingVisualizer::new(ctx.secrets()).into_callback());
        }
        observers.extend(options.callbacks);
        let pipeline = EventPipeline::new(observers, Arc::clone(&state));

        let conversation = Self {
            agent,
            secrets: ctx.secrets(),
            stuck_detector: options.stuck_detection.then(StuckDetector::new),
            max_iteration_per_run: options.max_iteration_per_run.max(1),
            state,
            pipeline,
            closed: AtomicBool::new(false),
        };

        {
            let _guard = conversation.state.lock();
            conversation
                .agent
                .init_state(&conversation.state, &conversation.pipeline)
                .map_err(ConversationError::Agent)?;
        }

        tracing::debug!(conversation_id = %id, "Conversation ready");
        Ok(conversation)
    }

    /// Conversation id
    #[must_use]
    pub fn id(&self) -> ConversationId {
        self.state.id()
    }

    /// Shared conversation state
    #[must_use]
    pub fn state(&self) -> &Arc<ConversationState> {
        &self.state
    }

    /// The agent driving this conversation
    #[must_use]
    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    /// Stuck detector, when enabled
    #[must_use]
    pub fn stuck_detector(&self) -> Option<&StuckDetector> {
        self.stuck_detector.as_ref()
    }

    /// Secrets available to the agent's tools
    #[must_use]
    pub fn secrets(&self) -> &Arc<SecretRegistry> {
        &self.secrets
    }

    /// Emit an event through the pipeline
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be appended.
    pub fn emit(&self, event: Event) -> Result<(), ConversationError> {
        let _guard = self.state.lock();
        Ok(self.pipeline.emit(event)?)
    }

    /// Add a user message. The agent reacts on the next [`Conversation::run`].
    ///
    /// A finished conversation is reopened (status back to idle) before the
    /// message is recorded. Knowledge microagents whose triggers appear in
    /// the message are attached once per conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the state or the message cannot be persisted.
    pub fn send_message(&self, message: impl Into<String>) -> Result<(), ConversationError> {
        let content = message.into();
        let _guard = self.state.lock();

        if self.state.agent_status() == AgentStatus::Finished {
            self.state.set_agent_status(AgentStatus::Idle)?;
        }

        let mut activated_microagents = Vec::new();
        let mut extended_content = Vec::new();
        if let Some(context) = self.agent.context() {
            let already = self.state.activated_knowledge_microagents();
            if let Some((suffix, names)) = context.user_message_suffix(&content, &already) {
                tracing::debug!(microagents = ?names, "Knowledge microagents triggered");
                extended_content.push(suffix);
                self.state.mutate(|f| {
                    f.activated_knowledge_microagents.extend(names.iter().cloned());
                })?;
                activated_microagents = names;
            }
        }

        self.pipeline.emit(Event::new(
            EventSource::User,
            EventKind::Message {
                content,
                activated_microagents,
                extended_content,
            },
        ))?;
        Ok(())
    }

    /// Step the agent until it finishes, needs confirmation, pauses, gets
    /// stuck or exhausts the step budget.
    ///
    /// A paused conversation resumes. Calling `run` while waiting for
    /// confirmation approves the pending actions.
    ///
    /// # Errors
    ///
    /// Returns [`ConversationError::Agent`] (after setting the status to
    /// error) if a step fails.
    pub fn run(&self) -> Result<(), ConversationError> {
        {
            let _guard = self.state.lock();
            if self.state.agent_status() == AgentStatus::Paused {
                self.state.set_agent_status(AgentStatus::Running)?;
            }
        }

        let mut iteration = 0;
        loop {
            let _guard = self.state.lock();
            let status = self.state.agent_status();
            tracing::trace!(conversation_id = %self.id(), iteration, %status, "Run iteration");

            if matches!(
                status,
                AgentStatus::Finished | AgentStatus::Paused | AgentStatus::Stuck
            ) {
                break;
            }

            if let Some(detector) = &self.stuck_detector {
                if detector.is_stuck(&self.state) {
                    tracing::warn!(conversation_id = %self.id(), "Stuck pattern detected");
                    self.state.set_agent_status(AgentStatus::Stuck)?;
                    break;
                }
            }

            if status != AgentStatus::Running {
                self.state.set_agent_status(AgentStatus::Running)?;
            }

            if let Err(e) = self.agent.step(&self.state, &self.pipeline) {
                tracing::error!(conversation_id = %self.id(), error = %e, "Agent step failed");
                self.state.set_agent_status(AgentStatus::Error)?;
                return Err(ConversationError::Agent(e));
            }
            iteration += 1;

            let status = self.state.agent_status();
            if matches!(
                status,
                AgentStatus::Finished | AgentStatus::WaitingForConfirmation
            ) || iteration >= self.max_iteration_per_run
            {
                break;
            }
        }
        Ok(())
    }

    /// Actions the agent produced that were neither executed nor rejected
    #[must_use]
    pub fn get_pending_actions(&self) -> Vec<Event> {
        self.state.pending_actions()
    }

    /// Reject every pending action with `reason`.
    ///
    /// Leaves the waiting state first, then records one rejection per
    /// action. With nothing pending only the waiting state is cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the status or a rejection cannot be persisted.
    pub fn reject_pending_actions(&self, reason: &str) -> Result<(), ConversationError> {
        let _guard = self.state.lock();
        if self.state.waiting_for_confirmation() {
            self.state.set_agent_status(AgentStatus::Idle)?;
        }

        let pending = self.state.pending_actions();
        if pending.is_empty() {
            tracing::warn!(conversation_id = %self.id(), "No pending actions to reject");
            return Ok(());
        }

        for action in &pending {
            if let Some(rejection) = Event::rejection_for(action, reason) {
                self.pipeline.emit(rejection)?;
                tracing::info!(action_id = %action.id, reason, "Rejected pending action");
            }
        }
        Ok(())
    }

    /// Ask the run loop to stop before its next step.
    ///
    /// Only an idle or running conversation can be paused; a step already in
    /// progress completes first.
    ///
    /// # Errors
    ///
    /// Returns an error if the pause cannot be persisted.
    pub fn pause(&self) -> Result<(), ConversationError> {
        if self.state.agent_status() == AgentStatus::Paused {
            return Ok(());
        }

        let _guard = self.state.lock();
        if matches!(
            self.state.agent_status(),
            AgentStatus::Idle | AgentStatus::Running
        ) {
            self.state.set_agent_status(AgentStatus::Paused)?;
            self.pipeline
                .emit(Event::new(EventSource::User, EventKind::Pause))?;
            tracing::info!(conversation_id = %self.id(), "Agent execution paused");
        }
        Ok(())
    }

    /// Replace the confirmation policy
    ///
    /// # Errors
    ///
    /// Returns an error if the policy cannot be persisted.
    pub fn set_confirmation_policy(&self, policy: ConfirmationPolicy) -> Result<(), ConversationError> {
        let _guard = self.state.lock();
        self.state.set_confirmation_policy(policy)?;
        tracing::info!(conversation_id = %self.id(), %policy, "Confirmation policy set");
        Ok(())
    }

    /// Whether actions may pause for confirmation
    #[must_use]
    pub fn confirmation_policy_active(&self) -> bool {
        self.state.confirmation_policy().is_active()
    }

    /// Make secrets available to the agent's tools
    pub fn update_secrets<K, V>(&self, secrets: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<SecretValue>,
    {
        self.secrets.update_secrets(secrets);
    }

    /// Release the agent's resources; later calls do nothing
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(conversation_id = %self.id(), "Closing conversation");
        self.agent.close();
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("max_iteration_per_run", &self.max_iteration_per_run)
            .finish_non_exhaustive()
    }
}
