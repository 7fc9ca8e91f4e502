//! Conversation Core - State, Event Log and Run Loop for Agent Sessions
//!
//! This crate holds everything a long-lived agent conversation needs apart
//! from the agent itself: a fair lock serialising callers, an append-only
//! event log persisted one file per event, an auto-persisting state snapshot
//! and the orchestrator that drives an [`Agent`] step by step.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Conversation                          │
//! │  send_message / run / reject_pending_actions / pause          │
//! │                              │                                │
//! │               ┌──────────────┴──────────────┐                 │
//! │               ▼                             ▼                 │
//! │          Agent::step ──emit──► EventPipeline                  │
//! │                          visualizer → callbacks → append      │
//! │                                             │                 │
//! │  ┌──────────────────────────────────────────┼───────────────┐ │
//! │  │                 ConversationState         ▼               │ │
//! │  │   FairLock     StateFields ──► base_state.json           │ │
//! │  │                EventLog    ──► events/event-NNNNN-<id>    │ │
//! │  └──────────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Conversation`]: the orchestrator
//! - [`ConversationState`]: lock, fields and event log of one conversation
//! - [`EventLog`]: append-only, id-addressable, persisted event sequence
//! - [`FairLock`]: reentrant lock granting access in request order
//! - [`Agent`]: the trait an agent implements to be driven
//! - [`RuntimeContext`]: configuration and secrets shared by conversations
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use conversation_core::{Conversation, ConversationOptions, RuntimeContext};
//!
//! let ctx = RuntimeContext::load(&Default::default())?;
//! conversation_core::logging::init_tracing(&ctx.config().logging);
//!
//! let options = ConversationOptions::from_config(ctx.config());
//! let conversation = Conversation::new(Arc::new(MyAgent::new()), options, &ctx)?;
//! conversation.send_message("List the files in this repository")?;
//! conversation.run()?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod config;
pub mod confirmation;
pub mod context;
pub mod conversation;
pub mod event_log;
pub mod events;
pub mod fair_lock;
pub mod file_store;
pub mod logging;
pub mod persistence;
pub mod secrets;
pub mod state;
pub mod stuck_detector;
pub mod visualizer;

// Re-exports for convenience
pub use agent::{Agent, AgentContext, AgentSpec, KnowledgeMicroagent};
pub use confirmation::{ConfirmationPolicy, FINISH_TOOL_NAME};
pub use context::RuntimeContext;
pub use conversation::{
    Conversation, ConversationError, ConversationOptions, EventCallback, EventPipeline,
};
pub use event_log::{EventLog, EventLogError};
pub use events::{Event, EventId, EventKind, EventSource, SecurityRisk};
pub use fair_lock::{FairLock, FairLockGuard, LockError};
pub use file_store::{FileStore, FileStoreError, InMemoryFileStore, LocalFileStore};
pub use secrets::{SecretRegistry, SecretValue};
pub use state::{
    AgentStatus, ConversationId, ConversationState, StateChange, StateChangeListener, StateError,
    StateFields, StateOptions,
};
pub use stuck_detector::StuckDetector;
pub use visualizer::TracingVisualizer;

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, ConversationConfig,
};
pub use logging::{init_tracing, LoggingConfig};
