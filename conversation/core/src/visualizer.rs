//! Event Visualizer
//!
//! Default head of the event pipeline: renders one structured `tracing` line
//! per event, with known secret values masked.

use std::sync::Arc;

use crate::conversation::EventCallback;
use crate::events::{Event, EventKind};
use crate::secrets::SecretRegistry;

/// Longest text rendered for a single field
const MAX_PREVIEW: usize = 200;

/// Logs every event it observes
#[derive(Debug, Clone)]
pub struct TracingVisualizer {
    secrets: Arc<SecretRegistry>,
}

impl TracingVisualizer {
    /// Visualizer masking the values in `secrets`
    #[must_use]
    pub fn new(secrets: Arc<SecretRegistry>) -> Self {
        Self { secrets }
    }

    /// Render one event
    pub fn on_event(&self, event: &Event) {
        let summary = self.summarize(event);
        match &event.kind {
            EventKind::StreamingDelta { .. } => {
                tracing::trace!(id = %event.id, source = %event.source, "{summary}");
            }
            EventKind::AgentError { .. } => {
                tracing::warn!(id = %event.id, source = %event.source, kind = event.kind.name(), "{summary}");
            }
            _ => {
                tracing::info!(id = %event.id, source = %event.source, kind = event.kind.name(), "{summary}");
            }
        }
    }

    /// One-line description of an event
    #[must_use]
    pub fn summarize(&self, event: &Event) -> String {
        let text = match &event.kind {
            EventKind::SystemPrompt { tools, .. } => format!("system prompt ({} tools)", tools.len()),
            EventKind::Message {
                content,
                activated_microagents,
                ..
            } if activated_microagents.is_empty() => format!("message: {content}"),
            EventKind::Message {
                content,
                activated_microagents,
                ..
            } => format!("message: {content} [microagents: {}]", activated_microagents.join(", ")),
            EventKind::Action {
                tool_name,
                arguments,
                security_risk,
                ..
            } => format!("action {tool_name} {arguments} (risk {security_risk:?})"),
            EventKind::Observation {
                tool_name, content, ..
            } => format!("observation {tool_name}: {content}"),
            EventKind::UserRejectObservation {
                tool_name,
                rejection_reason,
                ..
            } => format!("rejected {tool_name}: {rejection_reason}"),
            EventKind::AgentError { error, .. } => format!("agent error: {error}"),
            EventKind::Pause => "paused".to_string(),
            EventKind::Condensation {
                forgotten_event_ids,
                ..
            } => format!("condensed {} events", forgotten_event_ids.len()),
            EventKind::CondensationRequest => "condensation requested".to_string(),
            EventKind::StreamingDelta { content } => content.clone(),
        };
        truncate(&self.secrets.mask(&text), MAX_PREVIEW)
    }

    /// This visualizer as a pipeline observer
    #[must_use]
    pub fn into_callback(self) -> EventCallback {
        Arc::new(move |event: &Event| self.on_event(event))
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
