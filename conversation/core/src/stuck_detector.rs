//! Stuck Detection
//!
//! Spots an agent repeating itself without progress. Only events after the
//! most recent user message are considered; anything before it was answered
//! by the user and is not a loop.
//!
//! Patterns:
//!
//! 1. Four identical actions, each answered by the same observation
//! 2. Three identical actions, each answered by an agent error
//! 3. A monologue: three agent messages in a row with nothing in between
//! 4. Ping-pong: actions and observations alternating A, B, A, B, A, B
//!
//! Events are compared with [`Event::same_content`], ignoring ids and times.

use crate::events::{Event, EventKind, EventSource};
use crate::state::ConversationState;

/// Events kept for analysis
const WINDOW: usize = 64;

/// Detector for repetitive agent behaviour
#[derive(Debug, Clone, Copy, Default)]
pub struct StuckDetector;

impl StuckDetector {
    /// Create a detector
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Check the recent history of `state`
    #[must_use]
    pub fn is_stuck(&self, state: &ConversationState) -> bool {
        self.is_stuck_in(&state.events().tail(WINDOW))
    }

    /// Check an explicit event history
    #[must_use]
    pub fn is_stuck_in(&self, events: &[Event]) -> bool {
        let start = events
            .iter()
            .rposition(Event::is_user_message)
            .map_or(0, |i| i + 1);
        let events = &events[start..];

        if events.len() < 3 {
            return false;
        }

        let (actions, observations) = last_actions_and_observations(events, 4);

        if repeating_action_observation(&actions, &observations) {
            tracing::warn!("Action, observation loop detected");
            return true;
        }
        if repeating_action_error(&actions, &observations) {
            tracing::warn!("Action, error loop detected");
            return true;
        }
        if monologue(events) {
            tracing::warn!("Agent monologue detected");
            return true;
        }
        if events.len() >= 6 && alternating_action_observation(events) {
            tracing::warn!("Alternating action, observation loop detected");
            return true;
        }
        false
    }
}

fn is_observation_like(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Observation { .. } | EventKind::AgentError { .. }
    )
}

/// Most recent `n` actions and `n` observations/errors, newest first
fn last_actions_and_observations(events: &[Event], n: usize) -> (Vec<&Event>, Vec<&Event>) {
    let mut actions = Vec::with_capacity(n);
    let mut observations = Vec::with_capacity(n);
    for event in events.iter().rev() {
        if event.is_action() && actions.len() < n {
            actions.push(event);
        } else if is_observation_like(event) && observations.len() < n {
            observations.push(event);
        }
        if actions.len() >= n && observations.len() >= n {
            break;
        }
    }
    (actions, observations)
}

fn all_same(events: &[&Event]) -> bool {
    events
        .split_first()
        .is_some_and(|(first, rest)| rest.iter().all(|e| first.same_content(e)))
}

fn repeating_action_observation(actions: &[&Event], observations: &[&Event]) -> bool {
    actions.len() == 4 && observations.len() == 4 && all_same(actions) && all_same(observations)
}

fn repeating_action_error(actions: &[&Event], observations: &[&Event]) -> bool {
    if actions.len() < 3 || observations.len() < 3 {
        return false;
    }
    all_same(&actions[..3])
        && observations[..3]
            .iter()
            .all(|e| matches!(e.kind, EventKind::AgentError { .. }))
}

fn monologue(events: &[Event]) -> bool {
    if events.len() < 6 {
        return false;
    }
    let mut agent_messages = 0;
    for event in events[events.len() - 6..].iter().rev() {
        match (&event.kind, event.source) {
            (EventKind::Message { .. }, EventSource::Agent) => agent_messages += 1,
            (EventKind::Condensation { .. }, _) => continue,
            _ => break,
        }
    }
    agent_messages >= 3
}

fn alternating_action_observation(events: &[Event]) -> bool {
    let (actions, observations) = last_actions_and_observations(events, 6);
    if actions.len() < 6 || observations.len() < 6 {
        return false;
    }
    let ping_pong = |e: &[&Event]| {
        e[0].same_content(e[2])
            && e[0].same_content(e[4])
            && e[1].same_content(e[3])
            && e[1].same_content(e[5])
    };
    ping_pong(&actions[..]) && ping_pong(&observations[..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(command: &str, output: &str) -> [Event; 2] {
        let action = Event::action("bash", "call", json!({ "command": command }));
        let observation = Event::observation_for(&action, output).unwrap();
        [action, observation]
    }

    fn history(steps: impl IntoIterator<Item = [Event; 2]>) -> Vec<Event> {
        let mut events = vec![Event::message(EventSource::User, "go")];
        events.extend(steps.into_iter().flatten());
        events
    }

    #[test]
    fn test_short_history_is_not_stuck() {
        let events = history([step("ls", "a")]);
        assert!(!StuckDetector::new().is_stuck_in(&events));
    }

    #[test]
    fn test_four_identical_steps_are_stuck() {
        let events = history((0..4).map(|_| step("ls", "a")));
        assert!(StuckDetector::new().is_stuck_in(&events));
    }

    #[test]
    fn test_three_identical_steps_are_not_stuck() {
        let events = history((0..3).map(|_| step("ls", "a")));
        assert!(!StuckDetector::new().is_stuck_in(&events));
    }

    #[test]
    fn test_varying_observations_are_not_stuck() {
        let events = history((0..4).map(|i| step("ls", &format!("out {i}"))));
        assert!(!StuckDetector::new().is_stuck_in(&events));
    }

    #[test]
    fn test_user_message_resets_history() {
        let mut events = history((0..4).map(|_| step("ls", "a")));
        events.push(Event::message(EventSource::User, "try again"));
        assert!(!StuckDetector::new().is_stuck_in(&events));
    }

    #[test]
    fn test_repeated_action_errors_are_stuck() {
        let mut events = vec![Event::message(EventSource::User, "go")];
        for _ in 0..3 {
            events.push(Event::action("bash", "call", json!({"command": "bad"})));
            events.push(Event::agent_error("invalid arguments"));
        }
        assert!(StuckDetector::new().is_stuck_in(&events));
    }

    #[test]
    fn test_monologue_is_stuck() {
        let mut events = history([step("ls", "a"), step("pwd", "b")]);
        for i in 0..3 {
            events.push(Event::message(EventSource::Agent, format!("thinking {i}")));
        }
        assert!(StuckDetector::new().is_stuck_in(&events));
    }

    #[test]
    fn test_ping_pong_is_stuck() {
        let events = history((0..6).map(|i| {
            if i % 2 == 0 {
                step("ls", "a")
            } else {
                step("pwd", "b")
            }
        }));
        assert!(StuckDetector::new().is_stuck_in(&events));
    }
}
