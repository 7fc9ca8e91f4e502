//! End-to-end conversation scenarios
//!
//! These drive a scripted agent through the public API only: persistence and
//! resume, the confirmation workflow, reopening finished conversations and
//! stuck detection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use conversation_core::persistence::{
    event_file_name, legacy_event_file_name, BASE_STATE, EVENTS_DIR,
};
use conversation_core::{
    Agent, AgentSpec, AgentStatus, ConfirmationPolicy, Conversation, ConversationError,
    ConversationId, ConversationOptions, ConversationState, Event, EventKind, EventLog,
    EventLogError, EventPipeline, EventSource, FileStore, InMemoryFileStore, LocalFileStore,
    RuntimeContext, SecurityRisk, StateChange, StateError,
};

// =============================================================================
// Scripted agent
// =============================================================================

/// Runs one queued shell command per step, then finishes.
///
/// Pending actions left over from a confirmation pause are executed first.
struct ShellAgent {
    spec: AgentSpec,
    commands: Mutex<VecDeque<String>>,
    risk: SecurityRisk,
    fail_on: Option<String>,
    closes: AtomicUsize,
}

impl ShellAgent {
    fn new(commands: &[&str]) -> Self {
        Self {
            spec: AgentSpec::new("shell").with_config("model", json!("test-model")),
            commands: Mutex::new(commands.iter().map(|c| (*c).to_string()).collect()),
            risk: SecurityRisk::Medium,
            fail_on: None,
            closes: AtomicUsize::new(0),
        }
    }

    fn with_spec(mut self, spec: AgentSpec) -> Self {
        self.spec = spec;
        self
    }

    fn failing_on(mut self, command: &str) -> Self {
        self.fail_on = Some(command.to_string());
        self
    }

    fn execute(&self, action: &Event, on_event: &EventPipeline) -> anyhow::Result<()> {
        let command = match &action.kind {
            EventKind::Action { arguments, .. } => {
                arguments["command"].as_str().unwrap_or_default().to_string()
            }
            _ => anyhow::bail!("not an action"),
        };
        let observation = Event::observation_for(action, format!("ran {command}"))
            .ok_or_else(|| anyhow::anyhow!("not an action"))?;
        on_event.emit(observation)?;
        Ok(())
    }
}

impl Agent for ShellAgent {
    fn spec(&self) -> AgentSpec {
        self.spec.clone()
    }

    fn init_state(&self, state: &ConversationState, on_event: &EventPipeline) -> anyhow::Result<()> {
        if state.events().is_empty() {
            on_event.emit(Event::new(
                EventSource::Agent,
                EventKind::SystemPrompt {
                    system_prompt: "You run shell commands.".into(),
                    tools: vec![json!({"name": "bash"})],
                },
            ))?;
        }
        Ok(())
    }

    fn step(&self, state: &ConversationState, on_event: &EventPipeline) -> anyhow::Result<()> {
        let pending = state.pending_actions();
        if !pending.is_empty() {
            for action in &pending {
                self.execute(action, on_event)?;
            }
            return Ok(());
        }

        let next = self.commands.lock().pop_front();
        let Some(command) = next else {
            on_event.emit(Event::message(EventSource::Agent, "done"))?;
            state.set_agent_status(AgentStatus::Finished)?;
            return Ok(());
        };

        if self.fail_on.as_deref() == Some(command.as_str()) {
            anyhow::bail!("model refused {command}");
        }

        let action = Event::action("bash", format!("call-{command}"), json!({ "command": command }))
            .with_security_risk(self.risk);
        on_event.emit(action.clone())?;
        if state.await_confirmation_if_required(std::slice::from_ref(&action))? {
            return Ok(());
        }
        self.execute(&action, on_event)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn quiet() -> ConversationOptions {
    ConversationOptions::default()
        .with_visualize(false)
        .with_stuck_detection(false)
}

fn local_store(dir: &TempDir) -> Arc<dyn FileStore> {
    Arc::new(LocalFileStore::new(dir.path()).unwrap())
}

fn kinds(conversation: &Conversation) -> Vec<&'static str> {
    conversation
        .state()
        .events()
        .iter()
        .map(|e| e.kind.name())
        .collect()
}

// =============================================================================
// Basic run
// =============================================================================

#[test]
fn test_run_executes_commands_then_finishes() {
    let conversation = Conversation::new(
        Arc::new(ShellAgent::new(&["ls", "pwd"])),
        quiet(),
        &RuntimeContext::default(),
    )
    .unwrap();

    conversation.send_message("look around").unwrap();
    conversation.run().unwrap();

    assert_eq!(conversation.state().agent_status(), AgentStatus::Finished);
    assert_eq!(
        kinds(&conversation),
        vec![
            "system_prompt",
            "message",
            "action",
            "observation",
            "action",
            "observation",
            "message",
        ]
    );
    assert!(conversation.get_pending_actions().is_empty());
}

#[test]
fn test_agent_failure_sets_error_status() {
    let conversation = Conversation::new(
        Arc::new(ShellAgent::new(&["ls", "rm -rf /"]).failing_on("rm -rf /")),
        quiet(),
        &RuntimeContext::default(),
    )
    .unwrap();
    conversation.send_message("clean up").unwrap();

    let err = conversation.run().unwrap_err();
    assert!(matches!(err, ConversationError::Agent(_)));
    assert!(err.to_string().contains("model refused"));
    assert_eq!(conversation.state().agent_status(), AgentStatus::Error);

    // A later run recovers and continues with the script
    conversation.run().unwrap();
    assert_eq!(conversation.state().agent_status(), AgentStatus::Finished);
}

// =============================================================================
// Persistence and resume
// =============================================================================

#[test]
fn test_resume_preserves_events_and_status() {
    let dir = TempDir::new().unwrap();
    let id = ConversationId::new();

    let first_ids = {
        let conversation = Conversation::new(
            Arc::new(ShellAgent::new(&["ls"])),
            quiet().with_id(id).with_store(local_store(&dir)),
            &RuntimeContext::default(),
        )
        .unwrap();
        conversation.send_message("list").unwrap();
        conversation.run().unwrap();
        let ids: Vec<_> = conversation.state().events().iter().map(|e| e.id).collect();
        ids
    };

    let resumed = Conversation::new(
        Arc::new(ShellAgent::new(&[])),
        quiet().with_id(id).with_store(local_store(&dir)),
        &RuntimeContext::default(),
    )
    .unwrap();

    let resumed_ids: Vec<_> = resumed.state().events().iter().map(|e| e.id).collect();
    assert_eq!(resumed_ids, first_ids);
    assert_eq!(resumed.state().agent_status(), AgentStatus::Finished);
    assert_eq!(resumed.id(), id);
    // init_state saw a non-empty log and emitted nothing
    assert_eq!(resumed.state().events().len(), first_ids.len());
}

#[test]
fn test_resume_with_other_id_fails() {
    let store: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());
    let first = Conversation::new(
        Arc::new(ShellAgent::new(&[])),
        quiet().with_store(Arc::clone(&store)),
        &RuntimeContext::default(),
    )
    .unwrap();

    let err = Conversation::new(
        Arc::new(ShellAgent::new(&[])),
        quiet().with_id(ConversationId::new()).with_store(store),
        &RuntimeContext::default(),
    )
    .unwrap_err();

    match err {
        ConversationError::State(StateError::IdMismatch { persisted, .. }) => {
            assert_eq!(persisted, first.id());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_resume_with_drifted_agent_config_fails() {
    let store: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());
    let id = ConversationId::new();
    drop(
        Conversation::new(
            Arc::new(ShellAgent::new(&[])),
            quiet().with_id(id).with_store(Arc::clone(&store)),
            &RuntimeContext::default(),
        )
        .unwrap(),
    );

    let drifted = ShellAgent::new(&[]).with_spec(AgentSpec::new("shell").with_config("model", json!("other")));
    let err = Conversation::new(
        Arc::new(drifted),
        quiet().with_id(id).with_store(store),
        &RuntimeContext::default(),
    )
    .unwrap_err();

    match err {
        ConversationError::State(StateError::AgentMismatch { differences }) => {
            assert_eq!(differences, vec!["config.model".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_runtime_agent_fields_never_persisted() {
    let dir = TempDir::new().unwrap();
    let store = local_store(&dir);
    let agent = ShellAgent::new(&[]).with_spec(
        AgentSpec::new("shell")
            .with_config("model", json!("test-model"))
            .with_runtime("api_key", json!("sk-live-123")),
    );
    let _conversation = Conversation::new(
        Arc::new(agent),
        quiet().with_store(Arc::clone(&store)),
        &RuntimeContext::default(),
    )
    .unwrap();

    let snapshot = store.read(BASE_STATE).unwrap();
    assert!(snapshot.contains("test-model"));
    assert!(!snapshot.contains("sk-live-123"));
}

#[test]
fn test_persistence_via_runtime_context() {
    let root = TempDir::new().unwrap();
    let mut config = conversation_core::ConversationConfig::default();
    config.persistence.enabled = true;
    config.persistence.root = Some(root.path().to_path_buf());
    let ctx = RuntimeContext::new(config);

    let conversation = Conversation::new(Arc::new(ShellAgent::new(&[])), quiet(), &ctx).unwrap();
    let dir = root.path().join(conversation.id().to_string());

    assert!(dir.join(BASE_STATE).is_file());
    assert_eq!(
        conversation.state().read(|f| f.persistence_dir.clone()),
        Some(dir.display().to_string())
    );
}

#[test]
fn test_legacy_files_resume_and_migrate() {
    let store: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());
    let id = ConversationId::new();

    let legacy_snapshot = json!({
        "id": id.to_string(),
        "agent": { "kind": "shell", "config": { "model": "test-model" } },
        "agent_finished": true,
        "confirmation_mode": false,
    });
    store
        .write(BASE_STATE, legacy_snapshot.to_string().as_bytes())
        .unwrap();

    let events = [
        Event::message(EventSource::User, "old question"),
        Event::message(EventSource::Agent, "old answer"),
    ];
    for (idx, event) in events.iter().enumerate() {
        let path = format!("{EVENTS_DIR}/{}", legacy_event_file_name(idx));
        store
            .write(&path, serde_json::to_string(event).unwrap().as_bytes())
            .unwrap();
    }

    let conversation = Conversation::new(
        Arc::new(ShellAgent::new(&[])),
        quiet().with_id(id).with_store(Arc::clone(&store)),
        &RuntimeContext::default(),
    )
    .unwrap();

    assert_eq!(conversation.state().agent_status(), AgentStatus::Finished);
    assert_eq!(conversation.state().events().len(), 2);

    let migrated = conversation.state().events().migrate_legacy_files().unwrap();
    assert_eq!(migrated, 2);
    for (idx, event) in events.iter().enumerate() {
        assert!(store.exists(&format!("{EVENTS_DIR}/{}", event_file_name(idx, &event.id))));
        assert!(!store.exists(&format!("{EVENTS_DIR}/{}", legacy_event_file_name(idx))));
    }
    assert_eq!(conversation.state().events().get_index(&events[1].id).unwrap(), 1);
}

// =============================================================================
// Event log properties
// =============================================================================

#[test]
fn test_duplicate_event_id_leaves_log_unchanged() {
    let store: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());
    let log = EventLog::open(Arc::clone(&store), EVENTS_DIR).unwrap();

    let event = Event::message(EventSource::User, "hi");
    log.append(&event).unwrap();
    let files_before = store.list(EVENTS_DIR).unwrap();

    let duplicate = Event::message(EventSource::Agent, "again").with_id(event.id.clone());
    let err = log.append(&duplicate).unwrap_err();

    assert!(matches!(err, EventLogError::IdConflict { .. }));
    assert_eq!(log.len(), 1);
    assert_eq!(store.list(EVENTS_DIR).unwrap(), files_before);
}

#[test]
fn test_gap_in_event_files_truncates_log() {
    let dir = TempDir::new().unwrap();
    let store = local_store(&dir);

    for idx in [0usize, 1, 2, 4, 5] {
        let event = Event::message(EventSource::User, format!("m{idx}"));
        let path = format!("{EVENTS_DIR}/{}", event_file_name(idx, &event.id));
        store
            .write(&path, serde_json::to_string(&event).unwrap().as_bytes())
            .unwrap();
    }

    let log = EventLog::open(store, EVENTS_DIR).unwrap();
    assert_eq!(log.len(), 3);
    assert!(matches!(
        log.get(3),
        Err(EventLogError::IndexOutOfRange { .. })
    ));
}

#[test]
fn test_unmatched_actions() {
    let a = Event::action("bash", "1", json!({"command": "ls"}));
    let b = Event::action("bash", "2", json!({"command": "pwd"}));
    let observed = Event::observation_for(&a, "ok").unwrap();
    let rejected = Event::rejection_for(&b, "no").unwrap();

    assert!(ConversationState::get_unmatched_actions(&[]).is_empty());
    assert_eq!(
        ConversationState::get_unmatched_actions(&[a.clone(), b.clone()]),
        vec![a.clone(), b.clone()]
    );
    assert_eq!(
        ConversationState::get_unmatched_actions(&[a.clone(), b.clone(), observed.clone()]),
        vec![b.clone()]
    );
    assert!(ConversationState::get_unmatched_actions(&[a, b, observed, rejected]).is_empty());
}

// =============================================================================
// Confirmation workflow
// =============================================================================

#[test]
fn test_confirmation_pause_and_reject() {
    let conversation = Conversation::new(
        Arc::new(ShellAgent::new(&["rm build"])),
        quiet().with_confirmation_mode(true),
        &RuntimeContext::default(),
    )
    .unwrap();

    conversation.send_message("clean").unwrap();
    conversation.run().unwrap();

    assert_eq!(
        conversation.state().agent_status(),
        AgentStatus::WaitingForConfirmation
    );
    let pending = conversation.get_pending_actions();
    assert_eq!(pending.len(), 1);

    conversation.reject_pending_actions("not now").unwrap();

    assert!(conversation.get_pending_actions().is_empty());
    assert_eq!(conversation.state().agent_status(), AgentStatus::Idle);
    let last = conversation.state().events().get(-1).unwrap();
    assert_eq!(last.source, EventSource::User);
    match &last.kind {
        EventKind::UserRejectObservation {
            action_id,
            rejection_reason,
            ..
        } => {
            assert_eq!(action_id, &pending[0].id);
            assert_eq!(rejection_reason, "not now");
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    // Nothing pending: a second reject is a no-op
    let len = conversation.state().events().len();
    conversation.reject_pending_actions("again").unwrap();
    assert_eq!(conversation.state().events().len(), len);
}

#[test]
fn test_run_while_waiting_approves_pending_actions() {
    let conversation = Conversation::new(
        Arc::new(ShellAgent::new(&["make"])),
        quiet().with_confirmation_mode(true),
        &RuntimeContext::default(),
    )
    .unwrap();

    conversation.send_message("build").unwrap();
    conversation.run().unwrap();
    assert!(conversation.state().waiting_for_confirmation());

    conversation.run().unwrap();

    assert_eq!(conversation.state().agent_status(), AgentStatus::Finished);
    assert!(conversation.get_pending_actions().is_empty());
    let observations = conversation
        .state()
        .events()
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Observation { .. }))
        .count();
    assert_eq!(observations, 1);
}

#[test]
fn test_risky_policy_lets_low_risk_through() {
    let conversation = Conversation::new(
        Arc::new(ShellAgent::new(&["ls"])),
        quiet(),
        &RuntimeContext::default(),
    )
    .unwrap();
    conversation
        .set_confirmation_policy(ConfirmationPolicy::ConfirmRisky {
            threshold: SecurityRisk::High,
            confirm_unknown: true,
        })
        .unwrap();

    conversation.send_message("list").unwrap();
    conversation.run().unwrap();

    assert_eq!(conversation.state().agent_status(), AgentStatus::Finished);
}

// =============================================================================
// Status transitions
// =============================================================================

#[test]
fn test_message_after_finish_reopens_before_append() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&log);
    let conversation = Conversation::new(
        Arc::new(ShellAgent::new(&[])),
        quiet().with_callback(Arc::new(move |event: &Event| {
            if event.is_user_message() {
                sink.lock().push("user message".to_string());
            }
        })),
        &RuntimeContext::default(),
    )
    .unwrap();

    conversation.run().unwrap();
    assert_eq!(conversation.state().agent_status(), AgentStatus::Finished);

    let sink = Arc::clone(&log);
    conversation
        .state()
        .set_on_state_change(Some(Arc::new(move |change: &StateChange| {
            if change.field == "agent_status" {
                sink.lock().push(format!("status {}", change.new));
            }
        })));

    conversation.send_message("one more thing").unwrap();

    assert_eq!(
        *log.lock(),
        vec!["status \"idle\"".to_string(), "user message".to_string()]
    );
    assert_eq!(conversation.state().agent_status(), AgentStatus::Idle);

    conversation.run().unwrap();
    assert_eq!(conversation.state().agent_status(), AgentStatus::Finished);
}

#[test]
fn test_subscribers_receive_changes_in_order() {
    let conversation = Conversation::new(
        Arc::new(ShellAgent::new(&["ls"])),
        quiet(),
        &RuntimeContext::default(),
    )
    .unwrap();
    let mut rx = conversation.state().subscribe();

    conversation.send_message("go").unwrap();
    conversation.run().unwrap();

    let mut statuses = Vec::new();
    while let Ok(change) = rx.try_recv() {
        if change.field == "agent_status" {
            statuses.push(change.new.as_str().unwrap_or_default().to_string());
        }
    }
    assert_eq!(statuses, vec!["running".to_string(), "finished".to_string()]);
}

#[test]
fn test_repeating_agent_gets_stuck() {
    let commands = ["ls"; 10];
    let conversation = Conversation::new(
        Arc::new(ShellAgent::new(&commands)),
        quiet().with_stuck_detection(true),
        &RuntimeContext::default(),
    )
    .unwrap();

    conversation.send_message("loop").unwrap();
    conversation.run().unwrap();

    assert_eq!(conversation.state().agent_status(), AgentStatus::Stuck);
    let actions = conversation
        .state()
        .events()
        .iter()
        .filter(Event::is_action)
        .count();
    assert_eq!(actions, 4);

    // Stuck conversations stay put until the user intervenes
    conversation.run().unwrap();
    assert_eq!(conversation.state().agent_status(), AgentStatus::Stuck);
}

#[test]
fn test_close_runs_once() {
    let agent = Arc::new(ShellAgent::new(&[]));
    let conversation = Conversation::new(
        Arc::clone(&agent) as Arc<dyn Agent>,
        quiet(),
        &RuntimeContext::default(),
    )
    .unwrap();
    conversation.close();
    drop(conversation);
    assert_eq!(agent.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_secrets_are_shared_with_context() {
    let ctx = RuntimeContext::default();
    let conversation = Conversation::new(Arc::new(ShellAgent::new(&[])), quiet(), &ctx).unwrap();
    conversation.update_secrets([("DEPLOY_TOKEN", "tok-1")]);

    assert_eq!(ctx.secrets().get("DEPLOY_TOKEN").as_deref(), Some("tok-1"));
    assert_eq!(
        ctx.secrets().mask("echo tok-1"),
        format!("echo {}", conversation_core::secrets::SECRET_MASK)
    );
}
