//! End-to-end turns through the agent loop with a scripted model.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use policy::{KindState, PermissionConfig, PermissionGate, PermissionRequest, RiskKind, UserDecision};
use runtime::{
    Agent, AgentConfig, Approver, Backend, CapabilityManager, FinishReason, LocalTool, Message,
    ModelError, ModelRequest, ModelResponse, Part, RejectAll, Role, ToolCall, ToolDefinition,
    ToolError, ToolResult, TurnEvent, TurnOutcome, Usage, event_channel,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Replies from a fixed script and records what it was shown.
#[derive(Default)]
struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    /// Tool names offered on each call.
    offered: Mutex<Vec<Vec<String>>>,
    /// When the script runs out, keep requesting this call.
    repeat: Option<ToolCall>,
}

impl ScriptedBackend {
    fn new(replies: impl IntoIterator<Item = Result<ModelResponse, ModelError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Default::default()
        }
    }

    fn repeating(call: ToolCall) -> Self {
        Self {
            repeat: Some(call),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.offered.lock().unwrap().len()
    }
}

impl Backend for ScriptedBackend {
    async fn call(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        self.offered
            .lock()
            .unwrap()
            .push(request.tools.iter().map(|t| t.name.clone()).collect());
        let next = self.replies.lock().unwrap().pop_front();
        match (next, &self.repeat) {
            (Some(reply), _) => reply,
            (None, Some(call)) => Ok(calls(vec![call.clone()])),
            (None, None) => Ok(text("script exhausted")),
        }
    }
}

fn text(text: &str) -> ModelResponse {
    ModelResponse {
        message: Message::assistant(text),
        usage: Usage::default(),
        finish: FinishReason::EndTurn,
    }
}

fn calls(calls: Vec<ToolCall>) -> ModelResponse {
    ModelResponse {
        message: Message {
            role: Role::Assistant,
            parts: calls.into_iter().map(Part::ToolCall).collect(),
        },
        usage: Usage::default(),
        finish: FinishReason::ToolUse,
    }
}

fn call(id: &str, name: &str, input: Value) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: name.into(),
        input,
    }
}

fn bash(id: &str, command: &str) -> ToolCall {
    call(id, "bash", json!({ "command": command }))
}

/// Answers with a fixed decision and counts the questions.
struct CountingApprover {
    answer: UserDecision,
    asked: AtomicUsize,
}

impl CountingApprover {
    fn new(answer: UserDecision) -> Arc<Self> {
        Arc::new(Self {
            answer,
            asked: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Approver for CountingApprover {
    async fn ask(&self, _request: &PermissionRequest) -> UserDecision {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

/// Sleeps for `ms` then echoes `value`.
struct Sleepy;

#[async_trait]
impl LocalTool for Sleepy {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::local("sleepy", "Sleep then echo.", json!({"type": "object"}))
    }

    fn risk(&self) -> RiskKind {
        RiskKind::FileRead
    }

    async fn execute(&self, arguments: Value) -> Result<String, ToolError> {
        let ms = arguments["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(arguments["value"].as_str().unwrap_or_default().to_string())
    }
}

fn manager() -> Arc<CapabilityManager> {
    Arc::new(
        CapabilityManager::builder()
            .builtin_tools()
            .local_tool(Arc::new(Sleepy))
            .build(),
    )
}

fn approve_all() -> Arc<PermissionGate> {
    let gate = PermissionGate::new();
    gate.set_all_operations(true);
    Arc::new(gate)
}

async fn run(
    agent: &mut Agent<ScriptedBackend>,
    text: &str,
) -> (TurnOutcome, Vec<TurnEvent>) {
    let (sink, mut stream) = event_channel();
    let outcome = agent.process_turn(text, sink, CancellationToken::new()).await;
    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }
    (outcome, events)
}

fn results(events: &[TurnEvent]) -> Vec<ToolResult> {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::ToolResult(r) => Some(r.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn plain_answer_ends_turn() {
    let backend = ScriptedBackend::new([Ok(text("Hello there."))]);
    let mut agent = Agent::new(
        backend,
        manager(),
        Arc::new(PermissionGate::new()),
        Arc::new(RejectAll),
        AgentConfig::default(),
    );

    let (outcome, events) = run(&mut agent, "hi").await;
    assert_eq!(outcome, TurnOutcome::Done);
    assert_eq!(
        events,
        vec![
            TurnEvent::ContentDelta("Hello there.".into()),
            TurnEvent::Done {
                text: "Hello there.".into()
            },
        ]
    );
    assert_eq!(agent.conversation().len(), 2);
    assert_eq!(
        agent.conversation().last_assistant_text().as_deref(),
        Some("Hello there.")
    );
}

#[tokio::test]
async fn remembered_approval_asks_once() {
    let backend = ScriptedBackend::new([
        Ok(calls(vec![bash("1", "echo one"), bash("2", "echo two")])),
        Ok(calls(vec![bash("3", "echo three")])),
        Ok(text("All done.")),
    ]);
    let approver = CountingApprover::new(UserDecision::always(true));
    let gate = Arc::new(PermissionGate::new());
    let mut agent = Agent::new(
        backend,
        manager(),
        Arc::clone(&gate),
        approver.clone(),
        AgentConfig::default(),
    );

    let (outcome, events) = run(&mut agent, "count to three").await;
    assert_eq!(outcome, TurnOutcome::Done);
    assert_eq!(approver.asked.load(Ordering::SeqCst), 1);
    assert_eq!(gate.flags().state(RiskKind::BashExec), KindState::SessionApproved);

    let asked: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, TurnEvent::PermissionRequested(_)))
        .collect();
    assert_eq!(asked.len(), 1);

    let outputs: Vec<String> = results(&events).iter().map(ToolResult::output_text).collect();
    assert_eq!(outputs, vec!["one\n", "two\n", "three\n"]);
    assert!(matches!(events.last(), Some(TurnEvent::Done { text }) if text == "All done."));

    // user, assistant(calls), results, assistant(calls), results, assistant
    assert_eq!(agent.conversation().len(), 6);
    assert_eq!(agent.backend().calls(), 3);
}

#[tokio::test]
async fn rejected_call_is_not_executed() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("touched");
    let command = format!("touch {}", marker.display());
    let backend = ScriptedBackend::new([
        Ok(calls(vec![bash("1", &command)])),
        Ok(text("Understood.")),
    ]);
    let mut agent = Agent::new(
        backend,
        manager(),
        Arc::new(PermissionGate::new()),
        Arc::new(RejectAll),
        AgentConfig::default(),
    );

    let (outcome, events) = run(&mut agent, "touch it").await;
    assert_eq!(outcome, TurnOutcome::Done);
    assert!(!marker.exists());
    let results = results(&events);
    assert!(matches!(
        &results[0],
        ToolResult::Failure { error: ToolError::PermissionDenied(_), .. }
    ));
}

#[tokio::test]
async fn configured_deny_skips_the_approver() {
    let config = PermissionConfig::parse("deny = [\"bash-exec\"]").unwrap();
    let approver = CountingApprover::new(UserDecision::always(true));
    let backend = ScriptedBackend::new([Ok(calls(vec![bash("1", "echo hi")])), Ok(text("ok"))]);
    let mut agent = Agent::new(
        backend,
        manager(),
        Arc::new(PermissionGate::from_config(&config)),
        approver.clone(),
        AgentConfig::default(),
    );

    let (_, events) = run(&mut agent, "go").await;
    assert_eq!(approver.asked.load(Ordering::SeqCst), 0);
    assert!(!results(&events)[0].is_success());
}

#[tokio::test]
async fn results_keep_call_order() {
    let backend = ScriptedBackend::new([
        Ok(calls(vec![
            call("a", "sleepy", json!({"ms": 150, "value": "first"})),
            call("b", "sleepy", json!({"ms": 10, "value": "second"})),
            call("c", "sleepy", json!({"ms": 60, "value": "third"})),
        ])),
        Ok(text("ok")),
    ]);
    let mut agent = Agent::new(
        backend,
        manager(),
        approve_all(),
        Arc::new(RejectAll),
        AgentConfig::default(),
    );

    let started = Instant::now();
    let (outcome, events) = run(&mut agent, "go").await;
    assert_eq!(outcome, TurnOutcome::Done);
    // Concurrent, so well under the 220ms sum.
    assert!(started.elapsed() < Duration::from_millis(1000));

    let ids: Vec<String> = results(&events)
        .iter()
        .map(|r| r.tool_call_id().to_string())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    let stored: Vec<String> = agent
        .conversation()
        .tool_results()
        .map(ToolResult::output_text)
        .collect();
    assert_eq!(stored, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn unknown_tool_fails_the_call_not_the_turn() {
    let backend = ScriptedBackend::new([
        Ok(calls(vec![call("1", "teleport", json!({}))])),
        Ok(text("That tool does not exist.")),
    ]);
    let mut agent = Agent::new(
        backend,
        manager(),
        approve_all(),
        Arc::new(RejectAll),
        AgentConfig::default(),
    );

    let (outcome, events) = run(&mut agent, "go").await;
    assert_eq!(outcome, TurnOutcome::Done);
    assert_eq!(
        results(&events),
        vec![ToolResult::failure(
            "1",
            ToolError::NotFound("teleport".into())
        )]
    );
}

#[tokio::test]
async fn round_limit_ends_turn() {
    let backend = ScriptedBackend::repeating(bash("x", "true"));
    let mut agent = Agent::new(
        backend,
        manager(),
        approve_all(),
        Arc::new(RejectAll),
        AgentConfig {
            max_rounds: 3,
            ..Default::default()
        },
    );

    let (outcome, events) = run(&mut agent, "loop forever").await;
    assert_eq!(outcome, TurnOutcome::RoundLimitExceeded { rounds: 3 });
    assert_eq!(agent.backend().calls(), 3);
    assert_eq!(events.last(), Some(&TurnEvent::RoundLimitExceeded { rounds: 3 }));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let last = agent.conversation().last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.text().contains("3 rounds"));
}

#[tokio::test]
async fn provider_error_aborts() {
    let backend = ScriptedBackend::new([Err(ModelError::Api("529: overloaded".into()))]);
    let mut agent = Agent::new(
        backend,
        manager(),
        approve_all(),
        Arc::new(RejectAll),
        AgentConfig::default(),
    );

    let (outcome, events) = run(&mut agent, "hi").await;
    assert!(matches!(outcome, TurnOutcome::Aborted { ref reason } if reason.contains("overloaded")));
    assert!(matches!(events.last(), Some(TurnEvent::Aborted { .. })));
    let text = agent.conversation().last_assistant_text().unwrap();
    assert!(text.starts_with("Error:"));
}

#[tokio::test]
async fn cancel_interrupts_long_tool() {
    let backend = ScriptedBackend::new([Ok(calls(vec![bash("1", "sleep 30")]))]);
    let mut agent = Agent::new(
        backend,
        manager(),
        approve_all(),
        Arc::new(RejectAll),
        AgentConfig::default(),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let (sink, mut stream) = event_channel();
    let started = Instant::now();
    let outcome = agent.process_turn("sleep", sink, cancel).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        outcome,
        TurnOutcome::Aborted {
            reason: "cancelled".into()
        }
    );

    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }
    assert_eq!(
        results(&events),
        vec![ToolResult::failure("1", ToolError::Cancelled)]
    );

    // The next turn starts from a consistent history.
    let last = agent.conversation().last().unwrap();
    assert_eq!(last.role, Role::Tool);
}

#[tokio::test]
async fn tool_timeout_reports_failure() {
    let backend = ScriptedBackend::new([
        Ok(calls(vec![call("1", "sleepy", json!({"ms": 5000}))])),
        Ok(text("too slow")),
    ]);
    let mut agent = Agent::new(
        backend,
        manager(),
        approve_all(),
        Arc::new(RejectAll),
        AgentConfig {
            tool_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    );

    let (outcome, events) = run(&mut agent, "go").await;
    assert_eq!(outcome, TurnOutcome::Done);
    assert_eq!(
        results(&events),
        vec![ToolResult::failure("1", ToolError::Timeout(50))]
    );
}

#[tokio::test]
async fn clear_resets_history_and_permissions() {
    let backend = ScriptedBackend::new([Ok(calls(vec![bash("1", "true")])), Ok(text("ok"))]);
    let gate = Arc::new(PermissionGate::new());
    let mut agent = Agent::new(
        backend,
        manager(),
        Arc::clone(&gate),
        CountingApprover::new(UserDecision::always(true)),
        AgentConfig::default(),
    );

    run(&mut agent, "go").await;
    assert_eq!(gate.flags().state(RiskKind::BashExec), KindState::SessionApproved);

    agent.clear();
    assert!(agent.conversation().is_empty());
    assert_eq!(gate.flags(), Default::default());
}

#[tokio::test]
async fn zero_rounds_stops_before_the_model() {
    let backend = ScriptedBackend::new([Ok(text("never sent"))]);
    let mut agent = Agent::new(
        backend,
        manager(),
        approve_all(),
        Arc::new(RejectAll),
        AgentConfig {
            max_rounds: 0,
            ..Default::default()
        },
    );

    let (outcome, _) = run(&mut agent, "hi").await;
    assert_eq!(outcome, TurnOutcome::RoundLimitExceeded { rounds: 0 });
    assert_eq!(agent.backend().calls(), 0);
}
