//! The orchestration loop.
//!
//! One call to [`Agent::process_turn`] takes a user message through as many
//! model rounds as the model needs: stream the reply, run the requested
//! tools (gated by the [`PermissionGate`]), feed the results back, repeat.

use std::collections::HashSet;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use policy::{Decision, PermissionGate, PermissionRequest, UserDecision};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::capability::CapabilityManager;
use crate::conversation::Conversation;
use crate::events::{EventSink, TurnEvent};
use crate::model::{
    Backend, Message, ModelError, ModelRequest, Part, Role, StreamChunk, ToolCall, ToolResult,
};
use crate::tools::{RegisteredTool, ToolError, ToolHandler, ToolRegistry, truncate};
use crate::Error;

/// Default cap on provider calls per turn.
pub const DEFAULT_MAX_ROUNDS: u32 = 400;

/// Limits applied to every turn.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_rounds: u32,
    pub tool_timeout: Duration,
    /// Bound on opening the provider stream and on each chunk after that.
    pub provider_timeout: Duration,
    pub max_concurrent_tools: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            tool_timeout: Duration::from_secs(60),
            provider_timeout: Duration::from_secs(300),
            max_concurrent_tools: 4,
        }
    }
}

/// Out-of-band source of permission decisions (usually the user).
#[async_trait]
pub trait Approver: Send + Sync {
    async fn ask(&self, request: &PermissionRequest) -> UserDecision;
}

/// Answers "no" to everything.
#[derive(Debug, Default)]
pub struct RejectAll;

#[async_trait]
impl Approver for RejectAll {
    async fn ask(&self, _request: &PermissionRequest) -> UserDecision {
        UserDecision::once(false)
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Done,
    Aborted { reason: String },
    RoundLimitExceeded { rounds: u32 },
}

enum RoundEnd {
    Complete(Message),
    Cancelled(String),
    Failed(ModelError),
}

/// Drives conversation turns against a backend.
///
/// Taking `&mut self` per turn keeps a single turn active per agent.
pub struct Agent<B: Backend> {
    backend: B,
    capabilities: Arc<CapabilityManager>,
    gate: Arc<PermissionGate>,
    approver: Arc<dyn Approver>,
    config: AgentConfig,
    conversation: Conversation,
    /// Serializes questions to the approver.
    asking: tokio::sync::Mutex<()>,
}

impl<B: Backend> Agent<B> {
    pub fn new(
        backend: B,
        capabilities: Arc<CapabilityManager>,
        gate: Arc<PermissionGate>,
        approver: Arc<dyn Approver>,
        config: AgentConfig,
    ) -> Self {
        Self {
            backend,
            capabilities,
            gate,
            approver,
            config,
            conversation: Conversation::new(),
            asking: tokio::sync::Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn capabilities(&self) -> &Arc<CapabilityManager> {
        &self.capabilities
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Forget the conversation and every session permission.
    pub fn clear(&mut self) {
        self.conversation.clear();
        self.gate.reset_session();
        info!("conversation cleared");
    }

    /// Process one user message to a terminal state.
    ///
    /// Events go to `events`, which is dropped on return so the consumer's
    /// stream ends. `cancel` aborts the turn at the next suspension point.
    pub async fn process_turn(
        &mut self,
        text: &str,
        events: EventSink,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let span = info_span!("turn", id = %Uuid::new_v4());
        self.run_turn(text, &events, &cancel).instrument(span).await
    }

    async fn run_turn(
        &mut self,
        text: &str,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        self.conversation.push_user(text);
        let mut rounds = 0;

        loop {
            if cancel.is_cancelled() {
                return self.abort(events, "cancelled");
            }
            if rounds >= self.config.max_rounds {
                warn!(rounds, "round limit reached");
                self.conversation.push_assistant(Message::assistant(format!(
                    "Stopped after {rounds} rounds without a final answer. \
                     Send another message to let me continue."
                )));
                events.emit(TurnEvent::RoundLimitExceeded { rounds });
                return TurnOutcome::RoundLimitExceeded { rounds };
            }
            rounds += 1;

            let registry = self.capabilities.get_tools();
            debug!(round = rounds, tools = registry.len(), "dispatching round");

            let message = match self.stream_round(&registry, events, cancel).await {
                RoundEnd::Complete(message) => message,
                RoundEnd::Cancelled(partial) => {
                    if !partial.is_empty() {
                        self.conversation.push_assistant(Message::assistant(partial));
                    }
                    return self.abort(events, "cancelled");
                }
                RoundEnd::Failed(e) => {
                    warn!(round = rounds, "provider call failed: {e}");
                    self.conversation
                        .push_assistant(Message::assistant(format!("Error: {e}")));
                    return self.abort(events, &e.to_string());
                }
            };

            let calls = message.tool_calls();
            let text = message.text();
            if !message.parts.is_empty() {
                self.conversation.push_assistant(message);
            }
            if calls.is_empty() {
                events.emit(TurnEvent::Done { text });
                return TurnOutcome::Done;
            }

            events.emit(TurnEvent::ToolCallsRequested(calls.clone()));
            let results = self.execute_calls(&registry, &calls, events, cancel).await;
            if let Err(e) = self.conversation.push_tool_results(results) {
                warn!("dropping inconsistent tool results: {e}");
                return self.abort(events, &e.to_string());
            }
        }
    }

    async fn stream_round(
        &self,
        registry: &ToolRegistry,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> RoundEnd {
        let specs = registry.specs();
        let request = ModelRequest {
            messages: self.conversation.messages(),
            tools: &specs,
        };
        let timeout = self.config.provider_timeout;

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RoundEnd::Cancelled(String::new()),
            opened = tokio::time::timeout(timeout, self.backend.stream(request)) => match opened {
                Err(_) => return RoundEnd::Failed(ModelError::Timeout(timeout)),
                Ok(Err(e)) => return RoundEnd::Failed(e),
                Ok(Ok(stream)) => stream,
            },
        };

        let mut text = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        let mut ids = HashSet::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return RoundEnd::Cancelled(text),
                next = tokio::time::timeout(timeout, stream.next()) => next,
            };
            match next {
                Err(_) => return RoundEnd::Failed(ModelError::Timeout(timeout)),
                Ok(None) => break,
                Ok(Some(Err(e))) => return RoundEnd::Failed(e),
                Ok(Some(Ok(StreamChunk::Text(delta)))) => {
                    if !delta.is_empty() {
                        text.push_str(&delta);
                        events.emit(TurnEvent::ContentDelta(delta));
                    }
                }
                Ok(Some(Ok(StreamChunk::ToolCall(mut call)))) => {
                    if call.id.is_empty() || !ids.insert(call.id.clone()) {
                        call.id = format!("call_{}", Uuid::new_v4().simple());
                        ids.insert(call.id.clone());
                    }
                    calls.push(call);
                }
                Ok(Some(Ok(StreamChunk::Finish { reason, usage }))) => {
                    debug!(
                        ?reason,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "round finished"
                    );
                }
            }
        }

        let mut parts = Vec::with_capacity(calls.len() + 1);
        if !text.is_empty() {
            parts.push(Part::Text(text));
        }
        parts.extend(calls.into_iter().map(Part::ToolCall));
        RoundEnd::Complete(Message {
            role: Role::Assistant,
            parts,
        })
    }

    /// Run a round's calls, at most `max_concurrent_tools` at once.
    /// Results come back in call order whatever order they finish in.
    async fn execute_calls(
        &self,
        registry: &ToolRegistry,
        calls: &[ToolCall],
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let limit = self.config.max_concurrent_tools.max(1);
        let mut running = pin!(
            futures::stream::iter(
                calls
                    .iter()
                    .map(|call| self.run_call(registry, call, events, cancel)),
            )
            .buffered(limit)
        );

        let mut results = Vec::with_capacity(calls.len());
        while let Some(result) = running.next().await {
            events.emit(TurnEvent::ToolResult(result.clone()));
            results.push(result);
        }
        results
    }

    async fn run_call(
        &self,
        registry: &ToolRegistry,
        call: &ToolCall,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let Some(tool) = registry.get(&call.name) else {
            debug!(tool = %call.name, "model requested unknown tool");
            return ToolResult::failure(&call.id, ToolError::NotFound(call.name.clone()));
        };

        let request = tool.permission_request(&call.input);
        if let Err(error) = self.authorize(&request, events, cancel).await {
            debug!(tool = %call.name, call_id = %call.id, "{error}");
            return ToolResult::failure(&call.id, error);
        }

        let timeout = self.config.tool_timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            result = tokio::time::timeout(timeout, self.execute(tool, call)) => {
                result.unwrap_or_else(|_| Err(ToolError::Timeout(millis(timeout))))
            }
        };

        match outcome {
            Ok(output) => {
                debug!(tool = %call.name, call_id = %call.id, bytes = output.len(), "tool succeeded");
                ToolResult::success(&call.id, output)
            }
            Err(error) => {
                debug!(tool = %call.name, call_id = %call.id, "tool failed: {error}");
                ToolResult::failure(&call.id, error)
            }
        }
    }

    async fn authorize(
        &self,
        request: &PermissionRequest,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        if let Some(settled) = settled(self.gate.decide(request)) {
            return settled;
        }

        // One question at a time; an earlier "always" may answer this one.
        let _asking = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ToolError::Cancelled),
            guard = self.asking.lock() => guard,
        };
        if let Some(settled) = settled(self.gate.decide(request)) {
            return settled;
        }

        events.emit(TurnEvent::PermissionRequested(request.clone()));
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ToolError::Cancelled),
            answer = self.approver.ask(request) => answer,
        };
        self.gate.record(request.kind, answer);

        if answer.approved {
            Ok(())
        } else {
            Err(ToolError::PermissionDenied(format!(
                "{} was rejected by the user",
                request.tool
            )))
        }
    }

    async fn execute(&self, tool: &RegisteredTool, call: &ToolCall) -> Result<String, ToolError> {
        match &tool.handler {
            ToolHandler::Local(local) => local.execute(call.input.clone()).await,
            ToolHandler::Capability { server, tool: name } => {
                let timeout = self.config.tool_timeout;
                match self
                    .capabilities
                    .invoke(server, name, call.input.clone(), timeout)
                    .await
                {
                    Ok(result) if result.is_error => {
                        Err(ToolError::Execution(truncate(result.text())))
                    }
                    Ok(result) => Ok(truncate(result.text())),
                    Err(Error::Capability(e)) if e.is_timeout() => {
                        Err(ToolError::Timeout(millis(timeout)))
                    }
                    Err(e) => Err(ToolError::Execution(e.to_string())),
                }
            }
        }
    }

    fn abort(&self, events: &EventSink, reason: &str) -> TurnOutcome {
        info!(%reason, "turn aborted");
        events.emit(TurnEvent::Aborted {
            reason: reason.to_string(),
        });
        TurnOutcome::Aborted {
            reason: reason.to_string(),
        }
    }
}

fn settled(decision: Decision) -> Option<Result<(), ToolError>> {
    match decision {
        Decision::Approve => Some(Ok(())),
        Decision::Deny { reason } => Some(Err(ToolError::PermissionDenied(reason))),
        Decision::AskUser => None,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
