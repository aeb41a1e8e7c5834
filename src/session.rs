//! The per-session conversation loop: model round-trips interleaved with tool execution.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{AgentError, Result};
use crate::executor::ToolExecutor;
use crate::llm::{ChatRequest, LanguageModel, ModelCompletion};
use crate::memory::MessageHistory;
use crate::message::{Message, ToolCall};
use crate::metrics::{MetricsTracker, TurnGuard};
use crate::middleware::{MiddlewareChain, SessionContext, ToolMiddleware};
use crate::schema::ToolDescriptor;
use crate::stream::{DeltaAccumulator, MessageDelta};
use crate::telemetry::{TelemetryCollector, TelemetryLabels};
use crate::tool::{Tool, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    AwaitingModel,
    ExecutingTools,
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// The model answered without requesting tools.
    Complete,
    /// The model kept requesting tools after the configured number of rounds.
    /// The last assistant message (with its unanswered tool calls) is the answer.
    /// Those calls stay in the history; `OpenAiClient` leaves them out of later
    /// requests.
    IterationLimit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub message: Message,
    /// Tool-resolution rounds executed during the turn.
    pub iterations: usize,
    pub termination: Termination,
}

impl TurnOutcome {
    pub fn content(&self) -> &str {
        &self.message.content
    }

    pub fn hit_iteration_limit(&self) -> bool {
        self.termination == Termination::IterationLimit
    }
}

struct Turn {
    iterations: usize,
    guard: Option<TurnGuard>,
}

pub struct SessionBuilder {
    model: Arc<dyn LanguageModel>,
    config: SessionConfig,
    tools: Vec<Arc<dyn Tool>>,
    chain: MiddlewareChain,
    telemetry: Option<TelemetryCollector>,
    metrics: Option<MetricsTracker>,
    cancel: Option<CancellationToken>,
    session_id: Option<Uuid>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Append a hook. Hooks run before calls in the order they are added.
    pub fn middleware(mut self, hook: impl ToolMiddleware + 'static) -> Self {
        self.chain = self.chain.with(hook);
        self
    }

    pub fn middleware_arc(mut self, hook: Arc<dyn ToolMiddleware>) -> Self {
        self.chain = self.chain.with_arc(hook);
        self
    }

    pub fn telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn metrics(mut self, metrics: MetricsTracker) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Tie the session to an outside token. Cancelling it abandons the
    /// in-flight turn and every later one; the session's own token from
    /// [`Session::cancellation_token`] is a child of it.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Reuse a known session id, e.g. to reopen a tool's per-session data.
    pub fn session_id(mut self, id: Uuid) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn build(self) -> Result<Session> {
        let mut registry = ToolRegistry::new();
        for tool in self.tools {
            registry.register_arc(tool)?;
        }
        let id = self.session_id.unwrap_or_else(Uuid::new_v4);
        let context = SessionContext {
            session_id: id,
            model: self.config.model.clone(),
        };
        let parent = self.cancel.unwrap_or_default();
        let mut session = Session {
            id,
            config: self.config,
            model: self.model,
            registry,
            chain: self.chain,
            history: MessageHistory::new(),
            context,
            state: SessionState::Idle,
            cancel: parent.child_token(),
            parent_cancel: parent,
            telemetry: self.telemetry,
            metrics: self.metrics,
        };
        session.seed_system_prompt()?;
        tracing::debug!(
            session_id = %session.id,
            tools = ?session.registry.names(),
            middleware = ?session.chain.names(),
            "session built"
        );
        Ok(session)
    }
}

/// An isolated conversation: its own history, tools, middleware and configuration.
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    model: Arc<dyn LanguageModel>,
    registry: ToolRegistry,
    chain: MiddlewareChain,
    history: MessageHistory,
    context: SessionContext,
    state: SessionState,
    cancel: CancellationToken,
    parent_cancel: CancellationToken,
    telemetry: Option<TelemetryCollector>,
    metrics: Option<MetricsTracker>,
}

impl Session {
    pub fn builder(model: Arc<dyn LanguageModel>) -> SessionBuilder {
        SessionBuilder {
            model,
            config: SessionConfig::default(),
            tools: Vec::new(),
            chain: MiddlewareChain::new(),
            telemetry: None,
            metrics: None,
            cancel: None,
            session_id: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &[Message] {
        self.history.messages()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.registry.descriptors()
    }

    /// Token that abandons the in-flight backend call when cancelled. A fresh
    /// child of the builder's token is installed after a cancelled turn, so
    /// fetch it again per turn.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register another tool. On failure the session is left as it was.
    pub fn register_tool(&mut self, tool: impl Tool + 'static) -> Result<ToolDescriptor> {
        self.register_tool_arc(Arc::new(tool))
    }

    pub fn register_tool_arc(&mut self, tool: Arc<dyn Tool>) -> Result<ToolDescriptor> {
        self.registry.register_arc(tool).cloned()
    }

    /// Empty the history, keeping the configured system prompt.
    pub fn clear_history(&mut self) -> Result<()> {
        self.history.clear();
        self.seed_system_prompt()
    }

    pub fn append_system_message(&mut self, text: impl Into<String>) -> Result<()> {
        self.history.push(Message::system(text))
    }

    fn seed_system_prompt(&mut self) -> Result<()> {
        match self.config.system_prompt.clone() {
            Some(prompt) => self.history.push(Message::system(prompt)),
            None => Ok(()),
        }
    }

    /// Run one turn. Uses the streaming backend path when `config.stream` is
    /// set; deltas are accumulated without being forwarded.
    pub async fn send_message(&mut self, text: impl Into<String>) -> Result<TurnOutcome> {
        let stream = self.config.stream;
        self.run_turn(text.into(), stream, None).await
    }

    /// Run one turn over the streaming path, forwarding every delta as it
    /// arrives. Dropping the receiver only stops forwarding.
    pub async fn send_message_streaming(
        &mut self,
        text: impl Into<String>,
        deltas: mpsc::Sender<MessageDelta>,
    ) -> Result<TurnOutcome> {
        self.run_turn(text.into(), true, Some(deltas)).await
    }

    async fn run_turn(
        &mut self,
        text: String,
        stream: bool,
        forward: Option<mpsc::Sender<MessageDelta>>,
    ) -> Result<TurnOutcome> {
        let span = tracing::info_span!("turn", session_id = %self.id, stream);
        let mut turn = Turn {
            iterations: 0,
            guard: self.metrics.as_ref().map(MetricsTracker::start_turn),
        };

        let result = self
            .drive(text, stream, forward, &mut turn)
            .instrument(span)
            .await;
        self.state = SessionState::Idle;

        match &result {
            Ok(outcome) => {
                self.record(
                    "turn_complete",
                    json!({
                        "iterations": outcome.iterations,
                        "termination": outcome.termination,
                    }),
                );
            }
            Err(AgentError::Cancelled) => {
                tracing::info!(session_id = %self.id, "turn cancelled");
                self.cancel = self.parent_cancel.child_token();
                self.record_failure("turn", &AgentError::Cancelled);
            }
            Err(err) => {
                tracing::warn!(session_id = %self.id, error = %err, "turn failed");
                self.record_failure("turn", err);
            }
        }
        if let Some(guard) = turn.guard {
            guard.finish(
                turn.iterations,
                result.as_ref().ok().map(|outcome| outcome.termination),
            );
        }
        result
    }

    async fn drive(
        &mut self,
        text: String,
        stream: bool,
        forward: Option<mpsc::Sender<MessageDelta>>,
        turn: &mut Turn,
    ) -> Result<TurnOutcome> {
        self.record("user_message", json!({ "chars": text.chars().count() }));
        self.history.push(Message::user(text))?;
        let limit = self.config.iteration_limit();
        let mut forward = forward;

        loop {
            self.transition(SessionState::AwaitingModel);
            if let Some(guard) = turn.guard.as_mut() {
                guard.record_backend_call();
            }
            let completion = self.await_model(stream, &mut forward).await?;
            let message = self.assistant_message(completion);
            self.history.push(message.clone())?;

            if !message.has_tool_calls() {
                tracing::info!(iterations = turn.iterations, "turn complete");
                return Ok(TurnOutcome {
                    message,
                    iterations: turn.iterations,
                    termination: Termination::Complete,
                });
            }
            if turn.iterations >= limit {
                tracing::warn!(
                    limit,
                    pending = message.tool_calls.len(),
                    "iteration limit reached"
                );
                return Ok(TurnOutcome {
                    message,
                    iterations: turn.iterations,
                    termination: Termination::IterationLimit,
                });
            }
            turn.iterations += 1;

            self.transition(SessionState::ExecutingTools);
            self.execute_batch(&message.tool_calls, turn).await?;
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    async fn await_model(
        &self,
        stream: bool,
        forward: &mut Option<mpsc::Sender<MessageDelta>>,
    ) -> Result<ModelCompletion> {
        let tools = self.registry.descriptors();
        let request = ChatRequest {
            messages: self.history.messages(),
            tools: &tools,
            model: &self.config.model,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            timeout: self.config.timeout(),
        };
        let call = async {
            if stream {
                self.stream_completion(&request, forward).await
            } else {
                self.model.complete_chat(&request).await
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            result = call => result,
        }
    }

    async fn stream_completion(
        &self,
        request: &ChatRequest<'_>,
        forward: &mut Option<mpsc::Sender<MessageDelta>>,
    ) -> Result<ModelCompletion> {
        let mut deltas = ReceiverStream::new(self.model.stream_chat(request).await?);
        let mut acc = DeltaAccumulator::new();
        while let Some(delta) = deltas.next().await {
            let delta = delta?;
            acc.push(&delta);
            if let Some(tx) = forward.as_ref() {
                if tx.send(delta).await.is_err() {
                    tracing::debug!("delta receiver dropped; continuing without forwarding");
                    *forward = None;
                }
            }
        }
        Ok(acc.finish())
    }

    /// Build the assistant message, giving every tool call an id that is
    /// unique within the session.
    fn assistant_message(&self, completion: ModelCompletion) -> Message {
        let ModelCompletion {
            content,
            reasoning,
            tool_calls,
        } = completion;
        let mut taken: HashSet<String> = HashSet::new();
        let mut next = 0usize;
        let calls: Vec<ToolCall> = tool_calls
            .into_iter()
            .map(|mut call| {
                let clashes = call.id.is_empty()
                    || self.history.knows_call_id(&call.id)
                    || taken.contains(&call.id);
                if clashes {
                    call.id = loop {
                        let candidate = format!("call_{next}");
                        next += 1;
                        if !self.history.knows_call_id(&candidate) && !taken.contains(&candidate) {
                            break candidate;
                        }
                    };
                }
                taken.insert(call.id.clone());
                call
            })
            .collect();
        Message::assistant_with_tool_calls(content.unwrap_or_default(), calls)
            .with_reasoning(reasoning)
    }

    /// Execute calls one at a time in emitted order, appending each result
    /// before the next call starts.
    async fn execute_batch(&mut self, calls: &[ToolCall], turn: &mut Turn) -> Result<()> {
        let executor = ToolExecutor::new(&self.registry, &self.chain);
        for call in calls {
            let result = executor.execute(call, &self.context).await;
            if let Some(guard) = turn.guard.as_mut() {
                guard.record_tool_call(result.is_error);
            }
            if let Some(telemetry) = &self.telemetry {
                let labels = TelemetryLabels::session(self.id).with_tool(call.name.clone());
                if result.is_error {
                    telemetry.record_failure("tool_failure", result.content(), labels);
                } else {
                    telemetry.record("tool_call", json!({ "call_id": call.id }), labels);
                }
            }
            self.history.push(result.into_message())?;
        }
        Ok(())
    }

    fn record(&self, kind: &str, detail: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record(kind, detail, TelemetryLabels::session(self.id));
        }
    }

    fn record_failure(&self, context: &str, err: &AgentError) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_failure(context, err.to_string(), TelemetryLabels::session(self.id));
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("tools", &self.registry.names())
            .field("middleware", &self.chain.names())
            .field("history_len", &self.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubModel;
    use crate::schema::{ParamType, ToolSignature};
    use crate::tool::FnTool;

    fn echo() -> FnTool {
        FnTool::new(
            ToolSignature::new("echo").param("text", ParamType::String),
            |args| async move { Ok(args["text"].clone()) },
        )
    }

    #[tokio::test]
    async fn assigns_ids_to_anonymous_and_clashing_calls() {
        let stub = StubModel::new(vec![
            ModelCompletion::with_tool_calls(vec![
                ToolCall::new("", "echo", json!({"text": "a"})),
                ToolCall::new("dup", "echo", json!({"text": "b"})),
                ToolCall::new("dup", "echo", json!({"text": "c"})),
            ]),
            ModelCompletion::text("done"),
        ]);
        let mut session = Session::builder(stub).tool(echo()).build().unwrap();

        let outcome = session.send_message("go").await.unwrap();
        assert_eq!(outcome.termination, Termination::Complete);

        let ids: Vec<&str> = session.history()[1]
            .tool_calls
            .iter()
            .map(|call| call.id.as_str())
            .collect();
        assert_eq!(ids, vec!["call_0", "dup", "call_1"]);
        let answered: Vec<Option<&str>> = session.history()[2..5]
            .iter()
            .map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(answered, vec![Some("call_0"), Some("dup"), Some("call_1")]);
    }

    #[tokio::test]
    async fn builder_token_outlives_turn_cancellation() {
        let parent = CancellationToken::new();
        let stub = StubModel::new(vec![ModelCompletion::text("never requested")]);
        let mut session = Session::builder(stub.clone())
            .cancellation(parent.clone())
            .build()
            .unwrap();

        session.cancellation_token().cancel();
        let err = session.send_message("first").await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(!parent.is_cancelled());
        assert!(!session.cancellation_token().is_cancelled());

        parent.cancel();
        assert!(session.cancellation_token().is_cancelled());
        let err = session.send_message("second").await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(session.cancellation_token().is_cancelled());
        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn system_prompt_survives_clear() {
        let stub = StubModel::new(vec![ModelCompletion::text("hi")]);
        let mut session = Session::builder(stub)
            .system_prompt("You are terse.")
            .build()
            .unwrap();
        session.send_message("hello").await.unwrap();
        assert_eq!(session.history().len(), 3);

        session.clear_history().unwrap();
        assert_eq!(session.history(), &[Message::system("You are terse.")]);
        session.append_system_message("Extra rule.").unwrap();
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn failed_registration_leaves_session_untouched() {
        let stub = StubModel::new(vec![]);
        let mut session = Session::builder(stub).tool(echo()).build().unwrap();

        let err = session.register_tool(echo()).unwrap_err();
        assert!(matches!(err, AgentError::DuplicateTool(_)));
        let err = session
            .register_tool(FnTool::new(
                ToolSignature::new("bad").param("x", ParamType::Union(vec![])),
                |_| async { Ok(json!(null)) },
            ))
            .unwrap_err();
        assert!(matches!(err, AgentError::UnsupportedSignature { .. }));
        assert_eq!(session.descriptors().len(), 1);
    }

    #[tokio::test]
    async fn records_telemetry_and_metrics() {
        let stub = StubModel::new(vec![
            ModelCompletion::with_tool_calls(vec![
                ToolCall::new("c1", "echo", json!({"text": "a"})),
                ToolCall::new("c2", "missing", json!({})),
            ]),
            ModelCompletion::text("done"),
        ]);
        let telemetry = TelemetryCollector::default();
        let metrics = MetricsTracker::default();
        let mut session = Session::builder(stub)
            .tool(echo())
            .telemetry(telemetry.clone())
            .metrics(metrics.clone())
            .build()
            .unwrap();

        session.send_message("go").await.unwrap();

        assert_eq!(
            telemetry.event_kinds(),
            vec!["user_message", "tool_call", "turn_complete"]
        );
        let (_, failures) = telemetry.drain();
        assert_eq!(failures[0].labels.tool.as_deref(), Some("missing"));

        let report = &metrics.reports()[0];
        assert_eq!(report.backend_calls, 2);
        assert_eq!(report.tool_calls, 2);
        assert_eq!(report.tool_failures, 1);
        assert_eq!(report.iterations, 1);
        assert_eq!(report.termination, Some(Termination::Complete));
    }
}
