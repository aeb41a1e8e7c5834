//! Language model backends and the request/response types the session speaks.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::BackendConfig;
use crate::error::{AgentError, BackendErrorKind, Result};
use crate::message::{Message, Role, ToolCall};
use crate::schema::ToolDescriptor;
use crate::stream::{delta_channel, DeltaReceiver, DeltaSender, MessageDelta, ToolCallDelta};

/// Everything a backend needs for one completion.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolDescriptor],
    pub model: &'a str,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
}

impl ChatRequest<'_> {
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|tool| tool.name.clone()).collect()
    }
}

/// Result of a chat completion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelCompletion {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelCompletion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn with_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Minimal abstraction around a chat completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete_chat(&self, request: &ChatRequest<'_>) -> Result<ModelCompletion>;

    /// Stream the completion as ordered deltas. Backends without native
    /// streaming deliver the whole completion as one delta.
    async fn stream_chat(&self, request: &ChatRequest<'_>) -> Result<DeltaReceiver> {
        let completion = self.complete_chat(request).await?;
        let (tx, rx) = delta_channel();
        let delta = MessageDelta::from_completion(&completion);
        if !delta.is_empty() {
            let _ = tx.send(Ok(delta)).await;
        }
        Ok(rx)
    }
}

fn status_error(status: reqwest::StatusCode, body: &str) -> AgentError {
    let kind = match status {
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
            BackendErrorKind::Auth
        }
        reqwest::StatusCode::TOO_MANY_REQUESTS => BackendErrorKind::RateLimited,
        _ => BackendErrorKind::Other,
    };
    AgentError::backend(kind, format!("request failed with {status}: {body}"))
}

fn transport_error(err: reqwest::Error) -> AgentError {
    if err.is_decode() {
        AgentError::backend(BackendErrorKind::MalformedResponse, err.to_string())
    } else {
        AgentError::backend(BackendErrorKind::Connectivity, err.to_string())
    }
}

fn serialize_tool_arguments(args: &Value) -> String {
    match args {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// OpenAI-compatible chat-completions client. Also works against Ollama's `/v1` endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder().build().map_err(|err| {
            AgentError::backend(BackendErrorKind::Other, format!("http client error: {err}"))
        })?;
        Ok(Self {
            http,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(cfg: &BackendConfig) -> Result<Self> {
        Self::new(cfg.base_url.clone(), cfg.api_key.clone())
    }

    /// Convert the history to wire messages. Tool calls left unanswered (a
    /// turn that stopped at its iteration limit) are omitted, since
    /// OpenAI-compatible endpoints reject a `tool_calls` entry without results.
    fn to_openai_messages(messages: &[Message]) -> Vec<OpenAiMessage> {
        let answered: HashSet<&str> = messages
            .iter()
            .filter(|message| message.role == Role::Tool)
            .filter_map(|message| message.tool_call_id.as_deref())
            .collect();
        messages
            .iter()
            .map(|message| {
                let role = match message.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                }
                .to_string();

                let calls: Vec<OpenAiToolCall> = message
                    .tool_calls
                    .iter()
                    .filter(|call| answered.contains(call.id.as_str()))
                    .map(|call| OpenAiToolCall {
                        id: Some(call.id.clone()),
                        r#type: "function".to_string(),
                        function: OpenAiFunctionCall {
                            name: call.name.clone(),
                            arguments: serialize_tool_arguments(&call.arguments),
                        },
                    })
                    .collect();
                let tool_calls = (!calls.is_empty()).then_some(calls);

                let content = if tool_calls.is_some() && message.content.is_empty() {
                    None
                } else {
                    Some(message.content.clone())
                };

                OpenAiMessage {
                    role,
                    content,
                    tool_call_id: message.tool_call_id.clone(),
                    tool_calls,
                }
            })
            .collect()
    }

    fn to_openai_tools(tools: &[ToolDescriptor]) -> Option<Vec<OpenAiTool>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|tool| OpenAiTool {
                    r#type: "function".to_string(),
                    function: OpenAiFunction {
                        name: tool.name.clone(),
                        description: Some(tool.description.clone()),
                        parameters: Some(tool.parameters_json()),
                    },
                })
                .collect(),
        )
    }

    fn payload(request: &ChatRequest<'_>, stream: bool) -> Value {
        let mut payload = json!({
            "model": request.model,
            "messages": Self::to_openai_messages(request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });
        if let Some(tools) = Self::to_openai_tools(request.tools) {
            payload["tools"] = json!(tools);
            payload["tool_choice"] = json!("auto");
        }
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        payload
    }

    async fn send(&self, request: &ChatRequest<'_>, stream: bool) -> Result<reqwest::Response> {
        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(request.timeout)
            .json(&Self::payload(request, stream));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await.map_err(transport_error)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete_chat(&self, request: &ChatRequest<'_>) -> Result<ModelCompletion> {
        let resp = self.send(request, false).await?;
        let text = resp.text().await.map_err(transport_error)?;
        parse_completion(&text)
    }

    async fn stream_chat(&self, request: &ChatRequest<'_>) -> Result<DeltaReceiver> {
        let resp = self.send(request, true).await?;
        let (tx, rx) = delta_channel();
        tokio::spawn(pump_sse(resp.bytes_stream(), tx));
        Ok(rx)
    }
}

fn parse_completion(body: &str) -> Result<ModelCompletion> {
    let body: OpenAiResponse = serde_json::from_str(body).map_err(|err| {
        AgentError::backend(
            BackendErrorKind::MalformedResponse,
            format!("response parse error: {err}"),
        )
    })?;
    let first = body.choices.into_iter().next().ok_or_else(|| {
        AgentError::backend(BackendErrorKind::MalformedResponse, "no choices returned")
    })?;

    let tool_calls = first
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| {
            ToolCall::new(
                call.id.unwrap_or_default(),
                call.function.name,
                Value::String(call.function.arguments),
            )
        })
        .collect();

    Ok(ModelCompletion {
        content: first.message.content.filter(|c| !c.is_empty()),
        reasoning: first.message.reasoning.filter(|r| !r.is_empty()),
        tool_calls,
    })
}

/// Parse one SSE `data:` payload. `Ok(None)` marks the end of the stream.
fn parse_sse_data(data: &str) -> Result<Option<MessageDelta>> {
    if data == "[DONE]" {
        return Ok(None);
    }
    let parsed: OpenAiStreamChunk = serde_json::from_str(data).map_err(|err| {
        AgentError::backend(
            BackendErrorKind::MalformedResponse,
            format!("stream parse error `{data}`: {err}"),
        )
    })?;

    let mut delta = MessageDelta::default();
    for choice in parsed.choices {
        if let Some(content) = choice.delta.content {
            delta.content.get_or_insert_with(String::new).push_str(&content);
        }
        if let Some(reasoning) = choice.delta.reasoning {
            delta
                .reasoning
                .get_or_insert_with(String::new)
                .push_str(&reasoning);
        }
        for call in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match call.function {
                Some(function) => (function.name, function.arguments),
                None => (None, None),
            };
            delta.tool_calls.push(ToolCallDelta {
                index: call.index,
                id: call.id,
                name,
                arguments,
            });
        }
    }
    Ok(Some(delta))
}

/// Split the next complete line off `buffer`. Lines are decoded only once
/// whole, so a character split across network chunks survives intact.
fn take_line(buffer: &mut Vec<u8>) -> Option<Result<String>> {
    let end = buffer.iter().position(|byte| *byte == b'\n')?;
    let line: Vec<u8> = buffer.drain(..=end).collect();
    Some(String::from_utf8(line).map_err(|err| {
        AgentError::backend(
            BackendErrorKind::MalformedResponse,
            format!("stream line is not valid UTF-8: {err}"),
        )
    }))
}

async fn pump_sse<S, B>(body: S, tx: DeltaSender)
where
    S: Stream<Item = reqwest::Result<B>>,
    B: AsRef<[u8]>,
{
    let mut body = std::pin::pin!(body);
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = tx.send(Err(transport_error(err))).await;
                return;
            }
        };
        buffer.extend_from_slice(chunk.as_ref());
        while let Some(line) = take_line(&mut buffer) {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            match parse_sse_data(data.trim()) {
                Ok(Some(delta)) if delta.is_empty() => {}
                Ok(Some(delta)) => {
                    if tx.send(Ok(delta)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
    }
}

/// A request as the stub model saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
    pub model: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StubDirective {
    Respond { content: String },
    CallTool { name: String, arguments: Value },
}

/// A deterministic model used for tests and demos.
pub struct StubModel {
    responses: Mutex<VecDeque<Result<ModelCompletion>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    chunk_size: usize,
    latency: Option<Duration>,
    pace: Option<Duration>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StubModel {
    pub fn new(completions: Vec<ModelCompletion>) -> Arc<Self> {
        Self::with_outcomes(completions.into_iter().map(Ok).collect())
    }

    /// Script successes and failures alike.
    pub fn with_outcomes(outcomes: Vec<Result<ModelCompletion>>) -> Arc<Self> {
        Arc::new(Self::build(outcomes, 4, None))
    }

    /// Script from JSON directives: `{"action": "respond", "content": ..}` or
    /// `{"action": "call_tool", "name": .., "arguments": {..}}`. Anything else
    /// is replied verbatim.
    pub fn from_directives<I, S>(directives: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let completions = directives
            .into_iter()
            .enumerate()
            .map(|(n, raw)| {
                let raw = raw.into();
                match serde_json::from_str::<StubDirective>(&raw) {
                    Ok(StubDirective::Respond { content }) => ModelCompletion::text(content),
                    Ok(StubDirective::CallTool { name, arguments }) => {
                        ModelCompletion::with_tool_calls(vec![ToolCall::new(
                            format!("stub_{n}"),
                            name,
                            arguments,
                        )])
                    }
                    Err(_) => ModelCompletion::text(raw),
                }
            })
            .map(Ok)
            .collect();
        Arc::new(Self::build(completions, 4, None))
    }

    fn build(
        outcomes: Vec<Result<ModelCompletion>>,
        chunk_size: usize,
        latency: Option<Duration>,
    ) -> Self {
        Self {
            responses: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
            chunk_size,
            latency,
            pace: None,
        }
    }

    /// Same script, delayed by `latency` before every reply.
    pub fn delayed(completions: Vec<ModelCompletion>, latency: Duration) -> Arc<Self> {
        Arc::new(Self::build(
            completions.into_iter().map(Ok).collect(),
            4,
            Some(latency),
        ))
    }

    /// Same script, with `interval` between streamed deltas.
    pub fn paced(completions: Vec<ModelCompletion>, interval: Duration) -> Arc<Self> {
        let mut stub = Self::build(completions.into_iter().map(Ok).collect(), 4, None);
        stub.pace = Some(interval);
        Arc::new(stub)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        locked(&self.requests).clone()
    }

    pub fn remaining(&self) -> usize {
        locked(&self.responses).len()
    }

    async fn next(&self, request: &ChatRequest<'_>) -> Result<ModelCompletion> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        locked(&self.requests).push(RecordedRequest {
            messages: request.messages.to_vec(),
            tools: request.tool_names(),
            model: request.model.to_string(),
        });
        locked(&self.responses).pop_front().unwrap_or_else(|| {
            Err(AgentError::backend(
                BackendErrorKind::Other,
                "StubModel ran out of scripted responses",
            ))
        })
    }

    fn chunks(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(self.chunk_size.max(1))
            .map(|chunk| chunk.iter().collect())
            .collect()
    }
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn complete_chat(&self, request: &ChatRequest<'_>) -> Result<ModelCompletion> {
        self.next(request).await
    }

    async fn stream_chat(&self, request: &ChatRequest<'_>) -> Result<DeltaReceiver> {
        let completion = self.next(request).await?;
        let mut deltas = Vec::new();
        if let Some(reasoning) = &completion.reasoning {
            deltas.push(MessageDelta::reasoning(reasoning.clone()));
        }
        if let Some(content) = &completion.content {
            deltas.extend(self.chunks(content).into_iter().map(MessageDelta::content));
        }
        for (index, call) in completion.tool_calls.iter().enumerate() {
            deltas.push(MessageDelta::tool_call(ToolCallDelta {
                index,
                id: (!call.id.is_empty()).then(|| call.id.clone()),
                name: Some(call.name.clone()),
                arguments: None,
            }));
            let arguments = serialize_tool_arguments(&call.arguments);
            deltas.extend(self.chunks(&arguments).into_iter().map(|fragment| {
                MessageDelta::tool_call(ToolCallDelta {
                    index,
                    arguments: Some(fragment),
                    ..ToolCallDelta::default()
                })
            }));
        }

        let (tx, rx) = delta_channel();
        let pace = self.pace;
        tokio::spawn(async move {
            for delta in deltas {
                if let Some(interval) = pace {
                    tokio::time::sleep(interval).await;
                }
                if tx.send(Ok(delta)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default = "function_type")]
    r#type: String,
    function: OpenAiFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
    #[serde(default, alias = "reasoning_content")]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiDeltaChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDeltaChoice {
    delta: OpenAiDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
    #[serde(default, alias = "reasoning_content")]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
