use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::message::{Message, ToolCall};
use crate::middleware::{MiddlewareChain, SessionContext};
use crate::tool::ToolRegistry;

/// Outcome of one tool call, ready to be appended as a tool-role message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub output: Value,
    pub is_error: bool,
}

impl ToolResult {
    /// Textual form placed in the tool message. Strings are passed through
    /// untouched, everything else is rendered as JSON.
    pub fn content(&self) -> String {
        match &self.output {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }

    pub fn into_message(self) -> Message {
        let content = self.content();
        if self.is_error {
            Message::tool_error(self.call_id, content)
        } else {
            Message::tool_result(self.call_id, content)
        }
    }
}

/// Resolves tool calls against a registry and runs them inside the middleware chain.
pub struct ToolExecutor<'a> {
    registry: &'a ToolRegistry,
    chain: &'a MiddlewareChain,
}

impl<'a> ToolExecutor<'a> {
    pub fn new(registry: &'a ToolRegistry, chain: &'a MiddlewareChain) -> Self {
        Self { registry, chain }
    }

    /// Execute one call. Never fails: unknown tools, rejected arguments,
    /// middleware aborts and tool errors all come back as error results.
    pub async fn execute(&self, call: &ToolCall, ctx: &SessionContext) -> ToolResult {
        match self.run(&call.name, call.arguments.clone(), ctx).await {
            Ok(output) => {
                tracing::debug!(tool = %call.name, call_id = %call.id, "tool call succeeded");
                ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    output,
                    is_error: false,
                }
            }
            Err(err) => {
                tracing::warn!(tool = %call.name, call_id = %call.id, error = %err, "tool call failed");
                ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    output: Value::String(format!("error: {err}")),
                    is_error: true,
                }
            }
        }
    }

    async fn run(&self, name: &str, args: Value, ctx: &SessionContext) -> Result<Value> {
        if !self.registry.contains(name) {
            return Err(AgentError::UnknownTool(name.to_string()));
        }
        if !args.is_object() {
            return Err(AgentError::InvalidArguments {
                tool: name.to_string(),
                reason: format!("expected a JSON object, got `{args}`"),
            });
        }
        let args = self.chain.before_all(name, args, ctx).await?;
        let raw = self.registry.call(name, args).await?;
        self.chain.after_all(raw, name, ctx).await
    }
}
