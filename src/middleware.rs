//! Ordered before/after hooks wrapped around every tool invocation.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AgentError, Result};

/// Per-session values hooks can read. Never supplied by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub model: String,
}

#[async_trait]
pub trait ToolMiddleware: Send + Sync {
    fn name(&self) -> &str;

    async fn before_tool_call(
        &self,
        tool: &str,
        args: Value,
        ctx: &SessionContext,
    ) -> Result<Value>;

    async fn after_tool_call(
        &self,
        result: Value,
        _tool: &str,
        _ctx: &SessionContext,
    ) -> Result<Value> {
        Ok(result)
    }
}

/// Hooks in registration order. Fixed once the owning session is built.
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    hooks: Vec<Arc<dyn ToolMiddleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hook: impl ToolMiddleware + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn with_arc(mut self, hook: Arc<dyn ToolMiddleware>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.iter().map(|h| h.name().to_string()).collect()
    }

    /// Run pre hooks in registration order, threading the arguments through.
    pub async fn before_all(
        &self,
        tool: &str,
        mut args: Value,
        ctx: &SessionContext,
    ) -> Result<Value> {
        for hook in &self.hooks {
            args = hook
                .before_tool_call(tool, args, ctx)
                .await
                .map_err(|err| abort(hook.as_ref(), tool, err))?;
        }
        Ok(args)
    }

    /// Run post hooks in reverse registration order.
    pub async fn after_all(
        &self,
        mut result: Value,
        tool: &str,
        ctx: &SessionContext,
    ) -> Result<Value> {
        for hook in self.hooks.iter().rev() {
            result = hook
                .after_tool_call(result, tool, ctx)
                .await
                .map_err(|err| abort(hook.as_ref(), tool, err))?;
        }
        Ok(result)
    }
}

fn abort(hook: &dyn ToolMiddleware, tool: &str, err: AgentError) -> AgentError {
    match err {
        AgentError::MiddlewareAbort { .. } => err,
        other => AgentError::MiddlewareAbort {
            hook: hook.name().to_string(),
            tool: tool.to_string(),
            reason: other.to_string(),
        },
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("hooks", &self.names())
            .finish()
    }
}

/// Injects the session id into tool arguments.
#[derive(Debug, Clone)]
pub struct SessionIdInjector {
    field: String,
    tools: HashSet<String>,
}

impl SessionIdInjector {
    /// Inject into every tool call.
    pub fn all() -> Self {
        Self {
            field: "session_id".into(),
            tools: HashSet::new(),
        }
    }

    /// Inject only into the named tools.
    pub fn for_tools<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            field: "session_id".into(),
            tools: tools.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    fn applies_to(&self, tool: &str) -> bool {
        self.tools.is_empty() || self.tools.contains(tool)
    }
}

#[async_trait]
impl ToolMiddleware for SessionIdInjector {
    fn name(&self) -> &str {
        "session_id_injector"
    }

    async fn before_tool_call(
        &self,
        tool: &str,
        mut args: Value,
        ctx: &SessionContext,
    ) -> Result<Value> {
        if !self.applies_to(tool) {
            return Ok(args);
        }
        match args.as_object_mut() {
            Some(map) => {
                map.insert(self.field.clone(), Value::String(ctx.session_id.to_string()));
                Ok(args)
            }
            None => Err(AgentError::InvalidArguments {
                tool: tool.to_string(),
                reason: format!("cannot inject `{}` into non-object arguments", self.field),
            }),
        }
    }
}

type BeforeFn = dyn Fn(&str, Value, &SessionContext) -> Result<Value> + Send + Sync;
type AfterFn = dyn Fn(Value, &str, &SessionContext) -> Result<Value> + Send + Sync;

/// Middleware assembled from plain closures.
pub struct FnMiddleware {
    name: String,
    before: Option<Box<BeforeFn>>,
    after: Option<Box<AfterFn>>,
}

impl FnMiddleware {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            before: None,
            after: None,
        }
    }

    pub fn before(
        mut self,
        hook: impl Fn(&str, Value, &SessionContext) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.before = Some(Box::new(hook));
        self
    }

    pub fn after(
        mut self,
        hook: impl Fn(Value, &str, &SessionContext) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.after = Some(Box::new(hook));
        self
    }
}

#[async_trait]
impl ToolMiddleware for FnMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn before_tool_call(
        &self,
        tool: &str,
        args: Value,
        ctx: &SessionContext,
    ) -> Result<Value> {
        match &self.before {
            Some(hook) => hook(tool, args, ctx),
            None => Ok(args),
        }
    }

    async fn after_tool_call(
        &self,
        result: Value,
        tool: &str,
        ctx: &SessionContext,
    ) -> Result<Value> {
        match &self.after {
            Some(hook) => hook(result, tool, ctx),
            None => Ok(result),
        }
    }
}

/// Logs every call and its result through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMiddleware;

#[async_trait]
impl ToolMiddleware for TracingMiddleware {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn before_tool_call(
        &self,
        tool: &str,
        args: Value,
        ctx: &SessionContext,
    ) -> Result<Value> {
        tracing::info!(session_id = %ctx.session_id, tool, args = %args, "tool call");
        Ok(args)
    }

    async fn after_tool_call(
        &self,
        result: Value,
        tool: &str,
        ctx: &SessionContext,
    ) -> Result<Value> {
        tracing::info!(session_id = %ctx.session_id, tool, result = %result, "tool result");
        Ok(result)
    }
}
