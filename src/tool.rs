use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::schema::{generate, ToolDescriptor, ToolSignature};

#[async_trait]
pub trait Tool: Send + Sync {
    /// Declared name, documentation and parameters of the callable.
    fn signature(&self) -> ToolSignature;

    /// Invoke the tool with named arguments (a JSON object).
    async fn invoke(&self, args: Value) -> Result<Value>;
}

type BoxedHandler =
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync;

/// A tool backed by an async closure.
pub struct FnTool {
    signature: ToolSignature,
    handler: Box<BoxedHandler>,
}

impl FnTool {
    pub fn new<F, Fut>(signature: ToolSignature, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            signature,
            handler: Box::new(move |args| Box::pin(handler(args))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn signature(&self) -> ToolSignature {
        self.signature.clone()
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        (self.handler)(args).await
    }
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub tool: Arc<dyn Tool>,
    pub descriptor: ToolDescriptor,
}

/// Name-indexed tool set with descriptors generated once at registration.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> Result<&ToolDescriptor> {
        self.register_arc(Arc::new(tool))
    }

    /// Register a shared tool. Registering the same `Arc` twice keeps the
    /// cached descriptor; a different tool under a taken name is rejected.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<&ToolDescriptor> {
        let signature = tool.signature();
        if let Some(existing) = self.tools.get(&signature.name) {
            if !Arc::ptr_eq(&existing.tool, &tool) {
                return Err(AgentError::DuplicateTool(signature.name));
            }
        } else {
            let descriptor = generate(&signature)?;
            self.order.push(signature.name.clone());
            self.tools
                .insert(signature.name.clone(), RegisteredTool { tool, descriptor });
        }
        Ok(&self.tools[&signature.name].descriptor)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Cached descriptors in registration order.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.order
            .iter()
            .map(|name| self.tools[name].descriptor.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub async fn call(&self, name: &str, input: Value) -> Result<Value> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| AgentError::UnknownTool(name.to_string()))?;
        match AssertUnwindSafe(entry.tool.invoke(input)).catch_unwind().await {
            Ok(result) => result.map_err(|err| match err {
                AgentError::ToolExecution { .. } => err,
                other => AgentError::tool_failure(name, other),
            }),
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                tracing::error!(tool = name, panic = %reason, "tool panicked");
                Err(AgentError::tool_failure(name, format!("panicked: {reason}")))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}
