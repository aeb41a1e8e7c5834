//! Client-side tool-calling sessions for chat language models.
//!
//! The crate provides:
//! - A schema generator that turns tool signatures into JSON-Schema descriptors.
//! - A tool interface (`Tool`, `FnTool`, `ToolRegistry`) and an ordered middleware chain.
//! - A `Session` that alternates between a `LanguageModel` backend and the
//!   registered tools until the model answers, streamed or not.

pub mod config;
pub mod error;
pub mod executor;
pub mod llm;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod middleware;
pub mod runner;
pub mod schema;
pub mod session;
pub mod stream;
pub mod telemetry;
pub mod tool;
pub mod tools;

pub use config::{AgentConfig, BackendConfig, SessionConfig};
pub use error::{AgentError, BackendErrorKind, Result};
pub use executor::{ToolExecutor, ToolResult};
pub use llm::{ChatRequest, LanguageModel, ModelCompletion, OpenAiClient, RecordedRequest, StubModel};
pub use memory::MessageHistory;
pub use message::{Message, Role, ToolCall};
pub use metrics::{MetricsTracker, TurnGuard, TurnReport};
pub use middleware::{
    FnMiddleware, MiddlewareChain, SessionContext, SessionIdInjector, ToolMiddleware,
    TracingMiddleware,
};
pub use runner::{ConsoleHandler, Runner, StreamHandler};
pub use schema::{
    generate, ObjectField, ParamKind, ParamSpec, ParamType, PropertySchema, ToolDescriptor,
    ToolSignature, TypeHint,
};
pub use session::{Session, SessionBuilder, SessionState, Termination, TurnOutcome};
pub use stream::{DeltaAccumulator, DeltaReceiver, MessageDelta, ToolCallDelta};
pub use telemetry::{init_tracing, TelemetryCollector, TelemetryEvent, TelemetryLabels};
pub use tool::{FnTool, RegisteredTool, Tool, ToolRegistry};
