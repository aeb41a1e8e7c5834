//! Plans a task with the todos toolkit.
//!
//! Usage: `todo-agent [config.toml] [prompt]`. Talks to the configured
//! OpenAI-compatible endpoint when `HQ_BASE_URL` or `HQ_API_KEY` is set, and to
//! a scripted stub model otherwise.

use std::env;
use std::path::Path;
use std::sync::Arc;

use hq_agent_sdk::tools::{todo_middleware, todo_tools, TodoStore};
use hq_agent_sdk::{
    init_tracing, AgentConfig, ConsoleHandler, LanguageModel, OpenAiClient, Result, Runner,
    Session, StubModel, TracingMiddleware,
};
use serde_json::json;

const SYSTEM_PROMPT: &str = "You are a planning assistant. Break the user's request into \
steps with create_todos, mark progress with update_todos and check the list with query_todos \
before answering.";

fn load_config(path: Option<&String>) -> Result<AgentConfig> {
    match path.filter(|p| Path::new(p).exists()) {
        Some(path) => AgentConfig::from_env_or_file(path),
        None => {
            let mut cfg = AgentConfig::default();
            cfg.apply_overrides(|key| env::var(key).ok());
            Ok(cfg)
        }
    }
}

fn scripted_model() -> Arc<StubModel> {
    StubModel::from_directives([
        json!({
            "action": "call_tool",
            "name": "create_todos",
            "arguments": {"todo_items": ["Outline the release notes", "Tag the release"]}
        })
        .to_string(),
        json!({
            "action": "call_tool",
            "name": "update_todos",
            "arguments": {"task_id": "1", "status": "completed"}
        })
        .to_string(),
        json!({"action": "call_tool", "name": "query_todos", "arguments": {}}).to_string(),
        json!({"action": "respond", "content": "Release notes are outlined; tagging is next."})
            .to_string(),
    ])
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("todo-agent", false);

    let args: Vec<String> = env::args().skip(1).collect();
    let config = load_config(args.first())?;
    let prompt = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "Plan the next release.".to_string());

    let live = env::var("HQ_BASE_URL").is_ok() || env::var("HQ_API_KEY").is_ok();
    let model: Arc<dyn LanguageModel> = if live {
        Arc::new(OpenAiClient::from_config(&config.backend)?)
    } else {
        tracing::info!("no backend configured; using the scripted model");
        scripted_model()
    };

    let mut session = Session::builder(model)
        .config(config.session)
        .system_prompt(SYSTEM_PROMPT)
        .tools(todo_tools(TodoStore::in_home()?))
        .middleware(todo_middleware())
        .middleware(TracingMiddleware)
        .build()?;

    let mut runner = Runner::new(ConsoleHandler::stdout());
    let answer = runner.run(&mut session, prompt).await?;
    tracing::info!(session_id = %session.id(), chars = answer.len(), "done");
    Ok(())
}
