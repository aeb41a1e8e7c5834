//! Per-session todo list toolkit.
//!
//! Lists are stored as pretty JSON at `<root>/<session_id>.json`. The
//! `session_id` argument is never supplied by the model; install
//! [`todo_middleware`] so the session injects it.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::middleware::SessionIdInjector;
use crate::schema::{ParamType, ToolSignature};
use crate::tool::Tool;

pub const CREATE_TODOS: &str = "create_todos";
pub const UPDATE_TODOS: &str = "update_todos";
pub const QUERY_TODOS: &str = "query_todos";

const MISSING_SESSION: &str =
    "error: session_id was not provided; make sure the todos middleware is installed";
const NO_LIST: &str = "This session has no todo list yet; create one first";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    pub const ALL: [&'static str; 3] = ["pending", "in_progress", "completed"];

    fn icon(self) -> &'static str {
        match self {
            TodoStatus::Pending => "⏳",
            TodoStatus::InProgress => "🔄",
            TodoStatus::Completed => "✅",
        }
    }
}

impl fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TodoStatus::Pending => "pending",
            TodoStatus::InProgress => "in_progress",
            TodoStatus::Completed => "completed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
    pub id: String,
}

/// File-backed storage, one JSON document per session.
#[derive(Debug, Clone)]
pub struct TodoStore {
    root: PathBuf,
}

impl TodoStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store under `~/.hq-agent-sdk/todos`.
    pub fn in_home() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| AgentError::Config("cannot resolve the home directory".into()))?;
        Ok(Self::new(home.join(".hq-agent-sdk").join("todos")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of a session's list. Ids that are not a single plain path
    /// component are rejected.
    pub fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        let plain = !session_id.is_empty()
            && session_id != "."
            && session_id != ".."
            && !session_id.contains(['/', '\\'])
            && !session_id.contains('\0');
        if !plain {
            return Err(AgentError::InvalidArguments {
                tool: "todos".into(),
                reason: format!("session_id `{session_id}` is not a plain identifier"),
            });
        }
        Ok(self.root.join(format!("{session_id}.json")))
    }

    /// Load a session's list. A missing document is an empty list, and so is
    /// one that no longer parses; other IO failures are returned.
    pub async fn load(&self, session_id: &str) -> Result<Vec<TodoItem>> {
        match tokio::fs::read(self.path_for(session_id)?).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw).unwrap_or_else(|err| {
                tracing::warn!(session_id, error = %err, "discarding unreadable todo list");
                Vec::new()
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, session_id: &str, todos: &[TodoItem]) -> Result<()> {
        let path = self.path_for(session_id)?;
        tokio::fs::create_dir_all(&self.root).await?;
        let raw = serde_json::to_vec_pretty(todos)?;
        tokio::fs::write(path, raw).await?;
        Ok(())
    }
}

/// The three todo tools sharing one store.
pub fn todo_tools(store: TodoStore) -> Vec<Arc<dyn Tool>> {
    let store = Arc::new(store);
    vec![
        Arc::new(CreateTodosTool {
            store: store.clone(),
        }),
        Arc::new(UpdateTodosTool {
            store: store.clone(),
        }),
        Arc::new(QueryTodosTool { store }),
    ]
}

/// Injects the session id into the todo tools only.
pub fn todo_middleware() -> SessionIdInjector {
    SessionIdInjector::for_tools([CREATE_TODOS, UPDATE_TODOS, QUERY_TODOS])
}

fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, args: Value) -> Result<T> {
    serde_json::from_value(args).map_err(|err| AgentError::InvalidArguments {
        tool: tool.to_string(),
        reason: err.to_string(),
    })
}

fn status_literal() -> ParamType {
    ParamType::literal(TodoStatus::ALL)
}

struct CreateTodosTool {
    store: Arc<TodoStore>,
}

#[derive(Deserialize)]
struct CreateArgs {
    todo_items: Vec<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[async_trait]
impl Tool for CreateTodosTool {
    fn signature(&self) -> ToolSignature {
        ToolSignature::new(CREATE_TODOS)
            .doc(
                "Create a new todo list for this session, replacing any existing one.\n\
                 :param todo_items: Task descriptions in execution order",
            )
            .param("todo_items", ParamType::array(ParamType::String))
            .context("session_id")
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let args: CreateArgs = parse_args(CREATE_TODOS, args)?;
        let Some(session_id) = args.session_id.filter(|id| !id.is_empty()) else {
            return Ok(Value::String(MISSING_SESSION.into()));
        };
        let todos: Vec<TodoItem> = args
            .todo_items
            .into_iter()
            .enumerate()
            .map(|(i, content)| TodoItem {
                content,
                status: TodoStatus::Pending,
                id: (i + 1).to_string(),
            })
            .collect();
        self.store.save(&session_id, &todos).await?;
        Ok(Value::String(format!(
            "Created a todo list with {} tasks",
            todos.len()
        )))
    }
}

struct UpdateTodosTool {
    store: Arc<TodoStore>,
}

#[derive(Deserialize)]
struct UpdateArgs {
    task_id: String,
    status: TodoStatus,
    #[serde(default)]
    session_id: Option<String>,
}

#[async_trait]
impl Tool for UpdateTodosTool {
    fn signature(&self) -> ToolSignature {
        ToolSignature::new(UPDATE_TODOS)
            .doc(
                "Update the status of one task.\n\
                 :param task_id: Id of the task to update\n\
                 :param status: New status of the task",
            )
            .param("task_id", ParamType::String)
            .param("status", status_literal())
            .context("session_id")
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let args: UpdateArgs = parse_args(UPDATE_TODOS, args)?;
        let Some(session_id) = args.session_id.filter(|id| !id.is_empty()) else {
            return Ok(Value::String(MISSING_SESSION.into()));
        };
        let mut todos = self.store.load(&session_id).await?;
        if todos.is_empty() {
            return Ok(Value::String(NO_LIST.into()));
        }
        let Some(todo) = todos.iter_mut().find(|todo| todo.id == args.task_id) else {
            return Ok(Value::String(format!("No task with id {}", args.task_id)));
        };
        let previous = std::mem::replace(&mut todo.status, args.status);
        self.store.save(&session_id, &todos).await?;
        Ok(Value::String(format!(
            "Updated task {} from '{previous}' to '{}'",
            args.task_id, args.status
        )))
    }
}

struct QueryTodosTool {
    store: Arc<TodoStore>,
}

#[derive(Deserialize)]
struct QueryArgs {
    #[serde(default)]
    status_filter: Option<TodoStatus>,
    #[serde(default)]
    session_id: Option<String>,
}

#[async_trait]
impl Tool for QueryTodosTool {
    fn signature(&self) -> ToolSignature {
        ToolSignature::new(QUERY_TODOS)
            .doc(
                "List the tasks of this session.\n\
                 :param status_filter: Only list tasks with this status",
            )
            .param("status_filter", ParamType::optional(status_literal()))
            .context("session_id")
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let args: QueryArgs = parse_args(QUERY_TODOS, args)?;
        let Some(session_id) = args.session_id.filter(|id| !id.is_empty()) else {
            return Ok(Value::String(MISSING_SESSION.into()));
        };
        let todos = self.store.load(&session_id).await?;
        if todos.is_empty() {
            return Ok(Value::String(NO_LIST.into()));
        }
        let matching: Vec<&TodoItem> = todos
            .iter()
            .filter(|todo| args.status_filter.map_or(true, |status| todo.status == status))
            .collect();
        if matching.is_empty() {
            let suffix = args
                .status_filter
                .map(|status| format!(" (status: {status})"))
                .unwrap_or_default();
            return Ok(Value::String(format!("No matching tasks{suffix}")));
        }
        let lines: Vec<String> = matching
            .iter()
            .map(|todo| {
                format!(
                    "{} [{}] {} ({})",
                    todo.status.icon(),
                    todo.id,
                    todo.content,
                    todo.status
                )
            })
            .collect();
        Ok(Value::String(format!(
            "Current todo list:\n{}",
            lines.join("\n")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolRegistry;
    use serde_json::json;
    use tempfile::tempdir;

    fn registry(store: TodoStore) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for tool in todo_tools(store) {
            registry.register_arc(tool).unwrap();
        }
        registry
    }

    #[test]
    fn descriptors_hide_the_session_id() {
        let dir = tempdir().unwrap();
        let registry = registry(TodoStore::new(dir.path()));

        let update = registry.get(UPDATE_TODOS).unwrap().descriptor.parameters_json();
        assert_eq!(update["required"], json!(["task_id", "status"]));
        assert_eq!(
            update["properties"]["status"]["enum"],
            json!(["pending", "in_progress", "completed"])
        );
        assert!(update["properties"].get("session_id").is_none());

        let query = registry.get(QUERY_TODOS).unwrap().descriptor.parameters_json();
        assert!(query.get("required").is_none());
    }

    #[tokio::test]
    async fn create_update_and_query() {
        let dir = tempdir().unwrap();
        let store = TodoStore::new(dir.path());
        let registry = registry(store.clone());

        let created = registry
            .call(
                CREATE_TODOS,
                json!({"todo_items": ["plan", "build"], "session_id": "s1"}),
            )
            .await
            .unwrap();
        assert_eq!(created, json!("Created a todo list with 2 tasks"));
        assert!(store.path_for("s1").unwrap().exists());

        let updated = registry
            .call(
                UPDATE_TODOS,
                json!({"task_id": "1", "status": "completed", "session_id": "s1"}),
            )
            .await
            .unwrap();
        assert_eq!(updated, json!("Updated task 1 from 'pending' to 'completed'"));

        let listed = registry
            .call(QUERY_TODOS, json!({"status_filter": "pending", "session_id": "s1"}))
            .await
            .unwrap();
        assert_eq!(listed, json!("Current todo list:\n⏳ [2] build (pending)"));

        let stored = store.load("s1").await.unwrap();
        assert_eq!(stored[0].status, TodoStatus::Completed);
    }

    #[tokio::test]
    async fn explains_missing_session_and_unknown_tasks() {
        let dir = tempdir().unwrap();
        let registry = registry(TodoStore::new(dir.path()));

        let missing = registry.call(QUERY_TODOS, json!({})).await.unwrap();
        assert_eq!(missing, json!(MISSING_SESSION));

        let empty = registry
            .call(QUERY_TODOS, json!({"session_id": "fresh"}))
            .await
            .unwrap();
        assert_eq!(empty, json!(NO_LIST));

        registry
            .call(CREATE_TODOS, json!({"todo_items": ["a"], "session_id": "s2"}))
            .await
            .unwrap();
        let unknown = registry
            .call(
                UPDATE_TODOS,
                json!({"task_id": "9", "status": "completed", "session_id": "s2"}),
            )
            .await
            .unwrap();
        assert_eq!(unknown, json!("No task with id 9"));

        let bad_status = registry
            .call(
                UPDATE_TODOS,
                json!({"task_id": "1", "status": "done", "session_id": "s2"}),
            )
            .await;
        assert!(matches!(bad_status, Err(AgentError::ToolExecution { .. })));
    }

    #[tokio::test]
    async fn rejects_session_ids_that_leave_the_store() {
        let dir = tempdir().unwrap();
        let store = TodoStore::new(dir.path().join("todos"));
        let registry = registry(store.clone());

        assert!(store.path_for("../escape").is_err());
        assert!(store.path_for("..").is_err());
        let err = registry
            .call(
                CREATE_TODOS,
                json!({"todo_items": ["a"], "session_id": "../escape"}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a plain identifier"));
        assert!(!dir.path().join("escape.json").exists());
    }

    #[tokio::test]
    async fn surfaces_io_errors_other_than_a_missing_list() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"plain file").unwrap();
        let store = TodoStore::new(&blocker);

        assert!(TodoStore::new(dir.path()).load("absent").await.unwrap().is_empty());
        assert!(matches!(store.load("s1").await, Err(AgentError::Io(_))));
    }
}
