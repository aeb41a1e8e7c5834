//! Tools shipped with the SDK.

pub mod todos;

pub use todos::{todo_middleware, todo_tools, TodoItem, TodoStatus, TodoStore};
