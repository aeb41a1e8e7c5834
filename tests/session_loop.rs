//! End-to-end behaviour of the session loop against a scripted model.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hq_agent_sdk::{
    generate, AgentError, BackendErrorKind, FnMiddleware, FnTool, Message, ModelCompletion,
    ParamType, Role, Session, SessionConfig, SessionState, StubModel, Termination, Tool,
    ToolCall, ToolSignature,
};
use serde_json::json;
use tokio::sync::mpsc;

fn add_signature() -> ToolSignature {
    ToolSignature::new("add")
        .doc("Add two integers.\n:param a: First addend\n:param b: Second addend")
        .param("a", ParamType::Integer)
        .param("b", ParamType::Integer)
}

fn add_tool() -> FnTool {
    FnTool::new(add_signature(), |args| async move {
        let a = args["a"].as_i64().unwrap_or_default();
        let b = args["b"].as_i64().unwrap_or_default();
        Ok(json!(a + b))
    })
}

fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall::new(id, name, args)
}

#[test]
fn add_descriptor_is_deterministic_with_two_required_integers() {
    let first = generate(&add_signature()).unwrap();
    let second = generate(&add_signature()).unwrap();
    assert_eq!(first.to_json().to_string(), second.to_json().to_string());

    let params = first.parameters_json();
    assert_eq!(params["type"], "object");
    assert_eq!(params["properties"]["a"]["type"], "integer");
    assert_eq!(params["properties"]["b"]["type"], "integer");
    assert_eq!(params["required"], json!(["a", "b"]));
    assert!(first.parameters.iter().all(|p| p.required));
}

#[tokio::test]
async fn add_round_trip_appends_one_result_before_the_next_call() {
    let stub = StubModel::new(vec![
        ModelCompletion::with_tool_calls(vec![call("c1", "add", json!({"a": 2, "b": 2}))]),
        ModelCompletion::text("2 + 2 = 4"),
    ]);
    let mut session = Session::builder(stub.clone()).tool(add_tool()).build().unwrap();

    let outcome = session.send_message("compute 2+2").await.unwrap();

    assert_eq!(outcome.content(), "2 + 2 = 4");
    assert_eq!(outcome.termination, Termination::Complete);
    assert_eq!(outcome.iterations, 1);

    let requests = stub.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools, vec!["add"]);
    let seen = &requests[1].messages;
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2], Message::tool_result("c1", "4"));

    let roles: Vec<Role> = session.history().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
}

#[tokio::test]
async fn tool_results_follow_request_order_regardless_of_latency() {
    let slow = FnTool::new(
        ToolSignature::new("slow").param("tag", ParamType::String),
        |args| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(args["tag"].clone())
        },
    );
    let fast = FnTool::new(
        ToolSignature::new("fast").param("tag", ParamType::String),
        |args| async move { Ok(args["tag"].clone()) },
    );
    let stub = StubModel::new(vec![
        ModelCompletion::with_tool_calls(vec![
            call("A", "slow", json!({"tag": "a"})),
            call("B", "fast", json!({"tag": "b"})),
            call("C", "slow", json!({"tag": "c"})),
        ]),
        ModelCompletion::text("done"),
    ]);
    let mut session = Session::builder(stub).tool(slow).tool(fast).build().unwrap();

    session.send_message("go").await.unwrap();

    let results: Vec<(&str, &str)> = session
        .history()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| (m.tool_call_id.as_deref().unwrap_or(""), m.content.as_str()))
        .collect();
    assert_eq!(results, vec![("A", "a"), ("B", "b"), ("C", "c")]);
}

#[tokio::test]
async fn middleware_wraps_calls_in_stack_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let hook = |label: &'static str| {
        let before = log.clone();
        let after = log.clone();
        FnMiddleware::new(label)
            .before(move |_, args, _| {
                before.lock().unwrap().push(format!("{label}:before"));
                Ok(args)
            })
            .after(move |result, _, _| {
                after.lock().unwrap().push(format!("{label}:after"));
                Ok(result)
            })
    };
    let stub = StubModel::new(vec![
        ModelCompletion::with_tool_calls(vec![call("c1", "add", json!({"a": 1, "b": 1}))]),
        ModelCompletion::text("2"),
    ]);
    let mut session = Session::builder(stub)
        .tool(add_tool())
        .middleware(hook("H1"))
        .middleware(hook("H2"))
        .build()
        .unwrap();

    session.send_message("1+1").await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["H1:before", "H2:before", "H2:after", "H1:after"]
    );
}

#[tokio::test]
async fn sessions_sharing_tools_stay_isolated() {
    let shared: Arc<dyn Tool> = Arc::new(add_tool());
    let mut first = Session::builder(StubModel::new(vec![ModelCompletion::text("one")]))
        .tool_arc(shared.clone())
        .build()
        .unwrap();
    let mut second = Session::builder(StubModel::new(vec![ModelCompletion::text("two")]))
        .tool_arc(shared)
        .build()
        .unwrap();

    first.send_message("hello from first").await.unwrap();
    first
        .register_tool(FnTool::new(ToolSignature::new("extra"), |_| async {
            Ok(json!(null))
        }))
        .unwrap();
    second.send_message("hello from second").await.unwrap();

    assert_ne!(first.id(), second.id());
    assert_eq!(first.history()[0].content, "hello from first");
    assert_eq!(second.history()[0].content, "hello from second");
    assert_eq!(second.history().len(), 2);
    assert_eq!(first.descriptors().len(), 2);
    assert_eq!(second.descriptors().len(), 1);
}

#[tokio::test]
async fn stops_after_the_configured_number_of_tool_rounds() {
    let looping: Vec<ModelCompletion> = (0..6)
        .map(|n| {
            ModelCompletion::with_tool_calls(vec![call(
                &format!("loop_{n}"),
                "add",
                json!({"a": n, "b": 1}),
            )])
        })
        .collect();
    let stub = StubModel::new(looping);
    let mut session = Session::builder(stub.clone())
        .config(SessionConfig::default().with_max_iterations(3))
        .tool(add_tool())
        .build()
        .unwrap();

    let outcome = session.send_message("never stop").await.unwrap();

    assert_eq!(outcome.termination, Termination::IterationLimit);
    assert!(outcome.hit_iteration_limit());
    assert_eq!(outcome.iterations, 3);
    assert!(outcome.message.has_tool_calls());
    assert_eq!(stub.requests().len(), 4);
    let tool_results = session
        .history()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .count();
    assert_eq!(tool_results, 3);
    assert_eq!(session.history().last(), Some(&outcome.message));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn failing_and_unknown_tools_become_error_entries() {
    let explode = FnTool::new(ToolSignature::new("explode"), |_| async {
        Err(AgentError::tool_failure("explode", "disk on fire"))
    });
    let stub = StubModel::new(vec![
        ModelCompletion::with_tool_calls(vec![
            call("c1", "explode", json!({})),
            call("c2", "teleport", json!({"to": "mars"})),
        ]),
        ModelCompletion::text("Sorry, both tools failed."),
    ]);
    let mut session = Session::builder(stub.clone())
        .tool(explode)
        .build()
        .unwrap();

    let outcome = session.send_message("try things").await.unwrap();

    assert_eq!(outcome.content(), "Sorry, both tools failed.");
    let errors: Vec<&Message> = session
        .history()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|m| m.is_error));
    assert!(errors[0].content.contains("disk on fire"));
    assert_eq!(errors[1].content, "error: tool `teleport` not found");
    assert_eq!(stub.requests().len(), 2);
}

#[tokio::test]
async fn backend_errors_reach_the_caller_and_keep_complete_batches() {
    let stub = StubModel::with_outcomes(vec![
        Ok(ModelCompletion::with_tool_calls(vec![call(
            "c1",
            "add",
            json!({"a": 1, "b": 2}),
        )])),
        Err(AgentError::backend(BackendErrorKind::Auth, "invalid api key")),
    ]);
    let mut session = Session::builder(stub).tool(add_tool()).build().unwrap();

    let err = session.send_message("1+2").await.unwrap_err();

    assert_eq!(err.backend_kind(), Some(BackendErrorKind::Auth));
    assert!(!err.is_tool_local());
    assert_eq!(session.history().len(), 3);
    assert_eq!(session.history()[2], Message::tool_result("c1", "3"));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn streaming_forwards_deltas_and_accumulates_the_message() {
    let stub = StubModel::new(vec![
        ModelCompletion::with_tool_calls(vec![call("c1", "add", json!({"a": 20, "b": 22}))])
            .with_reasoning("use the tool"),
        ModelCompletion::text("The sum is 42."),
    ]);
    let mut session = Session::builder(stub).tool(add_tool()).build().unwrap();
    let (tx, mut rx) = mpsc::channel(256);

    let outcome = session.send_message_streaming("20+22", tx).await.unwrap();

    let mut content = String::new();
    let mut fragments = 0;
    while let Some(delta) = rx.recv().await {
        if let Some(text) = delta.content {
            content.push_str(&text);
        }
        fragments += delta.tool_calls.len();
    }
    assert_eq!(content, "The sum is 42.");
    assert!(fragments > 1);
    assert_eq!(outcome.content(), "The sum is 42.");
    assert_eq!(session.history()[1].tool_calls[0].arguments, json!({"a": 20, "b": 22}));
    assert_eq!(session.history()[1].reasoning.as_deref(), Some("use the tool"));
    assert_eq!(session.history()[2], Message::tool_result("c1", "42"));
}

#[tokio::test]
async fn dropped_delta_receiver_does_not_abort_the_turn() {
    let stub = StubModel::new(vec![ModelCompletion::text("still answered in full")]);
    let mut session = Session::builder(stub).build().unwrap();
    let (tx, rx) = mpsc::channel(1);
    drop(rx);

    let outcome = session.send_message_streaming("hi", tx).await.unwrap();
    assert_eq!(outcome.content(), "still answered in full");
}

#[tokio::test]
async fn configured_streaming_is_transparent_to_send_message() {
    let stub = StubModel::new(vec![ModelCompletion::text("chunked reply text")]);
    let mut session = Session::builder(stub)
        .config(SessionConfig::default().with_stream(true))
        .build()
        .unwrap();

    let outcome = session.send_message("hi").await.unwrap();
    assert_eq!(outcome.content(), "chunked reply text");
}

#[tokio::test]
async fn cancellation_abandons_the_backend_call() {
    let stub = StubModel::delayed(
        vec![ModelCompletion::text("first reply")],
        Duration::from_millis(300),
    );
    let mut session = Session::builder(stub).build().unwrap();
    let token = session.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let err = session.send_message("hello").await.unwrap_err();

    assert!(matches!(err, AgentError::Cancelled));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.history(), &[Message::user("hello")]);
    assert!(!session.cancellation_token().is_cancelled());

    let outcome = session.send_message("again").await.unwrap();
    assert_eq!(outcome.content(), "first reply");
}

#[tokio::test]
async fn panicking_tool_becomes_an_error_entry() {
    let lookup = FnTool::new(
        ToolSignature::new("lookup").param("index", ParamType::Integer),
        |args| async move {
            let rows: Vec<i64> = Vec::new();
            let index = args["index"].as_u64().unwrap_or_default() as usize;
            Ok(json!(rows[index]))
        },
    );
    let stub = StubModel::new(vec![
        ModelCompletion::with_tool_calls(vec![call("c1", "lookup", json!({"index": 3}))]),
        ModelCompletion::text("recovered"),
    ]);
    let mut session = Session::builder(stub).tool(lookup).build().unwrap();

    let outcome = session.send_message("look it up").await.unwrap();

    assert_eq!(outcome.content(), "recovered");
    let result = &session.history()[2];
    assert!(result.is_error);
    assert!(result.content.contains("index out of bounds"));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn cancellation_mid_stream_discards_the_partial_message() {
    let stub = StubModel::paced(
        vec![
            ModelCompletion::text("a long answer that arrives slowly"),
            ModelCompletion::text("second answer"),
        ],
        Duration::from_millis(20),
    );
    let mut session = Session::builder(stub).build().unwrap();
    let token = session.cancellation_token();
    let (tx, mut rx) = mpsc::channel(64);
    let watcher = tokio::spawn(async move {
        let first = rx.recv().await;
        token.cancel();
        first
    });

    let err = session.send_message_streaming("hello", tx).await.unwrap_err();

    assert!(matches!(err, AgentError::Cancelled));
    let first = watcher.await.unwrap().unwrap();
    assert_eq!(first.content.as_deref(), Some("a lo"));
    assert_eq!(session.history(), &[Message::user("hello")]);
    assert_eq!(session.state(), SessionState::Idle);

    let outcome = session.send_message("again").await.unwrap();
    assert_eq!(outcome.content(), "second answer");
    assert_eq!(session.history().len(), 3);
}
