//! Drives a session turn and hands its output to a pluggable handler.

use std::io::{self, Write};

use tokio::sync::mpsc;

use crate::error::Result;
use crate::session::{Session, TurnOutcome};
use crate::stream::{MessageDelta, ToolCallDelta, DELTA_BUFFER};

/// Receives a turn's output. Streamed turns see the deltas; non-streamed
/// turns only see the final outcome.
pub trait StreamHandler: Send {
    fn on_stream_start(&mut self) {}

    fn on_reasoning_delta(&mut self, _text: &str) {}

    fn on_content_delta(&mut self, _text: &str) {}

    fn on_tool_call_delta(&mut self, _delta: &ToolCallDelta) {}

    fn on_stream_end(&mut self) {}

    fn on_response(&mut self, _outcome: &TurnOutcome) {}
}

pub struct Runner<H> {
    handler: H,
}

impl<H: StreamHandler> Runner<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Run one turn, streamed when the session is configured to stream.
    /// Returns the answer text: every content delta of the turn when streamed,
    /// the final assistant message otherwise.
    pub async fn run(&mut self, session: &mut Session, text: impl Into<String>) -> Result<String> {
        if session.config().stream {
            return self.run_streaming(session, text.into()).await;
        }
        let outcome = session.send_message(text).await?;
        self.handler.on_response(&outcome);
        Ok(outcome.message.content)
    }

    async fn run_streaming(&mut self, session: &mut Session, text: String) -> Result<String> {
        let (tx, mut rx) = mpsc::channel::<MessageDelta>(DELTA_BUFFER);
        self.handler.on_stream_start();

        let handler = &mut self.handler;
        let drain = async move {
            let mut content = String::new();
            while let Some(delta) = rx.recv().await {
                if let Some(reasoning) = delta.reasoning.as_deref() {
                    handler.on_reasoning_delta(reasoning);
                }
                if let Some(text) = delta.content.as_deref().filter(|t| !t.is_empty()) {
                    handler.on_content_delta(text);
                    content.push_str(text);
                }
                for call in &delta.tool_calls {
                    handler.on_tool_call_delta(call);
                }
            }
            content
        };

        let (outcome, content) = tokio::join!(session.send_message_streaming(text, tx), drain);
        self.handler.on_stream_end();
        outcome?;
        Ok(content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Pending,
    Reasoning,
    Answer,
    ToolCall,
}

/// Prints a stage header whenever output switches between reasoning,
/// answer text and tool calls.
pub struct ConsoleHandler<W: Write> {
    out: W,
    stage: Stage,
}

impl ConsoleHandler<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsoleHandler<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            stage: Stage::Pending,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn enter(&mut self, stage: Stage, header: &str) {
        if self.stage != stage {
            let _ = write!(self.out, "\n{header}\n");
            self.stage = stage;
        }
    }

    fn emit(&mut self, text: &str) {
        let _ = write!(self.out, "{text}");
        let _ = self.out.flush();
    }
}

impl<W: Write + Send> StreamHandler for ConsoleHandler<W> {
    fn on_stream_start(&mut self) {
        self.stage = Stage::Pending;
    }

    fn on_reasoning_delta(&mut self, text: &str) {
        self.enter(Stage::Reasoning, "Reasoning:");
        self.emit(text);
    }

    fn on_content_delta(&mut self, text: &str) {
        self.enter(Stage::Answer, "Answer:");
        self.emit(text);
    }

    fn on_tool_call_delta(&mut self, delta: &ToolCallDelta) {
        if delta.name.is_some() {
            self.stage = Stage::Pending;
        }
        self.enter(Stage::ToolCall, "Tool call:");
        if let Some(name) = &delta.name {
            self.emit(name);
            self.emit(" ");
        }
        if let Some(arguments) = &delta.arguments {
            self.emit(arguments);
        }
    }

    fn on_stream_end(&mut self) {
        self.emit("\n");
    }

    fn on_response(&mut self, outcome: &TurnOutcome) {
        let _ = writeln!(self.out, "Answer: {}", outcome.content());
    }
}
