//! Partial assistant output produced by streaming backends.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::llm::ModelCompletion;
use crate::message::ToolCall;

/// Receiving half of a streamed completion. The backend sends deltas in order
/// and closes the channel when the completion is finished.
pub type DeltaReceiver = mpsc::Receiver<Result<MessageDelta>>;
pub type DeltaSender = mpsc::Sender<Result<MessageDelta>>;

/// Buffer used for backend delta channels.
pub const DELTA_BUFFER: usize = 64;

pub fn delta_channel() -> (DeltaSender, DeltaReceiver) {
    mpsc::channel(DELTA_BUFFER)
}

/// A fragment of a tool call. Fragments sharing an `index` belong to the same call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,
}

impl MessageDelta {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool_call(delta: ToolCallDelta) -> Self {
        Self {
            tool_calls: vec![delta],
            ..Self::default()
        }
    }

    /// A complete completion expressed as one delta.
    pub fn from_completion(completion: &ModelCompletion) -> Self {
        Self {
            content: completion.content.clone().filter(|c| !c.is_empty()),
            reasoning: completion.reasoning.clone().filter(|r| !r.is_empty()),
            tool_calls: completion
                .tool_calls
                .iter()
                .enumerate()
                .map(|(index, call)| ToolCallDelta {
                    index,
                    id: (!call.id.is_empty()).then(|| call.id.clone()),
                    name: Some(call.name.clone()),
                    arguments: Some(match &call.arguments {
                        Value::String(raw) => raw.clone(),
                        other => other.to_string(),
                    }),
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.as_deref().map_or(true, str::is_empty)
            && self.reasoning.as_deref().map_or(true, str::is_empty)
            && self.tool_calls.is_empty()
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds ordered deltas into one logical completion.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    content: String,
    reasoning: String,
    calls: Vec<Option<PartialCall>>,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &MessageDelta) {
        if let Some(content) = &delta.content {
            self.content.push_str(content);
        }
        if let Some(reasoning) = &delta.reasoning {
            self.reasoning.push_str(reasoning);
        }
        for fragment in &delta.tool_calls {
            if self.calls.len() <= fragment.index {
                self.calls.resize_with(fragment.index + 1, || None);
            }
            let call = self.calls[fragment.index].get_or_insert_with(PartialCall::default);
            if let Some(id) = fragment.id.as_deref().filter(|id| !id.is_empty()) {
                call.id = id.to_string();
            }
            if let Some(name) = &fragment.name {
                call.name.push_str(name);
            }
            if let Some(arguments) = &fragment.arguments {
                call.arguments.push_str(arguments);
            }
        }
    }

    /// Finish accumulation. Calls without an id keep an empty id; the session
    /// assigns one before the message enters history.
    pub fn finish(self) -> ModelCompletion {
        let tool_calls = self
            .calls
            .into_iter()
            .flatten()
            .filter(|call| !call.name.is_empty())
            .map(|call| ToolCall::new(call.id, call.name, Value::String(call.arguments)))
            .collect();
        ModelCompletion {
            content: (!self.content.is_empty()).then_some(self.content),
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            tool_calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merges_fragments_by_index() {
        let mut acc = DeltaAccumulator::new();
        acc.push(&MessageDelta::reasoning("thinking"));
        acc.push(&MessageDelta::content("Let me "));
        acc.push(&MessageDelta::content("check."));
        acc.push(&MessageDelta::tool_call(ToolCallDelta {
            index: 1,
            id: Some("call_b".into()),
            name: Some("query_todos".into()),
            arguments: Some("{}".into()),
        }));
        acc.push(&MessageDelta::tool_call(ToolCallDelta {
            index: 0,
            id: Some("call_a".into()),
            name: Some("ad".into()),
            arguments: Some("{\"a\": 2,".into()),
        }));
        acc.push(&MessageDelta::tool_call(ToolCallDelta {
            index: 0,
            name: Some("d".into()),
            arguments: Some(" \"b\": 2}".into()),
            ..ToolCallDelta::default()
        }));

        let completion = acc.finish();
        assert_eq!(completion.content.as_deref(), Some("Let me check."));
        assert_eq!(completion.reasoning.as_deref(), Some("thinking"));
        assert_eq!(completion.tool_calls.len(), 2);
        assert_eq!(completion.tool_calls[0].id, "call_a");
        assert_eq!(completion.tool_calls[0].name, "add");
        assert_eq!(completion.tool_calls[0].arguments, json!({"a": 2, "b": 2}));
        assert_eq!(completion.tool_calls[1].name, "query_todos");
    }

    #[test]
    fn single_delta_round_trips_a_completion() {
        let completion = ModelCompletion {
            content: Some("calling".into()),
            reasoning: None,
            tool_calls: vec![ToolCall::new("c1", "add", json!({"a": 1, "b": 2}))],
        };
        let mut acc = DeltaAccumulator::new();
        acc.push(&MessageDelta::from_completion(&completion));
        assert_eq!(acc.finish(), completion);
    }

    #[test]
    fn empty_stream_yields_empty_completion() {
        let completion = DeltaAccumulator::new().finish();
        assert!(completion.content.is_none());
        assert!(completion.tool_calls.is_empty());
        assert!(MessageDelta::default().is_empty());
    }
}
