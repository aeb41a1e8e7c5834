use std::collections::HashSet;

use crate::error::{AgentError, Result};
use crate::message::{Message, Role};

/// Append-only, chronologically ordered conversation transcript.
///
/// Entries are never reordered or edited once pushed. A tool-role entry is
/// only accepted when it answers a tool call emitted by an assistant entry
/// that is still in the history, and only once per call id.
#[derive(Default, Clone, Debug)]
pub struct MessageHistory {
    messages: Vec<Message>,
    pending_calls: HashSet<String>,
    answered_calls: HashSet<String>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<Message>) -> Result<Self> {
        let mut history = Self::new();
        for message in messages {
            history.push(message)?;
        }
        Ok(history)
    }

    pub fn push(&mut self, message: Message) -> Result<()> {
        match message.role {
            Role::Tool => {
                let call_id = message.tool_call_id.as_deref().ok_or_else(|| {
                    AgentError::InvalidHistory("tool message without a call id".into())
                })?;
                if self.answered_calls.contains(call_id) {
                    return Err(AgentError::InvalidHistory(format!(
                        "tool call `{call_id}` was already answered"
                    )));
                }
                if !self.pending_calls.remove(call_id) {
                    return Err(AgentError::InvalidHistory(format!(
                        "tool message answers unknown call `{call_id}`"
                    )));
                }
                self.answered_calls.insert(call_id.to_string());
            }
            Role::Assistant => {
                let mut batch = HashSet::new();
                for call in &message.tool_calls {
                    if self.knows_call_id(&call.id) || !batch.insert(call.id.as_str()) {
                        return Err(AgentError::InvalidHistory(format!(
                            "duplicate tool call id `{}`",
                            call.id
                        )));
                    }
                }
                self.pending_calls
                    .extend(message.tool_calls.iter().map(|call| call.id.clone()));
            }
            Role::System | Role::User => {}
        }
        self.messages.push(message);
        Ok(())
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> + '_ {
        self.messages.iter()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.pending_calls.clear();
        self.answered_calls.clear();
    }

    /// Whether a call id has already been used by an assistant entry.
    pub(crate) fn knows_call_id(&self, id: &str) -> bool {
        self.pending_calls.contains(id) || self.answered_calls.contains(id)
    }
}
