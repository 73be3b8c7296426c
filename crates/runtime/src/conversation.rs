//! Conversation history owned by one agent.

use std::collections::HashSet;

use crate::model::{Message, Part, Role, ToolResult};
use crate::{Error, Result};

/// Ordered messages exchanged with the model.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(Message::user(text));
    }

    pub fn push_assistant(&mut self, message: Message) {
        debug_assert_eq!(message.role, Role::Assistant);
        self.messages.push(message);
    }

    /// Ids of the calls in the last assistant message still waiting for a
    /// result.
    pub fn pending_calls(&self) -> Vec<String> {
        match self.messages.last() {
            Some(msg) if msg.role == Role::Assistant => {
                msg.tool_calls().into_iter().map(|c| c.id).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Append the results for the previous assistant message.
    ///
    /// Every result must answer a distinct pending call, and every pending
    /// call must be answered; nothing is appended otherwise.
    pub fn push_tool_results(&mut self, results: Vec<ToolResult>) -> Result<()> {
        let pending: HashSet<String> = self.pending_calls().into_iter().collect();
        let mut seen = HashSet::new();
        for result in &results {
            let id = result.tool_call_id();
            if !pending.contains(id) || !seen.insert(id.to_string()) {
                return Err(Error::UnmatchedToolResult(id.to_string()));
            }
        }
        if let Some(missing) = pending.iter().find(|id| !seen.contains(*id)) {
            return Err(Error::InvalidState(format!(
                "no result for tool call {missing}"
            )));
        }

        self.messages.push(Message::tool_results(results));
        Ok(())
    }

    /// Text of the final assistant message, if the conversation ends on one.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(Message::text)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResult> {
        self.messages.iter().flat_map(|m| {
            m.parts.iter().filter_map(|p| match p {
                Part::ToolResult(r) => Some(r),
                _ => None,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolCall;
    use crate::tools::ToolError;

    fn assistant_with_calls(ids: &[&str]) -> Message {
        Message {
            role: Role::Assistant,
            parts: ids
                .iter()
                .map(|id| {
                    Part::ToolCall(ToolCall {
                        id: id.to_string(),
                        name: "bash".into(),
                        input: serde_json::json!({}),
                    })
                })
                .collect(),
        }
    }

    #[test]
    fn results_must_match_pending_calls() {
        let mut conv = Conversation::new();
        conv.push_user("list files");
        conv.push_assistant(assistant_with_calls(&["a", "b"]));

        let err = conv
            .push_tool_results(vec![ToolResult::success("a", ""), ToolResult::success("zzz", "")])
            .unwrap_err();
        assert!(matches!(err, Error::UnmatchedToolResult(id) if id == "zzz"));
        assert_eq!(conv.len(), 2);

        conv.push_tool_results(vec![
            ToolResult::success("a", "x"),
            ToolResult::failure("b", ToolError::Cancelled),
        ])
        .unwrap();
        assert_eq!(conv.len(), 3);
        assert_eq!(conv.tool_results().count(), 2);
    }

    #[test]
    fn results_without_calls_rejected() {
        let mut conv = Conversation::new();
        conv.push_user("hi");
        assert!(matches!(
            conv.push_tool_results(vec![ToolResult::success("a", "")]),
            Err(Error::UnmatchedToolResult(_))
        ));
    }

    #[test]
    fn duplicate_and_missing_results_rejected() {
        let mut conv = Conversation::new();
        conv.push_assistant(assistant_with_calls(&["a", "b"]));
        assert!(matches!(
            conv.push_tool_results(vec![ToolResult::success("a", ""), ToolResult::success("a", "")]),
            Err(Error::UnmatchedToolResult(_))
        ));
        assert!(matches!(
            conv.push_tool_results(vec![ToolResult::success("a", "")]),
            Err(Error::InvalidState(_))
        ));
    }
}
