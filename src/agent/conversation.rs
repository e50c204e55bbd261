//! Ordered message history owned by one orchestrator turn at a time.

use crate::llm::{Message, Role};

/// An append-only sequence of messages.
///
/// Turns borrow it mutably, so only one turn can write to a conversation at
/// a time. Order is significant and never changed after an append.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from previously saved messages.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
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

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Check that every tool message answers the calls of the assistant
    /// message right before its batch, in the order they were requested.
    pub fn validate(&self) -> Result<(), String> {
        let mut expected: std::vec::IntoIter<String> = Vec::new().into_iter();

        for (index, message) in self.messages.iter().enumerate() {
            match message.role {
                Role::Tool => {
                    let id = message.tool_call_id.as_deref().unwrap_or_default();
                    match expected.next() {
                        Some(next) if next == id => {}
                        Some(next) => {
                            return Err(format!(
                                "message {} answers tool call {:?}, expected {:?}",
                                index, id, next
                            ))
                        }
                        None => {
                            return Err(format!(
                                "message {} answers tool call {:?} with no pending request",
                                index, id
                            ))
                        }
                    }
                }
                Role::Assistant => {
                    expected = message
                        .tool_calls
                        .iter()
                        .map(|c| c.id.clone())
                        .collect::<Vec<_>>()
                        .into_iter();
                }
                Role::System | Role::User => {
                    expected = Vec::new().into_iter();
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCall;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "bash".into(),
            arguments: json!({}),
        }
    }

    #[test]
    fn test_valid_sequence() {
        let mut conv = Conversation::new();
        conv.push(Message::user("go"));
        conv.push(Message::assistant_with_tools("", vec![call("a"), call("b")]));
        conv.push(Message::tool("a", "1"));
        conv.push(Message::tool("b", "2"));
        conv.push(Message::assistant("done"));
        assert!(conv.validate().is_ok());
        assert_eq!(conv.len(), 5);
    }

    #[test]
    fn test_out_of_order_results_are_invalid() {
        let mut conv = Conversation::new();
        conv.push(Message::assistant_with_tools("", vec![call("a"), call("b")]));
        conv.push(Message::tool("b", "2"));
        assert!(conv.validate().is_err());
    }

    #[test]
    fn test_orphan_tool_message_is_invalid() {
        let mut conv = Conversation::new();
        conv.push(Message::user("hi"));
        conv.push(Message::tool("a", "1"));
        assert!(conv.validate().is_err());
    }
}
