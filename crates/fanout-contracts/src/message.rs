// Message DTOs returned by the remote session API
//
// The engine never writes these; it reads them to count transcript growth
// and to check whether a session has produced usable output.

use serde::{Deserialize, Serialize};

/// Message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// One part of a message body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Reasoning { text: String },
    ToolUse { name: String },
}

impl MessagePart {
    /// Whether this part counts as usable output: non-blank text or
    /// reasoning, or any tool invocation.
    pub fn has_content(&self) -> bool {
        match self {
            MessagePart::Text { text } | MessagePart::Reasoning { text } => {
                !text.trim().is_empty()
            }
            MessagePart::ToolUse { .. } => true,
        }
    }

    /// Text carried by this part, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            MessagePart::Text { text } | MessagePart::Reasoning { text } => Some(text),
            MessagePart::ToolUse { .. } => None,
        }
    }
}

/// One entry in a session transcript
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn assistant(parts: Vec<MessagePart>) -> Self {
        Self {
            role: Role::Assistant,
            parts,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![MessagePart::Text { text: text.into() }],
        }
    }

    /// Whether this is an assistant message with at least one content part.
    pub fn is_assistant_output(&self) -> bool {
        self.role == Role::Assistant && self.parts.iter().any(MessagePart::has_content)
    }
}

/// Check a transcript for usable assistant output.
pub fn has_assistant_output(messages: &[Message]) -> bool {
    messages.iter().any(Message::is_assistant_output)
}

/// Text of the last assistant message: its text and reasoning parts joined
/// with newlines. None when the transcript has no assistant message.
pub fn final_assistant_text(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| {
            m.parts
                .iter()
                .filter_map(MessagePart::text)
                .filter(|t| !t.trim().is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_text_is_not_content() {
        let msg = Message::assistant(vec![MessagePart::Text {
            text: "   ".into(),
        }]);
        assert!(!msg.is_assistant_output());
    }

    #[test]
    fn test_tool_use_counts_as_output() {
        let msg = Message::assistant(vec![MessagePart::ToolUse {
            name: "read_file".into(),
        }]);
        assert!(msg.is_assistant_output());
    }

    #[test]
    fn test_user_output_is_ignored() {
        let messages = vec![Message::user("do the thing")];
        assert!(!has_assistant_output(&messages));
    }

    #[test]
    fn test_final_assistant_text_takes_last() {
        let messages = vec![
            Message::user("go"),
            Message::assistant(vec![MessagePart::Text {
                text: "draft".into(),
            }]),
            Message::assistant(vec![
                MessagePart::Reasoning {
                    text: "thinking".into(),
                },
                MessagePart::Text {
                    text: "final".into(),
                },
            ]),
        ];
        assert_eq!(
            final_assistant_text(&messages).as_deref(),
            Some("thinking\nfinal")
        );
        assert_eq!(final_assistant_text(&[Message::user("hi")]), None);
    }
}
