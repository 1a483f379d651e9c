//! Rendering chat messages into the prompt sent over stdin

use serde::{Deserialize, Serialize};

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[cfg(test)]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Build the prompt for one turn.
///
/// A resumed session already holds everything up to the last assistant
/// reply, so only what follows it is sent. A fresh session gets the whole
/// transcript.
pub fn render_prompt(messages: &[ChatMessage], resuming: bool) -> String {
    let new_input = if resuming {
        let start = messages
            .iter()
            .rposition(|m| m.role == Role::Assistant)
            .map_or(0, |i| i + 1);
        match messages.get(start..) {
            Some(rest) if !rest.is_empty() => rest,
            _ => messages,
        }
    } else {
        messages
    };

    if let [only] = new_input {
        if only.role == Role::User {
            return only.content.clone();
        }
    }

    let mut parts: Vec<String> = new_input
        .iter()
        .map(|m| format!("{}: {}", m.role.label(), m.content))
        .collect();
    parts.push("Assistant:".to_string());
    parts.join("\n\n")
}
