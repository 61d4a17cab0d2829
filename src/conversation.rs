use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SYSTEM_MESSAGE_ID: &str = "system-prompt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub id: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// Presentation hint for user turns.
    pub is_floating: bool,
}

impl Message {
    fn stamped(role: Role, prefix: &str, content: String, is_floating: bool) -> Self {
        Self {
            role,
            content,
            id: format!("{}-{}", prefix, Uuid::new_v4()),
            timestamp: Some(Utc::now()),
            is_floating,
        }
    }
}

/// Role/content pair as sent to the chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
        }
    }
}

/// Append-only, in-memory conversation that always starts with the system directive.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system_prompt: &str) -> Self {
        Self {
            messages: vec![Message {
                role: Role::System,
                content: system_prompt.to_string(),
                id: SYSTEM_MESSAGE_ID.to_string(),
                timestamp: None,
                is_floating: false,
            }],
        }
    }

    pub fn push_user(&mut self, text: &str) -> Message {
        self.push(Message::stamped(Role::User, "user", text.to_string(), true))
    }

    pub fn push_assistant(&mut self, text: &str) -> Message {
        self.push(Message::stamped(
            Role::Assistant,
            "assistant",
            text.to_string(),
            false,
        ))
    }

    /// Appends a fixed error reply; it is an ordinary assistant turn on the wire.
    pub fn push_error(&mut self, text: &str) -> Message {
        self.push(Message::stamped(
            Role::Assistant,
            "error",
            text.to_string(),
            false,
        ))
    }

    fn push(&mut self, msg: Message) -> Message {
        self.messages.push(msg.clone());
        msg
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Everything except the system directive, in insertion order.
    pub fn visible(&self) -> &[Message] {
        &self.messages[1..]
    }

    pub fn wire_messages(&self) -> Vec<WireMessage> {
        self.messages.iter().map(WireMessage::from).collect()
    }

    /// The n-th (1-based) assistant reply.
    pub fn assistant_reply(&self, n: usize) -> Option<&Message> {
        if n == 0 {
            return None;
        }
        self.visible()
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .nth(n - 1)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
