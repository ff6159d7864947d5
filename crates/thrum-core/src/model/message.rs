//! Message entity (spec.md §3.1/§3.3): immutable body plus mutable edit
//! history.

use super::scope::{Ref, Scope};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    Markdown,
    Plain,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    pub format: MessageFormat,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
}

/// One historical version of a message's body, recorded on `message.edit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEdit {
    pub content: String,
    pub format: MessageFormat,
    pub edited_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub author_agent_name: String,
    pub session_id: String,
    pub body: MessageBody,
    pub scopes: Vec<Scope>,
    pub refs: Vec<Ref>,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Chronological edit history (oldest first), excluding the current
    /// body (spec.md §8 S6: `edits` precede the live `body`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edits: Vec<MessageEdit>,
}

impl Message {
    pub fn mentions(&self) -> impl Iterator<Item = &str> {
        self.refs.iter().filter(|r| r.is_mention()).map(|r| r.value.as_str())
    }
}
