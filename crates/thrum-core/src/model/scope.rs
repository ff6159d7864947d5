//! Scopes and refs (spec.md §3.1): tags attached to messages and
//! subscriptions, and typed pointers carried by messages.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    #[serde(rename = "type")]
    pub scope_type: String,
    pub value: String,
}

impl Scope {
    pub fn new(scope_type: impl Into<String>, value: impl Into<String>) -> Self {
        Scope {
            scope_type: scope_type.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ref {
    #[serde(rename = "type")]
    pub ref_type: String,
    pub value: String,
}

impl Ref {
    pub fn mention(value: impl Into<String>) -> Self {
        Ref {
            ref_type: "mention".into(),
            value: value.into(),
        }
    }

    pub fn reply_to(message_id: impl Into<String>) -> Self {
        Ref {
            ref_type: "reply-to".into(),
            value: message_id.into(),
        }
    }

    pub fn is_mention(&self) -> bool {
        self.ref_type == "mention"
    }
}
