//! The event record (spec.md §6.2): the single wire/on-disk shape written
//! by [`crate::event_store`] and replayed by [`crate::projection`].
//!
//! `Event` carries the four fields common to every record (`event_id`,
//! `timestamp`, `v`, `type`) plus a type-specific payload. `type` and the
//! payload are encoded together via serde's internally-tagged enum support,
//! so on the wire an event is one flat JSON object, exactly as §6.2
//! specifies — not a nested `{type, data}` pair.

use crate::model::agent::AgentKind;
use crate::model::message::{MessageBody, MessageEdit};
use crate::model::scope::{Ref, Scope};
use crate::model::session::EndReason;
use crate::model::work_context::WorkContext;
use serde::{Deserialize, Serialize};

pub const EVENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub timestamp: String,
    pub v: u32,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Builds a new event with `event_id`/`timestamp`/`v` filled in, per
    /// the "`write_event` assigns `event_id` and `v` if missing" contract
    /// (spec.md §4.1). `now` and `new_id` are injected so callers control
    /// clock/id sourcing (and tests can be deterministic).
    pub fn new(payload: EventPayload, event_id: String, timestamp: String) -> Self {
        Event {
            event_id,
            timestamp,
            v: EVENT_VERSION,
            payload,
        }
    }

    /// True if this event type is routed to `messages/<author>.jsonl`
    /// rather than the shared `events.jsonl` (spec.md §4.1 sharding rule).
    pub fn is_message_event(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::MessageCreate(_) | EventPayload::MessageEdit(_) | EventPayload::MessageDelete(_)
        )
    }

    /// The author whose shard file a message event belongs in, if any.
    pub fn message_author(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::MessageCreate(p) => Some(&p.author_agent_name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "message.create")]
    MessageCreate(MessageCreatePayload),
    #[serde(rename = "message.edit")]
    MessageEdit(MessageEditPayload),
    #[serde(rename = "message.delete")]
    MessageDelete(MessageDeletePayload),
    #[serde(rename = "group.create")]
    GroupCreate(GroupCreatePayload),
    #[serde(rename = "group.delete")]
    GroupDelete(GroupDeletePayload),
    #[serde(rename = "group.member.add")]
    GroupMemberAdd(GroupMemberPayload),
    #[serde(rename = "group.member.remove")]
    GroupMemberRemove(GroupMemberPayload),
    #[serde(rename = "agent.register")]
    AgentRegister(AgentRegisterPayload),
    #[serde(rename = "agent.update")]
    AgentUpdate(AgentUpdatePayload),
    #[serde(rename = "agent.cleanup")]
    AgentCleanup(AgentCleanupPayload),
    #[serde(rename = "agent.session.start")]
    SessionStart(SessionStartPayload),
    #[serde(rename = "agent.session.end")]
    SessionEnd(SessionEndPayload),
    /// Any event type not recognized by this build. Preserved verbatim so
    /// `rebuild_projection` can ignore it (forward compatibility, spec.md
    /// §4.1) without losing the line on re-serialization.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCreatePayload {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub author_agent_name: String,
    pub session_id: String,
    pub body: MessageBody,
    #[serde(default)]
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub refs: Vec<Ref>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEditPayload {
    pub message_id: String,
    pub body: MessageBody,
    pub previous: MessageEdit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeletePayload {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupCreatePayload {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDeletePayload {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMemberPayload {
    pub group: String,
    pub member_kind: crate::model::group::MemberKind,
    pub member_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisterPayload {
    pub name: String,
    pub role: String,
    pub module: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    pub kind: AgentKind,
    pub worktree: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentUpdatePayload {
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<WorkContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCleanupPayload {
    pub agent_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartPayload {
    pub session_id: String,
    pub agent_name: String,
    pub started_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndPayload {
    pub session_id: String,
    pub agent_name: String,
    pub reason: EndReason,
    pub ended_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::MessageFormat;

    #[test]
    fn message_create_round_trips_as_flat_object() {
        let event = Event::new(
            EventPayload::MessageCreate(MessageCreatePayload {
                message_id: "msg_1".into(),
                thread_id: None,
                author_agent_name: "coord".into(),
                session_id: "ses_1".into(),
                body: MessageBody {
                    format: MessageFormat::Plain,
                    content: "hello".into(),
                    structured: None,
                },
                scopes: vec![],
                refs: vec![Ref::mention("impl")],
            }),
            "evt_1".into(),
            "2026-01-01T00:00:00Z".into(),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message.create");
        assert_eq!(json["event_id"], "evt_1");
        assert_eq!(json["message_id"], "msg_1");

        let back: Event = serde_json::from_value(json).unwrap();
        assert!(back.is_message_event());
        assert_eq!(back.message_author(), Some("coord"));
    }

    #[test]
    fn unknown_event_type_does_not_fail_parsing() {
        let json = serde_json::json!({
            "event_id": "evt_2",
            "timestamp": "2026-01-01T00:00:00Z",
            "v": 1,
            "type": "something.from_the_future",
            "whatever": true
        });
        let event: Event = serde_json::from_value(json).unwrap();
        assert!(matches!(event.payload, EventPayload::Unknown));
    }

    #[test]
    fn non_message_event_is_not_sharded() {
        let event = Event::new(
            EventPayload::AgentCleanup(AgentCleanupPayload {
                agent_name: "impl".into(),
            }),
            "evt_3".into(),
            "2026-01-01T00:00:00Z".into(),
        );
        assert!(!event.is_message_event());
    }
}
