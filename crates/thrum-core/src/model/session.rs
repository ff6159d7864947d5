//! Session entity (spec.md §3.1/§3.3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Normal,
    Crash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub agent_name: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    /// Last heartbeat timestamp, used for crash detection (spec.md §4.6).
    /// Not part of the wire event payload; maintained only in the
    /// projection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<String>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_session_has_no_end_fields() {
        let s = Session {
            session_id: "ses_1".into(),
            agent_name: "impl".into(),
            started_at: "2026-01-01T00:00:00Z".into(),
            ended_at: None,
            end_reason: None,
            current_intent: None,
            current_task: None,
            last_heartbeat_at: None,
        };
        assert!(s.is_active());
    }

    #[test]
    fn ended_session_is_not_active() {
        let mut s = Session {
            session_id: "ses_1".into(),
            agent_name: "impl".into(),
            started_at: "2026-01-01T00:00:00Z".into(),
            ended_at: None,
            end_reason: None,
            current_intent: None,
            current_task: None,
            last_heartbeat_at: None,
        };
        s.ended_at = Some("2026-01-02T00:00:00Z".into());
        s.end_reason = Some(EndReason::Crash);
        assert!(!s.is_active());
    }
}
