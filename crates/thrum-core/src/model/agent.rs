//! Agent entity (spec.md §3.1).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Agent,
    User,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Agent => write!(f, "agent"),
            AgentKind::User => write!(f, "user"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub role: String,
    pub module: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    pub kind: AgentKind,
    pub worktree: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let a = Agent {
            name: "impl".into(),
            role: "implementer".into(),
            module: "backend".into(),
            display: Some("Implementer".into()),
            kind: AgentKind::Agent,
            worktree: "main".into(),
        };
        let json = serde_json::to_string(&a).unwrap();
        let back: Agent = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }

    #[test]
    fn display_field_omitted_when_none() {
        let a = Agent {
            name: "impl".into(),
            role: "implementer".into(),
            module: "backend".into(),
            display: None,
            kind: AgentKind::User,
            worktree: "main".into(),
        };
        let json = serde_json::to_value(&a).unwrap();
        assert!(json.get("display").is_none());
    }
}
