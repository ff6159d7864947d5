//! Group entity (spec.md §3.1): named audiences, including the two
//! auto-maintained kinds (`everyone`, and one `role:<R>` per observed role).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    Agent,
    Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub kind: MemberKind,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub members: Vec<GroupMember>,
}

impl Group {
    /// The built-in `everyone` group: a single `role:*` wildcard member.
    pub fn everyone() -> Self {
        Group {
            name: "everyone".into(),
            description: Some("All agents".into()),
            members: vec![GroupMember {
                kind: MemberKind::Role,
                value: "*".into(),
            }],
        }
    }

    /// The auto-created group for an observed role value.
    pub fn for_role(role: &str) -> Self {
        Group {
            name: format!("role:{role}"),
            description: Some(format!("All agents with role '{role}'")),
            members: vec![GroupMember {
                kind: MemberKind::Role,
                value: role.to_string(),
            }],
        }
    }

    pub fn is_role_group(&self) -> bool {
        self.name != "everyone" && self.name.starts_with("role:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn everyone_group_is_a_wildcard() {
        let g = Group::everyone();
        assert_eq!(g.name, "everyone");
        assert_eq!(g.members.len(), 1);
        assert_eq!(g.members[0].value, "*");
        assert!(!g.is_role_group());
    }

    #[test]
    fn role_group_naming() {
        let g = Group::for_role("implementer");
        assert_eq!(g.name, "role:implementer");
        assert!(g.is_role_group());
    }
}
