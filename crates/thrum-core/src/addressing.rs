//! Recipient resolution (spec.md §4.4, C4 Router).
//!
//! Per spec.md §9: "model as a tagged variant resolved through a single
//! function [...] never branch on token shape at multiple call sites." All
//! of the grammar lives in [`resolve_recipients`]; callers never inspect a
//! raw token themselves.

use crate::error::{Result, ThrumError};
use crate::model::scope::Ref;
use std::collections::BTreeSet;

/// Read-only view of the agent/group/role registry the router needs.
/// Implemented by the daemon's projection-backed state; kept as a trait
/// here so the resolution grammar has no dependency on how that state is
/// stored.
pub trait AddressResolver {
    fn agent_exists(&self, name: &str) -> bool;
    /// Returns the current membership (as agent names) of a group with this
    /// exact name, or `None` if no such group exists.
    fn group_members(&self, group_name: &str) -> Option<Vec<String>>;
    /// True if at least one registered agent currently has this role.
    fn role_exists(&self, role: &str) -> bool;
}

fn role_group_name(role: &str) -> String {
    format!("role:{role}")
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedAudience {
    pub agent_names: BTreeSet<String>,
    pub refs: Vec<Ref>,
    pub warnings: Vec<String>,
}

/// Resolves a list of recipient tokens (leading `@` optional) into a
/// [`ResolvedAudience`]. On any unresolvable token, returns
/// `ThrumError::UnknownRecipient` naming every token that failed — callers
/// must treat this as atomic rejection (spec.md §4.4): no event is written.
pub fn resolve_recipients(
    tokens: &[String],
    resolver: &dyn AddressResolver,
) -> Result<ResolvedAudience> {
    let mut audience = ResolvedAudience::default();
    let mut unknown = Vec::new();

    for raw in tokens {
        let token = raw.strip_prefix('@').unwrap_or(raw);

        if resolver.agent_exists(token) {
            audience.agent_names.insert(token.to_string());
            audience.refs.push(Ref::mention(token));
            continue;
        }

        if let Some(members) = resolver.group_members(token) {
            audience.agent_names.extend(members);
            audience.refs.push(Ref::mention(token));
            if token != "everyone" && token.starts_with("role:") {
                audience.warnings.push(format!("@{token} resolved to role group"));
            }
            continue;
        }

        if resolver.role_exists(token) {
            let group_name = role_group_name(token);
            if let Some(members) = resolver.group_members(&group_name) {
                audience.agent_names.extend(members);
            }
            audience.refs.push(Ref::mention(token));
            audience.warnings.push(format!("@{token} resolved to role group"));
            continue;
        }

        unknown.push(token.to_string());
    }

    if !unknown.is_empty() {
        return Err(ThrumError::UnknownRecipient(unknown));
    }

    Ok(audience)
}

/// Scans free-form message text for `@token` occurrences and resolves each
/// one, for the "implicit mention" rule (spec.md §4.4). Unlike
/// [`resolve_recipients`], unresolved scanned tokens are silently skipped
/// rather than failing the call — only explicit `to=[...]` tokens are
/// atomic.
pub fn scan_mentions(text: &str, resolver: &dyn AddressResolver) -> ResolvedAudience {
    let tokens: Vec<String> = text
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '@' || c == ':'))
        .filter(|tok| tok.starts_with('@') && tok.len() > 1)
        .map(|tok| tok.to_string())
        .collect();

    let mut audience = ResolvedAudience::default();
    for token in tokens {
        if let Ok(resolved) = resolve_recipients(std::slice::from_ref(&token), resolver) {
            audience.agent_names.extend(resolved.agent_names);
            for r in resolved.refs {
                if !audience.refs.iter().any(|existing| existing.value == r.value) {
                    audience.refs.push(r);
                }
            }
            audience.warnings.extend(resolved.warnings);
        }
    }
    audience
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeResolver {
        agents: BTreeSet<String>,
        groups: HashMap<String, Vec<String>>,
        roles: BTreeSet<String>,
    }

    impl AddressResolver for FakeResolver {
        fn agent_exists(&self, name: &str) -> bool {
            self.agents.contains(name)
        }
        fn group_members(&self, group_name: &str) -> Option<Vec<String>> {
            self.groups.get(group_name).cloned()
        }
        fn role_exists(&self, role: &str) -> bool {
            self.roles.contains(role)
        }
    }

    fn fixture() -> FakeResolver {
        let mut groups = HashMap::new();
        groups.insert("everyone".to_string(), vec!["coord".into(), "impl".into()]);
        groups.insert("role:implementer".to_string(), vec!["impl".into()]);
        groups.insert("frontend-team".to_string(), vec!["impl".into()]);

        FakeResolver {
            agents: ["coord".to_string(), "impl".to_string()].into_iter().collect(),
            groups,
            roles: ["implementer".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn resolves_agent_name() {
        let r = fixture();
        let out = resolve_recipients(&["@impl".to_string()], &r).unwrap();
        assert!(out.agent_names.contains("impl"));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn resolves_role_with_warning() {
        let r = fixture();
        let out = resolve_recipients(&["@implementer".to_string()], &r).unwrap();
        assert!(out.agent_names.contains("impl"));
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn everyone_never_warns() {
        let r = fixture();
        let out = resolve_recipients(&["@everyone".to_string()], &r).unwrap();
        assert!(out.warnings.is_empty());
        assert!(out.agent_names.contains("coord"));
        assert!(out.agent_names.contains("impl"));
    }

    #[test]
    fn custom_group_without_role_prefix_never_warns() {
        let r = fixture();
        let out = resolve_recipients(&["@frontend-team".to_string()], &r).unwrap();
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn unknown_token_rejects_atomically_even_with_valid_tokens() {
        let r = fixture();
        let err = resolve_recipients(&["@impl".to_string(), "@ghost".to_string()], &r).unwrap_err();
        match err {
            ThrumError::UnknownRecipient(names) => assert_eq!(names, vec!["ghost".to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn scan_mentions_ignores_unknown_tokens() {
        let r = fixture();
        let out = scan_mentions("hey @impl can you check this, cc @ghost", &r);
        assert!(out.agent_names.contains("impl"));
        assert!(!out.agent_names.contains("ghost"));
    }
}
