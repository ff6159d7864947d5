//! The entities from spec.md §3.1, as plain serde-friendly Rust types.
//! These are the shapes the projection (§4.2) stores and the shapes RPC
//! methods (§4.3) return; the event log (§4.1/§6.2) carries the same fields
//! inside typed event payloads (see [`crate::event`]).

pub mod agent;
pub mod group;
pub mod message;
pub mod scope;
pub mod session;
pub mod subscription;
pub mod work_context;

pub use agent::{Agent, AgentKind};
pub use group::Group;
pub use message::{Message, MessageBody, MessageFormat};
pub use scope::{Ref, Scope};
pub use session::{EndReason, Session};
pub use subscription::{Subscription, SubscriptionFilter};
pub use work_context::{CommitSummary, WorkContext};

/// Reserved agent names that can never be registered (spec.md §3.1).
pub const RESERVED_NAMES: &[&str] = &["daemon", "system", "thrum", "all", "broadcast", "everyone"];

/// Validates an agent/role name against `[a-z0-9_]+`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(is_valid_name("coord"));
        assert!(is_valid_name("impl_1"));
        assert!(!is_valid_name("Coord"));
        assert!(!is_valid_name("co-ord"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn reserved_names_listed() {
        assert!(RESERVED_NAMES.contains(&"everyone"));
        assert!(RESERVED_NAMES.contains(&"daemon"));
    }
}
