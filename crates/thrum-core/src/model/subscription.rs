//! Subscription entity (spec.md §3.1/§4.5): owned by a session, matched
//! against every `message.create`/`message.edit`.

use super::scope::Scope;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubscriptionFilter {
    Scope { scope: Scope },
    Mention { value: String },
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: String,
    pub session_id: String,
    pub filter: SubscriptionFilter,
    /// Optional binding restricting this subscription to notifications for
    /// a specific caller agent, independent of the session's own agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub created_at: String,
}

impl Subscription {
    pub fn match_type(&self) -> &'static str {
        match self.filter {
            SubscriptionFilter::Scope { .. } => "scope",
            SubscriptionFilter::Mention { .. } => "mention",
            SubscriptionFilter::All => "all",
        }
    }
}
