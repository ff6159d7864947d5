//! Subscription Bus (C5, spec.md §4.5).
//!
//! Ephemeral in-memory index over the durable [`thrum_core::model::Subscription`]
//! rows the projection already tracks, generalized from the teacher's
//! agent-state pub/sub registry (`worker_adapter::pubsub`): there, a flat
//! map keyed by `(subscriber, agent)` with an upsert-on-resubscribe rule;
//! here, one subscription per `subscription_id`, matched by filter kind
//! against an outgoing message's scopes and mention refs.
//!
//! Unlike the teacher's registry, subscriptions are not ephemeral: they are
//! written to the event log via `subscribe`/`unsubscribe` RPCs and survive
//! in the projection across restarts, so a reconnecting client's existing
//! subscriptions keep matching. This bus only indexes them for fast lookup
//! and deletes its copy when the owning session ends.

use thrum_core::model::{Scope, Subscription, SubscriptionFilter};
use std::collections::HashMap;
use std::sync::RwLock;

/// A message's relevant addressing facts, as seen by the bus.
pub struct MatchInput<'a> {
    pub scopes: &'a [Scope],
    pub mention_values: &'a [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Scope,
    Mention,
    All,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Scope => "scope",
            MatchType::Mention => "mention",
            MatchType::All => "all",
        }
    }
}

pub struct Matched {
    pub subscription_id: String,
    pub session_id: String,
    pub match_type: MatchType,
}

/// Read-mostly in-memory index (spec.md §5: "Subscription index uses a
/// read-mostly lock; dispatch loops do not hold it during socket writes").
#[derive(Default)]
pub struct SubscriptionBus {
    by_id: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionBus {
    pub fn new() -> Self {
        SubscriptionBus::default()
    }

    /// Loads the bus's in-memory index from the durable rows in the
    /// projection. Called once at startup and after `rebuild_projection`.
    pub fn reload(&self, subscriptions: Vec<Subscription>) {
        let mut map = self.by_id.write().unwrap();
        map.clear();
        for sub in subscriptions {
            map.insert(sub.subscription_id.clone(), sub);
        }
    }

    pub fn insert(&self, subscription: Subscription) {
        self.by_id
            .write()
            .unwrap()
            .insert(subscription.subscription_id.clone(), subscription);
    }

    pub fn remove(&self, subscription_id: &str) {
        self.by_id.write().unwrap().remove(subscription_id);
    }

    /// Drops every subscription owned by `session_id` (spec.md §4.5: "auto
    /// deleted when the owning session ends"). Returns the ids removed so
    /// the caller can also clear the durable rows.
    pub fn remove_for_session(&self, session_id: &str) -> Vec<String> {
        let mut map = self.by_id.write().unwrap();
        let removed: Vec<String> = map
            .values()
            .filter(|s| s.session_id == session_id)
            .map(|s| s.subscription_id.clone())
            .collect();
        for id in &removed {
            map.remove(id);
        }
        removed
    }

    /// Finds every subscription matching `input` (spec.md §4.5 step 1).
    /// Released before any socket write is attempted by the caller.
    pub fn matching(&self, input: &MatchInput<'_>) -> Vec<Matched> {
        let map = self.by_id.read().unwrap();
        let mut matched = Vec::new();
        for sub in map.values() {
            match &sub.filter {
                SubscriptionFilter::All => matched.push(Matched {
                    subscription_id: sub.subscription_id.clone(),
                    session_id: sub.session_id.clone(),
                    match_type: MatchType::All,
                }),
                SubscriptionFilter::Scope { scope } => {
                    if input
                        .scopes
                        .iter()
                        .any(|s| s.scope_type == scope.scope_type && s.value == scope.value)
                    {
                        matched.push(Matched {
                            subscription_id: sub.subscription_id.clone(),
                            session_id: sub.session_id.clone(),
                            match_type: MatchType::Scope,
                        });
                    }
                }
                SubscriptionFilter::Mention { value } => {
                    if input.mention_values.iter().any(|v| v == value) {
                        matched.push(Matched {
                            subscription_id: sub.subscription_id.clone(),
                            session_id: sub.session_id.clone(),
                            match_type: MatchType::Mention,
                        });
                    }
                }
            }
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.by_id.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
