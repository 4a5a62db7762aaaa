//! Subscription bookkeeping for the hub.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use draftsync_shared::EventEnvelope;

/// Callback invoked with every matching envelope.
pub type Listener = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

/// Identifies one registration. Ids increase monotonically, so ordering by
/// id is registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// What a subscription listens to. Without a `resource_id` the scope is a
/// wildcard across every resource of the topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionScope {
    pub topic: String,
    pub resource_id: Option<String>,
}

impl SubscriptionScope {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            resource_id: None,
        }
    }

    pub fn resource(topic: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            resource_id: Some(resource_id.into()),
        }
    }

    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        self.topic == envelope.topic
            && match &self.resource_id {
                None => true,
                Some(id) => envelope.resource_id.as_deref() == Some(id.as_str()),
            }
    }
}

impl std::fmt::Display for SubscriptionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.resource_id {
            Some(id) => write!(f, "{}:{}", self.topic, id),
            None => write!(f, "{}:*", self.topic),
        }
    }
}

/// Listener sets keyed by scope.
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    scopes: HashMap<SubscriptionScope, BTreeMap<SubscriptionId, Listener>>,
    index: HashMap<SubscriptionId, SubscriptionScope>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scope: SubscriptionScope, listener: Listener) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.scopes
            .entry(scope.clone())
            .or_default()
            .insert(id, listener);
        self.index.insert(id, scope);
        id
    }

    /// Hands back the removed listener, or `None` when the id was already
    /// gone. Callers holding a lock should drop it only after unlocking:
    /// the closure may own a [`Subscription`](super::Subscription).
    pub fn remove(&mut self, id: SubscriptionId) -> Option<Listener> {
        let scope = self.index.remove(&id)?;
        let listeners = self.scopes.get_mut(&scope)?;
        let removed = listeners.remove(&id);
        if listeners.is_empty() {
            self.scopes.remove(&scope);
        }
        removed
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.index.contains_key(&id)
    }

    /// Listeners interested in `envelope`, in registration order.
    pub fn matching(&self, envelope: &EventEnvelope) -> Vec<(SubscriptionId, Listener)> {
        let wildcard = SubscriptionScope::topic(envelope.topic.clone());
        let exact = envelope
            .resource_id
            .as_ref()
            .map(|id| SubscriptionScope::resource(envelope.topic.clone(), id.clone()));

        let mut hits: Vec<(SubscriptionId, &Listener)> = Vec::new();
        for scope in std::iter::once(&wildcard).chain(exact.as_ref()) {
            if let Some(listeners) = self.scopes.get(scope) {
                hits.extend(listeners.iter().map(|(id, listener)| (*id, listener)));
            }
        }
        hits.sort_by_key(|(id, _)| *id);
        hits.into_iter()
            .map(|(id, listener)| (id, Arc::clone(listener)))
            .collect()
    }

    pub fn scope_of(&self, id: SubscriptionId) -> Option<&SubscriptionScope> {
        self.index.get(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Empties the registry and returns the listeners it held, with the
    /// same drop caveat as [`remove`](Self::remove).
    pub fn clear(&mut self) -> Vec<Listener> {
        self.index.clear();
        self.scopes
            .drain()
            .flat_map(|(_, listeners)| listeners.into_values())
            .collect()
    }
}
