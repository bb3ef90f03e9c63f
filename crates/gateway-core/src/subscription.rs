//! Subscription registry.
//!
//! Maps a canonical URI to the protocols waiting for replies on it. A
//! subscriber is either standing (every matching reply, used by OBSERVE) or
//! one-shot (the next reply, then removed). Compound read-modify-write
//! sequences run under the per-URI entry lock so concurrent subscribe,
//! unsubscribe and drain calls on one URI never lose updates.

use dashmap::DashMap;
use gateway_protocol::Sequence;
use std::collections::{BTreeMap, HashMap, HashSet};
use tenvis_gateway_plugin::ProtocolName;
use tracing::{debug, trace};

/// A party waiting for replies on a URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subscriber {
    /// Deliver every future reply.
    Standing,
    /// Deliver the next reply to this sequence, then forget it.
    Once(Sequence),
}

/// Fan-out set attached to a reply: protocol name to subscribers.
pub type ReplyTo = BTreeMap<ProtocolName, Vec<Subscriber>>;

type Subscribers = HashMap<ProtocolName, HashSet<Subscriber>>;

/// Registry of subscriptions per canonical URI.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<String, Subscribers>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber.
    pub fn subscribe(&self, uri: &str, protocol: &ProtocolName, subscriber: Subscriber) {
        self.entries
            .entry(uri.to_string())
            .or_default()
            .entry(protocol.clone())
            .or_default()
            .insert(subscriber);
        trace!(uri = %uri, protocol = %protocol, subscriber = ?subscriber, "Subscribed");
    }

    /// Register an observer: a standing entry plus a one-shot entry for the
    /// OBSERVE request itself.
    ///
    /// Returns `true` if the URI was already observed before this call, in
    /// which case the OBSERVE need not reach the target again.
    pub fn observe(&self, uri: &str, protocol: &ProtocolName, sequence: Sequence) -> bool {
        let mut entry = self.entries.entry(uri.to_string()).or_default();
        let already_observed = has_standing(&entry);

        let subscribers = entry.entry(protocol.clone()).or_default();
        subscribers.insert(Subscriber::Standing);
        subscribers.insert(Subscriber::Once(sequence));

        debug!(uri = %uri, protocol = %protocol, already_observed, "Observer added");
        already_observed
    }

    /// Remove the standing entry of `protocol`.
    ///
    /// Returns the number of protocols still observing the URI. When none
    /// remain, a one-shot entry for the UNOBSERVE request is registered in
    /// the same critical section so its reply can be routed back.
    pub fn unobserve(&self, uri: &str, protocol: &ProtocolName, sequence: Sequence) -> usize {
        let mut entry = self.entries.entry(uri.to_string()).or_default();

        if let Some(subscribers) = entry.get_mut(protocol) {
            subscribers.remove(&Subscriber::Standing);
            if subscribers.is_empty() {
                entry.remove(protocol);
            }
        }

        let remaining = entry
            .values()
            .filter(|subs| subs.contains(&Subscriber::Standing))
            .count();
        if remaining == 0 {
            entry
                .entry(protocol.clone())
                .or_default()
                .insert(Subscriber::Once(sequence));
        }

        debug!(uri = %uri, protocol = %protocol, remaining, "Observer removed");
        remaining
    }

    /// Remove a single subscriber, dropping empty entries.
    pub fn remove(&self, uri: &str, protocol: &ProtocolName, subscriber: Subscriber) -> bool {
        let Some(mut entry) = self.entries.get_mut(uri) else {
            return false;
        };
        let removed = entry
            .get_mut(protocol)
            .map(|subs| subs.remove(&subscriber))
            .unwrap_or(false);
        entry.retain(|_, subs| !subs.is_empty());
        let empty = entry.is_empty();
        drop(entry);

        if empty {
            self.entries.remove_if(uri, |_, subs| subs.is_empty());
        }
        removed
    }

    /// Drain the subscribers for a reply on `uri`.
    ///
    /// One-shot entries are removed and returned. Standing entries stay in
    /// the registry and are returned only when `include_standing` is set.
    /// Returns `None` if nothing is registered for the URI.
    pub fn drain(&self, uri: &str, include_standing: bool) -> Option<ReplyTo> {
        let mut entry = self.entries.get_mut(uri)?;

        let mut reply_to = ReplyTo::new();
        for (protocol, subscribers) in entry.iter_mut() {
            let mut delivered = Vec::new();
            subscribers.retain(|subscriber| match subscriber {
                Subscriber::Once(_) => {
                    delivered.push(*subscriber);
                    false
                }
                Subscriber::Standing => {
                    if include_standing {
                        delivered.push(*subscriber);
                    }
                    true
                }
            });
            if !delivered.is_empty() {
                delivered.sort_unstable();
                reply_to.insert(protocol.clone(), delivered);
            }
        }
        entry.retain(|_, subs| !subs.is_empty());
        let empty = entry.is_empty();
        drop(entry);

        if empty {
            self.entries.remove_if(uri, |_, subs| subs.is_empty());
            trace!(uri = %uri, "Subscription entry removed");
        }
        Some(reply_to)
    }

    /// Check if anything is registered for a URI.
    #[must_use]
    pub fn contains(&self, uri: &str) -> bool {
        self.entries.contains_key(uri)
    }

    /// Get the number of protocols observing a URI.
    #[must_use]
    pub fn observer_count(&self, uri: &str) -> usize {
        self.entries
            .get(uri)
            .map(|e| has_standing_count(&e))
            .unwrap_or(0)
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let mut stats = SubscriptionStats {
            uri_count: self.entries.len(),
            ..SubscriptionStats::default()
        };
        for entry in self.entries.iter() {
            for subscribers in entry.values() {
                for subscriber in subscribers {
                    match subscriber {
                        Subscriber::Standing => stats.standing += 1,
                        Subscriber::Once(_) => stats.one_shot += 1,
                    }
                }
            }
        }
        stats
    }
}

fn has_standing(subscribers: &Subscribers) -> bool {
    has_standing_count(subscribers) > 0
}

fn has_standing_count(subscribers: &Subscribers) -> usize {
    subscribers
        .values()
        .filter(|subs| subs.contains(&Subscriber::Standing))
        .count()
}

/// Subscription registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of URIs with at least one subscriber.
    pub uri_count: usize,
    /// Number of standing subscribers.
    pub standing: usize,
    /// Number of pending one-shot subscribers.
    pub one_shot: usize,
}
