//! Reply cache hooks.
//!
//! The interconnection controller asks the cache before forwarding a READ
//! and offers it every reply on the way back.

use dashmap::DashMap;
use gateway_protocol::{Operation, Reply};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Cache consulted by the interconnection controller.
pub trait ReplyCache: Send + Sync {
    /// Get a fresh reply for a canonical URI.
    fn lookup(&self, uri: &str) -> Option<Reply>;

    /// Offer a reply routed for a canonical URI.
    fn update(&self, uri: &str, reply: &Reply);
}

/// A cache that never hits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl ReplyCache for NoCache {
    fn lookup(&self, _uri: &str) -> Option<Reply> {
        None
    }

    fn update(&self, _uri: &str, _reply: &Reply) {}
}

/// Default lifetime of a cached reply without a `max_age` hint.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Default capacity of [`MemoryCache`].
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug)]
struct CacheEntry {
    reply: Reply,
    stored_at: Instant,
    expires_at: Instant,
}

/// In-memory reply cache keyed by canonical URI.
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
    max_entries: usize,
}

impl MemoryCache {
    /// Create a cache with the given default TTL and capacity.
    #[must_use]
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Number of cached replies, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached reply.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn evict(&self, now: Instant) {
        self.entries.retain(|_, entry| entry.expires_at > now);

        while self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.stored_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl ReplyCache for MemoryCache {
    fn lookup(&self, uri: &str) -> Option<Reply> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(uri)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.reply.clone());
        if hit.is_none() {
            self.entries.remove_if(uri, |_, entry| entry.expires_at <= now);
        }
        trace!(uri = %uri, hit = hit.is_some(), "Cache lookup");
        hit
    }

    fn update(&self, uri: &str, reply: &Reply) {
        let operation = reply.headers().operation();
        if operation.is_mutation() {
            if self.entries.remove(uri).is_some() {
                trace!(uri = %uri, operation = %operation, "Cache entry invalidated");
            }
            return;
        }
        if !matches!(operation, Operation::Read | Operation::Observe) {
            return;
        }

        let ttl = reply.headers().max_age().unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        if !self.entries.contains_key(uri) && self.entries.len() >= self.max_entries {
            self.evict(now);
        }
        self.entries.insert(
            uri.to_string(),
            CacheEntry {
                reply: reply.clone(),
                stored_at: now,
                expires_at: now + ttl,
            },
        );
        trace!(uri = %uri, ttl = ?ttl, "Reply cached");
    }
}
