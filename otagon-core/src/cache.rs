//! In-memory conversation cache with LRU eviction and TTL expiry
//!
//! Sits in front of the database so repeated reads of the active tab do not
//! hit SQLite. Entries are keyed by `(user_id, conversation_id)`; expired
//! entries count as misses and are dropped on access.

use crate::config::CacheConfig;
use crate::types::Conversation;
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

type CacheKey = (String, String);

#[derive(Debug, Clone)]
struct CacheEntry {
    conversation: Conversation,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Hit/miss counters and current size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
}

struct Inner {
    entries: LruCache<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// LRU + TTL cache of full conversations
pub struct ConversationCache {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl ConversationCache {
    const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(256) {
        Some(n) => n,
        None => unreachable!(),
    };

    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(Self::DEFAULT_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
            }),
            ttl: Duration::from_secs(config.ttl_secs),
        }
    }

    /// Fetch a fresh copy of a cached conversation
    pub fn get(&self, user_id: &str, conversation_id: &str) -> Option<Conversation> {
        let mut inner = self.inner.lock().unwrap();
        let key = (user_id.to_string(), conversation_id.to_string());

        let fresh = inner
            .entries
            .get(&key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.conversation.clone());

        if fresh.is_some() {
            inner.hits += 1;
        } else {
            // Drops the stale entry, if any
            inner.entries.pop(&key);
            inner.misses += 1;
        }
        fresh
    }

    /// Insert or replace a conversation, resetting its TTL
    pub fn put(&self, conversation: &Conversation) {
        let mut inner = self.inner.lock().unwrap();
        let key = (conversation.user_id.clone(), conversation.id.clone());
        inner.entries.put(
            key,
            CacheEntry {
                conversation: conversation.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop one conversation from the cache
    pub fn invalidate(&self, user_id: &str, conversation_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entries
            .pop(&(user_id.to_string(), conversation_id.to_string()));
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.entries.len(),
            capacity: inner.entries.cap().get(),
        }
    }
}
