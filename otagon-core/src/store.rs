//! Conversation store: the database behind a read-through cache
//!
//! All reads of a single conversation go through [`ConversationCache`]; every
//! write goes to SQLite first and then drops the cached copy, so the next read
//! reloads the committed state. Metadata writes are version checked.

use crate::cache::{CacheStats, ConversationCache};
use crate::config::CacheConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Conversation CRUD with caching and optimistic concurrency
pub struct ConversationStore {
    db: Arc<Database>,
    cache: ConversationCache,
}

impl ConversationStore {
    pub fn new(db: Arc<Database>, config: &CacheConfig) -> Self {
        Self {
            db,
            cache: ConversationCache::new(config),
        }
    }

    /// Shared database handle
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Make sure the user's general conversation exists and return it
    pub fn ensure_general(&self, user_id: &str, now: DateTime<Utc>) -> Result<Conversation> {
        if let Some(existing) = self.get(user_id, GENERAL_CONVERSATION_ID)? {
            return Ok(existing);
        }

        match self.create(
            user_id,
            GENERAL_CONVERSATION_ID,
            GENERAL_CONVERSATION_TITLE,
            None,
            now,
        ) {
            Ok(conversation) => Ok(conversation),
            // Someone else created it between our read and write
            Err(Error::ConversationExists(_)) => self.require(user_id, GENERAL_CONVERSATION_ID),
            Err(e) => Err(e),
        }
    }

    /// Create an empty conversation
    pub fn create(
        &self,
        user_id: &str,
        id: &str,
        title: &str,
        game_title: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("conversation id is empty".to_string()));
        }

        let mut conversation = Conversation::new(user_id, id, title, now);
        conversation.game_title = game_title.map(str::to_string);
        self.db.insert_conversation(&conversation)?;

        tracing::info!(
            user_id,
            conversation_id = id,
            game = game_title.unwrap_or(""),
            "Conversation created"
        );

        self.cache.put(&conversation);
        Ok(conversation)
    }

    /// Read a conversation, from cache when possible
    pub fn get(&self, user_id: &str, id: &str) -> Result<Option<Conversation>> {
        if let Some(cached) = self.cache.get(user_id, id) {
            return Ok(Some(cached));
        }

        let loaded = self.db.get_conversation(user_id, id)?;
        if let Some(ref conversation) = loaded {
            self.cache.put(conversation);
        }
        Ok(loaded)
    }

    /// Like [`get`](Self::get) but a missing conversation is an error
    pub fn require(&self, user_id: &str, id: &str) -> Result<Conversation> {
        self.get(user_id, id)?
            .ok_or_else(|| Error::ConversationNotFound(id.to_string()))
    }

    /// List conversations: pinned first, then most recently updated
    pub fn list(&self, user_id: &str, include_archived: bool) -> Result<Vec<ConversationSummary>> {
        self.db.list_conversations(user_id, include_archived)
    }

    /// Persist title, game and flag changes.
    ///
    /// `conversation.version` must match the stored version; on success the
    /// returned copy carries the new version.
    pub fn save(&self, conversation: &Conversation) -> Result<Conversation> {
        if conversation.is_general() && conversation.is_archived {
            return Err(Error::InvalidInput(
                "the general conversation cannot be archived".to_string(),
            ));
        }

        let result = self.db.update_conversation(conversation);
        // Cached copy is stale on success, and possibly stale on conflict
        self.cache.invalidate(&conversation.user_id, &conversation.id);

        let version = match result {
            Ok(version) => version,
            Err(e) => {
                if let Error::VersionConflict {
                    expected, found, ..
                } = &e
                {
                    tracing::warn!(
                        user_id = %conversation.user_id,
                        conversation_id = %conversation.id,
                        expected,
                        found,
                        "Rejected stale conversation write"
                    );
                }
                return Err(e);
            }
        };

        let mut saved = conversation.clone();
        saved.version = version;
        Ok(saved)
    }

    /// Load, mutate and save in one step
    fn update_with<F>(
        &self,
        user_id: &str,
        id: &str,
        now: DateTime<Utc>,
        f: F,
    ) -> Result<Conversation>
    where
        F: FnOnce(&mut Conversation),
    {
        let mut conversation = self.require(user_id, id)?;
        f(&mut conversation);
        conversation.updated_at = now;
        self.save(&conversation)
    }

    pub fn rename(
        &self,
        user_id: &str,
        id: &str,
        title: &str,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        self.update_with(user_id, id, now, |c| c.title = title.to_string())
    }

    pub fn set_pinned(
        &self,
        user_id: &str,
        id: &str,
        pinned: bool,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        self.update_with(user_id, id, now, |c| c.is_pinned = pinned)
    }

    pub fn set_archived(
        &self,
        user_id: &str,
        id: &str,
        archived: bool,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        self.update_with(user_id, id, now, |c| c.is_archived = archived)
    }

    /// Delete a conversation and everything in it.
    ///
    /// Returns false if it did not exist.
    pub fn delete(&self, user_id: &str, id: &str) -> Result<bool> {
        if id == GENERAL_CONVERSATION_ID {
            return Err(Error::InvalidInput(
                "the general conversation cannot be deleted".to_string(),
            ));
        }

        let deleted = self.db.delete_conversation(user_id, id)?;
        self.cache.invalidate(user_id, id);
        if deleted {
            tracing::info!(user_id, conversation_id = id, "Conversation deleted");
        }
        Ok(deleted)
    }

    /// Append a message and return the updated conversation
    pub fn append_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        message: &Message,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        let version = self.db.append_message(user_id, conversation_id, message, now)?;
        self.cache.invalidate(user_id, conversation_id);

        tracing::debug!(
            user_id,
            conversation_id,
            message_id = %message.id,
            role = message.role.as_str(),
            version,
            "Message appended"
        );

        self.require(user_id, conversation_id)
    }

    /// Add or replace an insight sub-tab
    pub fn upsert_insight(
        &self,
        user_id: &str,
        conversation_id: &str,
        insight: &Insight,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        self.db.upsert_insight(user_id, conversation_id, insight, now)?;
        self.cache.invalidate(user_id, conversation_id);
        self.require(user_id, conversation_id)
    }

    /// Remove an insight sub-tab. Returns false if it did not exist.
    pub fn remove_insight(
        &self,
        user_id: &str,
        conversation_id: &str,
        insight_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let removed = self
            .db
            .delete_insight(user_id, conversation_id, insight_id, now)?
            .is_some();
        self.cache.invalidate(user_id, conversation_id);
        Ok(removed)
    }

    /// Forget cached copies of the given conversations
    pub fn invalidate(&self, user_id: &str, ids: &[&str]) {
        for id in ids {
            self.cache.invalidate(user_id, id);
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 20, 9, 0, 0).unwrap()
    }

    fn setup() -> (ConversationStore, User) {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let user = User::new("auth-1", "p@example.com", Tier::Free, TierLimits::FREE, now());
        db.insert_user(&user).unwrap();
        (ConversationStore::new(Arc::new(db), &CacheConfig::default()), user)
    }

    #[test]
    fn test_ensure_general_is_idempotent() {
        let (store, user) = setup();
        let first = store.ensure_general(&user.id, now()).unwrap();
        let second = store.ensure_general(&user.id, now()).unwrap();
        assert_eq!(first.id, GENERAL_CONVERSATION_ID);
        assert_eq!(first.title, GENERAL_CONVERSATION_TITLE);
        assert_eq!(first, second);
        assert_eq!(store.list(&user.id, true).unwrap().len(), 1);
    }

    #[test]
    fn test_get_reads_through_cache() {
        let (store, user) = setup();
        store.create(&user.id, "c1", "Chat", None, now()).unwrap();

        store.get(&user.id, "c1").unwrap().unwrap();
        store.get(&user.id, "c1").unwrap().unwrap();
        assert_eq!(store.cache_stats().hits, 2);

        assert!(store.get(&user.id, "missing").unwrap().is_none());
        assert_eq!(store.cache_stats().misses, 1);
    }

    #[test]
    fn test_append_message_refreshes_cached_copy() {
        let (store, user) = setup();
        store.ensure_general(&user.id, now()).unwrap();

        let msg = Message::new(MessageRole::User, "where is the boss?", now());
        let updated = store
            .append_message(&user.id, GENERAL_CONVERSATION_ID, &msg, now())
            .unwrap();
        assert_eq!(updated.messages.len(), 1);
        assert_eq!(updated.version, 2);

        let cached = store.get(&user.id, GENERAL_CONVERSATION_ID).unwrap().unwrap();
        assert_eq!(cached.messages, vec![msg]);
    }

    #[test]
    fn test_stale_save_conflicts() {
        let (store, user) = setup();
        let original = store.create(&user.id, "c1", "Chat", None, now()).unwrap();

        store
            .set_pinned(&user.id, "c1", true, now() + Duration::minutes(1))
            .unwrap();

        let mut stale = original.clone();
        stale.title = "Overwrite".to_string();
        assert!(matches!(
            store.save(&stale),
            Err(Error::VersionConflict { expected: 1, found: 2, .. })
        ));

        let current = store.require(&user.id, "c1").unwrap();
        assert!(current.is_pinned);
        assert_eq!(current.title, "Chat");
    }

    #[test]
    fn test_general_conversation_is_protected() {
        let (store, user) = setup();
        store.ensure_general(&user.id, now()).unwrap();

        assert!(matches!(
            store.delete(&user.id, GENERAL_CONVERSATION_ID),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            store.set_archived(&user.id, GENERAL_CONVERSATION_ID, true, now()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_delete_and_insights() {
        let (store, user) = setup();
        store.create(&user.id, "game-hades", "Hades", Some("Hades"), now()).unwrap();

        let insight = Insight {
            id: "story_so_far".to_string(),
            title: "Story So Far".to_string(),
            content: String::new(),
            status: InsightStatus::Pending,
            created_at: now(),
            updated_at: now(),
        };
        let conv = store.upsert_insight(&user.id, "game-hades", &insight, now()).unwrap();
        assert_eq!(conv.insights.len(), 1);

        assert!(store.remove_insight(&user.id, "game-hades", "story_so_far", now()).unwrap());
        assert!(!store.remove_insight(&user.id, "game-hades", "story_so_far", now()).unwrap());

        assert!(store.delete(&user.id, "game-hades").unwrap());
        assert!(store.get(&user.id, "game-hades").unwrap().is_none());
    }
}
