//! Message routing between conversations
//!
//! When the assistant recognises which game a player is talking about, the
//! relevant messages leave the general conversation and move to that game's
//! tab. A move is all-or-nothing and deduplicates by message id.

use crate::error::{Error, Result};
use crate::store::ConversationStore;
use crate::types::*;
use chrono::{DateTime, Utc};

/// Moves messages between a user's conversations
pub struct MessageRouter<'a> {
    store: &'a ConversationStore,
}

impl<'a> MessageRouter<'a> {
    pub fn new(store: &'a ConversationStore) -> Self {
        Self { store }
    }

    /// Move `message_ids` from `from` to `to`.
    ///
    /// Ids already present in `to` are dropped from `from` rather than
    /// duplicated; ids not in `from` are reported as missing.
    pub fn migrate(
        &self,
        user_id: &str,
        message_ids: &[String],
        from: &str,
        to: &str,
        now: DateTime<Utc>,
    ) -> Result<MigrationReport> {
        if from == to {
            return Err(Error::InvalidInput(format!(
                "cannot migrate messages from {} to itself",
                from
            )));
        }

        let result = self
            .store
            .database()
            .move_messages(user_id, message_ids, from, to, now);
        self.store.invalidate(user_id, &[from, to]);
        let report = result?;

        tracing::info!(
            user_id,
            from,
            to,
            moved = report.moved.len(),
            deduplicated = report.deduplicated.len(),
            missing = report.missing.len(),
            "Messages migrated"
        );
        if !report.missing.is_empty() {
            tracing::warn!(user_id, from, missing = ?report.missing, "Migration skipped unknown messages");
        }

        Ok(report)
    }

    /// Move messages into the tab for `game_title`, creating the tab if needed.
    pub fn route_to_game(
        &self,
        user_id: &str,
        from: &str,
        game_title: &str,
        message_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<(Conversation, MigrationReport)> {
        let game_title = game_title.trim();
        let target_id = game_conversation_id(game_title);
        if target_id == game_conversation_id("") {
            return Err(Error::InvalidInput(format!(
                "game title {:?} has no usable characters",
                game_title
            )));
        }

        // Nothing is created unless the source exists
        self.store.require(user_id, from)?;

        if self.store.get(user_id, &target_id)?.is_none() {
            match self
                .store
                .create(user_id, &target_id, game_title, Some(game_title), now)
            {
                Ok(_) => {
                    tracing::info!(user_id, game = game_title, "Created tab for detected game");
                }
                Err(Error::ConversationExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let report = self.migrate(user_id, message_ids, from, &target_id, now)?;
        let conversation = self.store.require(user_id, &target_id)?;
        Ok((conversation, report))
    }
}
