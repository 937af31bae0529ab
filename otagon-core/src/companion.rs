//! The companion service: one handle over every component
//!
//! Wires the conversation store, quota tracker, trial manager and message
//! router onto a shared database, and implements the two flows a client
//! drives: starting a session and recording a question/answer exchange.

use crate::config::{Config, LimitsConfig};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::quota::{self, QuotaTracker};
use crate::router::MessageRouter;
use crate::store::ConversationStore;
use crate::trial::TrialManager;
use crate::types::*;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// What a client learns when a session opens
#[derive(Debug, Clone)]
pub struct SessionStart {
    pub trial: TrialCheck,
    pub general: Conversation,
}

/// A player question and the assistant's answer
#[derive(Debug, Clone)]
pub struct Exchange {
    pub conversation_id: String,
    pub kind: QueryKind,
    pub question: Message,
    pub answer: Message,
    /// Game the assistant recognised in the question, if any
    pub detected_game: Option<String>,
}

/// Where an exchange ended up
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub quota: QuotaDecision,
    pub conversation: Conversation,
    pub migration: Option<MigrationReport>,
}

pub struct Companion {
    db: Arc<Database>,
    store: ConversationStore,
    quota: QuotaTracker,
    trials: TrialManager,
    limits: LimitsConfig,
}

impl Companion {
    /// Build the service over an already migrated database
    pub fn new(db: Arc<Database>, config: &Config) -> Self {
        Self {
            store: ConversationStore::new(Arc::clone(&db), &config.cache),
            quota: QuotaTracker::new(Arc::clone(&db)),
            trials: TrialManager::new(
                Arc::clone(&db),
                config.trial.clone(),
                config.limits.clone(),
            ),
            limits: config.limits.clone(),
            db,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn trials(&self) -> &TrialManager {
        &self.trials
    }

    pub fn router(&self) -> MessageRouter<'_> {
        MessageRouter::new(&self.store)
    }

    /// Register a new user with the configured limits for `tier`
    pub fn register_user(
        &self,
        auth_user_id: &str,
        email: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<User> {
        if auth_user_id.trim().is_empty() {
            return Err(Error::InvalidInput("auth user id is empty".to_string()));
        }

        let user = User::new(auth_user_id, email, tier, self.limits.for_tier(tier), now);
        self.db.insert_user(&user)?;
        self.store.ensure_general(&user.id, now)?;

        tracing::info!(user_id = %user.id, auth_user_id, tier = tier.as_str(), "User registered");
        Ok(user)
    }

    /// Resolve a user by internal or auth id
    pub fn user(&self, key: &str) -> Result<User> {
        self.db
            .find_user(key)?
            .ok_or_else(|| Error::UserNotFound(key.to_string()))
    }

    /// Session-start work: trial check, then make sure the general tab exists
    pub fn start_session(&self, user_id: &str, now: DateTime<Utc>) -> Result<SessionStart> {
        let trial = self.trials.check_on_session_start(user_id, now)?;
        let general = self.store.ensure_general(user_id, now)?;
        Ok(SessionStart { trial, general })
    }

    /// Record a question/answer pair.
    ///
    /// Consuming one query of `exchange.kind` and appending both messages is
    /// one transaction: a quota denial (`Error::QuotaExceeded`), a repeated
    /// message id or a missing conversation leaves the user and the
    /// conversation untouched. When a game was detected in the general
    /// conversation the pair then moves into that game's tab.
    pub fn record_exchange(
        &self,
        user_id: &str,
        exchange: &Exchange,
        now: DateTime<Utc>,
    ) -> Result<ExchangeOutcome> {
        let game = exchange
            .detected_game
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty());
        if let Some(game) = game {
            if game_conversation_id(game) == game_conversation_id("") {
                return Err(Error::InvalidInput(format!(
                    "detected game {:?} has no usable characters",
                    game
                )));
            }
        }

        let kind = exchange.kind;
        let result = self.db.record_exchange(
            user_id,
            &exchange.conversation_id,
            &[&exchange.question, &exchange.answer],
            now,
            |user| {
                let decision = quota::consume(user, kind, now);
                if decision.allowed {
                    Ok(decision)
                } else {
                    Err(Error::QuotaExceeded(decision))
                }
            },
        );
        self.store.invalidate(user_id, &[&exchange.conversation_id]);

        let (quota, version) = match result {
            Ok(recorded) => recorded,
            Err(e) => {
                if let Error::QuotaExceeded(decision) = &e {
                    tracing::info!(
                        user_id,
                        kind = kind.as_str(),
                        used = decision.used,
                        limit = decision.limit,
                        "Exchange denied by quota"
                    );
                }
                return Err(e);
            }
        };

        tracing::debug!(
            user_id,
            conversation_id = %exchange.conversation_id,
            kind = kind.as_str(),
            used = quota.used,
            version,
            "Exchange recorded"
        );

        let conversation = self.store.require(user_id, &exchange.conversation_id)?;
        match game {
            Some(game) if conversation.is_general() => {
                let ids = vec![exchange.question.id.clone(), exchange.answer.id.clone()];
                let (conversation, report) = self.router().route_to_game(
                    user_id,
                    &conversation.id,
                    game,
                    &ids,
                    now,
                )?;
                Ok(ExchangeOutcome {
                    quota,
                    conversation,
                    migration: Some(report),
                })
            }
            _ => Ok(ExchangeOutcome {
                quota,
                conversation,
                migration: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 20, 18, 0, 0).unwrap()
    }

    fn companion() -> Companion {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        Companion::new(Arc::new(db), &Config::default())
    }

    fn exchange(game: Option<&str>) -> Exchange {
        Exchange {
            conversation_id: GENERAL_CONVERSATION_ID.to_string(),
            kind: QueryKind::Text,
            question: Message::new(MessageRole::User, "How do I beat Malenia?", now()),
            answer: Message::new(MessageRole::Assistant, "Bring bleed and patience.", now()),
            detected_game: game.map(str::to_string),
        }
    }

    #[test]
    fn test_register_creates_general_tab() {
        let companion = companion();
        let user = companion
            .register_user("auth-c", "c@example.com", Tier::Free, now())
            .unwrap();

        assert_eq!(companion.user("auth-c").unwrap().id, user.id);
        let list = companion.store().list(&user.id, false).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, GENERAL_CONVERSATION_ID);
    }

    #[test]
    fn test_exchange_with_detected_game_moves_to_tab() {
        let companion = companion();
        let user = companion
            .register_user("auth-c", "c@example.com", Tier::Free, now())
            .unwrap();

        let outcome = companion
            .record_exchange(&user.id, &exchange(Some("Elden Ring")), now())
            .unwrap();

        assert_eq!(outcome.quota.used, 1);
        assert_eq!(outcome.conversation.id, "game-elden-ring");
        assert_eq!(outcome.conversation.messages.len(), 2);
        assert_eq!(outcome.migration.unwrap().moved.len(), 2);

        let general = companion
            .store()
            .require(&user.id, GENERAL_CONVERSATION_ID)
            .unwrap();
        assert!(general.messages.is_empty());
    }

    #[test]
    fn test_exchange_without_game_stays_put() {
        let companion = companion();
        let user = companion
            .register_user("auth-c", "c@example.com", Tier::Free, now())
            .unwrap();

        let outcome = companion
            .record_exchange(&user.id, &exchange(Some("  ")), now())
            .unwrap();
        assert!(outcome.migration.is_none());
        assert!(outcome.conversation.is_general());
        assert_eq!(outcome.conversation.messages.len(), 2);
    }

    #[test]
    fn test_exchange_denied_writes_nothing() {
        let companion = companion();
        let user = companion
            .register_user("auth-c", "c@example.com", Tier::Free, now())
            .unwrap();
        let mut exhausted = user.clone();
        exhausted.text_count = exhausted.text_limit;
        companion.database().update_user(&exhausted).unwrap();

        let result = companion.record_exchange(&user.id, &exchange(None), now());
        assert!(matches!(result, Err(Error::QuotaExceeded(_))));

        let general = companion
            .store()
            .require(&user.id, GENERAL_CONVERSATION_ID)
            .unwrap();
        assert!(general.messages.is_empty());
    }

    #[test]
    fn test_exchange_with_repeated_message_id_is_not_recorded() {
        let companion = companion();
        let user = companion
            .register_user("auth-c", "c@example.com", Tier::Free, now())
            .unwrap();

        let mut ex = exchange(None);
        ex.answer.id = ex.question.id.clone();
        assert!(matches!(
            companion.record_exchange(&user.id, &ex, now()),
            Err(Error::InvalidInput(_))
        ));

        let general = companion
            .store()
            .require(&user.id, GENERAL_CONVERSATION_ID)
            .unwrap();
        assert!(general.messages.is_empty());
        assert_eq!(companion.user(&user.id).unwrap().text_count, 0);
    }

    #[test]
    fn test_exchange_with_blank_game_slug_rejected_before_charging() {
        let companion = companion();
        let user = companion
            .register_user("auth-c", "c@example.com", Tier::Free, now())
            .unwrap();

        assert!(matches!(
            companion.record_exchange(&user.id, &exchange(Some("?!")), now()),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(companion.user(&user.id).unwrap().text_count, 0);
    }

    #[test]
    fn test_exchange_on_unknown_conversation_does_not_charge() {
        let companion = companion();
        let user = companion
            .register_user("auth-c", "c@example.com", Tier::Free, now())
            .unwrap();

        let mut ex = exchange(None);
        ex.conversation_id = "nowhere".to_string();
        assert!(matches!(
            companion.record_exchange(&user.id, &ex, now()),
            Err(Error::ConversationNotFound(_))
        ));
        assert_eq!(companion.user(&user.id).unwrap().text_count, 0);
    }
}
