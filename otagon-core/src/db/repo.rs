//! Database repository layer
//!
//! Provides query and write operations for users, conversations, messages
//! and insights. Multi-step mutations (quota resets, message migration,
//! versioned conversation writes) each run inside a single transaction.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

/// Database handle (single connection behind a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn get_ts(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let idx = row.as_ref().column_index(column)?;
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn get_opt_ts(row: &Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let idx = row.as_ref().column_index(column)?;
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn get_parsed<T>(row: &Row, column: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let idx = row.as_ref().column_index(column)?;
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&mut conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // User operations
    // ============================================

    /// Insert a new user
    pub fn insert_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let taken: Option<String> = conn
            .query_row(
                "SELECT id FROM users WHERE id = ?1 OR auth_user_id = ?2",
                params![user.id, user.auth_user_id],
                |r| r.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(Error::InvalidInput(format!(
                "user {} / {} already exists",
                user.id, user.auth_user_id
            )));
        }

        conn.execute(
            r#"
            INSERT INTO users (
                id, auth_user_id, email, tier,
                text_count, image_count, text_limit, image_limit, last_reset_at,
                is_on_trial, has_used_trial, trial_started_at, trial_expires_at,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                user.id,
                user.auth_user_id,
                user.email,
                user.tier.as_str(),
                user.text_count,
                user.image_count,
                user.text_limit,
                user.image_limit,
                ts(&user.last_reset_at),
                user.is_on_trial,
                user.has_used_trial,
                user.trial_started_at.as_ref().map(ts),
                user.trial_expires_at.as_ref().map(ts),
                ts(&user.created_at),
                ts(&user.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Get a user by internal ID
    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        load_user(&conn, id)
    }

    /// Get a user by external auth ID
    pub fn get_user_by_auth_id(&self, auth_user_id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM users WHERE auth_user_id = ?",
            [auth_user_id],
            row_to_user,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Resolve a user by internal ID, falling back to auth ID
    pub fn find_user(&self, key: &str) -> Result<Option<User>> {
        match self.get_user(key)? {
            Some(user) => Ok(Some(user)),
            None => self.get_user_by_auth_id(key),
        }
    }

    /// List all users, oldest first
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM users ORDER BY created_at, id")?;
        let users = stmt
            .query_map([], row_to_user)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    /// Overwrite a user record
    pub fn update_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        write_user(&conn, user)
    }

    /// Read-modify-write a user inside one immediate transaction.
    ///
    /// The closure sees the current row. The row is written back only if the
    /// closure changed it, and nothing is written if the closure fails.
    pub fn modify_user<T, F>(&self, user_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut User) -> Result<T>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let original =
            load_user(&tx, user_id)?.ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;
        let mut user = original.clone();
        let value = f(&mut user)?;

        if user != original {
            write_user(&tx, &user)?;
        }
        tx.commit()?;
        Ok(value)
    }

    // ============================================
    // Conversation operations
    // ============================================

    /// Insert a new conversation along with any messages and insights it holds
    pub fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if load_user(&tx, &conversation.user_id)?.is_none() {
            return Err(Error::UserNotFound(conversation.user_id.clone()));
        }
        if conversation_version(&tx, &conversation.user_id, &conversation.id)?.is_some() {
            return Err(Error::ConversationExists(conversation.id.clone()));
        }

        tx.execute(
            r#"
            INSERT INTO conversations (
                user_id, id, title, game_title, is_pinned, is_archived,
                created_at, updated_at, version
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                conversation.user_id,
                conversation.id,
                conversation.title,
                conversation.game_title,
                conversation.is_pinned,
                conversation.is_archived,
                ts(&conversation.created_at),
                ts(&conversation.updated_at),
                conversation.version,
            ],
        )?;

        for (seq, message) in conversation.messages.iter().enumerate() {
            insert_message_row(
                &tx,
                &conversation.user_id,
                &conversation.id,
                (seq + 1) as i64,
                message,
            )?;
        }
        for insight in conversation.insights.values() {
            upsert_insight_row(&tx, &conversation.user_id, &conversation.id, insight)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Load a conversation with its messages and insights
    pub fn get_conversation(&self, user_id: &str, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock().unwrap();
        load_conversation(&conn, user_id, id)
    }

    /// List a user's conversations: pinned first, then most recently updated
    pub fn list_conversations(
        &self,
        user_id: &str,
        include_archived: bool,
    ) -> Result<Vec<ConversationSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT c.id, c.title, c.game_title, c.is_pinned, c.is_archived, c.updated_at,
                   (SELECT COUNT(*) FROM messages m
                     WHERE m.user_id = c.user_id AND m.conversation_id = c.id) AS message_count,
                   (SELECT COUNT(*) FROM insights i
                     WHERE i.user_id = c.user_id AND i.conversation_id = c.id) AS insight_count
            FROM conversations c
            WHERE c.user_id = ?1 AND (?2 OR c.is_archived = 0)
            ORDER BY c.is_pinned DESC, c.updated_at DESC, c.id
            "#,
        )?;

        let rows = stmt
            .query_map(params![user_id, include_archived], |row| {
                Ok(ConversationSummary {
                    id: row.get("id")?,
                    title: row.get("title")?,
                    game_title: row.get("game_title")?,
                    is_pinned: row.get("is_pinned")?,
                    is_archived: row.get("is_archived")?,
                    updated_at: get_ts(row, "updated_at")?,
                    message_count: row.get("message_count")?,
                    insight_count: row.get("insight_count")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Write conversation metadata if the stored version still matches.
    ///
    /// Returns the new version. Messages and insights are not touched here.
    pub fn update_conversation(&self, conversation: &Conversation) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            r#"
            UPDATE conversations
            SET title = ?3, game_title = ?4, is_pinned = ?5, is_archived = ?6,
                updated_at = ?7, version = version + 1
            WHERE user_id = ?1 AND id = ?2 AND version = ?8
            "#,
            params![
                conversation.user_id,
                conversation.id,
                conversation.title,
                conversation.game_title,
                conversation.is_pinned,
                conversation.is_archived,
                ts(&conversation.updated_at),
                conversation.version,
            ],
        )?;

        if changed == 0 {
            return match conversation_version(&tx, &conversation.user_id, &conversation.id)? {
                Some(found) => Err(Error::VersionConflict {
                    id: conversation.id.clone(),
                    expected: conversation.version,
                    found,
                }),
                None => Err(Error::ConversationNotFound(conversation.id.clone())),
            };
        }

        tx.commit()?;
        Ok(conversation.version + 1)
    }

    /// Delete a conversation with its messages and insights
    pub fn delete_conversation(&self, user_id: &str, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM conversations WHERE user_id = ?1 AND id = ?2",
            params![user_id, id],
        )?;
        Ok(deleted > 0)
    }

    // ============================================
    // Message operations
    // ============================================

    /// Append a message to a conversation. Returns the conversation's new version.
    pub fn append_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        message: &Message,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if conversation_version(&tx, user_id, conversation_id)?.is_none() {
            return Err(Error::ConversationNotFound(conversation_id.to_string()));
        }
        if message_exists(&tx, user_id, conversation_id, &message.id)? {
            return Err(Error::InvalidInput(format!(
                "message {} already exists in {}",
                message.id, conversation_id
            )));
        }

        let seq = next_seq(&tx, user_id, conversation_id)?;
        insert_message_row(&tx, user_id, conversation_id, seq, message)?;
        let version = touch_conversation(&tx, user_id, conversation_id, now)?;

        tx.commit()?;
        Ok(version)
    }

    /// Charge the user and append several messages in one transaction.
    ///
    /// `charge` runs against the current user row after the conversation and
    /// every message id have been checked. If any check or the charge fails,
    /// neither the user nor the conversation is written. Returns the charge's
    /// value and the conversation's new version.
    pub fn record_exchange<T, F>(
        &self,
        user_id: &str,
        conversation_id: &str,
        messages: &[&Message],
        now: DateTime<Utc>,
        charge: F,
    ) -> Result<(T, i64)>
    where
        F: FnOnce(&mut User) -> Result<T>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let original =
            load_user(&tx, user_id)?.ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;
        if conversation_version(&tx, user_id, conversation_id)?.is_none() {
            return Err(Error::ConversationNotFound(conversation_id.to_string()));
        }

        let mut seen = HashSet::new();
        for message in messages {
            if !seen.insert(message.id.as_str())
                || message_exists(&tx, user_id, conversation_id, &message.id)?
            {
                return Err(Error::InvalidInput(format!(
                    "message {} already exists in {}",
                    message.id, conversation_id
                )));
            }
        }

        let mut user = original.clone();
        let value = charge(&mut user)?;
        if user != original {
            write_user(&tx, &user)?;
        }

        let mut seq = next_seq(&tx, user_id, conversation_id)?;
        for message in messages {
            insert_message_row(&tx, user_id, conversation_id, seq, message)?;
            seq += 1;
        }
        let version = touch_conversation(&tx, user_id, conversation_id, now)?;

        tx.commit()?;
        Ok((value, version))
    }

    /// Move messages between two conversations of the same user.
    ///
    /// Runs in one transaction: either every listed message ends up owned by
    /// `to`, or nothing changes. A message id already present in `to` is
    /// removed from `from` instead of copied.
    pub fn move_messages(
        &self,
        user_id: &str,
        message_ids: &[String],
        from: &str,
        to: &str,
        now: DateTime<Utc>,
    ) -> Result<MigrationReport> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for id in [from, to] {
            if conversation_version(&tx, user_id, id)?.is_none() {
                return Err(Error::ConversationNotFound(id.to_string()));
            }
        }

        let mut report = MigrationReport::default();
        let mut seen = HashSet::new();
        let mut seq = next_seq(&tx, user_id, to)?;

        for message_id in message_ids {
            if !seen.insert(message_id.as_str()) {
                continue;
            }
            if !message_exists(&tx, user_id, from, message_id)? {
                report.missing.push(message_id.clone());
                continue;
            }

            if message_exists(&tx, user_id, to, message_id)? {
                tx.execute(
                    "DELETE FROM messages WHERE user_id = ?1 AND conversation_id = ?2 AND id = ?3",
                    params![user_id, from, message_id],
                )?;
                report.deduplicated.push(message_id.clone());
            } else {
                tx.execute(
                    r#"
                    UPDATE messages SET conversation_id = ?3, seq = ?4
                    WHERE user_id = ?1 AND conversation_id = ?2 AND id = ?5
                    "#,
                    params![user_id, from, to, seq, message_id],
                )?;
                seq += 1;
                report.moved.push(message_id.clone());
            }
        }

        if !report.is_noop() {
            touch_conversation(&tx, user_id, from, now)?;
            touch_conversation(&tx, user_id, to, now)?;
        }

        tx.commit()?;
        Ok(report)
    }

    // ============================================
    // Insight operations
    // ============================================

    /// Insert or replace an insight. Returns the conversation's new version.
    pub fn upsert_insight(
        &self,
        user_id: &str,
        conversation_id: &str,
        insight: &Insight,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if conversation_version(&tx, user_id, conversation_id)?.is_none() {
            return Err(Error::ConversationNotFound(conversation_id.to_string()));
        }
        upsert_insight_row(&tx, user_id, conversation_id, insight)?;
        let version = touch_conversation(&tx, user_id, conversation_id, now)?;

        tx.commit()?;
        Ok(version)
    }

    /// Remove an insight. Returns the new version, or `None` if it did not exist.
    pub fn delete_insight(
        &self,
        user_id: &str,
        conversation_id: &str,
        insight_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let deleted = tx.execute(
            "DELETE FROM insights WHERE user_id = ?1 AND conversation_id = ?2 AND id = ?3",
            params![user_id, conversation_id, insight_id],
        )?;
        if deleted == 0 {
            return Ok(None);
        }
        let version = touch_conversation(&tx, user_id, conversation_id, now)?;

        tx.commit()?;
        Ok(Some(version))
    }
}

// ============================================
// Row helpers (usable on a Connection or a Transaction)
// ============================================

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        auth_user_id: row.get("auth_user_id")?,
        email: row.get("email")?,
        tier: get_parsed(row, "tier")?,
        text_count: row.get("text_count")?,
        image_count: row.get("image_count")?,
        text_limit: row.get("text_limit")?,
        image_limit: row.get("image_limit")?,
        last_reset_at: get_ts(row, "last_reset_at")?,
        is_on_trial: row.get("is_on_trial")?,
        has_used_trial: row.get("has_used_trial")?,
        trial_started_at: get_opt_ts(row, "trial_started_at")?,
        trial_expires_at: get_opt_ts(row, "trial_expires_at")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get("id")?,
        role: get_parsed(row, "role")?,
        content: row.get("content")?,
        image_ref: row.get("image_ref")?,
        created_at: get_ts(row, "created_at")?,
    })
}

fn row_to_insight(row: &Row) -> rusqlite::Result<Insight> {
    Ok(Insight {
        id: row.get("id")?,
        title: row.get("title")?,
        content: row.get("content")?,
        status: get_parsed(row, "status")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

fn load_user(conn: &Connection, id: &str) -> Result<Option<User>> {
    conn.query_row("SELECT * FROM users WHERE id = ?", [id], row_to_user)
        .optional()
        .map_err(Error::from)
}

fn write_user(conn: &Connection, user: &User) -> Result<()> {
    let changed = conn.execute(
        r#"
        UPDATE users SET
            email = ?2, tier = ?3,
            text_count = ?4, image_count = ?5, text_limit = ?6, image_limit = ?7,
            last_reset_at = ?8,
            is_on_trial = ?9, has_used_trial = ?10,
            trial_started_at = ?11, trial_expires_at = ?12,
            updated_at = ?13
        WHERE id = ?1
        "#,
        params![
            user.id,
            user.email,
            user.tier.as_str(),
            user.text_count,
            user.image_count,
            user.text_limit,
            user.image_limit,
            ts(&user.last_reset_at),
            user.is_on_trial,
            user.has_used_trial,
            user.trial_started_at.as_ref().map(ts),
            user.trial_expires_at.as_ref().map(ts),
            ts(&user.updated_at),
        ],
    )?;
    if changed == 0 {
        return Err(Error::UserNotFound(user.id.clone()));
    }
    Ok(())
}

fn conversation_version(conn: &Connection, user_id: &str, id: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT version FROM conversations WHERE user_id = ?1 AND id = ?2",
        params![user_id, id],
        |r| r.get(0),
    )
    .optional()
    .map_err(Error::from)
}

fn load_conversation(conn: &Connection, user_id: &str, id: &str) -> Result<Option<Conversation>> {
    let header = conn
        .query_row(
            "SELECT * FROM conversations WHERE user_id = ?1 AND id = ?2",
            params![user_id, id],
            |row| {
                Ok(Conversation {
                    id: row.get("id")?,
                    user_id: row.get("user_id")?,
                    title: row.get("title")?,
                    game_title: row.get("game_title")?,
                    is_pinned: row.get("is_pinned")?,
                    is_archived: row.get("is_archived")?,
                    created_at: get_ts(row, "created_at")?,
                    updated_at: get_ts(row, "updated_at")?,
                    version: row.get("version")?,
                    messages: Vec::new(),
                    insights: BTreeMap::new(),
                })
            },
        )
        .optional()?;

    let Some(mut conversation) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM messages
        WHERE user_id = ?1 AND conversation_id = ?2
        ORDER BY created_at, seq
        "#,
    )?;
    conversation.messages = stmt
        .query_map(params![user_id, id], row_to_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt =
        conn.prepare("SELECT * FROM insights WHERE user_id = ?1 AND conversation_id = ?2")?;
    conversation.insights = stmt
        .query_map(params![user_id, id], row_to_insight)?
        .map(|r| r.map(|insight| (insight.id.clone(), insight)))
        .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

    Ok(Some(conversation))
}

fn message_exists(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    message_id: &str,
) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE user_id = ?1 AND conversation_id = ?2 AND id = ?3",
        params![user_id, conversation_id, message_id],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

fn next_seq(conn: &Connection, user_id: &str, conversation_id: &str) -> Result<i64> {
    let seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE user_id = ?1 AND conversation_id = ?2",
        params![user_id, conversation_id],
        |r| r.get(0),
    )?;
    Ok(seq)
}

fn insert_message_row(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    seq: i64,
    message: &Message,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO messages (user_id, conversation_id, id, seq, role, content, image_ref, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            user_id,
            conversation_id,
            message.id,
            seq,
            message.role.as_str(),
            message.content,
            message.image_ref,
            ts(&message.created_at),
        ],
    )?;
    Ok(())
}

fn upsert_insight_row(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    insight: &Insight,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO insights (user_id, conversation_id, id, title, content, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(user_id, conversation_id, id) DO UPDATE SET
            title = excluded.title,
            content = excluded.content,
            status = excluded.status,
            updated_at = excluded.updated_at
        "#,
        params![
            user_id,
            conversation_id,
            insight.id,
            insight.title,
            insight.content,
            insight.status.as_str(),
            ts(&insight.created_at),
            ts(&insight.updated_at),
        ],
    )?;
    Ok(())
}

/// Bump `updated_at` and `version`; returns the new version.
fn touch_conversation(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        r#"
        UPDATE conversations SET updated_at = ?3, version = version + 1
        WHERE user_id = ?1 AND id = ?2
        "#,
        params![user_id, conversation_id, ts(&now)],
    )?;
    conversation_version(conn, user_id, conversation_id)?
        .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn setup() -> (Database, User) {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let user = User::new(
            "auth-1",
            "player@example.com",
            Tier::Free,
            TierLimits::FREE,
            at(2025, 10, 1),
        );
        db.insert_user(&user).unwrap();
        (db, user)
    }

    fn message(id: &str, day: u32) -> Message {
        Message {
            id: id.to_string(),
            role: MessageRole::User,
            content: format!("message {}", id),
            image_ref: None,
            created_at: at(2025, 10, day),
        }
    }

    #[test]
    fn test_user_crud() {
        let (db, user) = setup();

        let by_id = db.get_user(&user.id).unwrap().unwrap();
        assert_eq!(by_id, user);

        let by_auth = db.find_user("auth-1").unwrap().unwrap();
        assert_eq!(by_auth.id, user.id);

        let mut updated = user.clone();
        updated.text_count = 7;
        db.update_user(&updated).unwrap();
        assert_eq!(db.get_user(&user.id).unwrap().unwrap().text_count, 7);

        assert_eq!(db.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_auth_id_rejected() {
        let (db, _) = setup();
        let dup = User::new("auth-1", "x@example.com", Tier::Free, TierLimits::FREE, at(2025, 10, 2));
        assert!(matches!(db.insert_user(&dup), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_modify_user_rolls_back_on_error() {
        let (db, user) = setup();

        let result: Result<()> = db.modify_user(&user.id, |u| {
            u.text_count = 42;
            Err(Error::InvalidInput("abort".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(db.get_user(&user.id).unwrap().unwrap().text_count, 0);

        assert!(matches!(
            db.modify_user("nobody", |_| Ok(())),
            Err(Error::UserNotFound(_))
        ));
    }

    #[test]
    fn test_conversation_round_trip() {
        let (db, user) = setup();
        let mut conv = Conversation::new(&user.id, "c1", "Chat", at(2025, 10, 1));
        conv.messages.push(message("m1", 2));
        db.insert_conversation(&conv).unwrap();

        let loaded = db.get_conversation(&user.id, "c1").unwrap().unwrap();
        assert_eq!(loaded, conv);

        assert!(matches!(
            db.insert_conversation(&conv),
            Err(Error::ConversationExists(_))
        ));
    }

    #[test]
    fn test_update_conversation_version_check() {
        let (db, user) = setup();
        let conv = Conversation::new(&user.id, "c1", "Chat", at(2025, 10, 1));
        db.insert_conversation(&conv).unwrap();

        let mut first = conv.clone();
        first.title = "Renamed".to_string();
        assert_eq!(db.update_conversation(&first).unwrap(), 2);

        let mut stale = conv.clone();
        stale.is_pinned = true;
        match db.update_conversation(&stale) {
            Err(Error::VersionConflict {
                expected, found, ..
            }) => {
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("expected version conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_append_message_rejects_duplicates() {
        let (db, user) = setup();
        db.insert_conversation(&Conversation::new(&user.id, "c1", "Chat", at(2025, 10, 1)))
            .unwrap();

        let v = db
            .append_message(&user.id, "c1", &message("m1", 2), at(2025, 10, 2))
            .unwrap();
        assert_eq!(v, 2);
        assert!(matches!(
            db.append_message(&user.id, "c1", &message("m1", 3), at(2025, 10, 3)),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            db.append_message(&user.id, "nope", &message("m2", 3), at(2025, 10, 3)),
            Err(Error::ConversationNotFound(_))
        ));
    }

    #[test]
    fn test_record_exchange_writes_user_and_messages_together() {
        let (db, user) = setup();
        db.insert_conversation(&Conversation::new(&user.id, "c1", "Chat", at(2025, 10, 1)))
            .unwrap();

        let (count, version) = db
            .record_exchange(
                &user.id,
                "c1",
                &[&message("q", 2), &message("a", 2)],
                at(2025, 10, 2),
                |u| {
                    u.text_count += 1;
                    Ok(u.text_count)
                },
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(version, 2);

        let conv = db.get_conversation(&user.id, "c1").unwrap().unwrap();
        let ids: Vec<_> = conv.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["q", "a"]);
        assert_eq!(db.get_user(&user.id).unwrap().unwrap().text_count, 1);
    }

    #[test]
    fn test_record_exchange_with_repeated_id_writes_nothing() {
        let (db, user) = setup();
        db.insert_conversation(&Conversation::new(&user.id, "c1", "Chat", at(2025, 10, 1)))
            .unwrap();

        let same = message("m1", 2);
        let result = db.record_exchange(&user.id, "c1", &[&same, &same], at(2025, 10, 2), |u| {
            u.text_count += 1;
            Ok(())
        });
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        let conv = db.get_conversation(&user.id, "c1").unwrap().unwrap();
        assert!(conv.messages.is_empty());
        assert_eq!(conv.version, 1);
        assert_eq!(db.get_user(&user.id).unwrap().unwrap().text_count, 0);
    }

    #[test]
    fn test_record_exchange_failed_charge_writes_nothing() {
        let (db, user) = setup();
        db.insert_conversation(&Conversation::new(&user.id, "c1", "Chat", at(2025, 10, 1)))
            .unwrap();

        let result: Result<((), i64)> = db.record_exchange(
            &user.id,
            "c1",
            &[&message("q", 2)],
            at(2025, 10, 2),
            |u| {
                u.text_count += 1;
                Err(Error::InvalidInput("no".to_string()))
            },
        );
        assert!(result.is_err());

        let conv = db.get_conversation(&user.id, "c1").unwrap().unwrap();
        assert!(conv.messages.is_empty());
        assert_eq!(db.get_user(&user.id).unwrap().unwrap().text_count, 0);
    }

    #[test]
    fn test_move_messages_dedups_by_id() {
        let (db, user) = setup();
        let mut x = Conversation::new(&user.id, "x", "X", at(2025, 10, 1));
        x.messages = vec![message("a", 2), message("b", 3)];
        let mut y = Conversation::new(&user.id, "y", "Y", at(2025, 10, 1));
        y.messages = vec![message("a", 2)];
        db.insert_conversation(&x).unwrap();
        db.insert_conversation(&y).unwrap();

        let ids = vec!["a".to_string(), "b".to_string(), "zzz".to_string()];
        let report = db
            .move_messages(&user.id, &ids, "x", "y", at(2025, 10, 5))
            .unwrap();
        assert_eq!(report.moved, vec!["b".to_string()]);
        assert_eq!(report.deduplicated, vec!["a".to_string()]);
        assert_eq!(report.missing, vec!["zzz".to_string()]);

        let x = db.get_conversation(&user.id, "x").unwrap().unwrap();
        let y = db.get_conversation(&user.id, "y").unwrap().unwrap();
        assert!(x.messages.is_empty());
        let y_ids: Vec<_> = y.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(y_ids, vec!["a", "b"]);
        assert_eq!(x.version, 2);
        assert_eq!(y.version, 2);
    }

    #[test]
    fn test_move_messages_missing_conversation_changes_nothing() {
        let (db, user) = setup();
        let mut x = Conversation::new(&user.id, "x", "X", at(2025, 10, 1));
        x.messages = vec![message("a", 2)];
        db.insert_conversation(&x).unwrap();

        let result = db.move_messages(&user.id, &["a".to_string()], "x", "ghost", at(2025, 10, 5));
        assert!(matches!(result, Err(Error::ConversationNotFound(id)) if id == "ghost"));

        let x = db.get_conversation(&user.id, "x").unwrap().unwrap();
        assert_eq!(x.messages.len(), 1);
        assert_eq!(x.version, 1);
    }

    #[test]
    fn test_delete_conversation_cascades() {
        let (db, user) = setup();
        let mut conv = Conversation::new(&user.id, "c1", "Chat", at(2025, 10, 1));
        conv.messages.push(message("m1", 2));
        db.insert_conversation(&conv).unwrap();

        assert!(db.delete_conversation(&user.id, "c1").unwrap());
        assert!(!db.delete_conversation(&user.id, "c1").unwrap());

        let remaining: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_list_conversations_order() {
        let (db, user) = setup();
        let old = Conversation::new(&user.id, "old", "Old", at(2025, 10, 1));
        let new = Conversation::new(&user.id, "new", "New", at(2025, 10, 9));
        let mut pinned = Conversation::new(&user.id, "pinned", "Pinned", at(2025, 9, 1));
        pinned.is_pinned = true;
        let mut archived = Conversation::new(&user.id, "archived", "Archived", at(2025, 10, 20));
        archived.is_archived = true;
        for c in [&old, &new, &pinned, &archived] {
            db.insert_conversation(c).unwrap();
        }

        let ids: Vec<_> = db
            .list_conversations(&user.id, false)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["pinned", "new", "old"]);

        assert_eq!(db.list_conversations(&user.id, true).unwrap().len(), 4);
    }
}
