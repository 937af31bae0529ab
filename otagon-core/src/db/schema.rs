//! Database schema and migrations
//!
//! Each migration is applied in its own transaction together with the
//! `PRAGMA user_version` bump, so a failed step leaves the file at the
//! previous version.

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

struct Migration {
    version: i32,
    tables: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    tables: "users, conversations, messages, insights",
    sql: r#"
    -- ============================================
    -- Accounts and quota windows
    -- ============================================

    CREATE TABLE IF NOT EXISTS users (
        id               TEXT PRIMARY KEY,
        auth_user_id     TEXT NOT NULL UNIQUE,
        email            TEXT NOT NULL,
        tier             TEXT NOT NULL,

        -- Quota windows
        text_count       INTEGER NOT NULL DEFAULT 0,
        image_count      INTEGER NOT NULL DEFAULT 0,
        text_limit       INTEGER NOT NULL,
        image_limit      INTEGER NOT NULL,
        last_reset_at    DATETIME NOT NULL,

        -- Trial
        is_on_trial      INTEGER NOT NULL DEFAULT 0,
        has_used_trial   INTEGER NOT NULL DEFAULT 0,
        trial_started_at DATETIME,
        trial_expires_at DATETIME,

        created_at       DATETIME NOT NULL,
        updated_at       DATETIME NOT NULL
    );

    -- ============================================
    -- Conversations (tabs)
    -- ============================================

    CREATE TABLE IF NOT EXISTS conversations (
        user_id          TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        id               TEXT NOT NULL,
        title            TEXT NOT NULL,
        game_title       TEXT,
        is_pinned        INTEGER NOT NULL DEFAULT 0,
        is_archived      INTEGER NOT NULL DEFAULT 0,
        created_at       DATETIME NOT NULL,
        updated_at       DATETIME NOT NULL,
        version          INTEGER NOT NULL DEFAULT 1,

        PRIMARY KEY (user_id, id)
    );

    CREATE TABLE IF NOT EXISTS messages (
        user_id          TEXT NOT NULL,
        conversation_id  TEXT NOT NULL,
        id               TEXT NOT NULL,
        seq              INTEGER NOT NULL,
        role             TEXT NOT NULL,
        content          TEXT NOT NULL,
        image_ref        TEXT,
        created_at       DATETIME NOT NULL,

        PRIMARY KEY (user_id, conversation_id, id),
        FOREIGN KEY (user_id, conversation_id)
            REFERENCES conversations(user_id, id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS insights (
        user_id          TEXT NOT NULL,
        conversation_id  TEXT NOT NULL,
        id               TEXT NOT NULL,
        title            TEXT NOT NULL,
        content          TEXT NOT NULL,
        status           TEXT NOT NULL,
        created_at       DATETIME NOT NULL,
        updated_at       DATETIME NOT NULL,

        PRIMARY KEY (user_id, conversation_id, id),
        FOREIGN KEY (user_id, conversation_id)
            REFERENCES conversations(user_id, id) ON DELETE CASCADE
    );

    -- ============================================
    -- Indexes
    -- ============================================

    CREATE INDEX IF NOT EXISTS idx_conversations_user_updated
        ON conversations(user_id, updated_at DESC);
    CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
        ON messages(user_id, conversation_id, seq);
    "#,
}];

/// Bring the schema up to [`SCHEMA_VERSION`]
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let current = get_schema_version(conn)?;
    if current > SCHEMA_VERSION {
        tracing::warn!(
            current,
            known = SCHEMA_VERSION,
            "Database schema is newer than this build"
        );
        return Ok(());
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            tables = migration.tables,
            "Creating otagon tables"
        );
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;
    }

    if current < SCHEMA_VERSION {
        tracing::info!(from = current, to = SCHEMA_VERSION, "Otagon schema up to date");
    } else {
        tracing::debug!(version = current, "Otagon schema already current");
    }
    Ok(())
}

/// Read `PRAGMA user_version`
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |r| r.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();

        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();

        for table in ["users", "conversations", "messages", "insights"] {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_foreign_keys() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        run_migrations(&mut conn).unwrap();

        let fk_tables: Vec<String> = conn
            .prepare("PRAGMA foreign_key_list(messages)")
            .unwrap()
            .query_map([], |row| row.get::<_, String>(2))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(
            fk_tables.iter().any(|t| t == "conversations"),
            "messages should reference conversations"
        );
    }

    #[test]
    fn test_newer_schema_is_left_alone() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();

        run_migrations(&mut conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION + 1);
        let tables: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='users'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn test_failed_migration_keeps_previous_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        // Older messages table without seq, so the index cannot be built
        conn.execute_batch("CREATE TABLE messages (id TEXT PRIMARY KEY);")
            .unwrap();

        assert!(run_migrations(&mut conn).is_err());
        assert_eq!(get_schema_version(&conn).unwrap(), 0);
        let created: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='conversations'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(created, 0);
    }
}
