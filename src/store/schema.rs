//! Database schema initialization.

use anyhow::Result;
use sqlx::SqlitePool;

/// Current schema version, recorded in `schema_version`.
const SCHEMA_VERSION: i64 = 1;

/// Initialize database schema with all tables and indexes.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Remote accounts, one row per mailbox
        CREATE TABLE IF NOT EXISTS mailboxes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant INTEGER NOT NULL,
            username TEXT NOT NULL,
            address TEXT NOT NULL,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            encryption INTEGER NOT NULL DEFAULT 1,
            login TEXT NOT NULL,
            password TEXT,
            oauth_token TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            is_processed INTEGER NOT NULL DEFAULT 0,
            checked_at INTEGER,
            auth_error_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_mailboxes_user ON mailboxes(tenant, username);

        -- Per-mailbox folder mapping overrides
        CREATE TABLE IF NOT EXISTS folder_overrides (
            mailbox_id INTEGER NOT NULL REFERENCES mailboxes(id) ON DELETE CASCADE,
            folder TEXT NOT NULL,
            role INTEGER,
            skip INTEGER NOT NULL DEFAULT 0,
            tags TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (mailbox_id, folder)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        -- Local mail rows
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mailbox_id INTEGER NOT NULL REFERENCES mailboxes(id) ON DELETE CASCADE,
            folder INTEGER NOT NULL,
            folder_name TEXT NOT NULL,
            uidl TEXT NOT NULL,
            mime_message_id TEXT NOT NULL,
            subject TEXT NOT NULL DEFAULT '',
            from_addr TEXT NOT NULL DEFAULT '',
            date INTEGER,
            server_date INTEGER,
            preview TEXT,
            is_unread INTEGER NOT NULL DEFAULT 1,
            is_important INTEGER NOT NULL DEFAULT 0,
            is_removed INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE (mailbox_id, folder_name, uidl)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_mime ON messages(mailbox_id, folder, mime_message_id);
        CREATE INDEX IF NOT EXISTS idx_messages_folder ON messages(mailbox_id, folder, is_removed);

        CREATE TABLE IF NOT EXISTS message_tags (
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            tag TEXT NOT NULL,
            PRIMARY KEY (message_id, tag)
        );

        -- Raw sources, content-addressed
        CREATE TABLE IF NOT EXISTS message_archive (
            message_id INTEGER PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
            sha256 TEXT NOT NULL,
            raw BLOB NOT NULL,
            archived_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_archive_sha ON message_archive(sha256);

        CREATE TABLE IF NOT EXISTS calendar_invites (
            message_id INTEGER PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
            event_uid TEXT,
            summary TEXT,
            ics TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        -- Commands issued outside the engine, bound for the server
        CREATE TABLE IF NOT EXISTS pending_commands (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant INTEGER NOT NULL,
            username TEXT NOT NULL,
            mailbox_id INTEGER NOT NULL,
            message_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            target INTEGER,
            folder INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pending_user ON pending_commands(tenant, username, id);

        -- Last time a user was seen by the outer system
        CREATE TABLE IF NOT EXISTS user_activity (
            tenant INTEGER NOT NULL,
            username TEXT NOT NULL,
            last_seen INTEGER NOT NULL,
            PRIMARY KEY (tenant, username)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}
