//! Local mail rows, tags, archive and calendar invites.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;

use crate::mail::parser::CalendarInvite;
use crate::mail::types::FolderRole;

/// A local mail row as seen by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailRow {
    pub id: i64,
    pub mailbox_id: i64,
    pub folder: FolderRole,
    /// Physical folder the `uidl` refers to.
    pub folder_name: String,
    pub uidl: String,
    pub mime_message_id: String,
    pub subject: String,
    pub is_unread: bool,
    pub is_important: bool,
    pub is_removed: bool,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub mailbox_id: i64,
    pub folder: FolderRole,
    pub folder_name: String,
    pub uidl: String,
    pub mime_message_id: String,
    pub subject: String,
    pub from_addr: String,
    pub date: Option<i64>,
    pub server_date: Option<i64>,
    pub preview: Option<String>,
    pub is_unread: bool,
    pub is_important: bool,
    pub is_removed: bool,
}

/// Total and unread counts of live rows in a folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderCounters {
    pub total: i64,
    pub unread: i64,
}

const ROW_COLUMNS: &str = "id, mailbox_id, folder, folder_name, uidl, mime_message_id, subject, is_unread, is_important, is_removed";

fn row_to_mail(row: &SqliteRow) -> MailRow {
    MailRow {
        id: row.get("id"),
        mailbox_id: row.get("mailbox_id"),
        folder: FolderRole::from_id(row.get("folder")).unwrap_or(FolderRole::Other),
        folder_name: row.get("folder_name"),
        uidl: row.get("uidl"),
        mime_message_id: row.get("mime_message_id"),
        subject: row.get("subject"),
        is_unread: row.get::<i64, _>("is_unread") != 0,
        is_important: row.get::<i64, _>("is_important") != 0,
        is_removed: row.get::<i64, _>("is_removed") != 0,
    }
}

/// Append ` WHERE id IN (?, ?, ...)` to a query.
fn push_id_filter(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    builder.push(" WHERE id IN (");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

pub async fn get_message(pool: &SqlitePool, id: i64) -> Result<Option<MailRow>> {
    let row = sqlx::query(&format!("SELECT {ROW_COLUMNS} FROM messages WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_mail))
}

pub async fn find_by_uidl(
    pool: &SqlitePool,
    mailbox_id: i64,
    folder_name: &str,
    uidl: &str,
) -> Result<Option<MailRow>> {
    let row = sqlx::query(&format!(
        "SELECT {ROW_COLUMNS} FROM messages WHERE mailbox_id = ? AND folder_name = ? AND uidl = ?"
    ))
    .bind(mailbox_id)
    .bind(folder_name)
    .bind(uidl)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(row_to_mail))
}

/// All rows bound to a physical folder, keyed by uidl.
pub async fn rows_by_uidl(
    pool: &SqlitePool,
    mailbox_id: i64,
    folder_name: &str,
) -> Result<HashMap<String, MailRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {ROW_COLUMNS} FROM messages WHERE mailbox_id = ? AND folder_name = ?"
    ))
    .bind(mailbox_id)
    .bind(folder_name)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(row_to_mail)
        .map(|row| (row.uidl.clone(), row))
        .collect())
}

/// Rows with this `Message-ID` in a logical folder, soft-deleted ones included.
pub async fn find_by_mime_id(
    pool: &SqlitePool,
    mailbox_id: i64,
    folder: FolderRole,
    mime_message_id: &str,
) -> Result<Vec<MailRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {ROW_COLUMNS} FROM messages WHERE mailbox_id = ? AND folder = ? AND mime_message_id = ? ORDER BY id"
    ))
    .bind(mailbox_id)
    .bind(folder.id())
    .bind(mime_message_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_mail).collect())
}

pub async fn insert_message(pool: &SqlitePool, message: &NewMessage) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO messages (mailbox_id, folder, folder_name, uidl, mime_message_id, subject, from_addr,
                              date, server_date, preview, is_unread, is_important, is_removed, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(message.mailbox_id)
    .bind(message.folder.id())
    .bind(&message.folder_name)
    .bind(&message.uidl)
    .bind(&message.mime_message_id)
    .bind(&message.subject)
    .bind(&message.from_addr)
    .bind(message.date)
    .bind(message.server_date)
    .bind(&message.preview)
    .bind(message.is_unread)
    .bind(message.is_important)
    .bind(message.is_removed)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Rebind a row to a new physical location.
pub async fn update_uidl(
    pool: &SqlitePool,
    id: i64,
    folder_name: &str,
    uidl: &str,
) -> Result<()> {
    sqlx::query("UPDATE messages SET folder_name = ?, uidl = ? WHERE id = ?")
        .bind(folder_name)
        .bind(uidl)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Un-delete a soft-deleted row and rebind it.
pub async fn restore_message(
    pool: &SqlitePool,
    id: i64,
    folder_name: &str,
    uidl: &str,
) -> Result<()> {
    sqlx::query("UPDATE messages SET is_removed = 0, folder_name = ?, uidl = ? WHERE id = ?")
        .bind(folder_name)
        .bind(uidl)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn update_column(pool: &SqlitePool, column: &str, value: bool, ids: &[i64]) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Sqlite>::new(format!("UPDATE messages SET {column} = "));
    builder.push_bind(value);
    push_id_filter(&mut builder, ids);
    builder.push(format!(" AND {column} != "));
    builder.push_bind(value);

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Returns the number of rows that actually changed.
pub async fn set_unread(pool: &SqlitePool, ids: &[i64], unread: bool) -> Result<u64> {
    update_column(pool, "is_unread", unread, ids).await
}

pub async fn set_important(pool: &SqlitePool, ids: &[i64], important: bool) -> Result<u64> {
    update_column(pool, "is_important", important, ids).await
}

pub async fn set_removed(pool: &SqlitePool, ids: &[i64]) -> Result<u64> {
    update_column(pool, "is_removed", true, ids).await
}

pub async fn move_to_folder(pool: &SqlitePool, ids: &[i64], folder: FolderRole) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Sqlite>::new("UPDATE messages SET folder = ");
    builder.push_bind(folder.id());
    push_id_filter(&mut builder, ids);

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

pub async fn folder_counters(
    pool: &SqlitePool,
    mailbox_id: i64,
    folder: FolderRole,
) -> Result<FolderCounters> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS total, COALESCE(SUM(is_unread), 0) AS unread
        FROM messages
        WHERE mailbox_id = ? AND folder = ? AND is_removed = 0
        "#,
    )
    .bind(mailbox_id)
    .bind(folder.id())
    .fetch_one(pool)
    .await?;

    Ok(FolderCounters {
        total: row.get("total"),
        unread: row.get("unread"),
    })
}

pub async fn add_tags(pool: &SqlitePool, message_id: i64, tags: &[String]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for tag in tags {
        sqlx::query("INSERT OR IGNORE INTO message_tags (message_id, tag) VALUES (?, ?)")
            .bind(message_id)
            .bind(tag)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn tags_for(pool: &SqlitePool, message_id: i64) -> Result<Vec<String>> {
    let tags = sqlx::query_scalar("SELECT tag FROM message_tags WHERE message_id = ? ORDER BY tag")
        .bind(message_id)
        .fetch_all(pool)
        .await?;
    Ok(tags)
}

pub async fn archive_raw(pool: &SqlitePool, message_id: i64, sha256: &str, raw: &[u8]) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO message_archive (message_id, sha256, raw, archived_at) VALUES (?, ?, ?, ?)",
    )
    .bind(message_id)
    .bind(sha256)
    .bind(raw)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn archived_hash(pool: &SqlitePool, message_id: i64) -> Result<Option<String>> {
    let hash = sqlx::query_scalar("SELECT sha256 FROM message_archive WHERE message_id = ?")
        .bind(message_id)
        .fetch_optional(pool)
        .await?;
    Ok(hash)
}

pub async fn record_calendar_invite(
    pool: &SqlitePool,
    message_id: i64,
    invite: &CalendarInvite,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO calendar_invites (message_id, event_uid, summary, ics) VALUES (?, ?, ?, ?)",
    )
    .bind(message_id)
    .bind(&invite.uid)
    .bind(&invite.summary)
    .bind(&invite.ics)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn calendar_invite(pool: &SqlitePool, message_id: i64) -> Result<Option<CalendarInvite>> {
    let row = sqlx::query("SELECT event_uid, summary, ics FROM calendar_invites WHERE message_id = ?")
        .bind(message_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|row| CalendarInvite {
        uid: row.get("event_uid"),
        summary: row.get("summary"),
        ics: row.get("ics"),
    }))
}
