//! External command queue and user activity.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::mail::types::{ActionKind, FolderRole, PendingAction, UserKey};

pub async fn push_command(pool: &SqlitePool, user: &UserKey, action: &PendingAction, now: i64) -> Result<i64> {
    let (kind, target) = action.kind.to_parts();
    let result = sqlx::query(
        r#"
        INSERT INTO pending_commands (tenant, username, mailbox_id, message_id, kind, target, folder, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user.tenant)
    .bind(&user.user)
    .bind(action.mailbox_id)
    .bind(action.message_id)
    .bind(kind)
    .bind(target)
    .bind(action.folder.id())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Remove and return up to `limit` of the user's oldest commands.
/// Rows that cannot be decoded are dropped with a warning.
pub async fn pop_commands(pool: &SqlitePool, user: &UserKey, limit: usize) -> Result<Vec<PendingAction>> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        r#"
        SELECT id, mailbox_id, message_id, kind, target, folder
        FROM pending_commands
        WHERE tenant = ? AND username = ?
        ORDER BY id
        LIMIT ?
        "#,
    )
    .bind(user.tenant)
    .bind(&user.user)
    .bind(limit as i64)
    .fetch_all(&mut *tx)
    .await?;

    let Some(last_id) = rows.last().map(|row| row.get::<i64, _>("id")) else {
        return Ok(Vec::new());
    };

    sqlx::query("DELETE FROM pending_commands WHERE tenant = ? AND username = ? AND id <= ?")
        .bind(user.tenant)
        .bind(&user.user)
        .bind(last_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let id: i64 = row.get("id");
            let kind: String = row.get("kind");
            let target: Option<i64> = row.get("target");
            let folder = FolderRole::from_id(row.get("folder"));
            match (ActionKind::from_parts(&kind, target), folder) {
                (Some(kind), Some(folder)) => Some(PendingAction::new(
                    kind,
                    row.get("mailbox_id"),
                    row.get("message_id"),
                    folder,
                )),
                _ => {
                    tracing::warn!("Dropping undecodable command {} ({})", id, kind);
                    None
                }
            }
        })
        .collect())
}

pub async fn pending_command_count(pool: &SqlitePool, user: &UserKey) -> Result<usize> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pending_commands WHERE tenant = ? AND username = ?")
            .bind(user.tenant)
            .bind(&user.user)
            .fetch_one(pool)
            .await?;
    Ok(count as usize)
}

pub async fn touch_user(pool: &SqlitePool, user: &UserKey, now: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_activity (tenant, username, last_seen) VALUES (?, ?, ?)
        ON CONFLICT (tenant, username) DO UPDATE SET last_seen = excluded.last_seen
        "#,
    )
    .bind(user.tenant)
    .bind(&user.user)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn user_active_since(pool: &SqlitePool, user: &UserKey, since: i64) -> Result<bool> {
    let last_seen: Option<i64> =
        sqlx::query_scalar("SELECT last_seen FROM user_activity WHERE tenant = ? AND username = ?")
            .bind(user.tenant)
            .bind(&user.user)
            .fetch_optional(pool)
            .await?;
    Ok(last_seen.is_some_and(|seen| seen >= since))
}
