//! Mailbox rows: account lookup, advisory locks and status stamps.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::FolderOverride;
use crate::mail::types::{Credentials, Encryption, FolderRole, MailboxAccount, UserKey};

/// Account data for provisioning a mailbox row.
#[derive(Debug, Clone)]
pub struct NewMailbox {
    pub user: UserKey,
    pub address: String,
    pub host: String,
    pub port: u16,
    pub encryption: Encryption,
    pub login: String,
    pub credentials: Credentials,
}

fn row_to_account(row: &SqliteRow) -> Result<MailboxAccount> {
    let id: i64 = row.get("id");
    let port: i64 = row.get("port");
    let port = u16::try_from(port)
        .map_err(|_| anyhow::anyhow!("mailbox {} has invalid port {}", id, port))?;

    let oauth_token: Option<String> = row.get("oauth_token");
    let password: Option<String> = row.get("password");
    let credentials = match oauth_token {
        Some(token) => Credentials::Bearer(token),
        None => Credentials::Password(password.unwrap_or_default()),
    };

    Ok(MailboxAccount {
        id,
        user: UserKey::new(row.get("tenant"), row.get::<String, _>("username")),
        address: row.get("address"),
        host: row.get("host"),
        port,
        encryption: Encryption::from_id(row.get("encryption")),
        login: row.get("login"),
        credentials,
        enabled: row.get::<i64, _>("enabled") != 0,
        checked_at: row.get("checked_at"),
        auth_error_at: row.get("auth_error_at"),
    })
}

pub async fn insert_mailbox(pool: &SqlitePool, mailbox: &NewMailbox) -> Result<i64> {
    let (password, oauth_token) = match &mailbox.credentials {
        Credentials::Password(password) => (Some(password.as_str()), None),
        Credentials::Bearer(token) => (None, Some(token.as_str())),
    };

    let result = sqlx::query(
        r#"
        INSERT INTO mailboxes (tenant, username, address, host, port, encryption, login, password, oauth_token)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(mailbox.user.tenant)
    .bind(&mailbox.user.user)
    .bind(&mailbox.address)
    .bind(&mailbox.host)
    .bind(mailbox.port as i64)
    .bind(mailbox.encryption.id())
    .bind(&mailbox.login)
    .bind(password)
    .bind(oauth_token)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Enabled mailboxes of a user, skipping those whose last authentication
/// failure is newer than `auth_error_before`.
pub async fn enabled_mailboxes(
    pool: &SqlitePool,
    user: &UserKey,
    auth_error_before: i64,
) -> Result<Vec<MailboxAccount>> {
    let rows = sqlx::query(
        r#"
        SELECT id, tenant, username, address, host, port, encryption, login, password, oauth_token,
               enabled, checked_at, auth_error_at
        FROM mailboxes
        WHERE tenant = ? AND username = ? AND enabled = 1
          AND (auth_error_at IS NULL OR auth_error_at < ?)
        ORDER BY id
        "#,
    )
    .bind(user.tenant)
    .bind(&user.user)
    .bind(auth_error_before)
    .fetch_all(pool)
    .await?;

    // A broken row only takes its own mailbox out of synchronization.
    Ok(rows
        .iter()
        .filter_map(|row| match row_to_account(row) {
            Ok(account) => Some(account),
            Err(e) => {
                tracing::warn!("Skipping mailbox of {}: {}", user, e);
                None
            }
        })
        .collect())
}

pub async fn set_enabled(pool: &SqlitePool, mailbox_id: i64, enabled: bool) -> Result<()> {
    sqlx::query("UPDATE mailboxes SET enabled = ? WHERE id = ?")
        .bind(enabled)
        .bind(mailbox_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Take the advisory lock. Returns `false` when another process holds it.
pub async fn lock_mailbox(pool: &SqlitePool, mailbox_id: i64) -> Result<bool> {
    let result = sqlx::query("UPDATE mailboxes SET is_processed = 1 WHERE id = ? AND is_processed = 0")
        .bind(mailbox_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn unlock_mailbox(pool: &SqlitePool, mailbox_id: i64) -> Result<()> {
    sqlx::query("UPDATE mailboxes SET is_processed = 0 WHERE id = ?")
        .bind(mailbox_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_auth_error(pool: &SqlitePool, mailbox_id: i64, at: i64) -> Result<()> {
    sqlx::query("UPDATE mailboxes SET auth_error_at = ? WHERE id = ?")
        .bind(at)
        .bind(mailbox_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Stamp a successful check; this also clears any previous auth error.
pub async fn set_checked(pool: &SqlitePool, mailbox_id: i64, at: i64) -> Result<()> {
    sqlx::query("UPDATE mailboxes SET checked_at = ?, auth_error_at = NULL WHERE id = ?")
        .bind(at)
        .bind(mailbox_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_mailbox(pool: &SqlitePool, mailbox_id: i64) -> Result<Option<MailboxAccount>> {
    let row = sqlx::query(
        r#"
        SELECT id, tenant, username, address, host, port, encryption, login, password, oauth_token,
               enabled, checked_at, auth_error_at
        FROM mailboxes
        WHERE id = ?
        "#,
    )
    .bind(mailbox_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_account).transpose()
}

pub async fn is_locked(pool: &SqlitePool, mailbox_id: i64) -> Result<bool> {
    let locked: Option<i64> = sqlx::query_scalar("SELECT is_processed FROM mailboxes WHERE id = ?")
        .bind(mailbox_id)
        .fetch_optional(pool)
        .await?;
    Ok(locked.unwrap_or(0) != 0)
}

pub async fn folder_overrides(pool: &SqlitePool, mailbox_id: i64) -> Result<Vec<FolderOverride>> {
    let rows = sqlx::query("SELECT folder, role, skip, tags FROM folder_overrides WHERE mailbox_id = ?")
        .bind(mailbox_id)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let tags: String = row.get("tags");
            FolderOverride {
                folder: row.get("folder"),
                role: row
                    .get::<Option<i64>, _>("role")
                    .and_then(FolderRole::from_id),
                skip: row.get::<i64, _>("skip") != 0,
                tags: tags
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect(),
            }
        })
        .collect())
}

pub async fn set_folder_override(
    pool: &SqlitePool,
    mailbox_id: i64,
    folder_override: &FolderOverride,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO folder_overrides (mailbox_id, folder, role, skip, tags) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(mailbox_id)
    .bind(&folder_override.folder)
    .bind(folder_override.role.map(FolderRole::id))
    .bind(folder_override.skip)
    .bind(folder_override.tags.join(","))
    .execute(pool)
    .await?;
    Ok(())
}
