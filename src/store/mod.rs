//! SQLite storage for mailboxes, mail rows and the command queue.
//!
//! This module is split into:
//! - `mod.rs` - Store struct, connection pool, delegation
//! - `schema.rs` - Database schema initialization
//! - `mailbox.rs` - Mailbox rows, advisory locks, folder overrides
//! - `message.rs` - Mail rows, tags, archive, calendar invites
//! - `command.rs` - External command queue and user activity

mod command;
mod mailbox;
mod message;
mod schema;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::config::FolderOverride;
use crate::constants::STORE_POOL_SIZE;
use crate::mail::parser::CalendarInvite;
use crate::mail::types::{FolderRole, MailboxAccount, PendingAction, UserKey};

pub use mailbox::NewMailbox;
pub use message::{FolderCounters, MailRow, NewMessage};

/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Get a reference to the connection pool (for tests).
    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn open(path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(STORE_POOL_SIZE)
            .connect_with(options)
            .await
            .context("Failed to create connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to create in-memory connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    //
    // Mailbox Operations (delegated to mailbox module)
    //

    pub async fn insert_mailbox(&self, mailbox: &NewMailbox) -> Result<i64> {
        mailbox::insert_mailbox(&self.pool, mailbox).await
    }

    pub async fn get_mailbox(&self, mailbox_id: i64) -> Result<Option<MailboxAccount>> {
        mailbox::get_mailbox(&self.pool, mailbox_id).await
    }

    pub async fn enabled_mailboxes(
        &self,
        user: &UserKey,
        auth_error_before: i64,
    ) -> Result<Vec<MailboxAccount>> {
        mailbox::enabled_mailboxes(&self.pool, user, auth_error_before).await
    }

    pub async fn set_enabled(&self, mailbox_id: i64, enabled: bool) -> Result<()> {
        mailbox::set_enabled(&self.pool, mailbox_id, enabled).await
    }

    pub async fn lock_mailbox(&self, mailbox_id: i64) -> Result<bool> {
        mailbox::lock_mailbox(&self.pool, mailbox_id).await
    }

    pub async fn unlock_mailbox(&self, mailbox_id: i64) -> Result<()> {
        mailbox::unlock_mailbox(&self.pool, mailbox_id).await
    }

    pub async fn is_locked(&self, mailbox_id: i64) -> Result<bool> {
        mailbox::is_locked(&self.pool, mailbox_id).await
    }

    pub async fn set_auth_error(&self, mailbox_id: i64, at: i64) -> Result<()> {
        mailbox::set_auth_error(&self.pool, mailbox_id, at).await
    }

    pub async fn set_checked(&self, mailbox_id: i64, at: i64) -> Result<()> {
        mailbox::set_checked(&self.pool, mailbox_id, at).await
    }

    pub async fn folder_overrides(&self, mailbox_id: i64) -> Result<Vec<FolderOverride>> {
        mailbox::folder_overrides(&self.pool, mailbox_id).await
    }

    pub async fn set_folder_override(
        &self,
        mailbox_id: i64,
        folder_override: &FolderOverride,
    ) -> Result<()> {
        mailbox::set_folder_override(&self.pool, mailbox_id, folder_override).await
    }

    //
    // Mail Row Operations (delegated to message module)
    //

    pub async fn get_message(&self, id: i64) -> Result<Option<MailRow>> {
        message::get_message(&self.pool, id).await
    }

    pub async fn find_by_uidl(
        &self,
        mailbox_id: i64,
        folder_name: &str,
        uidl: &str,
    ) -> Result<Option<MailRow>> {
        message::find_by_uidl(&self.pool, mailbox_id, folder_name, uidl).await
    }

    pub async fn rows_by_uidl(
        &self,
        mailbox_id: i64,
        folder_name: &str,
    ) -> Result<HashMap<String, MailRow>> {
        message::rows_by_uidl(&self.pool, mailbox_id, folder_name).await
    }

    pub async fn find_by_mime_id(
        &self,
        mailbox_id: i64,
        folder: FolderRole,
        mime_message_id: &str,
    ) -> Result<Vec<MailRow>> {
        message::find_by_mime_id(&self.pool, mailbox_id, folder, mime_message_id).await
    }

    pub async fn insert_message(&self, message: &NewMessage) -> Result<i64> {
        message::insert_message(&self.pool, message).await
    }

    pub async fn update_uidl(&self, id: i64, folder_name: &str, uidl: &str) -> Result<()> {
        message::update_uidl(&self.pool, id, folder_name, uidl).await
    }

    pub async fn restore_message(&self, id: i64, folder_name: &str, uidl: &str) -> Result<()> {
        message::restore_message(&self.pool, id, folder_name, uidl).await
    }

    pub async fn set_unread(&self, ids: &[i64], unread: bool) -> Result<u64> {
        message::set_unread(&self.pool, ids, unread).await
    }

    pub async fn set_important(&self, ids: &[i64], important: bool) -> Result<u64> {
        message::set_important(&self.pool, ids, important).await
    }

    pub async fn set_removed(&self, ids: &[i64]) -> Result<u64> {
        message::set_removed(&self.pool, ids).await
    }

    pub async fn move_to_folder(&self, ids: &[i64], folder: FolderRole) -> Result<u64> {
        message::move_to_folder(&self.pool, ids, folder).await
    }

    pub async fn folder_counters(
        &self,
        mailbox_id: i64,
        folder: FolderRole,
    ) -> Result<FolderCounters> {
        message::folder_counters(&self.pool, mailbox_id, folder).await
    }

    pub async fn add_tags(&self, message_id: i64, tags: &[String]) -> Result<()> {
        message::add_tags(&self.pool, message_id, tags).await
    }

    pub async fn tags_for(&self, message_id: i64) -> Result<Vec<String>> {
        message::tags_for(&self.pool, message_id).await
    }

    pub async fn archive_raw(&self, message_id: i64, sha256: &str, raw: &[u8]) -> Result<()> {
        message::archive_raw(&self.pool, message_id, sha256, raw).await
    }

    pub async fn archived_hash(&self, message_id: i64) -> Result<Option<String>> {
        message::archived_hash(&self.pool, message_id).await
    }

    pub async fn record_calendar_invite(
        &self,
        message_id: i64,
        invite: &CalendarInvite,
    ) -> Result<()> {
        message::record_calendar_invite(&self.pool, message_id, invite).await
    }

    pub async fn calendar_invite(&self, message_id: i64) -> Result<Option<CalendarInvite>> {
        message::calendar_invite(&self.pool, message_id).await
    }

    //
    // Command Queue and Activity (delegated to command module)
    //

    pub async fn push_command(&self, user: &UserKey, action: &PendingAction) -> Result<i64> {
        command::push_command(&self.pool, user, action, chrono::Utc::now().timestamp()).await
    }

    pub async fn pop_commands(&self, user: &UserKey, limit: usize) -> Result<Vec<PendingAction>> {
        command::pop_commands(&self.pool, user, limit).await
    }

    pub async fn pending_command_count(&self, user: &UserKey) -> Result<usize> {
        command::pending_command_count(&self.pool, user).await
    }

    pub async fn touch_user(&self, user: &UserKey, now: i64) -> Result<()> {
        command::touch_user(&self.pool, user, now).await
    }

    pub async fn user_active_since(&self, user: &UserKey, since: i64) -> Result<bool> {
        command::user_active_since(&self.pool, user, since).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mail::types::{ActionKind, Credentials, Encryption};

    pub(crate) fn test_mailbox(user: &UserKey) -> NewMailbox {
        NewMailbox {
            user: user.clone(),
            address: format!("{}@example.com", user.user),
            host: "imap.example.com".to_string(),
            port: 993,
            encryption: Encryption::Tls,
            login: user.user.clone(),
            credentials: Credentials::Password("secret".to_string()),
        }
    }

    pub(crate) fn test_message(mailbox_id: i64, uidl: &str, mime_id: &str) -> NewMessage {
        NewMessage {
            mailbox_id,
            folder: FolderRole::Inbox,
            folder_name: "INBOX".to_string(),
            uidl: uidl.to_string(),
            mime_message_id: mime_id.to_string(),
            subject: "Hello".to_string(),
            from_addr: "bob@example.com".to_string(),
            date: Some(1_700_000_000),
            server_date: None,
            preview: None,
            is_unread: true,
            is_important: false,
            is_removed: false,
        }
    }

    #[tokio::test]
    async fn test_mailbox_lookup_and_auth_backoff() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = UserKey::new(1, "alice");
        let id = store.insert_mailbox(&test_mailbox(&alice)).await.unwrap();
        store
            .insert_mailbox(&test_mailbox(&UserKey::new(2, "alice")))
            .await
            .unwrap();

        let mailboxes = store.enabled_mailboxes(&alice, 1000).await.unwrap();
        assert_eq!(mailboxes.len(), 1);
        assert_eq!(mailboxes[0].id, id);
        assert_eq!(mailboxes[0].credentials, Credentials::Password("secret".to_string()));
        assert_eq!(mailboxes[0].domain(), "example.com");

        store.set_auth_error(id, 900).await.unwrap();
        assert!(store.enabled_mailboxes(&alice, 800).await.unwrap().is_empty());
        assert_eq!(store.enabled_mailboxes(&alice, 1000).await.unwrap().len(), 1);

        store.set_checked(id, 1200).await.unwrap();
        let mailbox = store.get_mailbox(id).await.unwrap().unwrap();
        assert_eq!(mailbox.checked_at, Some(1200));
        assert_eq!(mailbox.auth_error_at, None);

        store.set_enabled(id, false).await.unwrap();
        assert!(store.enabled_mailboxes(&alice, 1000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_port_skips_only_that_mailbox() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = UserKey::new(1, "alice");
        let broken = store.insert_mailbox(&test_mailbox(&alice)).await.unwrap();
        let healthy = store.insert_mailbox(&test_mailbox(&alice)).await.unwrap();

        sqlx::query("UPDATE mailboxes SET port = 70000 WHERE id = ?")
            .bind(broken)
            .execute(store.pool())
            .await
            .unwrap();

        let mailboxes = store.enabled_mailboxes(&alice, 1000).await.unwrap();
        assert_eq!(mailboxes.len(), 1);
        assert_eq!(mailboxes[0].id, healthy);
        assert_eq!(mailboxes[0].port, 993);
        assert!(store.get_mailbox(broken).await.is_err());
    }

    #[tokio::test]
    async fn test_folder_override_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store
            .insert_mailbox(&test_mailbox(&UserKey::new(1, "alice")))
            .await
            .unwrap();
        assert!(store.folder_overrides(id).await.unwrap().is_empty());

        let mut rule = FolderOverride {
            folder: "Receipts".to_string(),
            role: Some(FolderRole::Spam),
            skip: false,
            tags: vec!["finance".to_string(), "2024".to_string()],
        };
        store.set_folder_override(id, &rule).await.unwrap();
        assert_eq!(store.folder_overrides(id).await.unwrap(), vec![rule.clone()]);

        rule.role = None;
        rule.skip = true;
        rule.tags.clear();
        store.set_folder_override(id, &rule).await.unwrap();
        assert_eq!(store.folder_overrides(id).await.unwrap(), vec![rule]);
    }

    #[tokio::test]
    async fn test_advisory_lock() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store
            .insert_mailbox(&test_mailbox(&UserKey::new(1, "alice")))
            .await
            .unwrap();

        assert!(store.lock_mailbox(id).await.unwrap());
        assert!(!store.lock_mailbox(id).await.unwrap());
        assert!(store.is_locked(id).await.unwrap());
        store.unlock_mailbox(id).await.unwrap();
        assert!(store.lock_mailbox(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_message_lookup_and_batched_flags() {
        let store = Store::open_in_memory().await.unwrap();
        let mailbox_id = store
            .insert_mailbox(&test_mailbox(&UserKey::new(1, "alice")))
            .await
            .unwrap();

        let first = store
            .insert_message(&test_message(mailbox_id, "1-INBOX", "a@x"))
            .await
            .unwrap();
        let second = store
            .insert_message(&test_message(mailbox_id, "2-INBOX", "b@x"))
            .await
            .unwrap();

        let row = store
            .find_by_uidl(mailbox_id, "INBOX", "1-INBOX")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.id, first);
        assert!(row.is_unread);

        assert_eq!(store.set_unread(&[first, second], false).await.unwrap(), 2);
        assert_eq!(store.set_unread(&[first, second], false).await.unwrap(), 0);
        assert_eq!(store.set_important(&[second], true).await.unwrap(), 1);

        let counters = store
            .folder_counters(mailbox_id, FolderRole::Inbox)
            .await
            .unwrap();
        assert_eq!(counters, FolderCounters { total: 2, unread: 0 });

        store.set_removed(&[first]).await.unwrap();
        let counters = store
            .folder_counters(mailbox_id, FolderRole::Inbox)
            .await
            .unwrap();
        assert_eq!(counters.total, 1);

        let matches = store
            .find_by_mime_id(mailbox_id, FolderRole::Inbox, "a@x")
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].is_removed);

        store.restore_message(first, "INBOX", "9-INBOX").await.unwrap();
        let row = store.get_message(first).await.unwrap().unwrap();
        assert!(!row.is_removed);
        assert_eq!(row.uidl, "9-INBOX");

        let by_uidl = store.rows_by_uidl(mailbox_id, "INBOX").await.unwrap();
        assert_eq!(by_uidl.len(), 2);
        assert!(by_uidl.contains_key("9-INBOX"));
    }

    #[tokio::test]
    async fn test_tags_archive_and_invites() {
        let store = Store::open_in_memory().await.unwrap();
        let mailbox_id = store
            .insert_mailbox(&test_mailbox(&UserKey::new(1, "alice")))
            .await
            .unwrap();
        let id = store
            .insert_message(&test_message(mailbox_id, "1-INBOX", "a@x"))
            .await
            .unwrap();

        let tags = vec!["finance".to_string(), "receipts".to_string()];
        store.add_tags(id, &tags).await.unwrap();
        store.add_tags(id, &tags[..1]).await.unwrap();
        assert_eq!(store.tags_for(id).await.unwrap(), tags);

        store.archive_raw(id, "abc123", b"raw").await.unwrap();
        assert_eq!(store.archived_hash(id).await.unwrap().as_deref(), Some("abc123"));

        let invite = CalendarInvite {
            uid: Some("evt@x".to_string()),
            summary: None,
            ics: "BEGIN:VCALENDAR".to_string(),
        };
        store.record_calendar_invite(id, &invite).await.unwrap();
        assert_eq!(store.calendar_invite(id).await.unwrap(), Some(invite));
    }

    #[tokio::test]
    async fn test_command_queue_is_fifo_per_user() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = UserKey::new(1, "alice");
        let bob = UserKey::new(1, "bob");

        let first = PendingAction::new(ActionKind::MarkRead, 1, 10, FolderRole::Inbox);
        let second = PendingAction::new(ActionKind::MoveTo(FolderRole::Spam), 1, 11, FolderRole::Inbox);
        store.push_command(&alice, &first).await.unwrap();
        store
            .push_command(&bob, &PendingAction::new(ActionKind::Delete, 2, 20, FolderRole::Sent))
            .await
            .unwrap();
        store.push_command(&alice, &second).await.unwrap();

        assert_eq!(store.pop_commands(&alice, 1).await.unwrap(), vec![first]);
        assert_eq!(store.pop_commands(&alice, 10).await.unwrap(), vec![second]);
        assert!(store.pop_commands(&alice, 10).await.unwrap().is_empty());
        assert_eq!(store.pending_command_count(&bob).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_user_activity() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = UserKey::new(1, "alice");

        assert!(!store.user_active_since(&alice, 0).await.unwrap());
        store.touch_user(&alice, 500).await.unwrap();
        store.touch_user(&alice, 700).await.unwrap();
        assert!(store.user_active_since(&alice, 600).await.unwrap());
        assert!(!store.user_active_since(&alice, 701).await.unwrap());
    }
}
