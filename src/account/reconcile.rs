//! Map remote message identity and flags onto local mail rows.
//!
//! Rows are matched by `uidl` first. When a server hands out a new UID for
//! a message that is already stored (UID reuse across reconnects, or a move
//! recorded locally before the server copy showed up), the row is found
//! again through its `Message-ID` and rebound instead of duplicated.

use std::collections::HashSet;

use crate::error::{Result, SyncError};
use crate::mail::folder::FolderMapping;
use crate::mail::parser::ParsedMessage;
use crate::mail::types::{MessageDescriptor, uidl};
use crate::store::{MailRow, NewMessage, Store};

/// Outcome of [`reconcile_new_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Inserted(i64),
    /// A soft-deleted row came back.
    Restored(i64),
    /// An existing live row was rebound or already matched.
    Updated(i64),
}

impl Reconciled {
    pub fn id(self) -> i64 {
        match self {
            Reconciled::Inserted(id) | Reconciled::Restored(id) | Reconciled::Updated(id) => id,
        }
    }
}

/// Reconcile a freshly downloaded message. `attached` holds row ids already
/// bound to live descriptors of any folder of the mailbox; those rows are
/// never taken over by another UID.
pub async fn reconcile_new_message(
    store: &Store,
    mailbox_id: i64,
    folder: &FolderMapping,
    descriptor: &MessageDescriptor,
    parsed: &ParsedMessage,
    attached: &HashSet<i64>,
) -> Result<Reconciled> {
    if !folder.is_tracked() {
        return Err(SyncError::Reconciliation(format!(
            "folder '{}' ({}) is not tracked",
            folder.name, folder.role
        )));
    }

    let uidl = uidl(descriptor.uid, &folder.name);
    if let Some(row) = store.find_by_uidl(mailbox_id, &folder.name, &uidl).await? {
        reconcile_flags(store, descriptor, &row).await?;
        return Ok(Reconciled::Updated(row.id));
    }

    let mut candidates: Vec<MailRow> = store
        .find_by_mime_id(mailbox_id, folder.role, &parsed.mime_message_id)
        .await?
        .into_iter()
        .filter(|row| !attached.contains(&row.id))
        .collect();
    // Soft-deleted rows first, then rows from this physical folder.
    candidates.sort_by_key(|row| (!row.is_removed, row.folder_name != folder.name, row.id));

    if let Some(mut row) = candidates.into_iter().next() {
        if row.is_removed {
            store.restore_message(row.id, &folder.name, &uidl).await?;
            row.is_removed = false;
            tracing::debug!("Restored message {} as {}", row.id, uidl);
            reconcile_flags(store, descriptor, &row).await?;
            return Ok(Reconciled::Restored(row.id));
        }

        tracing::debug!("Rebinding message {} from {} to {}", row.id, row.uidl, uidl);
        store.update_uidl(row.id, &folder.name, &uidl).await?;
        reconcile_flags(store, descriptor, &row).await?;
        return Ok(Reconciled::Updated(row.id));
    }

    let id = store
        .insert_message(&NewMessage {
            mailbox_id,
            folder: folder.role,
            folder_name: folder.name.clone(),
            uidl,
            mime_message_id: parsed.mime_message_id.clone(),
            subject: parsed.subject.clone(),
            from_addr: parsed.from_addr.clone(),
            date: parsed.date,
            server_date: descriptor.server_date.map(|d| d.timestamp()),
            preview: parsed.preview.clone(),
            is_unread: !descriptor.is_seen(),
            is_important: descriptor.is_flagged(),
            is_removed: descriptor.is_deleted(),
        })
        .await?;
    Ok(Reconciled::Inserted(id))
}

/// Bring a row's unread/important/removed state in line with the
/// descriptor's flags. A removal is applied alone. Returns `true` when
/// anything the unread counters depend on changed.
pub async fn reconcile_flags(
    store: &Store,
    descriptor: &MessageDescriptor,
    row: &MailRow,
) -> Result<bool> {
    if descriptor.is_deleted() {
        if row.is_removed {
            return Ok(false);
        }
        return Ok(store.set_removed(&[row.id]).await? > 0);
    }

    let mut changed = false;
    if row.is_removed {
        store.restore_message(row.id, &row.folder_name, &row.uidl).await?;
        changed = true;
    }

    let unread = !descriptor.is_seen();
    if row.is_unread != unread {
        changed |= store.set_unread(&[row.id], unread).await? > 0;
    }

    let important = descriptor.is_flagged();
    if row.is_important != important {
        store.set_important(&[row.id], important).await?;
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::types::{EmailFlags, FolderRole, UserKey};
    use crate::store::FolderCounters;
    use crate::store::tests::{test_mailbox, test_message};

    async fn setup() -> (Store, i64) {
        let store = Store::open_in_memory().await.unwrap();
        let mailbox_id = store
            .insert_mailbox(&test_mailbox(&UserKey::new(1, "alice")))
            .await
            .unwrap();
        (store, mailbox_id)
    }

    fn inbox() -> FolderMapping {
        FolderMapping::new("INBOX", FolderRole::Inbox)
    }

    fn parsed(mime_id: &str) -> ParsedMessage {
        ParsedMessage {
            mime_message_id: mime_id.to_string(),
            subject: "Hello".to_string(),
            from_addr: "bob@example.com".to_string(),
            ..ParsedMessage::default()
        }
    }

    #[tokio::test]
    async fn test_reconciling_twice_keeps_one_row() {
        let (store, mailbox_id) = setup().await;
        let descriptor = MessageDescriptor::new(5, 1, EmailFlags::empty(), None);
        let none = HashSet::new();

        let first = reconcile_new_message(&store, mailbox_id, &inbox(), &descriptor, &parsed("m@x"), &none)
            .await
            .unwrap();
        assert!(matches!(first, Reconciled::Inserted(_)));

        let second = reconcile_new_message(&store, mailbox_id, &inbox(), &descriptor, &parsed("m@x"), &none)
            .await
            .unwrap();
        assert_eq!(second, Reconciled::Updated(first.id()));

        let counters = store.folder_counters(mailbox_id, FolderRole::Inbox).await.unwrap();
        assert_eq!(counters, FolderCounters { total: 1, unread: 1 });
    }

    #[tokio::test]
    async fn test_flags_round_trip() {
        let (store, mailbox_id) = setup().await;
        let mut descriptor = MessageDescriptor::new(5, 1, EmailFlags::empty(), None);
        let id = reconcile_new_message(&store, mailbox_id, &inbox(), &descriptor, &parsed("m@x"), &HashSet::new())
            .await
            .unwrap()
            .id();

        let row = store.get_message(id).await.unwrap().unwrap();
        assert!(row.is_unread);
        assert!(!row.is_important);

        descriptor.flags = EmailFlags::SEEN | EmailFlags::FLAGGED;
        assert!(reconcile_flags(&store, &descriptor, &row).await.unwrap());

        let row = store.get_message(id).await.unwrap().unwrap();
        assert!(!row.is_unread);
        assert!(row.is_important);
        assert!(!row.is_removed);
    }

    #[tokio::test]
    async fn test_removal_takes_precedence() {
        let (store, mailbox_id) = setup().await;
        let id = store
            .insert_message(&test_message(mailbox_id, "1-INBOX", "m@x"))
            .await
            .unwrap();
        let row = store.get_message(id).await.unwrap().unwrap();

        let descriptor = MessageDescriptor::new(1, 1, EmailFlags::SEEN | EmailFlags::DELETED, None);
        assert!(reconcile_flags(&store, &descriptor, &row).await.unwrap());

        let row = store.get_message(id).await.unwrap().unwrap();
        assert!(row.is_removed);
        // Seen was not applied alongside the removal.
        assert!(row.is_unread);
    }

    #[tokio::test]
    async fn test_new_uid_prefers_soft_deleted_row() {
        let (store, mailbox_id) = setup().await;
        let live = store
            .insert_message(&test_message(mailbox_id, "1-INBOX", "m@x"))
            .await
            .unwrap();
        let removed = store
            .insert_message(&test_message(mailbox_id, "2-INBOX", "m@x"))
            .await
            .unwrap();
        store.set_removed(&[removed]).await.unwrap();

        let descriptor = MessageDescriptor::new(9, 1, EmailFlags::SEEN, None);
        let outcome = reconcile_new_message(&store, mailbox_id, &inbox(), &descriptor, &parsed("m@x"), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(outcome, Reconciled::Restored(removed));

        let row = store.get_message(removed).await.unwrap().unwrap();
        assert_eq!(row.uidl, "9-INBOX");
        assert!(!row.is_removed);
        assert!(!row.is_unread);

        let untouched = store.get_message(live).await.unwrap().unwrap();
        assert_eq!(untouched.uidl, "1-INBOX");
    }

    #[tokio::test]
    async fn test_attached_rows_are_not_taken_over() {
        let (store, mailbox_id) = setup().await;
        let live = store
            .insert_message(&test_message(mailbox_id, "1-INBOX", "m@x"))
            .await
            .unwrap();

        let descriptor = MessageDescriptor::new(2, 2, EmailFlags::empty(), None);
        let attached = HashSet::from([live]);
        let outcome = reconcile_new_message(&store, mailbox_id, &inbox(), &descriptor, &parsed("m@x"), &attached)
            .await
            .unwrap();
        assert!(matches!(outcome, Reconciled::Inserted(id) if id != live));

        // Without the attachment the live row is rebound instead.
        let descriptor = MessageDescriptor::new(3, 3, EmailFlags::empty(), None);
        let outcome = reconcile_new_message(&store, mailbox_id, &inbox(), &descriptor, &parsed("m@x"), &HashSet::from([outcome.id()]))
            .await
            .unwrap();
        assert_eq!(outcome, Reconciled::Updated(live));
        assert_eq!(store.get_message(live).await.unwrap().unwrap().uidl, "3-INBOX");
    }

    #[tokio::test]
    async fn test_untracked_folder_is_rejected() {
        let (store, mailbox_id) = setup().await;
        let drafts = FolderMapping::new("Drafts", FolderRole::Drafts);
        let descriptor = MessageDescriptor::new(1, 1, EmailFlags::empty(), None);

        let err = reconcile_new_message(&store, mailbox_id, &drafts, &descriptor, &parsed("m@x"), &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Reconciliation(_)));
    }
}
