//! Inbound action queue and batching toward storage.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;

use crate::mail::types::{ActionKind, FolderRole, PendingAction};
use crate::store::Store;

/// Consecutive actions sharing mailbox, folder and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionBatch {
    pub kind: ActionKind,
    pub mailbox_id: i64,
    pub folder: FolderRole,
    pub message_ids: Vec<i64>,
}

impl ActionBatch {
    fn accepts(&self, action: &PendingAction) -> bool {
        self.kind == action.kind
            && self.mailbox_id == action.mailbox_id
            && self.folder == action.folder
    }
}

/// Merge runs of consecutive actions with the same `(mailbox, folder, kind)`.
/// Order is preserved; non-adjacent repeats stay separate batches.
pub fn coalesce(actions: impl IntoIterator<Item = PendingAction>) -> Vec<ActionBatch> {
    let mut batches: Vec<ActionBatch> = Vec::new();
    for action in actions {
        match batches.last_mut() {
            Some(batch) if batch.accepts(&action) => {
                if !batch.message_ids.contains(&action.message_id) {
                    batch.message_ids.push(action.message_id);
                }
            }
            _ => batches.push(ActionBatch {
                kind: action.kind,
                mailbox_id: action.mailbox_id,
                folder: action.folder,
                message_ids: vec![action.message_id],
            }),
        }
    }
    batches
}

/// Actions detected by folder sessions, waiting for the next drain pass.
#[derive(Debug, Default)]
pub struct InboundQueue {
    actions: Mutex<VecDeque<PendingAction>>,
}

impl InboundQueue {
    pub fn push_many(&self, actions: Vec<PendingAction>) {
        let mut queue = self.actions.lock().unwrap_or_else(|e| e.into_inner());
        queue.extend(actions);
    }

    pub fn take_all(&self) -> Vec<PendingAction> {
        let mut queue = self.actions.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.actions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Apply one batch with a single storage call. Returns `true` when the
/// batch changed anything the unread counters depend on.
pub async fn apply_batch(store: &Store, batch: &ActionBatch) -> Result<bool> {
    let ids = &batch.message_ids;
    let changed = match batch.kind {
        ActionKind::MarkRead => store.set_unread(ids, false).await?,
        ActionKind::MarkUnread => store.set_unread(ids, true).await?,
        ActionKind::MarkImportant => store.set_important(ids, true).await?,
        ActionKind::MarkUnimportant => store.set_important(ids, false).await?,
        ActionKind::Delete => store.set_removed(ids).await?,
        ActionKind::MoveTo(role) => store.move_to_folder(ids, role).await?,
    };

    tracing::debug!(
        "Applied {:?} to {} of {} messages in {}:{}",
        batch.kind,
        changed,
        ids.len(),
        batch.mailbox_id,
        batch.folder
    );
    Ok(changed > 0 && batch.kind.affects_unread())
}
