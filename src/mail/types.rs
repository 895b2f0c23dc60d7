use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct EmailFlags: u32 {
        const SEEN = 0b00000001;
        const ANSWERED = 0b00000010;
        const FLAGGED = 0b00000100;
        const DELETED = 0b00001000;
        const DRAFT = 0b00010000;
    }
}

impl EmailFlags {
    /// IMAP system flag names for a STORE command, e.g. `\Seen \Flagged`.
    pub fn imap_list(self) -> String {
        let mut names = Vec::new();
        if self.contains(EmailFlags::SEEN) {
            names.push("\\Seen");
        }
        if self.contains(EmailFlags::ANSWERED) {
            names.push("\\Answered");
        }
        if self.contains(EmailFlags::FLAGGED) {
            names.push("\\Flagged");
        }
        if self.contains(EmailFlags::DELETED) {
            names.push("\\Deleted");
        }
        if self.contains(EmailFlags::DRAFT) {
            names.push("\\Draft");
        }
        names.join(" ")
    }
}

/// Logical category of a remote folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderRole {
    Inbox,
    Sent,
    Spam,
    Trash,
    /// Never tracked.
    Drafts,
    /// Tracked user-defined folder.
    Other,
}

impl FolderRole {
    /// Storage representation.
    pub fn id(self) -> i64 {
        match self {
            FolderRole::Inbox => 1,
            FolderRole::Sent => 2,
            FolderRole::Drafts => 3,
            FolderRole::Trash => 4,
            FolderRole::Spam => 5,
            FolderRole::Other => 6,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(FolderRole::Inbox),
            2 => Some(FolderRole::Sent),
            3 => Some(FolderRole::Drafts),
            4 => Some(FolderRole::Trash),
            5 => Some(FolderRole::Spam),
            6 => Some(FolderRole::Other),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "inbox" => Some(FolderRole::Inbox),
            "sent" => Some(FolderRole::Sent),
            "spam" | "junk" => Some(FolderRole::Spam),
            "trash" => Some(FolderRole::Trash),
            "drafts" => Some(FolderRole::Drafts),
            "other" => Some(FolderRole::Other),
            _ => None,
        }
    }
}

impl fmt::Display for FolderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FolderRole::Inbox => "inbox",
            FolderRole::Sent => "sent",
            FolderRole::Spam => "spam",
            FolderRole::Trash => "trash",
            FolderRole::Drafts => "drafts",
            FolderRole::Other => "other",
        };
        f.write_str(name)
    }
}

/// Identity of a local user across tenants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserKey {
    pub tenant: i64,
    pub user: String,
}

impl UserKey {
    pub fn new(tenant: i64, user: impl Into<String>) -> Self {
        Self {
            tenant,
            user: user.into(),
        }
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.user)
    }
}

/// Snapshot of one remote message as last seen by its Folder Session.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDescriptor {
    pub uid: u32,
    /// 1-based message sequence number in the selected folder.
    pub index: u32,
    pub flags: EmailFlags,
    pub server_date: Option<DateTime<Utc>>,
    local_id: Option<i64>,
}

impl MessageDescriptor {
    pub fn new(uid: u32, index: u32, flags: EmailFlags, server_date: Option<DateTime<Utc>>) -> Self {
        Self {
            uid,
            index,
            flags,
            server_date,
            local_id: None,
        }
    }

    pub fn local_id(&self) -> Option<i64> {
        self.local_id
    }

    pub fn is_resolved(&self) -> bool {
        self.local_id.is_some()
    }

    /// Attach the local row id. Once set the id never changes; a later
    /// attempt with a different id is refused and returns `false`.
    pub fn resolve(&mut self, id: i64) -> bool {
        match self.local_id {
            None => {
                self.local_id = Some(id);
                true
            }
            Some(existing) => existing == id,
        }
    }

    pub fn is_seen(&self) -> bool {
        self.flags.contains(EmailFlags::SEEN)
    }

    pub fn is_flagged(&self) -> bool {
        self.flags.contains(EmailFlags::FLAGGED)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(EmailFlags::DELETED)
    }
}

/// Join key between a remote message and a local row.
pub fn uidl(uid: u32, folder_name: &str) -> String {
    format!("{}-{}", uid, folder_name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    MarkRead,
    MarkUnread,
    MarkImportant,
    MarkUnimportant,
    Delete,
    MoveTo(FolderRole),
}

impl ActionKind {
    pub fn affects_unread(self) -> bool {
        matches!(
            self,
            ActionKind::MarkRead | ActionKind::MarkUnread | ActionKind::Delete | ActionKind::MoveTo(_)
        )
    }

    /// Storage representation: `(kind, target folder)`.
    pub fn to_parts(self) -> (&'static str, Option<i64>) {
        match self {
            ActionKind::MarkRead => ("mark-read", None),
            ActionKind::MarkUnread => ("mark-unread", None),
            ActionKind::MarkImportant => ("mark-important", None),
            ActionKind::MarkUnimportant => ("mark-unimportant", None),
            ActionKind::Delete => ("delete", None),
            ActionKind::MoveTo(role) => ("move-to", Some(role.id())),
        }
    }

    pub fn from_parts(kind: &str, target: Option<i64>) -> Option<Self> {
        match kind {
            "mark-read" => Some(ActionKind::MarkRead),
            "mark-unread" => Some(ActionKind::MarkUnread),
            "mark-important" => Some(ActionKind::MarkImportant),
            "mark-unimportant" => Some(ActionKind::MarkUnimportant),
            "delete" => Some(ActionKind::Delete),
            "move-to" => target.and_then(FolderRole::from_id).map(ActionKind::MoveTo),
            _ => None,
        }
    }
}

/// A unit of synchronization work, either detected on the server and bound
/// for storage (inbound) or issued elsewhere and bound for the server
/// (outbound).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    pub kind: ActionKind,
    pub mailbox_id: i64,
    pub message_id: i64,
    pub folder: FolderRole,
}

impl PendingAction {
    pub fn new(kind: ActionKind, mailbox_id: i64, message_id: i64, folder: FolderRole) -> Self {
        Self {
            kind,
            mailbox_id,
            message_id,
            folder,
        }
    }
}

/// Seen/flagged transitions between two flag sets, in that order.
/// Each changed bit yields exactly one action; unchanged bits yield none.
pub fn flag_transitions(before: EmailFlags, after: EmailFlags) -> Vec<ActionKind> {
    let mut actions = Vec::new();

    let was_seen = before.contains(EmailFlags::SEEN);
    let is_seen = after.contains(EmailFlags::SEEN);
    if was_seen != is_seen {
        actions.push(if is_seen {
            ActionKind::MarkRead
        } else {
            ActionKind::MarkUnread
        });
    }

    let was_flagged = before.contains(EmailFlags::FLAGGED);
    let is_flagged = after.contains(EmailFlags::FLAGGED);
    if was_flagged != is_flagged {
        actions.push(if is_flagged {
            ActionKind::MarkImportant
        } else {
            ActionKind::MarkUnimportant
        });
    }

    actions
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    None,
    #[default]
    Tls,
    StartTls,
}

impl Encryption {
    pub fn id(self) -> i64 {
        match self {
            Encryption::None => 0,
            Encryption::Tls => 1,
            Encryption::StartTls => 2,
        }
    }

    pub fn from_id(id: i64) -> Self {
        match id {
            0 => Encryption::None,
            2 => Encryption::StartTls,
            _ => Encryption::Tls,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password(String),
    /// OAuth access token presented through XOAUTH2.
    Bearer(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(***)"),
            Credentials::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

/// One remote mail account as read from storage.
#[derive(Debug, Clone)]
pub struct MailboxAccount {
    pub id: i64,
    pub user: UserKey,
    pub address: String,
    pub host: String,
    pub port: u16,
    pub encryption: Encryption,
    pub login: String,
    pub credentials: Credentials,
    pub enabled: bool,
    pub checked_at: Option<i64>,
    pub auth_error_at: Option<i64>,
}

impl MailboxAccount {
    /// Domain part of the address, used for per-provider folder overrides.
    pub fn domain(&self) -> &str {
        self.address
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or(&self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_only_for_changed_bits() {
        assert!(flag_transitions(EmailFlags::SEEN, EmailFlags::SEEN).is_empty());
        assert!(flag_transitions(EmailFlags::SEEN, EmailFlags::SEEN | EmailFlags::ANSWERED).is_empty());
        assert_eq!(
            flag_transitions(EmailFlags::empty(), EmailFlags::SEEN),
            vec![ActionKind::MarkRead]
        );
        assert_eq!(
            flag_transitions(EmailFlags::SEEN | EmailFlags::FLAGGED, EmailFlags::empty()),
            vec![ActionKind::MarkUnread, ActionKind::MarkUnimportant]
        );
        assert_eq!(
            flag_transitions(EmailFlags::SEEN, EmailFlags::SEEN | EmailFlags::FLAGGED),
            vec![ActionKind::MarkImportant]
        );
    }

    #[test]
    fn test_transition_sequence_counts_real_changes() {
        let observed = [
            EmailFlags::empty(),
            EmailFlags::SEEN,
            EmailFlags::SEEN,
            EmailFlags::SEEN | EmailFlags::FLAGGED,
            EmailFlags::SEEN | EmailFlags::FLAGGED,
            EmailFlags::FLAGGED,
        ];
        let emitted: usize = observed
            .windows(2)
            .map(|pair| flag_transitions(pair[0], pair[1]).len())
            .sum();
        assert_eq!(emitted, 3);
    }

    #[test]
    fn test_descriptor_local_id_is_set_once() {
        let mut descriptor = MessageDescriptor::new(7, 1, EmailFlags::empty(), None);
        assert!(!descriptor.is_resolved());
        assert!(descriptor.resolve(42));
        assert!(descriptor.resolve(42));
        assert!(!descriptor.resolve(43));
        assert_eq!(descriptor.local_id(), Some(42));
    }

    #[test]
    fn test_action_kind_storage_parts() {
        for kind in [
            ActionKind::MarkRead,
            ActionKind::MarkUnimportant,
            ActionKind::Delete,
            ActionKind::MoveTo(FolderRole::Spam),
        ] {
            let (name, target) = kind.to_parts();
            assert_eq!(ActionKind::from_parts(name, target), Some(kind));
        }
        assert_eq!(ActionKind::from_parts("move-to", None), None);
    }

    #[test]
    fn test_imap_flag_list() {
        assert_eq!((EmailFlags::SEEN | EmailFlags::FLAGGED).imap_list(), "\\Seen \\Flagged");
        assert_eq!(EmailFlags::empty().imap_list(), "");
    }

    #[test]
    fn test_uidl_is_deterministic() {
        assert_eq!(uidl(12, "INBOX"), "12-INBOX");
        assert_ne!(uidl(12, "INBOX"), uidl(12, "Sent"));
    }
}
