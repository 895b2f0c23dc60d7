use std::collections::{HashMap, HashSet};

use crate::config::FolderRules;
use crate::mail::folder::FolderMapping;
use crate::mail::imap::{FolderSessionHandle, SessionState};
use crate::mail::types::{FolderRole, MailboxAccount};

/// Folder Sessions of one enabled mailbox
pub struct MailboxSessions {
    /// Account as read at the time the mailbox was locked
    pub account: MailboxAccount,
    /// Folder rules with this mailbox's stored overrides applied
    pub rules: FolderRules,
    /// Inbox session; also performs folder discovery
    root: FolderSessionHandle,
    /// Sessions for the other tracked folders, keyed by server name
    folders: HashMap<String, FolderSessionHandle>,
    /// Last discovery result
    mappings: Vec<FolderMapping>,
    /// Destination for deletes, when the server has one
    trash: Option<String>,
    /// Local ids bound to live descriptors, per folder
    bound: HashMap<String, HashSet<i64>>,
}

impl MailboxSessions {
    pub fn new(account: MailboxAccount, rules: FolderRules, root: FolderSessionHandle) -> Self {
        Self {
            account,
            rules,
            root,
            folders: HashMap::new(),
            mappings: Vec::new(),
            trash: None,
            bound: HashMap::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.account.id
    }

    /// Record discovery results.
    pub fn set_discovered(&mut self, mappings: Vec<FolderMapping>) {
        self.trash = mappings
            .iter()
            .find(|m| m.role == FolderRole::Trash && !m.skip)
            .map(|m| m.name.clone());
        self.mappings = mappings;
    }

    /// The root session has reported the folder list.
    pub fn is_discovered(&self) -> bool {
        !self.mappings.is_empty()
    }

    /// Whether messages in this folder are synchronized by some session.
    pub fn tracks(&self, folder: &str) -> bool {
        folder.eq_ignore_ascii_case(&self.root.folder.name)
            || self
                .mappings
                .iter()
                .any(|m| m.is_tracked() && m.name == folder)
    }

    pub fn trash(&self) -> Option<&str> {
        self.trash.as_deref()
    }

    /// Server name of the first folder with this role.
    pub fn folder_for_role(&self, role: FolderRole) -> Option<&str> {
        if role == FolderRole::Trash {
            return self.trash();
        }
        if role == FolderRole::Inbox {
            return Some(self.root.folder.name.as_str());
        }
        self.mappings
            .iter()
            .find(|m| m.role == role && !m.skip)
            .map(|m| m.name.as_str())
    }

    /// Session owning a physical folder. IMAP folder names are compared
    /// exactly, except INBOX which is case-insensitive.
    pub fn session(&self, folder: &str) -> Option<&FolderSessionHandle> {
        if folder.eq_ignore_ascii_case(&self.root.folder.name) {
            return Some(&self.root);
        }
        self.folders.get(folder)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &FolderSessionHandle> {
        std::iter::once(&self.root).chain(self.folders.values())
    }

    pub fn insert(&mut self, handle: FolderSessionHandle) {
        self.folders.insert(handle.folder.name.clone(), handle);
    }

    /// Tracked folders from discovery that have no session yet.
    pub fn missing_folders(&self) -> Vec<FolderMapping> {
        let mut missing: Vec<FolderMapping> = Vec::new();
        for mapping in self.mappings.iter().filter(|m| m.is_tracked()) {
            if self.session(&mapping.name).is_none()
                && !missing.iter().any(|m| m.name == mapping.name)
            {
                missing.push(mapping.clone());
            }
        }
        missing
    }

    pub fn root_failed(&self) -> bool {
        self.root.is_finished()
    }

    /// Remove finished folder sessions so the next pass can recreate them.
    pub fn reap_failed(&mut self) -> Vec<FolderSessionHandle> {
        let failed: Vec<String> = self
            .folders
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        failed
            .into_iter()
            .filter_map(|name| {
                self.bound.remove(&name);
                self.folders.remove(&name)
            })
            .collect()
    }

    pub fn bind(&mut self, folder: &str, ids: impl IntoIterator<Item = i64>) {
        self.bound.entry(folder.to_string()).or_default().extend(ids);
    }

    pub fn release(&mut self, folder: &str, ids: &[i64]) {
        if let Some(bound) = self.bound.get_mut(folder) {
            for id in ids {
                bound.remove(id);
            }
        }
    }

    /// Every local id bound to a live descriptor of this mailbox.
    pub fn bound_ids(&self) -> HashSet<i64> {
        self.bound.values().flatten().copied().collect()
    }

    pub fn session_count(&self) -> usize {
        1 + self.folders.len()
    }

    pub fn is_usable(&self) -> bool {
        self.sessions().any(|s| {
            !matches!(
                s.state(),
                SessionState::Failed(_) | SessionState::Closing
            )
        })
    }

    /// Hand over every session for shutdown.
    pub fn into_sessions(self) -> Vec<FolderSessionHandle> {
        let mut sessions = vec![self.root];
        sessions.extend(self.folders.into_values());
        sessions
    }
}
