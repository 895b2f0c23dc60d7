//! Folder-role detection.
//!
//! Maps a discovered remote folder onto a logical [`FolderRole`] from its
//! server attributes (RFC 6154 special-use, XLIST) and its name.

use std::collections::HashMap;

use crate::config::FolderRules;

use super::types::FolderRole;

/// Server-declared folder attribute, independent of the protocol library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderAttribute {
    Inbox,
    Sent,
    Junk,
    Trash,
    Drafts,
    Archive,
    Flagged,
    All,
    NoSelect,
    NonExistent,
    Other(String),
}

impl FolderAttribute {
    /// Parse a raw attribute such as `\Sent` or `\Spam`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim_start_matches('\\').to_lowercase().as_str() {
            "inbox" => FolderAttribute::Inbox,
            "sent" => FolderAttribute::Sent,
            "junk" | "spam" => FolderAttribute::Junk,
            "trash" => FolderAttribute::Trash,
            "drafts" => FolderAttribute::Drafts,
            "archive" => FolderAttribute::Archive,
            "flagged" | "starred" | "important" => FolderAttribute::Flagged,
            "all" | "allmail" => FolderAttribute::All,
            "noselect" => FolderAttribute::NoSelect,
            "nonexistent" => FolderAttribute::NonExistent,
            _ => FolderAttribute::Other(raw.to_string()),
        }
    }

    fn is_exclusionary(&self) -> bool {
        matches!(
            self,
            FolderAttribute::Drafts
                | FolderAttribute::Archive
                | FolderAttribute::Flagged
                | FolderAttribute::All
                | FolderAttribute::NoSelect
                | FolderAttribute::NonExistent
        )
    }
}

/// A remote folder as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub name: String,
    pub attributes: Vec<FolderAttribute>,
}

/// Result of role detection for one physical folder. Immutable for the
/// lifetime of the session that tracks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderMapping {
    pub name: String,
    pub role: FolderRole,
    /// Tags auto-applied to messages landing in this folder.
    pub tags: Vec<String>,
    pub skip: bool,
}

impl FolderMapping {
    pub fn new(name: impl Into<String>, role: FolderRole) -> Self {
        Self {
            name: name.into(),
            role,
            tags: Vec::new(),
            skip: false,
        }
    }

    /// Whether this folder gets its own Folder Session.
    pub fn is_tracked(&self) -> bool {
        !self.skip && !matches!(self.role, FolderRole::Trash | FolderRole::Drafts)
    }
}

/// Localized folder names recognized without server attributes.
const NAME_TABLE: &[(&str, FolderRole)] = &[
    ("inbox", FolderRole::Inbox),
    ("sent", FolderRole::Sent),
    ("sent items", FolderRole::Sent),
    ("sent mail", FolderRole::Sent),
    ("sent messages", FolderRole::Sent),
    ("gesendet", FolderRole::Sent),
    ("gesendete elemente", FolderRole::Sent),
    ("envoyés", FolderRole::Sent),
    ("enviados", FolderRole::Sent),
    ("отправленные", FolderRole::Sent),
    ("spam", FolderRole::Spam),
    ("junk", FolderRole::Spam),
    ("junk e-mail", FolderRole::Spam),
    ("junk email", FolderRole::Spam),
    ("bulk mail", FolderRole::Spam),
    ("correo basura", FolderRole::Spam),
    ("спам", FolderRole::Spam),
    ("trash", FolderRole::Trash),
    ("bin", FolderRole::Trash),
    ("deleted items", FolderRole::Trash),
    ("deleted messages", FolderRole::Trash),
    ("papierkorb", FolderRole::Trash),
    ("corbeille", FolderRole::Trash),
    ("papelera", FolderRole::Trash),
    ("корзина", FolderRole::Trash),
    ("drafts", FolderRole::Drafts),
    ("draft", FolderRole::Drafts),
    ("entwürfe", FolderRole::Drafts),
    ("brouillons", FolderRole::Drafts),
    ("черновики", FolderRole::Drafts),
];

/// Candidate keys for name lookups: the full name and its last hierarchy
/// segment, lowercased. `[Gmail]/Sent Mail` yields both forms.
fn name_keys(name: &str) -> Vec<String> {
    let full = name.to_lowercase();
    let mut keys = vec![full.clone()];
    if let Some(last) = full.rsplit(['/', '.']).next()
        && last != full
        && !last.is_empty()
    {
        keys.push(last.to_string());
    }
    keys
}

fn lookup(table: &HashMap<String, FolderRole>, keys: &[String]) -> Option<FolderRole> {
    keys.iter().find_map(|key| {
        table
            .iter()
            .find(|(name, _)| name.to_lowercase() == *key)
            .map(|(_, role)| *role)
    })
}

/// Assign a logical role to a discovered folder.
///
/// Precedence: skip list, Inbox/Sent/Junk attribute, Trash attribute,
/// exclusionary attributes, name table (configured entries first), then the
/// per-domain overrides, finally `Other`.
pub fn detect_folder(
    name: &str,
    attributes: &[FolderAttribute],
    domain: &str,
    rules: &FolderRules,
) -> FolderMapping {
    let mut mapping = FolderMapping::new(name, FolderRole::Other);
    mapping.tags = rules.tags_for(name);

    if rules.skip.iter().any(|s| s.eq_ignore_ascii_case(name)) {
        mapping.skip = true;
        return mapping;
    }

    for attr in attributes {
        let role = match attr {
            FolderAttribute::Inbox => FolderRole::Inbox,
            FolderAttribute::Sent => FolderRole::Sent,
            FolderAttribute::Junk => FolderRole::Spam,
            _ => continue,
        };
        mapping.role = role;
        return mapping;
    }

    if attributes.contains(&FolderAttribute::Trash) {
        mapping.role = FolderRole::Trash;
        return mapping;
    }

    if let Some(attr) = attributes.iter().find(|a| a.is_exclusionary()) {
        tracing::debug!("Folder '{}' excluded by attribute {:?}", name, attr);
        mapping.role = if *attr == FolderAttribute::Drafts {
            FolderRole::Drafts
        } else {
            FolderRole::Other
        };
        mapping.skip = true;
        return mapping;
    }

    let keys = name_keys(name);

    let configured = lookup(&rules.names, &keys);
    let builtin = || {
        keys.iter().find_map(|key| {
            NAME_TABLE
                .iter()
                .find(|(candidate, _)| candidate == key)
                .map(|(_, role)| *role)
        })
    };
    if let Some(role) = configured.or_else(builtin) {
        mapping.role = role;
        return mapping;
    }

    if let Some(role) = rules
        .domains
        .iter()
        .filter(|o| o.domain.eq_ignore_ascii_case(domain))
        .find_map(|o| lookup(&o.names, &keys))
    {
        mapping.role = role;
        return mapping;
    }

    mapping
}
