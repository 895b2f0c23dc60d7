pub mod folder;
pub mod imap;
pub mod parser;
pub mod types;

pub use folder::{FolderAttribute, FolderMapping, RemoteFolder, detect_folder};
pub use types::{
    ActionKind, EmailFlags, FolderRole, MailboxAccount, MessageDescriptor, PendingAction, UserKey,
};
