//! IMAP connection seam and the per-folder session actor.
//!
//! This module is split into:
//! - `mod.rs` - Protocol-neutral traits and types shared by sessions
//! - `client.rs` - The async-imap implementation of [`Connector`]
//! - `session.rs` - Folder Session actor: state machine, IDLE/poll loop, command FIFO

mod client;
pub mod session;

#[cfg(test)]
pub(crate) mod fake;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::constants::UID_BATCH_SIZE;
use crate::error::SessionError;

use super::folder::RemoteFolder;
use super::types::{EmailFlags, MailboxAccount};

pub use client::ImapConnector;
pub use session::{
    FolderSessionHandle, SessionCommand, SessionObserver, SessionSpec, SessionState,
    spawn_folder_session,
};

/// XOAUTH2 authenticator for IMAP
pub(crate) struct XOAuth2Authenticator {
    pub user: String,
    pub access_token: String,
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        // XOAUTH2 format: "user=" + user + "\x01auth=Bearer " + token + "\x01\x01"
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// Result of selecting a folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderStatus {
    pub exists: u32,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
}

/// One line of a folder listing: `UID FLAGS INTERNALDATE` by sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSummary {
    pub uid: u32,
    pub index: u32,
    pub flags: EmailFlags,
    pub server_date: Option<DateTime<Utc>>,
}

/// Unsolicited change reported by the server while a folder is selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// `* n EXISTS`
    CountChanged(u32),
    /// `* n FETCH (FLAGS (...))`
    FlagsChanged { index: u32, flags: EmailFlags },
    /// `* n EXPUNGE`
    Expunged(u32),
}

/// Wakes a session out of a push-wait, either for new work or for shutdown.
#[derive(Debug, Clone)]
pub struct Interrupt {
    pub wake: Arc<Notify>,
    pub cancel: CancellationToken,
}

impl Interrupt {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            wake: Arc::new(Notify::new()),
            cancel,
        }
    }

    pub async fn wait(&self) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Opens authenticated connections for a mailbox.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        account: &MailboxAccount,
    ) -> Result<Box<dyn MailConnection>, SessionError>;
}

/// One authenticated protocol connection. A connection has at most one
/// selected folder and is driven by a single Folder Session.
#[async_trait]
pub trait MailConnection: Send {
    /// Whether the server advertises push notifications (IDLE).
    fn supports_idle(&self) -> bool;

    async fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, SessionError>;

    async fn select(&mut self, folder: &str) -> Result<FolderStatus, SessionError>;

    /// UID, flags and server date of every message in the selected folder.
    async fn fetch_summaries(&mut self) -> Result<Vec<MessageSummary>, SessionError>;

    /// Full RFC 822 source without setting `\Seen`. `None` when the UID is gone.
    async fn fetch_body(&mut self, uid: u32) -> Result<Option<Vec<u8>>, SessionError>;

    async fn add_flags(&mut self, uids: &[u32], flags: EmailFlags) -> Result<(), SessionError>;

    async fn remove_flags(&mut self, uids: &[u32], flags: EmailFlags) -> Result<(), SessionError>;

    async fn move_messages(&mut self, uids: &[u32], destination: &str)
    -> Result<(), SessionError>;

    /// Flag `\Deleted` and expunge exactly these UIDs.
    async fn expunge(&mut self, uids: &[u32]) -> Result<(), SessionError>;

    /// Block in IDLE until the server reports changes, `timeout` elapses or
    /// `interrupt` fires. Returns whatever the server reported.
    async fn idle(
        &mut self,
        timeout: Duration,
        interrupt: &Interrupt,
    ) -> Result<Vec<ServerEvent>, SessionError>;

    /// NOOP, returning any changes the server reported with it.
    async fn noop(&mut self) -> Result<Vec<ServerEvent>, SessionError>;

    async fn logout(&mut self);
}

/// UID sets for commands, at most [`UID_BATCH_SIZE`] UIDs each.
pub(crate) fn uid_sets(uids: &[u32]) -> Vec<String> {
    uids.chunks(UID_BATCH_SIZE)
        .map(|chunk| {
            chunk
                .iter()
                .map(|uid| uid.to_string())
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect()
}
