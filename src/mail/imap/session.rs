//! Folder Session actor: one authenticated connection per tracked folder.
//!
//! The actor owns the connection and the folder's message descriptors. It
//! alternates between draining its command FIFO and a push-wait (IDLE, or a
//! sleep followed by NOOP on servers without IDLE). Enqueuing a command
//! interrupts the wait, so commands run before the next wait begins.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FolderRules;
use crate::constants::SESSION_SHUTDOWN_GRACE_SECS;
use crate::error::{FailureKind, SessionError};
use crate::mail::folder::{FolderMapping, detect_folder};
use crate::mail::types::{
    ActionKind, EmailFlags, MailboxAccount, MessageDescriptor, PendingAction, flag_transitions,
};

use super::{Connector, Interrupt, MailConnection, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Authenticating,
    FolderSelected,
    Idling,
    Executing,
    Closing,
    Failed(FailureKind),
}

/// Work item on a session's FIFO. Message ids are local row ids; the
/// session maps them to UIDs through its descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Download and store a message not yet known locally.
    Fetch { uid: u32 },
    SetFlags { message_ids: Vec<i64>, kind: ActionKind },
    Move { message_ids: Vec<i64>, destination: String },
    /// Flag `\Deleted` and expunge.
    Expunge { message_ids: Vec<i64> },
    /// Re-list the folder.
    Refresh,
}

impl SessionCommand {
    /// Commands that carry a user change for the server. Fetches and
    /// re-lists are recreated by the next session on its own.
    pub fn is_outbound(&self) -> bool {
        !matches!(self, SessionCommand::Fetch { .. } | SessionCommand::Refresh)
    }
}

/// Receives everything a session detects. Implemented by the account
/// orchestrator.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// The session authenticated and selected its folder.
    async fn on_started(&self, mailbox_id: i64, folder: &FolderMapping);

    /// Folder discovery results, reported by the mailbox's root session.
    async fn on_folders_discovered(&self, mailbox_id: i64, folders: Vec<FolderMapping>);

    /// Attach local ids to descriptors whose messages are already stored.
    async fn resolve_known(
        &self,
        mailbox_id: i64,
        folder: &FolderMapping,
        descriptors: &mut [MessageDescriptor],
    );

    /// Reconcile a downloaded message. `attached` holds local ids already
    /// bound to live descriptors in this folder. Returns the local id.
    async fn on_new_message(
        &self,
        mailbox_id: i64,
        folder: &FolderMapping,
        descriptor: &MessageDescriptor,
        raw: &[u8],
        attached: &HashSet<i64>,
    ) -> Option<i64>;

    /// Inbound actions, in detection order.
    fn on_actions(&self, actions: Vec<PendingAction>);

    fn on_activity(&self, mailbox_id: i64);

    /// Local ids no longer bound to a descriptor of this folder.
    async fn on_released(&self, mailbox_id: i64, folder: &FolderMapping, ids: Vec<i64>);

    /// The session stopped. `unfinished` holds the outbound commands it
    /// accepted but did not complete, in FIFO order.
    async fn on_failed(
        &self,
        mailbox_id: i64,
        folder: &FolderMapping,
        kind: FailureKind,
        unfinished: Vec<SessionCommand>,
    );
}

#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub account: MailboxAccount,
    pub folder: FolderMapping,
    /// Set on a mailbox's root session only: it lists and classifies folders.
    pub discovery: Option<FolderRules>,
    pub idle_timeout: Duration,
}

/// Handle for a spawned Folder Session.
pub struct FolderSessionHandle {
    pub mailbox_id: i64,
    pub folder: FolderMapping,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    interrupt: Interrupt,
    state_rx: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl FolderSessionHandle {
    /// Append to the FIFO and interrupt any push-wait in progress.
    pub fn enqueue(&self, command: SessionCommand) -> bool {
        if self.cmd_tx.send(command).is_err() {
            return false;
        }
        self.interrupt.wake.notify_one();
        true
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Failed or exited; the orchestrator reaps it on the next refresh.
    pub fn is_finished(&self) -> bool {
        matches!(self.state(), SessionState::Failed(_)) || self.task.is_finished()
    }

    pub async fn shutdown(self) {
        self.interrupt.cancel.cancel();
        let mut task = self.task;
        let grace = Duration::from_secs(SESSION_SHUTDOWN_GRACE_SECS);
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            tracing::warn!(
                "Folder session {}:{} did not stop in time, aborting",
                self.mailbox_id,
                self.folder.name
            );
            task.abort();
        }
    }
}

/// Spawn a Folder Session. It stops when `parent` or its own handle is cancelled.
pub fn spawn_folder_session(
    spec: SessionSpec,
    connector: Arc<dyn Connector>,
    observer: Arc<dyn SessionObserver>,
    parent: &CancellationToken,
) -> FolderSessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
    let interrupt = Interrupt::new(parent.child_token());
    let mailbox_id = spec.account.id;
    let folder = spec.folder.clone();

    let session = FolderSession {
        spec,
        connector,
        observer,
        cmd_rx,
        queue: VecDeque::new(),
        interrupt: interrupt.clone(),
        state_tx,
        messages: Vec::new(),
        pending_fetch: HashSet::new(),
    };
    let task = tokio::spawn(session.run());

    FolderSessionHandle {
        mailbox_id,
        folder,
        cmd_tx,
        interrupt,
        state_rx,
        task,
    }
}

struct FolderSession {
    spec: SessionSpec,
    connector: Arc<dyn Connector>,
    observer: Arc<dyn SessionObserver>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    /// The FIFO proper: external commands are moved here in arrival order,
    /// fetches for newly listed messages are appended by the session itself.
    queue: VecDeque<SessionCommand>,
    interrupt: Interrupt,
    state_tx: watch::Sender<SessionState>,
    messages: Vec<MessageDescriptor>,
    pending_fetch: HashSet<u32>,
}

impl FolderSession {
    fn mailbox_id(&self) -> i64 {
        self.spec.account.id
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    async fn run(mut self) {
        self.set_state(SessionState::Authenticating);

        let mut conn = match self.connector.connect(&self.spec.account).await {
            Ok(conn) => conn,
            Err(e) => return self.fail(e).await,
        };

        let result = match self.open(conn.as_mut()).await {
            Ok(()) => self.event_loop(conn.as_mut()).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.set_state(SessionState::Closing);
                conn.logout().await;
                tracing::debug!(
                    "Folder session {}:{} closed",
                    self.mailbox_id(),
                    self.spec.folder.name
                );
            }
            Err(e) => {
                if e.failure_kind() != Some(FailureKind::Transport) {
                    conn.logout().await;
                }
                self.fail(e).await;
            }
        }
    }

    async fn fail(&mut self, err: SessionError) {
        if self.interrupt.is_cancelled() {
            tracing::debug!(
                "Folder session {}:{} stopped during shutdown: {}",
                self.mailbox_id(),
                self.spec.folder.name,
                err
            );
            self.set_state(SessionState::Closing);
            return;
        }

        let kind = err.failure_kind().unwrap_or(FailureKind::Transport);
        tracing::warn!(
            "Folder session {}:{} failed: {}",
            self.mailbox_id(),
            self.spec.folder.name,
            err
        );
        self.set_state(SessionState::Failed(kind));

        // Later sends bounce back to the caller instead of vanishing.
        self.cmd_rx.close();
        while let Ok(command) = self.cmd_rx.try_recv() {
            self.queue.push_back(command);
        }
        let unfinished: Vec<SessionCommand> = self
            .queue
            .drain(..)
            .filter(SessionCommand::is_outbound)
            .collect();
        self.observer
            .on_failed(self.mailbox_id(), &self.spec.folder, kind, unfinished)
            .await;
    }

    /// Discovery (root session only), SELECT and the initial listing.
    async fn open(&mut self, conn: &mut dyn MailConnection) -> Result<(), SessionError> {
        if let Some(rules) = &self.spec.discovery {
            let remote = conn.list_folders().await?;
            let domain = self.spec.account.domain();
            let mappings: Vec<FolderMapping> = remote
                .iter()
                .map(|f| detect_folder(&f.name, &f.attributes, domain, rules))
                .collect();
            tracing::info!(
                "Mailbox {} has {} folders ({} tracked)",
                self.spec.account.address,
                mappings.len(),
                mappings.iter().filter(|m| m.is_tracked()).count()
            );
            self.observer
                .on_folders_discovered(self.mailbox_id(), mappings)
                .await;
        }

        let status = match conn.select(&self.spec.folder.name).await {
            Ok(status) => status,
            // A session without its folder cannot do anything useful.
            Err(SessionError::FolderNotFound(name)) => {
                return Err(SessionError::Transport(format!("folder '{name}' is gone")));
            }
            Err(e) => return Err(e),
        };
        self.set_state(SessionState::FolderSelected);
        tracing::info!(
            "Selected '{}' on {} ({} messages)",
            self.spec.folder.name,
            self.spec.account.address,
            status.exists
        );

        self.observer
            .on_started(self.mailbox_id(), &self.spec.folder)
            .await;
        self.refresh_listing(conn).await
    }

    async fn event_loop(&mut self, conn: &mut dyn MailConnection) -> Result<(), SessionError> {
        loop {
            if self.interrupt.is_cancelled() {
                return Ok(());
            }

            loop {
                match self.cmd_rx.try_recv() {
                    Ok(command) => self.queue.push_back(command),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
                }
            }

            if let Some(command) = self.queue.pop_front() {
                self.set_state(SessionState::Executing);
                if let Err(e) = self.execute(conn, command.clone()).await {
                    if e.is_fatal() {
                        // Not known to have reached the server.
                        self.queue.push_front(command);
                        return Err(e);
                    }
                    tracing::warn!(
                        "Command on {}:{} failed: {}",
                        self.mailbox_id(),
                        self.spec.folder.name,
                        e
                    );
                }
                continue;
            }

            self.set_state(SessionState::Idling);
            let events = if conn.supports_idle() {
                conn.idle(self.spec.idle_timeout, &self.interrupt).await?
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(self.spec.idle_timeout) => {}
                    _ = self.interrupt.wait() => {}
                }
                if self.interrupt.is_cancelled() {
                    return Ok(());
                }
                conn.noop().await?
            };

            if self.interrupt.is_cancelled() {
                return Ok(());
            }
            self.apply_events(conn, events).await?;
        }
    }

    fn action(&self, kind: ActionKind, message_id: i64) -> PendingAction {
        PendingAction::new(kind, self.mailbox_id(), message_id, self.spec.folder.role)
    }

    fn emit(&self, actions: Vec<PendingAction>) {
        if !actions.is_empty() {
            self.observer.on_actions(actions);
        }
    }

    async fn apply_events(
        &mut self,
        conn: &mut dyn MailConnection,
        events: Vec<ServerEvent>,
    ) -> Result<(), SessionError> {
        if events.is_empty() {
            return Ok(());
        }
        self.observer.on_activity(self.mailbox_id());

        let mut relist = false;
        let mut actions = Vec::new();
        for event in events {
            match event {
                ServerEvent::CountChanged(_) | ServerEvent::Expunged(_) => relist = true,
                // Once the count changed, indexes may be stale; the re-list diff
                // picks up these flags instead.
                ServerEvent::FlagsChanged { .. } if relist => {}
                ServerEvent::FlagsChanged { index, flags } => {
                    let Some(descriptor) = self.messages.iter_mut().find(|d| d.index == index)
                    else {
                        relist = true;
                        continue;
                    };
                    let transitions = flag_transitions(descriptor.flags, flags);
                    descriptor.flags = flags;
                    if let Some(id) = descriptor.local_id() {
                        actions.extend(transitions.into_iter().map(|kind| (kind, id)));
                    }
                }
            }
        }

        let actions = actions
            .into_iter()
            .map(|(kind, id)| self.action(kind, id))
            .collect();
        self.emit(actions);

        if relist {
            self.refresh_listing(conn).await?;
        }
        Ok(())
    }

    /// Re-list the folder, diff against the descriptors and queue fetches
    /// for messages not yet stored.
    async fn refresh_listing(&mut self, conn: &mut dyn MailConnection) -> Result<(), SessionError> {
        let summaries = conn.fetch_summaries().await?;

        let mut previous: HashMap<u32, MessageDescriptor> = std::mem::take(&mut self.messages)
            .into_iter()
            .map(|d| (d.uid, d))
            .collect();

        let mut changes = Vec::new();
        let mut current = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let descriptor = match previous.remove(&summary.uid) {
                Some(mut descriptor) => {
                    if let Some(id) = descriptor.local_id() {
                        changes.extend(
                            flag_transitions(descriptor.flags, summary.flags)
                                .into_iter()
                                .map(|kind| (kind, id)),
                        );
                    }
                    descriptor.index = summary.index;
                    descriptor.flags = summary.flags;
                    if summary.server_date.is_some() {
                        descriptor.server_date = summary.server_date;
                    }
                    descriptor
                }
                None => MessageDescriptor::new(
                    summary.uid,
                    summary.index,
                    summary.flags,
                    summary.server_date,
                ),
            };
            current.push(descriptor);
        }

        let mut released = Vec::new();
        for gone in previous.into_values() {
            self.pending_fetch.remove(&gone.uid);
            if let Some(id) = gone.local_id() {
                changes.push((ActionKind::Delete, id));
                released.push(id);
            }
        }
        self.messages = current;
        self.release(released).await;

        let actions = changes
            .into_iter()
            .map(|(kind, id)| self.action(kind, id))
            .collect();
        self.emit(actions);

        if self.messages.iter().any(|d| !d.is_resolved()) {
            self.observer
                .resolve_known(self.spec.account.id, &self.spec.folder, &mut self.messages)
                .await;
        }

        for descriptor in &self.messages {
            if !descriptor.is_resolved() && self.pending_fetch.insert(descriptor.uid) {
                self.queue
                    .push_back(SessionCommand::Fetch { uid: descriptor.uid });
            }
        }

        tracing::debug!(
            "Listed {}:{}: {} messages, {} queued for fetch",
            self.mailbox_id(),
            self.spec.folder.name,
            self.messages.len(),
            self.pending_fetch.len()
        );
        Ok(())
    }

    fn uids_for(&self, message_ids: &[i64]) -> Vec<u32> {
        self.messages
            .iter()
            .filter(|d| d.local_id().is_some_and(|id| message_ids.contains(&id)))
            .map(|d| d.uid)
            .collect()
    }

    async fn release(&self, ids: Vec<i64>) {
        if !ids.is_empty() {
            self.observer
                .on_released(self.mailbox_id(), &self.spec.folder, ids)
                .await;
        }
    }

    /// Drop descriptors for messages this session moved or expunged itself,
    /// so no inbound delete is reported for them.
    async fn forget(&mut self, uids: &[u32]) {
        let released: Vec<i64> = self
            .messages
            .iter()
            .filter(|d| uids.contains(&d.uid))
            .filter_map(MessageDescriptor::local_id)
            .collect();
        self.messages.retain(|d| !uids.contains(&d.uid));
        self.release(released).await;
    }

    async fn execute(
        &mut self,
        conn: &mut dyn MailConnection,
        command: SessionCommand,
    ) -> Result<(), SessionError> {
        match command {
            SessionCommand::Fetch { uid } => self.fetch_new(conn, uid).await,
            SessionCommand::SetFlags { message_ids, kind } => {
                let (flag, add) = match kind {
                    ActionKind::MarkRead => (EmailFlags::SEEN, true),
                    ActionKind::MarkUnread => (EmailFlags::SEEN, false),
                    ActionKind::MarkImportant => (EmailFlags::FLAGGED, true),
                    ActionKind::MarkUnimportant => (EmailFlags::FLAGGED, false),
                    ActionKind::Delete | ActionKind::MoveTo(_) => {
                        return Err(SessionError::Rejected(format!(
                            "{:?} is not a flag change",
                            kind
                        )));
                    }
                };
                let uids = self.uids_for(&message_ids);
                if uids.is_empty() {
                    tracing::debug!("No live messages for {:?} {:?}", kind, message_ids);
                    return Ok(());
                }

                if add {
                    conn.add_flags(&uids, flag).await?;
                } else {
                    conn.remove_flags(&uids, flag).await?;
                }

                // Record our own change so the next diff does not report it back.
                for descriptor in self.messages.iter_mut().filter(|d| uids.contains(&d.uid)) {
                    descriptor.flags.set(flag, add);
                }
                Ok(())
            }
            SessionCommand::Move {
                message_ids,
                destination,
            } => {
                let uids = self.uids_for(&message_ids);
                if uids.is_empty() {
                    return Ok(());
                }
                conn.move_messages(&uids, &destination).await?;
                tracing::debug!(
                    "Moved {} messages from '{}' to '{}'",
                    uids.len(),
                    self.spec.folder.name,
                    destination
                );
                self.forget(&uids).await;
                Ok(())
            }
            SessionCommand::Expunge { message_ids } => {
                let uids = self.uids_for(&message_ids);
                if uids.is_empty() {
                    return Ok(());
                }
                conn.expunge(&uids).await?;
                self.forget(&uids).await;
                Ok(())
            }
            SessionCommand::Refresh => self.refresh_listing(conn).await,
        }
    }

    async fn fetch_new(&mut self, conn: &mut dyn MailConnection, uid: u32) -> Result<(), SessionError> {
        self.pending_fetch.remove(&uid);
        let Some(pos) = self.messages.iter().position(|d| d.uid == uid) else {
            return Ok(());
        };
        if self.messages[pos].is_resolved() {
            return Ok(());
        }

        let Some(raw) = conn.fetch_body(uid).await? else {
            tracing::debug!("UID {} vanished from '{}' before fetch", uid, self.spec.folder.name);
            return Ok(());
        };

        let attached: HashSet<i64> = self.messages.iter().filter_map(|d| d.local_id()).collect();
        let descriptor = self.messages[pos].clone();
        let stored = self
            .observer
            .on_new_message(
                self.mailbox_id(),
                &self.spec.folder,
                &descriptor,
                &raw,
                &attached,
            )
            .await;

        if let Some(id) = stored
            && !self.messages[pos].resolve(id)
        {
            tracing::warn!(
                "UID {} in '{}' already bound to another row, ignoring {}",
                uid,
                self.spec.folder.name,
                id
            );
        }
        Ok(())
    }
}
