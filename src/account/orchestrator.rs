//! Account Orchestrator: owns every Folder Session of one user.
//!
//! Sessions detect changes in parallel; everything that reads and then
//! writes account-scoped storage goes through one guard (`state`), so
//! reconciliation for an account is serialized. The guard is never held
//! while waiting for a session to stop, since a stopping session may be
//! waiting for the guard itself.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::config::FolderRules;
use crate::error::{FailureKind, Result, SyncError};
use crate::mail::folder::FolderMapping;
use crate::mail::imap::{
    FolderSessionHandle, SessionCommand, SessionObserver, SessionSpec, spawn_folder_session,
};
use crate::mail::parser::parse_message;
use crate::mail::types::{
    ActionKind, FolderRole, MailboxAccount, MessageDescriptor, PendingAction, UserKey, uidl,
};

use super::actions::{ActionBatch, InboundQueue, apply_batch, coalesce};
use super::mailbox::MailboxSessions;
use super::pipeline::ProcessedMessage;
use super::reconcile::{Reconciled, reconcile_new_message};
use super::{EngineContext, EngineNotice};

const MIN_DRAIN_INTERVAL: Duration = Duration::from_millis(10);
const MIN_TIMER_INTERVAL: Duration = Duration::from_secs(1);

/// Outbound work not yet accepted by a session.
#[derive(Debug)]
enum Outbound {
    /// Not routed: the mailbox has no sessions or no folder list yet.
    Pending(ActionBatch),
    /// Routed to a folder whose session is down.
    Routed {
        mailbox_id: i64,
        folder: String,
        command: SessionCommand,
    },
}

struct Deferred {
    work: Outbound,
    /// When the work first entered the orchestrator
    since: Instant,
}

/// Hand a command to the live session of `folder`, or give it back.
fn dispatch(
    state: &AccountState,
    mailbox_id: i64,
    folder: String,
    command: SessionCommand,
) -> Option<Outbound> {
    let session = state
        .mailboxes
        .get(&mailbox_id)
        .and_then(|m| m.session(&folder))
        .filter(|s| !s.is_finished());
    match session {
        Some(session) if session.enqueue(command.clone()) => None,
        _ => {
            tracing::debug!("No live session for '{}', holding {:?}", folder, command);
            Some(Outbound::Routed {
                mailbox_id,
                folder,
                command,
            })
        }
    }
}

#[derive(Default)]
struct AccountState {
    mailboxes: HashMap<i64, MailboxSessions>,
}

struct AccountShared {
    me: Weak<AccountShared>,
    ctx: EngineContext,
    user: UserKey,
    /// The account guard.
    state: Mutex<AccountState>,
    inbound: InboundQueue,
    /// Set by any session traffic or applied change; cleared by the liveness check.
    activity: AtomicBool,
    /// An insert changed unread counters since the last drain pass.
    unread_dirty: AtomicBool,
    /// Outbound work waiting for a session, in arrival order.
    deferred: StdMutex<Vec<Deferred>>,
    cancel: CancellationToken,
    refresh_now: Notify,
}

/// Handle to a running orchestrator.
pub struct AccountOrchestrator {
    shared: Arc<AccountShared>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl AccountOrchestrator {
    /// Lock and open every enabled mailbox of `user`. Fails with
    /// [`SyncError::Configuration`] when there is nothing to synchronize;
    /// in that case nothing is left running or locked.
    pub async fn start(
        ctx: EngineContext,
        user: UserKey,
        fatal_tx: mpsc::UnboundedSender<UserKey>,
    ) -> Result<Self> {
        let cancel = ctx.shutdown.child_token();
        let shared = Arc::new_cyclic(|me| AccountShared {
            me: me.clone(),
            ctx,
            user: user.clone(),
            state: Mutex::new(AccountState::default()),
            inbound: InboundQueue::default(),
            activity: AtomicBool::new(false),
            unread_dirty: AtomicBool::new(false),
            deferred: StdMutex::new(Vec::new()),
            cancel,
            refresh_now: Notify::new(),
        });

        let sessions = match shared.refresh().await {
            Ok(sessions) => sessions,
            Err(e) => {
                shared.cancel.cancel();
                shared.teardown_all().await;
                return Err(e);
            }
        };
        if sessions == 0 {
            shared.cancel.cancel();
            shared.teardown_all().await;
            return Err(SyncError::Configuration(format!(
                "no enabled mailboxes for {}",
                user
            )));
        }

        tracing::info!(
            "Account orchestrator for {} started with {} sessions",
            user,
            sessions
        );
        let task = tokio::spawn(Arc::clone(&shared).run(fatal_tx));

        Ok(Self {
            shared,
            task: StdMutex::new(Some(task)),
        })
    }

    pub fn user(&self) -> &UserKey {
        &self.shared.user
    }

    /// Duplicate trigger: count it as activity and re-list the hinted folder.
    pub async fn poke(&self, mailbox_hint: Option<i64>, folder_hint: Option<&str>) {
        self.shared.activity.store(true, Ordering::Release);
        let Some(mailbox_id) = mailbox_hint else {
            return;
        };

        let state = self.shared.state.lock().await;
        let Some(mailbox) = state.mailboxes.get(&mailbox_id) else {
            // Not ours yet, maybe just enabled.
            self.shared.refresh_now.notify_one();
            return;
        };

        match folder_hint {
            Some(folder) => {
                if let Some(session) = mailbox.session(folder) {
                    session.enqueue(SessionCommand::Refresh);
                }
            }
            None => {
                for session in mailbox.sessions() {
                    session.enqueue(SessionCommand::Refresh);
                }
            }
        }
    }

    pub async fn session_count(&self) -> usize {
        let state = self.shared.state.lock().await;
        state
            .mailboxes
            .values()
            .map(MailboxSessions::session_count)
            .sum()
    }

    pub fn is_finished(&self) -> bool {
        if self.shared.cancel.is_cancelled() {
            return true;
        }
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Stop every session, release the mailbox locks and wait for the run loop.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!("Orchestrator task for {} ended abnormally: {}", self.shared.user, e);
        }
    }
}

impl AccountShared {
    async fn run(self: Arc<Self>, fatal_tx: mpsc::UnboundedSender<UserKey>) {
        let sync = self.ctx.config.sync.clone();

        let mut drain = tokio::time::interval(sync.drain_interval().max(MIN_DRAIN_INTERVAL));
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let every = sync.refresh_interval().max(MIN_TIMER_INTERVAL);
        let mut refresh = interval_at(Instant::now() + every, every);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let every = sync.liveness_interval().max(MIN_TIMER_INTERVAL);
        let mut liveness = interval_at(Instant::now() + every, every);
        let mut active_since = Utc::now().timestamp();

        loop {
            let retire = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = drain.tick() => {
                    self.drain_inbound().await;
                    self.drain_outbound().await;
                    false
                }
                _ = refresh.tick() => !self.refresh_pass().await,
                _ = self.refresh_now.notified() => !self.refresh_pass().await,
                _ = liveness.tick() => {
                    let alive = self.check_liveness(active_since).await;
                    active_since = Utc::now().timestamp();
                    !alive
                }
            };

            if retire {
                self.cancel.cancel();
                if fatal_tx.send(self.user.clone()).is_err() {
                    tracing::debug!("Supervisor gone, stopping {} anyway", self.user);
                }
                break;
            }
        }

        self.teardown_all().await;
        tracing::info!("Account orchestrator for {} stopped", self.user);
    }

    fn spawn_session(
        &self,
        account: &MailboxAccount,
        folder: FolderMapping,
        discovery: Option<FolderRules>,
    ) -> Option<FolderSessionHandle> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let observer: Arc<dyn SessionObserver> = self.me.upgrade()?;
        let spec = SessionSpec {
            account: account.clone(),
            folder,
            discovery,
            idle_timeout: self.ctx.config.sync.idle_timeout(),
        };
        Some(spawn_folder_session(
            spec,
            Arc::clone(&self.ctx.connector),
            observer,
            &self.cancel,
        ))
    }

    /// Bring the session set in line with the enabled mailboxes. Returns the
    /// number of sessions of mailboxes that still have a usable one.
    async fn refresh(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let backoff = self.ctx.config.sync.auth_error_backoff_secs as i64;
        let accounts = self
            .ctx
            .store
            .enabled_mailboxes(&self.user, now - backoff)
            .await?;
        let enabled: HashSet<i64> = accounts.iter().map(|a| a.id).collect();

        let (retired, reaped) = {
            let mut state = self.state.lock().await;
            let stale: Vec<i64> = state
                .mailboxes
                .iter()
                .filter(|(id, mailbox)| !enabled.contains(id) || mailbox.root_failed())
                .map(|(id, _)| *id)
                .collect();
            let retired: Vec<MailboxSessions> = stale
                .iter()
                .filter_map(|id| state.mailboxes.remove(id))
                .collect();
            let reaped: Vec<FolderSessionHandle> = state
                .mailboxes
                .values_mut()
                .flat_map(MailboxSessions::reap_failed)
                .collect();
            (retired, reaped)
        };

        for mailbox in retired {
            tracing::info!(
                "Retiring mailbox {} ({})",
                mailbox.account.address,
                if enabled.contains(&mailbox.id()) { "root session failed" } else { "disabled" }
            );
            self.retire(mailbox).await;
        }
        join_all(reaped.into_iter().map(FolderSessionHandle::shutdown)).await;

        let mut state = self.state.lock().await;
        for mailbox in state.mailboxes.values_mut() {
            for mapping in mailbox.missing_folders() {
                if let Some(handle) = self.spawn_session(&mailbox.account, mapping, None) {
                    mailbox.insert(handle);
                }
            }
        }

        for account in accounts {
            if state.mailboxes.contains_key(&account.id) || self.cancel.is_cancelled() {
                continue;
            }

            let overrides = self.ctx.store.folder_overrides(account.id).await?;
            if !self.ctx.store.lock_mailbox(account.id).await? {
                tracing::debug!("Mailbox {} is processed elsewhere", account.address);
                continue;
            }

            let rules = self.ctx.config.folders.with_overrides(&overrides);
            let mut root = FolderMapping::new("INBOX", FolderRole::Inbox);
            root.tags = rules.tags_for(&root.name);

            let Some(root) = self.spawn_session(&account, root, Some(rules.clone())) else {
                self.ctx.store.unlock_mailbox(account.id).await?;
                break;
            };
            tracing::info!("Syncing mailbox {} for {}", account.address, self.user);
            state
                .mailboxes
                .insert(account.id, MailboxSessions::new(account, rules, root));
        }

        Ok(state
            .mailboxes
            .values()
            .filter(|m| m.is_usable())
            .map(MailboxSessions::session_count)
            .sum())
    }

    /// `false` when nothing usable is left.
    async fn refresh_pass(&self) -> bool {
        match self.refresh().await {
            Ok(0) => {
                tracing::warn!("No usable folder sessions left for {}", self.user);
                false
            }
            Ok(sessions) => {
                tracing::debug!("Refreshed {}: {} sessions", self.user, sessions);
                true
            }
            Err(e) => {
                tracing::warn!("Refresh for {} failed: {}", self.user, e);
                true
            }
        }
    }

    async fn check_liveness(&self, since: i64) -> bool {
        if self.activity.swap(false, Ordering::AcqRel) {
            return true;
        }
        match self.ctx.store.user_active_since(&self.user, since).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::info!("No activity for {}, retiring", self.user);
                false
            }
            Err(e) => {
                tracing::warn!("Activity check for {} failed: {}", self.user, e);
                true
            }
        }
    }

    async fn retire(&self, mailbox: MailboxSessions) {
        let id = mailbox.id();
        join_all(
            mailbox
                .into_sessions()
                .into_iter()
                .map(FolderSessionHandle::shutdown),
        )
        .await;
        if let Err(e) = self.ctx.store.unlock_mailbox(id).await {
            tracing::warn!("Failed to unlock mailbox {}: {}", id, e);
        }
    }

    async fn teardown_all(&self) {
        let mailboxes: Vec<MailboxSessions> = {
            let mut state = self.state.lock().await;
            state.mailboxes.drain().map(|(_, m)| m).collect()
        };
        join_all(mailboxes.into_iter().map(|m| self.retire(m))).await;
    }

    /// Apply queued inbound actions, one storage call per coalesced batch.
    async fn drain_inbound(&self) {
        let actions = self.inbound.take_all();
        let mut unread_changed = self.unread_dirty.swap(false, Ordering::AcqRel);

        if !actions.is_empty() {
            self.activity.store(true, Ordering::Release);
            let _guard = self.state.lock().await;
            for batch in coalesce(actions) {
                match apply_batch(&self.ctx.store, &batch).await {
                    Ok(changed) => unread_changed |= changed,
                    Err(e) => tracing::warn!(
                        "Failed to apply {:?} to {:?}: {}",
                        batch.kind,
                        batch.message_ids,
                        e
                    ),
                }
            }
        }

        if unread_changed {
            self.notify(EngineNotice::UnreadChanged {
                user: self.user.clone(),
            });
        }
    }

    fn deferred(&self) -> std::sync::MutexGuard<'_, Vec<Deferred>> {
        self.deferred.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Outbound work that waits longer than this is dropped.
    fn retry_window(&self) -> Duration {
        self.ctx.config.sync.refresh_interval().max(MIN_TIMER_INTERVAL) * 2
    }

    /// Keep undelivered work for the next pass, ahead of anything a failing
    /// session handed back meanwhile.
    fn defer(&self, items: Vec<Deferred>) {
        let window = self.retry_window();
        let mut kept: Vec<Deferred> = items
            .into_iter()
            .filter(|item| {
                let expired = item.since.elapsed() > window;
                if expired {
                    tracing::warn!("Dropping {:?} for {} after {:?}", item.work, self.user, window);
                }
                !expired
            })
            .collect();
        if kept.is_empty() {
            return;
        }
        let mut deferred = self.deferred();
        kept.append(&mut deferred);
        *deferred = kept;
    }

    /// Pop external commands and hand them to the owning sessions. Work
    /// that has no live session yet is retried on later passes.
    async fn drain_outbound(&self) {
        let retries = std::mem::take(&mut *self.deferred());
        let limit = self.ctx.config.sync.command_batch_size;
        let commands = match self.ctx.store.pop_commands(&self.user, limit).await {
            Ok(commands) => commands,
            Err(e) => {
                tracing::warn!("Failed to read commands for {}: {}", self.user, e);
                Vec::new()
            }
        };
        if retries.is_empty() && commands.is_empty() {
            return;
        }
        if !commands.is_empty() {
            self.activity.store(true, Ordering::Release);
        }

        let now = Instant::now();
        let mut pending = retries;
        pending.extend(coalesce(commands).into_iter().map(|batch| Deferred {
            work: Outbound::Pending(batch),
            since: now,
        }));

        let mut left = Vec::new();
        {
            let state = self.state.lock().await;
            for Deferred { work, since } in pending {
                let undelivered = match work {
                    Outbound::Pending(batch) => match self.route_outbound(&state, batch).await {
                        Ok(undelivered) => undelivered,
                        Err(e) => {
                            tracing::warn!("Dropping outbound work for {}: {}", self.user, e);
                            continue;
                        }
                    },
                    Outbound::Routed {
                        mailbox_id,
                        folder,
                        command,
                    } => dispatch(&state, mailbox_id, folder, command).into_iter().collect(),
                };
                left.extend(undelivered.into_iter().map(|work| Deferred { work, since }));
            }
        }
        self.defer(left);
    }

    /// Turn a batch into session commands. Returns what could not be handed
    /// over yet.
    async fn route_outbound(&self, state: &AccountState, batch: ActionBatch) -> Result<Vec<Outbound>> {
        // Destinations depend on discovery, which a restarted root session redoes.
        let Some(mailbox) = state
            .mailboxes
            .get(&batch.mailbox_id)
            .filter(|m| m.is_discovered())
        else {
            return Ok(vec![Outbound::Pending(batch)]);
        };

        // Commands go to the folder the message physically lives in.
        let mut by_folder: Vec<(String, Vec<i64>)> = Vec::new();
        for id in &batch.message_ids {
            match self.ctx.store.get_message(*id).await? {
                Some(row) if row.mailbox_id == batch.mailbox_id => {
                    match by_folder.iter_mut().find(|(name, _)| *name == row.folder_name) {
                        Some((_, ids)) => ids.push(row.id),
                        None => by_folder.push((row.folder_name, vec![row.id])),
                    }
                }
                _ => tracing::warn!("Skipping {:?} for unknown message {}", batch.kind, id),
            }
        }

        let mut undelivered = Vec::new();
        for (folder, message_ids) in by_folder {
            if !mailbox.tracks(&folder) {
                tracing::warn!(
                    "'{}' on {} is not synchronized, skipping {:?}",
                    folder,
                    mailbox.account.address,
                    batch.kind
                );
                continue;
            }

            let command = match batch.kind {
                ActionKind::Delete | ActionKind::MoveTo(FolderRole::Trash) => match mailbox.trash() {
                    Some(trash) => SessionCommand::Move {
                        message_ids,
                        destination: trash.to_string(),
                    },
                    None => SessionCommand::Expunge { message_ids },
                },
                ActionKind::MoveTo(role) => match mailbox.folder_for_role(role) {
                    Some(destination) if destination != folder => SessionCommand::Move {
                        message_ids,
                        destination: destination.to_string(),
                    },
                    Some(_) => continue,
                    None => {
                        tracing::warn!("No {} folder on {}", role, mailbox.account.address);
                        continue;
                    }
                },
                kind => SessionCommand::SetFlags { message_ids, kind },
            };

            undelivered.extend(dispatch(state, batch.mailbox_id, folder, command));
        }
        Ok(undelivered)
    }

    fn notify(&self, notice: EngineNotice) {
        if self.ctx.notices.send(notice).is_err() {
            tracing::trace!("No notice listener");
        }
    }

    /// Filter results: applied locally now, sent to the server by the next
    /// outbound drain.
    async fn queue_follow_up(&self, actions: Vec<PendingAction>) {
        for action in &actions {
            if let Err(e) = self.ctx.store.push_command(&self.user, action).await {
                tracing::warn!("Failed to queue {:?}: {}", action.kind, e);
            }
        }
        self.inbound.push_many(actions);
    }
}

#[async_trait]
impl SessionObserver for AccountShared {
    async fn on_started(&self, mailbox_id: i64, folder: &FolderMapping) {
        tracing::debug!("Session {}:{} started", mailbox_id, folder.name);
        if let Err(e) = self
            .ctx
            .store
            .set_checked(mailbox_id, Utc::now().timestamp())
            .await
        {
            tracing::warn!("Failed to stamp mailbox {}: {}", mailbox_id, e);
        }
    }

    async fn on_folders_discovered(&self, mailbox_id: i64, folders: Vec<FolderMapping>) {
        let mut state = self.state.lock().await;
        let Some(mailbox) = state.mailboxes.get_mut(&mailbox_id) else {
            return;
        };

        mailbox.set_discovered(folders);
        for mapping in mailbox.missing_folders() {
            tracing::debug!("Tracking '{}' ({}) on {}", mapping.name, mapping.role, mailbox.account.address);
            if let Some(handle) = self.spawn_session(&mailbox.account, mapping, None) {
                mailbox.insert(handle);
            }
        }
    }

    async fn resolve_known(
        &self,
        mailbox_id: i64,
        folder: &FolderMapping,
        descriptors: &mut [MessageDescriptor],
    ) {
        let rows = match self.ctx.store.rows_by_uidl(mailbox_id, &folder.name).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Failed to load rows for {}:{}: {}", mailbox_id, folder.name, e);
                return;
            }
        };

        for descriptor in descriptors.iter_mut().filter(|d| !d.is_resolved()) {
            if let Some(row) = rows.get(&uidl(descriptor.uid, &folder.name)) {
                descriptor.resolve(row.id);
            }
        }

        let mut state = self.state.lock().await;
        if let Some(mailbox) = state.mailboxes.get_mut(&mailbox_id) {
            mailbox.bind(&folder.name, descriptors.iter().filter_map(|d| d.local_id()));
        }
    }

    async fn on_new_message(
        &self,
        mailbox_id: i64,
        folder: &FolderMapping,
        descriptor: &MessageDescriptor,
        raw: &[u8],
        attached: &HashSet<i64>,
    ) -> Option<i64> {
        let parsed = parse_message(raw);
        let outcome = {
            let mut state = self.state.lock().await;
            // Rows bound in other folders of the mailbox are off limits too.
            let mut attached = attached.clone();
            if let Some(mailbox) = state.mailboxes.get(&mailbox_id) {
                attached.extend(mailbox.bound_ids());
            }
            let outcome = reconcile_new_message(
                &self.ctx.store,
                mailbox_id,
                folder,
                descriptor,
                &parsed,
                &attached,
            )
            .await;
            if let Ok(reconciled) = &outcome
                && let Some(mailbox) = state.mailboxes.get_mut(&mailbox_id)
            {
                mailbox.bind(&folder.name, [reconciled.id()]);
            }
            outcome
        };

        let id = match outcome {
            Ok(Reconciled::Inserted(id)) => id,
            Ok(other) => return Some(other.id()),
            Err(e) => {
                tracing::warn!(
                    "Skipping UID {} in {}:{}: {}",
                    descriptor.uid,
                    mailbox_id,
                    folder.name,
                    e
                );
                return None;
            }
        };

        self.activity.store(true, Ordering::Release);
        if !descriptor.is_seen() {
            self.unread_dirty.store(true, Ordering::Release);
        }
        self.notify(EngineNotice::NewMessage {
            user: self.user.clone(),
            mailbox_id,
            message_id: id,
        });

        let message = ProcessedMessage {
            user: self.user.clone(),
            mailbox_id,
            folder: folder.clone(),
            message_id: id,
            parsed,
            raw: raw.to_vec(),
        };
        let follow_up = self.ctx.pipeline.run(&self.ctx.store, &message).await;
        if !follow_up.is_empty() {
            self.queue_follow_up(follow_up).await;
        }
        Some(id)
    }

    fn on_actions(&self, actions: Vec<PendingAction>) {
        self.activity.store(true, Ordering::Release);
        self.inbound.push_many(actions);
    }

    fn on_activity(&self, _mailbox_id: i64) {
        self.activity.store(true, Ordering::Release);
    }

    async fn on_released(&self, mailbox_id: i64, folder: &FolderMapping, ids: Vec<i64>) {
        let mut state = self.state.lock().await;
        if let Some(mailbox) = state.mailboxes.get_mut(&mailbox_id) {
            mailbox.release(&folder.name, &ids);
        }
    }

    async fn on_failed(
        &self,
        mailbox_id: i64,
        folder: &FolderMapping,
        kind: FailureKind,
        unfinished: Vec<SessionCommand>,
    ) {
        if !unfinished.is_empty() {
            tracing::debug!(
                "Holding {} commands of {}:{} for its replacement",
                unfinished.len(),
                mailbox_id,
                folder.name
            );
            let now = Instant::now();
            self.defer(
                unfinished
                    .into_iter()
                    .map(|command| Deferred {
                        work: Outbound::Routed {
                            mailbox_id,
                            folder: folder.name.clone(),
                            command,
                        },
                        since: now,
                    })
                    .collect(),
            );
        }

        match kind {
            FailureKind::Authentication => {
                tracing::warn!("Authentication failed for mailbox {}, backing off", mailbox_id);
                if let Err(e) = self
                    .ctx
                    .store
                    .set_auth_error(mailbox_id, Utc::now().timestamp())
                    .await
                {
                    tracing::warn!("Failed to stamp auth error on {}: {}", mailbox_id, e);
                }
                self.refresh_now.notify_one();
            }
            FailureKind::Transport => {
                tracing::debug!(
                    "Session {}:{} lost its connection, recreating on next refresh",
                    mailbox_id,
                    folder.name
                );
            }
        }
    }
}
