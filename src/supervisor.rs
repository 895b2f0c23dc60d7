//! Process Supervisor: one Account Orchestrator per active user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::mpsc;

use crate::account::{AccountOrchestrator, EngineContext};
use crate::error::Result;
use crate::mail::types::UserKey;

/// Wake-up signal for a user. Delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub user: UserKey,
    pub mailbox_hint: Option<i64>,
    pub folder_hint: Option<String>,
}

impl Trigger {
    pub fn user(user: UserKey) -> Self {
        Self {
            user,
            mailbox_hint: None,
            folder_hint: None,
        }
    }
}

enum Slot {
    /// Construction in progress.
    Reserved,
    Running(Arc<AccountOrchestrator>),
}

enum Next {
    Poke(Arc<AccountOrchestrator>),
    Start(Option<Arc<AccountOrchestrator>>),
    Skip,
}

pub struct Supervisor {
    ctx: EngineContext,
    registry: Mutex<HashMap<UserKey, Slot>>,
    fatal_tx: mpsc::UnboundedSender<UserKey>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<UserKey>>>,
}

impl Supervisor {
    pub fn new(ctx: EngineContext) -> Arc<Self> {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            ctx,
            registry: Mutex::new(HashMap::new()),
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
        })
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<UserKey, Slot>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self, user: &UserKey) -> bool {
        matches!(self.registry().get(user), Some(Slot::Running(_)))
    }

    pub fn running_count(&self) -> usize {
        self.registry()
            .values()
            .filter(|slot| matches!(slot, Slot::Running(_)))
            .count()
    }

    /// Wake the user's orchestrator, starting one if needed. A failed start
    /// leaves no registry entry and discards the user's queued commands.
    pub async fn on_trigger(&self, trigger: Trigger) -> Result<()> {
        if self.ctx.shutdown.is_cancelled() {
            return Ok(());
        }

        let next = {
            let mut registry = self.registry();
            let current = registry.get(&trigger.user).map(|slot| match slot {
                Slot::Reserved => None,
                Slot::Running(orchestrator) => Some(Arc::clone(orchestrator)),
            });
            match current {
                Some(None) => Next::Skip,
                Some(Some(orchestrator)) if !orchestrator.is_finished() => {
                    Next::Poke(orchestrator)
                }
                stale => {
                    registry.insert(trigger.user.clone(), Slot::Reserved);
                    Next::Start(stale.flatten())
                }
            }
        };

        match next {
            Next::Skip => Ok(()),
            Next::Poke(orchestrator) => {
                orchestrator
                    .poke(trigger.mailbox_hint, trigger.folder_hint.as_deref())
                    .await;
                Ok(())
            }
            Next::Start(stale) => {
                if let Some(stale) = stale {
                    // Its mailbox locks must be released before we take them again.
                    stale.shutdown().await;
                }
                self.start(trigger.user).await
            }
        }
    }

    async fn start(&self, user: UserKey) -> Result<()> {
        match AccountOrchestrator::start(self.ctx.clone(), user.clone(), self.fatal_tx.clone()).await
        {
            Ok(orchestrator) => {
                self.registry()
                    .insert(user, Slot::Running(Arc::new(orchestrator)));
                Ok(())
            }
            Err(e) => {
                self.registry().remove(&user);
                tracing::warn!("Could not start orchestrator for {}: {}", user, e);
                self.discard_commands(&user).await;
                Err(e)
            }
        }
    }

    /// Pop and log everything queued for a user nobody serves.
    async fn discard_commands(&self, user: &UserKey) {
        let limit = self.ctx.config.sync.command_batch_size.max(1);
        loop {
            let commands = match self.ctx.store.pop_commands(user, limit).await {
                Ok(commands) => commands,
                Err(e) => {
                    tracing::warn!("Failed to discard commands for {}: {}", user, e);
                    return;
                }
            };
            if commands.is_empty() {
                return;
            }
            for command in commands {
                tracing::warn!(
                    "Discarding {:?} for message {} of {} (no orchestrator)",
                    command.kind,
                    command.message_id,
                    user
                );
            }
        }
    }

    /// Remove and stop the user's orchestrator. A start in progress is left alone.
    pub async fn on_orchestrator_fatal(&self, user: &UserKey) {
        let removed = {
            let mut registry = self.registry();
            match registry.remove(user) {
                Some(Slot::Running(orchestrator)) => Some(orchestrator),
                Some(Slot::Reserved) => {
                    registry.insert(user.clone(), Slot::Reserved);
                    None
                }
                None => None,
            }
        };

        if let Some(orchestrator) = removed {
            orchestrator.shutdown().await;
            tracing::info!("Retired orchestrator for {}", user);
        }
    }

    /// A fatal report may arrive after a trigger already replaced the
    /// orchestrator that sent it; only a finished one is retired.
    async fn on_fatal_report(&self, user: &UserKey) {
        let finished = match self.registry().get(user) {
            Some(Slot::Running(orchestrator)) => orchestrator.is_finished(),
            _ => false,
        };
        if finished {
            self.on_orchestrator_fatal(user).await;
        }
    }

    /// Serve triggers until the process-wide token is cancelled, then stop
    /// every orchestrator.
    pub async fn run(self: Arc<Self>, mut triggers: mpsc::UnboundedReceiver<Trigger>) {
        let fatal_rx = self.fatal_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut fatal_rx) = fatal_rx else {
            tracing::warn!("Supervisor is already running");
            return;
        };

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                Some(trigger) = triggers.recv() => {
                    let supervisor = Arc::clone(&self);
                    tokio::spawn(async move {
                        let user = trigger.user.clone();
                        if let Err(e) = supervisor.on_trigger(trigger).await {
                            tracing::debug!("Trigger for {} failed: {}", user, e);
                        }
                    });
                }
                Some(user) = fatal_rx.recv() => {
                    let supervisor = Arc::clone(&self);
                    tokio::spawn(async move { supervisor.on_fatal_report(&user).await });
                }
                else => break,
            }
        }

        self.shutdown_all().await;
    }

    pub async fn shutdown_all(&self) {
        let running: Vec<Arc<AccountOrchestrator>> = self
            .registry()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Running(orchestrator) => Some(orchestrator),
                Slot::Reserved => None,
            })
            .collect();
        tracing::info!("Stopping {} orchestrators", running.len());
        join_all(running.iter().map(|o| o.shutdown())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use crate::account::Pipeline;
    use crate::config::Config;
    use crate::error::SyncError;
    use crate::mail::imap::fake::{FakeConnector, FakeServer};
    use crate::mail::types::{ActionKind, FolderRole, PendingAction};
    use crate::store::Store;
    use crate::store::tests::test_mailbox;

    async fn context(server: &FakeServer, liveness_secs: u64) -> EngineContext {
        let mut config = Config::default();
        config.sync.idle_timeout_secs = 3600;
        config.sync.drain_interval_ms = 20;
        config.sync.liveness_interval_secs = liveness_secs;
        let (notices, _) = mpsc::unbounded_channel();
        EngineContext {
            store: Store::open_in_memory().await.unwrap(),
            connector: Arc::new(FakeConnector::new(server.clone())),
            pipeline: Arc::new(Pipeline::default()),
            config: Arc::new(config),
            notices,
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_trigger_reuses_orchestrator() {
        let server = FakeServer::new();
        let ctx = context(&server, 3600).await;
        let alice = UserKey::new(1, "alice");
        let mailbox_id = ctx.store.insert_mailbox(&test_mailbox(&alice)).await.unwrap();
        let supervisor = Supervisor::new(ctx.clone());

        supervisor.on_trigger(Trigger::user(alice.clone())).await.unwrap();
        supervisor
            .on_trigger(Trigger {
                user: alice.clone(),
                mailbox_hint: Some(mailbox_id),
                folder_hint: Some("INBOX".to_string()),
            })
            .await
            .unwrap();

        assert!(supervisor.is_running(&alice));
        assert_eq!(supervisor.running_count(), 1);

        supervisor.on_orchestrator_fatal(&alice).await;
        assert!(!supervisor.is_running(&alice));
        assert!(!ctx.store.is_locked(mailbox_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_start_discards_commands() {
        let server = FakeServer::new();
        let ctx = context(&server, 3600).await;
        let bob = UserKey::new(1, "bob");
        for id in 1..=3 {
            ctx.store
                .push_command(&bob, &PendingAction::new(ActionKind::MarkRead, 9, id, FolderRole::Inbox))
                .await
                .unwrap();
        }
        let supervisor = Supervisor::new(ctx.clone());

        let result = supervisor.on_trigger(Trigger::user(bob.clone())).await;
        assert!(matches!(result, Err(SyncError::Configuration(_))));
        assert!(!supervisor.is_running(&bob));
        assert_eq!(supervisor.running_count(), 0);
        assert_eq!(ctx.store.pending_command_count(&bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_idle_account_is_retired_by_run_loop() {
        let server = FakeServer::new();
        let ctx = context(&server, 1).await;
        let alice = UserKey::new(1, "alice");
        let mailbox_id = ctx.store.insert_mailbox(&test_mailbox(&alice)).await.unwrap();
        let supervisor = Supervisor::new(ctx.clone());

        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(Arc::clone(&supervisor).run(trigger_rx));
        trigger_tx.send(Trigger::user(alice.clone())).unwrap();

        let mut seen_running = false;
        for _ in 0..400 {
            let running = supervisor.is_running(&alice);
            seen_running |= running;
            if seen_running && !running && !ctx.store.is_locked(mailbox_id).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen_running);
        assert!(!supervisor.is_running(&alice));
        assert!(!ctx.store.is_locked(mailbox_id).await.unwrap());

        ctx.shutdown.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_orchestrator() {
        let server = FakeServer::new();
        let ctx = context(&server, 3600).await;
        let alice = UserKey::new(1, "alice");
        let bob = UserKey::new(1, "bob");
        let alice_box = ctx.store.insert_mailbox(&test_mailbox(&alice)).await.unwrap();
        let bob_box = ctx.store.insert_mailbox(&test_mailbox(&bob)).await.unwrap();
        let supervisor = Supervisor::new(ctx.clone());

        supervisor.on_trigger(Trigger::user(alice)).await.unwrap();
        supervisor.on_trigger(Trigger::user(bob)).await.unwrap();
        assert_eq!(supervisor.running_count(), 2);

        supervisor.shutdown_all().await;
        assert_eq!(supervisor.running_count(), 0);
        assert!(!ctx.store.is_locked(alice_box).await.unwrap());
        assert!(!ctx.store.is_locked(bob_box).await.unwrap());
    }
}
