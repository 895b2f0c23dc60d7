mod actions;
mod mailbox;
mod orchestrator;
pub mod pipeline;
mod reconcile;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::mail::imap::Connector;
use crate::mail::types::UserKey;
use crate::store::Store;

pub use actions::{ActionBatch, InboundQueue, apply_batch, coalesce};
pub use mailbox::MailboxSessions;
pub use orchestrator::AccountOrchestrator;
pub use pipeline::{Pipeline, PostProcessor, ProcessedMessage};
pub use reconcile::{Reconciled, reconcile_flags, reconcile_new_message};

/// Events for the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotice {
    /// Published at most once per drain pass.
    UnreadChanged { user: UserKey },
    NewMessage {
        user: UserKey,
        mailbox_id: i64,
        message_id: i64,
    },
}

/// Everything an orchestrator shares with the rest of the process.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Store,
    pub connector: Arc<dyn Connector>,
    pub config: Arc<Config>,
    pub pipeline: Arc<Pipeline>,
    pub notices: mpsc::UnboundedSender<EngineNotice>,
    /// Process-wide shutdown token; orchestrators derive theirs from it.
    pub shutdown: CancellationToken,
}
