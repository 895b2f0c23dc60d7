//! Side effects run once per newly stored message.
//!
//! Steps run in order and are isolated from each other: a failing step is
//! logged and the remaining steps still run. Nothing here rolls back the
//! insert that triggered the pipeline.

use std::sync::Arc;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use async_trait::async_trait;

use crate::config::FilterRule;
use crate::mail::folder::FolderMapping;
use crate::mail::parser::{ParsedMessage, content_hash};
use crate::mail::types::{ActionKind, PendingAction, UserKey};
use crate::store::Store;

/// A reconciled message handed to the pipeline.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub user: UserKey,
    pub mailbox_id: i64,
    pub folder: FolderMapping,
    pub message_id: i64,
    pub parsed: ParsedMessage,
    pub raw: Vec<u8>,
}

impl ProcessedMessage {
    fn action(&self, kind: ActionKind) -> PendingAction {
        PendingAction::new(kind, self.mailbox_id, self.message_id, self.folder.role)
    }
}

/// One pipeline step. Returned actions are applied locally and queued for
/// the server.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        store: &Store,
        message: &ProcessedMessage,
    ) -> anyhow::Result<Vec<PendingAction>>;
}

#[derive(Clone, Default)]
pub struct Pipeline {
    steps: Vec<Arc<dyn PostProcessor>>,
}

impl Pipeline {
    /// Tagging, archival, calendar extraction and the configured filters.
    pub fn standard(filters: &[FilterRule]) -> Self {
        Self::default()
            .with_step(TagStep)
            .with_step(ArchiveStep)
            .with_step(CalendarStep)
            .with_step(FilterStep::new(filters))
    }

    pub fn with_step(mut self, step: impl PostProcessor + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub async fn run(&self, store: &Store, message: &ProcessedMessage) -> Vec<PendingAction> {
        let mut actions = Vec::new();
        for step in &self.steps {
            match step.process(store, message).await {
                Ok(produced) => actions.extend(produced),
                Err(e) => tracing::warn!(
                    "Pipeline step '{}' failed for message {}: {:#}",
                    step.name(),
                    message.message_id,
                    e
                ),
            }
        }
        actions
    }
}

/// Applies the folder's configured tags.
pub struct TagStep;

#[async_trait]
impl PostProcessor for TagStep {
    fn name(&self) -> &str {
        "tags"
    }

    async fn process(
        &self,
        store: &Store,
        message: &ProcessedMessage,
    ) -> anyhow::Result<Vec<PendingAction>> {
        if !message.folder.tags.is_empty() {
            store.add_tags(message.message_id, &message.folder.tags).await?;
        }
        Ok(Vec::new())
    }
}

/// Keeps the raw message, addressed by its SHA-256.
pub struct ArchiveStep;

#[async_trait]
impl PostProcessor for ArchiveStep {
    fn name(&self) -> &str {
        "archive"
    }

    async fn process(
        &self,
        store: &Store,
        message: &ProcessedMessage,
    ) -> anyhow::Result<Vec<PendingAction>> {
        let hash = content_hash(&message.raw);
        store.archive_raw(message.message_id, &hash, &message.raw).await?;
        Ok(Vec::new())
    }
}

/// Records `text/calendar` invitations.
pub struct CalendarStep;

#[async_trait]
impl PostProcessor for CalendarStep {
    fn name(&self) -> &str {
        "calendar"
    }

    async fn process(
        &self,
        store: &Store,
        message: &ProcessedMessage,
    ) -> anyhow::Result<Vec<PendingAction>> {
        if let Some(invite) = &message.parsed.calendar {
            store.record_calendar_invite(message.message_id, invite).await?;
            tracing::debug!(
                "Recorded calendar invite {:?} for message {}",
                invite.uid,
                message.message_id
            );
        }
        Ok(Vec::new())
    }
}

struct CompiledRule {
    name: String,
    from: Option<AhoCorasick>,
    subject: Option<AhoCorasick>,
    action: ActionKind,
}

fn build_matcher(patterns: &[String]) -> Option<AhoCorasick> {
    let patterns: Vec<&str> = patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    if patterns.is_empty() {
        return None;
    }

    match AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(&patterns)
    {
        Ok(ac) => Some(ac),
        Err(e) => {
            tracing::warn!("Ignoring filter patterns {:?}: {}", patterns, e);
            None
        }
    }
}

/// Keyword filters. A rule matches when every pattern list it sets has a
/// hit; the first matching rule wins.
pub struct FilterStep {
    rules: Vec<CompiledRule>,
}

impl FilterStep {
    pub fn new(rules: &[FilterRule]) -> Self {
        let rules = rules
            .iter()
            .enumerate()
            .filter_map(|(i, rule)| {
                let from = build_matcher(&rule.from_contains);
                let subject = build_matcher(&rule.subject_contains);
                if from.is_none() && subject.is_none() {
                    return None;
                }
                Some(CompiledRule {
                    name: rule.name.clone().unwrap_or_else(|| format!("filter #{}", i + 1)),
                    from,
                    subject,
                    action: rule.action,
                })
            })
            .collect();
        Self { rules }
    }

    fn matching(&self, parsed: &ParsedMessage) -> Option<&CompiledRule> {
        self.rules.iter().find(|rule| {
            let from_ok = rule
                .from
                .as_ref()
                .is_none_or(|ac| ac.is_match(&parsed.from_addr));
            let subject_ok = rule
                .subject
                .as_ref()
                .is_none_or(|ac| ac.is_match(&parsed.subject));
            from_ok && subject_ok
        })
    }
}

#[async_trait]
impl PostProcessor for FilterStep {
    fn name(&self) -> &str {
        "filters"
    }

    async fn process(
        &self,
        _store: &Store,
        message: &ProcessedMessage,
    ) -> anyhow::Result<Vec<PendingAction>> {
        let Some(rule) = self.matching(&message.parsed) else {
            return Ok(Vec::new());
        };
        if rule.action == ActionKind::MoveTo(message.folder.role) {
            return Ok(Vec::new());
        }

        tracing::debug!(
            "Filter '{}' matched message {}: {:?}",
            rule.name,
            message.message_id,
            rule.action
        );
        Ok(vec![message.action(rule.action)])
    }
}
