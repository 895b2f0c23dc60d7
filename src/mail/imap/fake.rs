//! Scripted in-memory IMAP server for tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::SessionError;
use crate::mail::folder::{FolderAttribute, RemoteFolder};
use crate::mail::types::{EmailFlags, MailboxAccount};

use super::{
    Connector, FolderStatus, Interrupt, MailConnection, MessageSummary, ServerEvent,
};

#[derive(Debug, Clone)]
struct FakeMessage {
    uid: u32,
    flags: EmailFlags,
    raw: Vec<u8>,
}

#[derive(Debug, Default)]
struct FakeFolder {
    attributes: Vec<FolderAttribute>,
    messages: Vec<FakeMessage>,
    next_uid: u32,
}

struct Subscriber {
    connection: usize,
    folder: String,
    events: Arc<Mutex<Vec<ServerEvent>>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct State {
    folders: BTreeMap<String, FakeFolder>,
    subscribers: Vec<Subscriber>,
    reject_logins: bool,
    no_idle: bool,
    /// Bumped by `drop_connections`; older connections fail with a transport error.
    generation: u64,
    connections: usize,
    idles: usize,
    log: Vec<String>,
}

impl State {
    fn folder_mut(&mut self, name: &str) -> &mut FakeFolder {
        self.folders.entry(name.to_string()).or_insert_with(|| FakeFolder {
            next_uid: 1,
            ..FakeFolder::default()
        })
    }

    fn publish(&self, folder: &str, except: Option<usize>, event: ServerEvent) {
        for sub in self
            .subscribers
            .iter()
            .filter(|s| s.folder == folder && Some(s.connection) != except)
        {
            if let Ok(mut events) = sub.events.lock() {
                events.push(event.clone());
            }
            sub.notify.notify_one();
        }
    }
}

/// Shared handle to the fake server; clones see the same mailbox.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    pub fn new() -> Self {
        let server = Self::default();
        server.add_folder("INBOX", Vec::new());
        server
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn add_folder(&self, name: &str, attributes: Vec<FolderAttribute>) {
        self.with_state(|state| state.folder_mut(name).attributes = attributes);
    }

    /// Append a message and notify sessions with the folder selected.
    pub fn deliver(&self, folder: &str, raw: &[u8], flags: EmailFlags) -> u32 {
        self.with_state(|state| {
            let target = state.folder_mut(folder);
            let uid = target.next_uid;
            target.next_uid += 1;
            target.messages.push(FakeMessage {
                uid,
                flags,
                raw: raw.to_vec(),
            });
            let count = target.messages.len() as u32;
            state.publish(folder, None, ServerEvent::CountChanged(count));
            uid
        })
    }

    /// Change flags from "another client".
    pub fn set_flags(&self, folder: &str, uid: u32, flags: EmailFlags) {
        self.with_state(|state| {
            let target = state.folder_mut(folder);
            let Some(index) = target.messages.iter().position(|m| m.uid == uid) else {
                return;
            };
            target.messages[index].flags = flags;
            state.publish(
                folder,
                None,
                ServerEvent::FlagsChanged {
                    index: index as u32 + 1,
                    flags,
                },
            );
        });
    }

    /// Expunge from "another client".
    pub fn remove(&self, folder: &str, uid: u32) {
        self.with_state(|state| {
            let target = state.folder_mut(folder);
            let Some(index) = target.messages.iter().position(|m| m.uid == uid) else {
                return;
            };
            target.messages.remove(index);
            state.publish(folder, None, ServerEvent::Expunged(index as u32 + 1));
        });
    }

    pub fn flags(&self, folder: &str, uid: u32) -> Option<EmailFlags> {
        self.with_state(|state| {
            state
                .folders
                .get(folder)
                .and_then(|f| f.messages.iter().find(|m| m.uid == uid))
                .map(|m| m.flags)
        })
    }

    pub fn count(&self, folder: &str) -> usize {
        self.with_state(|state| state.folders.get(folder).map_or(0, |f| f.messages.len()))
    }

    pub fn reject_logins(&self, reject: bool) {
        self.with_state(|state| state.reject_logins = reject);
    }

    pub fn disable_idle(&self) {
        self.with_state(|state| state.no_idle = true);
    }

    /// Break every open connection.
    pub fn drop_connections(&self) {
        self.with_state(|state| {
            state.generation += 1;
            for sub in &state.subscribers {
                sub.notify.notify_one();
            }
        });
    }

    pub fn connections(&self) -> usize {
        self.with_state(|state| state.connections)
    }

    pub fn idles(&self) -> usize {
        self.with_state(|state| state.idles)
    }

    /// Mutating commands received so far, e.g. `MOVE 3 Trash`.
    pub fn log(&self) -> Vec<String> {
        self.with_state(|state| state.log.clone())
    }

    pub async fn wait_for_log(&self, entry: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.log().iter().any(|l| l == entry) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

pub struct FakeConnector {
    pub server: FakeServer,
}

impl FakeConnector {
    pub fn new(server: FakeServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        account: &MailboxAccount,
    ) -> Result<Box<dyn MailConnection>, SessionError> {
        self.server.with_state(|state| {
            if state.reject_logins {
                return Err(SessionError::Authentication(format!(
                    "invalid credentials for {}",
                    account.login
                )));
            }
            state.connections += 1;
            Ok(Box::new(FakeConnection {
                server: self.server.clone(),
                id: state.connections,
                generation: state.generation,
                selected: None,
                events: Arc::new(Mutex::new(Vec::new())),
                notify: Arc::new(Notify::new()),
            }) as Box<dyn MailConnection>)
        })
    }
}

struct FakeConnection {
    server: FakeServer,
    id: usize,
    generation: u64,
    selected: Option<String>,
    events: Arc<Mutex<Vec<ServerEvent>>>,
    notify: Arc<Notify>,
}

impl FakeConnection {
    fn check(&self) -> Result<(), SessionError> {
        let current = self.server.with_state(|state| state.generation);
        if current != self.generation {
            return Err(SessionError::Transport("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn selected(&self) -> Result<String, SessionError> {
        self.selected
            .clone()
            .ok_or_else(|| SessionError::Rejected("no folder selected".to_string()))
    }

    fn take_events(&self) -> Vec<ServerEvent> {
        self.events
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }

    fn uid_list(uids: &[u32]) -> String {
        uids.iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn store(&self, uids: &[u32], flags: EmailFlags, add: bool) -> Result<(), SessionError> {
        self.check()?;
        let folder = self.selected()?;
        let id = self.id;
        self.server.with_state(|state| {
            let sign = if add { '+' } else { '-' };
            state.log.push(format!(
                "STORE {} {}FLAGS {}",
                Self::uid_list(uids),
                sign,
                flags.imap_list()
            ));
            let target = state.folder_mut(&folder);
            let mut changed = Vec::new();
            for (index, message) in target.messages.iter_mut().enumerate() {
                if uids.contains(&message.uid) {
                    message.flags.set(flags, add);
                    changed.push((index as u32 + 1, message.flags));
                }
            }
            for (index, flags) in changed {
                state.publish(&folder, Some(id), ServerEvent::FlagsChanged { index, flags });
            }
        });
        Ok(())
    }

    fn take_messages(&self, folder: &str, uids: &[u32]) -> Vec<FakeMessage> {
        let id = self.id;
        self.server.with_state(|state| {
            let target = state.folder_mut(folder);
            let mut taken = Vec::new();
            let mut expunged = Vec::new();
            while let Some(index) = target.messages.iter().position(|m| uids.contains(&m.uid)) {
                taken.push(target.messages.remove(index));
                expunged.push(index as u32 + 1);
            }
            for index in expunged {
                state.publish(folder, Some(id), ServerEvent::Expunged(index));
            }
            taken
        })
    }
}

#[async_trait]
impl MailConnection for FakeConnection {
    fn supports_idle(&self) -> bool {
        self.server.with_state(|state| !state.no_idle)
    }

    async fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, SessionError> {
        self.check()?;
        Ok(self.server.with_state(|state| {
            state
                .folders
                .iter()
                .map(|(name, folder)| RemoteFolder {
                    name: name.clone(),
                    attributes: folder.attributes.clone(),
                })
                .collect()
        }))
    }

    async fn select(&mut self, folder: &str) -> Result<FolderStatus, SessionError> {
        self.check()?;
        let id = self.id;
        let events = self.events.clone();
        let notify = self.notify.clone();
        let exists = self.server.with_state(|state| {
            let target = state.folders.get(folder)?;
            let exists = target.messages.len() as u32;
            state.subscribers.retain(|s| s.connection != id);
            state.subscribers.push(Subscriber {
                connection: id,
                folder: folder.to_string(),
                events,
                notify,
            });
            Some(exists)
        });
        let exists = exists.ok_or_else(|| SessionError::FolderNotFound(folder.to_string()))?;
        self.selected = Some(folder.to_string());
        Ok(FolderStatus {
            exists,
            uid_validity: Some(1),
            uid_next: None,
        })
    }

    async fn fetch_summaries(&mut self) -> Result<Vec<MessageSummary>, SessionError> {
        self.check()?;
        let folder = self.selected()?;
        Ok(self.server.with_state(|state| {
            state.folder_mut(&folder)
                .messages
                .iter()
                .enumerate()
                .map(|(index, m)| MessageSummary {
                    uid: m.uid,
                    index: index as u32 + 1,
                    flags: m.flags,
                    server_date: None,
                })
                .collect()
        }))
    }

    async fn fetch_body(&mut self, uid: u32) -> Result<Option<Vec<u8>>, SessionError> {
        self.check()?;
        let folder = self.selected()?;
        Ok(self.server.with_state(|state| {
            state
                .folder_mut(&folder)
                .messages
                .iter()
                .find(|m| m.uid == uid)
                .map(|m| m.raw.clone())
        }))
    }

    async fn add_flags(&mut self, uids: &[u32], flags: EmailFlags) -> Result<(), SessionError> {
        self.store(uids, flags, true)
    }

    async fn remove_flags(&mut self, uids: &[u32], flags: EmailFlags) -> Result<(), SessionError> {
        self.store(uids, flags, false)
    }

    async fn move_messages(
        &mut self,
        uids: &[u32],
        destination: &str,
    ) -> Result<(), SessionError> {
        self.check()?;
        let folder = self.selected()?;
        let known = self
            .server
            .with_state(|state| state.folders.contains_key(destination));
        if !known {
            return Err(SessionError::Rejected(format!(
                "[TRYCREATE] no folder {destination}"
            )));
        }

        let moved = self.take_messages(&folder, uids);
        self.server.with_state(|state| {
            state
                .log
                .push(format!("MOVE {} {}", Self::uid_list(uids), destination));
            for message in moved {
                let target = state.folder_mut(destination);
                let uid = target.next_uid;
                target.next_uid += 1;
                target.messages.push(FakeMessage { uid, ..message });
                let count = target.messages.len() as u32;
                state.publish(destination, None, ServerEvent::CountChanged(count));
            }
        });
        Ok(())
    }

    async fn expunge(&mut self, uids: &[u32]) -> Result<(), SessionError> {
        self.check()?;
        let folder = self.selected()?;
        self.take_messages(&folder, uids);
        self.server.with_state(|state| {
            state
                .log
                .push(format!("EXPUNGE {}", Self::uid_list(uids)));
        });
        Ok(())
    }

    async fn idle(
        &mut self,
        timeout: Duration,
        interrupt: &Interrupt,
    ) -> Result<Vec<ServerEvent>, SessionError> {
        self.check()?;
        let pending = self.take_events();
        if !pending.is_empty() {
            return Ok(pending);
        }

        self.server.with_state(|state| state.idles += 1);
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
            _ = interrupt.wait() => {}
        }

        self.check()?;
        Ok(self.take_events())
    }

    async fn noop(&mut self) -> Result<Vec<ServerEvent>, SessionError> {
        self.check()?;
        Ok(self.take_events())
    }

    async fn logout(&mut self) {
        let id = self.id;
        self.server
            .with_state(|state| state.subscribers.retain(|s| s.connection != id));
    }
}
