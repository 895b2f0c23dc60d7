//! IMAP connections over async-imap: TCP, implicit TLS or STARTTLS.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{AttributeValue, MailboxDatum, Response};
use async_imap::types::{Flag, NameAttribute, UnsolicitedResponse};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use futures::io::{AsyncRead, AsyncWrite};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::error::SessionError;
use crate::mail::folder::{FolderAttribute, RemoteFolder};
use crate::mail::parser::{parse_flag_names, parse_flags_from_imap};
use crate::mail::types::{Credentials, EmailFlags, Encryption, MailboxAccount};

use super::{
    Connector, FolderStatus, Interrupt, MailConnection, MessageSummary, ServerEvent,
    XOAuth2Authenticator, uid_sets,
};

/// Byte stream an IMAP client can run over, plain or encrypted.
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T> ImapStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

type ImapSession = async_imap::Session<Box<dyn ImapStream>>;

/// [`Connector`] for real IMAP servers.
#[derive(Clone)]
pub struct ImapConnector {
    tls: TlsConnector,
}

// TlsConnector has no Debug impl.
impl fmt::Debug for ImapConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConnector").finish_non_exhaustive()
    }
}

impl Default for ImapConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ImapConnector {
    pub fn new() -> Self {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    async fn tls_handshake(
        &self,
        host: &str,
        tcp: TcpStream,
    ) -> Result<TlsStream<TcpStream>, SessionError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| SessionError::Transport(format!("Invalid server name: {e}")))?;
        self.tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| SessionError::Transport(format!("TLS handshake failed: {e}")))
    }

    async fn open_stream(
        &self,
        account: &MailboxAccount,
    ) -> Result<Box<dyn ImapStream>, SessionError> {
        let addr = format!("{}:{}", account.host, account.port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| SessionError::Transport(format!("Failed to connect to {addr}: {e}")))?;

        match account.encryption {
            Encryption::None => Ok(Box::new(tcp.compat())),
            Encryption::Tls => {
                let tls = self.tls_handshake(&account.host, tcp).await?;
                Ok(Box::new(tls.compat()))
            }
            Encryption::StartTls => {
                let mut client = async_imap::Client::new(tcp.compat());
                client
                    .run_command_and_check_ok("STARTTLS", None)
                    .await
                    .map_err(|e| SessionError::Transport(format!("STARTTLS failed: {e}")))?;
                let tcp = client.into_inner().into_inner();
                let tls = self.tls_handshake(&account.host, tcp).await?;
                Ok(Box::new(tls.compat()))
            }
        }
    }
}

/// Login failures are credential problems unless the connection itself broke.
fn login_error(err: async_imap::error::Error) -> SessionError {
    match SessionError::from(err) {
        SessionError::Transport(msg) => SessionError::Transport(msg),
        other => SessionError::Authentication(other.to_string()),
    }
}

#[async_trait]
impl Connector for ImapConnector {
    async fn connect(
        &self,
        account: &MailboxAccount,
    ) -> Result<Box<dyn MailConnection>, SessionError> {
        let stream = self.open_stream(account).await?;
        let client = async_imap::Client::new(stream);

        let mut session = match &account.credentials {
            Credentials::Password(password) => client
                .login(&account.login, password)
                .await
                .map_err(|(e, _)| login_error(e))?,
            Credentials::Bearer(token) => {
                let authenticator = XOAuth2Authenticator {
                    user: account.login.clone(),
                    access_token: token.clone(),
                };
                client
                    .authenticate("XOAUTH2", authenticator)
                    .await
                    .map_err(|(e, _)| login_error(e))?
            }
        };

        let caps = session.capabilities().await?;
        let connection = ImapConnection {
            has_idle: caps.has_str("IDLE"),
            has_move: caps.has_str("MOVE"),
            has_uidplus: caps.has_str("UIDPLUS"),
            exists: 0,
            session: Some(session),
        };

        tracing::info!(
            "Connected to IMAP server {} for {} (idle={}, move={}, uidplus={})",
            account.host,
            account.address,
            connection.has_idle,
            connection.has_move,
            connection.has_uidplus
        );

        Ok(Box::new(connection))
    }
}

struct ImapConnection {
    /// `None` only while an IDLE is in flight or after a failed IDLE exit.
    session: Option<ImapSession>,
    has_idle: bool,
    has_move: bool,
    has_uidplus: bool,
    /// EXISTS count of the selected folder.
    exists: u32,
}

impl ImapConnection {
    fn session(&mut self) -> Result<&mut ImapSession, SessionError> {
        self.session
            .as_mut()
            .ok_or_else(|| SessionError::Transport("Not connected to IMAP server".to_string()))
    }

    /// Drain responses the server sent outside of any command.
    fn drain_unsolicited(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        let Some(session) = self.session.as_ref() else {
            return events;
        };

        while let Ok(response) = session.unsolicited_responses.try_recv() {
            match response {
                UnsolicitedResponse::Exists(count) => events.push(ServerEvent::CountChanged(count)),
                UnsolicitedResponse::Expunge(index) => events.push(ServerEvent::Expunged(index)),
                UnsolicitedResponse::Other(data) => events.extend(parse_response(data.parsed())),
                _ => {}
            }
        }

        self.track_exists(&events);
        events
    }

    fn track_exists(&mut self, events: &[ServerEvent]) {
        for event in events {
            match event {
                ServerEvent::CountChanged(count) => self.exists = *count,
                ServerEvent::Expunged(_) => self.exists = self.exists.saturating_sub(1),
                ServerEvent::FlagsChanged { .. } => {}
            }
        }
    }

    async fn store(&mut self, uids: &[u32], query: &str) -> Result<(), SessionError> {
        let session = self.session()?;
        for set in uid_sets(uids) {
            let _: Vec<_> = session.uid_store(&set, query).await?.try_collect().await?;
        }
        Ok(())
    }

    async fn uid_expunge(&mut self, uids: &[u32]) -> Result<(), SessionError> {
        let has_uidplus = self.has_uidplus;
        let session = self.session()?;

        if has_uidplus {
            for set in uid_sets(uids) {
                let _: Vec<u32> = session.uid_expunge(&set).await?.try_collect().await?;
            }
        } else {
            // Without UIDPLUS this also removes other messages already flagged \Deleted.
            let _: Vec<u32> = session.expunge().await?.try_collect().await?;
        }
        Ok(())
    }
}

fn parse_response(response: &Response<'_>) -> Vec<ServerEvent> {
    match response {
        Response::MailboxData(MailboxDatum::Exists(count)) => {
            vec![ServerEvent::CountChanged(*count)]
        }
        Response::Expunge(index) => vec![ServerEvent::Expunged(*index)],
        Response::Fetch(index, attributes) => attributes
            .iter()
            .filter_map(|attr| match attr {
                AttributeValue::Flags(flags) => Some(ServerEvent::FlagsChanged {
                    index: *index,
                    flags: parse_flag_names(flags),
                }),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn convert_attribute(attr: &NameAttribute<'_>) -> FolderAttribute {
    match attr {
        NameAttribute::NoSelect => FolderAttribute::NoSelect,
        NameAttribute::All => FolderAttribute::All,
        NameAttribute::Archive => FolderAttribute::Archive,
        NameAttribute::Drafts => FolderAttribute::Drafts,
        NameAttribute::Flagged => FolderAttribute::Flagged,
        NameAttribute::Junk => FolderAttribute::Junk,
        NameAttribute::Sent => FolderAttribute::Sent,
        NameAttribute::Trash => FolderAttribute::Trash,
        NameAttribute::Extension(label) => FolderAttribute::parse(label),
        other => FolderAttribute::Other(format!("{:?}", other)),
    }
}

#[async_trait]
impl MailConnection for ImapConnection {
    fn supports_idle(&self) -> bool {
        self.has_idle
    }

    async fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, SessionError> {
        let session = self.session()?;
        let names: Vec<_> = session
            .list(Some(""), Some("*"))
            .await?
            .try_collect()
            .await?;

        Ok(names
            .iter()
            .map(|name| RemoteFolder {
                name: name.name().to_string(),
                attributes: name.attributes().iter().map(convert_attribute).collect(),
            })
            .collect())
    }

    async fn select(&mut self, folder: &str) -> Result<FolderStatus, SessionError> {
        let mailbox = self
            .session()?
            .select(folder)
            .await
            .map_err(|e| match SessionError::from(e) {
                SessionError::Rejected(_) => SessionError::FolderNotFound(folder.to_string()),
                other => other,
            })?;

        self.exists = mailbox.exists;
        Ok(FolderStatus {
            exists: mailbox.exists,
            uid_validity: mailbox.uid_validity,
            uid_next: mailbox.uid_next,
        })
    }

    async fn fetch_summaries(&mut self) -> Result<Vec<MessageSummary>, SessionError> {
        // "1:*" on an empty folder is an error on some servers.
        if self.exists == 0 {
            let events = self.drain_unsolicited();
            if self.exists == 0 {
                tracing::debug!("Skipping fetch of empty folder ({} events)", events.len());
                return Ok(Vec::new());
            }
        }

        let session = self.session()?;
        let fetches: Vec<_> = session
            .fetch("1:*", "(UID FLAGS INTERNALDATE)")
            .await?
            .try_collect()
            .await?;

        let summaries: Vec<MessageSummary> = fetches
            .iter()
            .filter_map(|fetch| {
                let uid = fetch.uid?;
                let flags: Vec<Flag> = fetch.flags().collect();
                Some(MessageSummary {
                    uid,
                    index: fetch.message,
                    flags: parse_flags_from_imap(&flags),
                    server_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
                })
            })
            .collect();

        self.exists = self.exists.max(summaries.len() as u32);
        Ok(summaries)
    }

    async fn fetch_body(&mut self, uid: u32) -> Result<Option<Vec<u8>>, SessionError> {
        let session = self.session()?;
        let fetches: Vec<_> = session
            .uid_fetch(uid.to_string(), "BODY.PEEK[]")
            .await?
            .try_collect()
            .await?;

        Ok(fetches
            .iter()
            .find(|fetch| fetch.uid == Some(uid))
            .and_then(|fetch| fetch.body())
            .map(|body| body.to_vec()))
    }

    async fn add_flags(&mut self, uids: &[u32], flags: EmailFlags) -> Result<(), SessionError> {
        // .SILENT keeps the server from echoing our own change back as a FETCH.
        self.store(uids, &format!("+FLAGS.SILENT ({})", flags.imap_list()))
            .await
    }

    async fn remove_flags(&mut self, uids: &[u32], flags: EmailFlags) -> Result<(), SessionError> {
        self.store(uids, &format!("-FLAGS.SILENT ({})", flags.imap_list()))
            .await
    }

    async fn move_messages(
        &mut self,
        uids: &[u32],
        destination: &str,
    ) -> Result<(), SessionError> {
        if self.has_move {
            let session = self.session()?;
            for set in uid_sets(uids) {
                session.uid_mv(&set, destination).await?;
            }
            return Ok(());
        }

        let session = self.session()?;
        for set in uid_sets(uids) {
            session.uid_copy(&set, destination).await?;
        }
        self.expunge(uids).await
    }

    async fn expunge(&mut self, uids: &[u32]) -> Result<(), SessionError> {
        self.add_flags(uids, EmailFlags::DELETED).await?;
        self.uid_expunge(uids).await
    }

    async fn idle(
        &mut self,
        timeout: Duration,
        interrupt: &Interrupt,
    ) -> Result<Vec<ServerEvent>, SessionError> {
        // Changes reported during earlier commands are handled before waiting.
        let pending = self.drain_unsolicited();
        if !pending.is_empty() {
            return Ok(pending);
        }

        let session = self
            .session
            .take()
            .ok_or_else(|| SessionError::Transport("Not connected to IMAP server".to_string()))?;

        let mut idle = session.idle();
        if let Err(e) = idle.init().await {
            tracing::warn!("Failed to init IDLE: {:?}", e);
            if let Ok(session) = idle.done().await {
                self.session = Some(session);
            }
            return Err(e.into());
        }

        let (idle_future, stop_source) = idle.wait();
        let idle_with_timeout = tokio::time::timeout(timeout, idle_future);

        let outcome = tokio::select! {
            result = idle_with_timeout => Some(result),
            _ = interrupt.wait() => None,
        };
        drop(stop_source);

        let mut events = Vec::new();
        let mut failure = None;
        match outcome {
            Some(Ok(Ok(IdleResponse::NewData(data)))) => events.extend(parse_response(data.parsed())),
            Some(Ok(Ok(_))) | Some(Err(_)) | None => {}
            Some(Ok(Err(e))) => failure = Some(SessionError::from(e)),
        }

        match idle.done().await {
            Ok(session) => self.session = Some(session),
            Err(e) => return Err(failure.unwrap_or_else(|| SessionError::from(e))),
        }
        if let Some(failure) = failure {
            return Err(failure);
        }

        self.track_exists(&events);
        events.extend(self.drain_unsolicited());
        Ok(events)
    }

    async fn noop(&mut self) -> Result<Vec<ServerEvent>, SessionError> {
        self.session()?.noop().await?;
        Ok(self.drain_unsolicited())
    }

    async fn logout(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.logout().await.ok();
        }
    }
}
