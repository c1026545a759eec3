//! IMAP transport on async-imap 0.11 with tokio-rustls.
use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::types::{MailboxDatum, Response};
use async_imap::types::UnsolicitedResponse;
use async_imap::{Authenticator, Client};
use async_trait::async_trait;
use futures::TryStreamExt;
use rustls_native_certs::load_native_certs;
use std::any::Any;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

use super::{proxy, ConnectTimeouts, Connector, IdleEvent, MailTransport, MailboxStatus, SearchQuery};
use crate::errors::{WatchError, WatchResult};
use crate::message::RawMessage;
use crate::resolver::ConnectTarget;
use crate::types::{AccountCredentials, AuthMechanism};

/// Anything we can speak IMAP over: plain TCP or TLS on top of it.
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + Debug {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Debug> ImapStream for T {}

type ImapSession = async_imap::Session<Compat<Box<dyn ImapStream>>>;

const CLIENT_ID: &str = concat!(
    "ID (\"name\" \"mailwatch\" \"version\" \"",
    env!("CARGO_PKG_VERSION"),
    "\" \"vendor\" \"mailwatch\")"
);

#[derive(Debug, Default, Clone, Copy)]
pub struct ImapConnector;

#[async_trait]
impl Connector for ImapConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        credentials: &AccountCredentials,
        timeouts: ConnectTimeouts,
        announce_identity: bool,
    ) -> WatchResult<Arc<dyn MailTransport>> {
        let transport = ImapTransport::connect(target, credentials, timeouts, announce_identity).await?;
        Ok(Arc::new(transport))
    }
}

pub struct ImapTransport {
    session: Mutex<Option<ImapSession>>,
    usable: AtomicBool,
    /// Commands waiting for the session; an IDLE must yield to them.
    waiting: AtomicUsize,
    /// Dropping the stored stop source ends the IDLE in progress.
    idle_stop: StdMutex<Option<Box<dyn Any + Send>>>,
    account: String,
}

impl ImapTransport {
    pub async fn connect(
        target: &ConnectTarget,
        credentials: &AccountCredentials,
        timeouts: ConnectTimeouts,
        announce_identity: bool,
    ) -> WatchResult<Self> {
        let stream = timeout(timeouts.connect, open_stream(target, credentials.secure))
            .await
            .map_err(|_| {
                WatchError::Timeout(format!(
                    "connecting to {}:{} after {:?}",
                    target.host, target.port, timeouts.connect
                ))
            })??;

        let session = timeout(timeouts.auth, handshake(stream, credentials, announce_identity))
            .await
            .map_err(|_| WatchError::Timeout(format!("authenticating after {:?}", timeouts.auth)))??;

        info!(account = %credentials.address, host = %target.host, "IMAP session established");

        Ok(Self {
            session: Mutex::new(Some(session)),
            usable: AtomicBool::new(true),
            waiting: AtomicUsize::new(0),
            idle_stop: StdMutex::new(None),
            account: credentials.address.clone(),
        })
    }

    /// Take the session for one command, stopping any IDLE that holds it.
    async fn acquire(&self) -> WatchResult<MutexGuard<'_, Option<ImapSession>>> {
        if !self.usable.load(Ordering::SeqCst) {
            return Err(WatchError::Network("connection is no longer usable".into()));
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        self.interrupt_idle();
        let guard = self.session.lock().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        if guard.is_none() {
            return Err(WatchError::Network("connection closed".into()));
        }
        Ok(guard)
    }

    fn interrupt_idle(&self) {
        if let Ok(mut slot) = self.idle_stop.lock() {
            slot.take();
        }
    }

    fn fail(&self, err: async_imap::error::Error) -> WatchError {
        let lost = matches!(
            err,
            async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost
        );
        if lost {
            warn!(account = %self.account, error = %err, "IMAP connection lost");
            self.usable.store(false, Ordering::SeqCst);
        }
        map_imap_error(err)
    }

    fn drain_exists(session: &mut ImapSession) -> Option<u32> {
        let mut latest = None;
        while let Ok(response) = session.unsolicited_responses.try_recv() {
            if let UnsolicitedResponse::Exists(n) = response {
                latest = Some(n);
            }
        }
        latest
    }
}

#[async_trait]
impl MailTransport for ImapTransport {
    async fn open_mailbox(&self, name: &str) -> WatchResult<MailboxStatus> {
        let mut guard = self.acquire().await?;
        let Some(session) = guard.as_mut() else {
            return Err(WatchError::NotConnected);
        };
        let mailbox = session.select(name).await.map_err(|e| self.fail(e))?;
        debug!(account = %self.account, mailbox = name, exists = mailbox.exists, "Mailbox selected");
        Ok(MailboxStatus {
            exists: mailbox.exists,
            uid_validity: mailbox.uid_validity,
        })
    }

    async fn noop(&self) -> WatchResult<Option<u32>> {
        let mut guard = self.acquire().await?;
        let Some(session) = guard.as_mut() else {
            return Err(WatchError::NotConnected);
        };
        session.noop().await.map_err(|e| self.fail(e))?;
        Ok(Self::drain_exists(session))
    }

    async fn idle(&self, max: Duration) -> WatchResult<IdleEvent> {
        let mut guard = self.acquire().await?;
        if self.waiting.load(Ordering::SeqCst) > 0 {
            return Ok(IdleEvent::Interrupted);
        }
        let Some(session) = guard.take() else {
            return Err(WatchError::NotConnected);
        };

        let mut handle = session.idle();
        if let Err(e) = handle.init().await {
            // The session is gone with the failed handle unless DONE succeeds.
            if let Ok(session) = handle.done().await {
                *guard = Some(session);
            } else {
                self.usable.store(false, Ordering::SeqCst);
            }
            return Err(self.fail(e));
        }

        let outcome = {
            let (wait, stop) = handle.wait();
            if let Ok(mut slot) = self.idle_stop.lock() {
                *slot = Some(Box::new(stop));
            }
            // A command may have queued between acquire and storing the stop source.
            if self.waiting.load(Ordering::SeqCst) > 0 {
                self.interrupt_idle();
            }
            timeout(max, wait).await
        };
        self.interrupt_idle();

        match handle.done().await {
            Ok(session) => *guard = Some(session),
            Err(e) => return Err(self.fail(e)),
        }

        match outcome {
            Err(_) => Ok(IdleEvent::Timeout),
            Ok(Ok(IdleResponse::Timeout)) => Ok(IdleEvent::Timeout),
            Ok(Ok(IdleResponse::ManualInterrupt)) => Ok(IdleEvent::Interrupted),
            Ok(Ok(IdleResponse::NewData(data))) => match data.parsed() {
                Response::MailboxData(MailboxDatum::Exists(n)) => Ok(IdleEvent::Exists(*n)),
                _ => Ok(IdleEvent::Other),
            },
            Ok(Err(e)) => Err(self.fail(e)),
        }
    }

    async fn search(&self, query: SearchQuery) -> WatchResult<Vec<u32>> {
        let mut guard = self.acquire().await?;
        let Some(session) = guard.as_mut() else {
            return Err(WatchError::NotConnected);
        };
        let raw = query.to_imap();
        let found = session.uid_search(&raw).await.map_err(|e| self.fail(e))?;
        let mut uids: Vec<u32> = found.into_iter().collect();
        uids.sort_unstable();
        debug!(account = %self.account, query = %raw, found = uids.len(), "UID SEARCH");
        Ok(uids)
    }

    async fn fetch_size(&self, uid: u32) -> WatchResult<Option<u32>> {
        let mut guard = self.acquire().await?;
        let Some(session) = guard.as_mut() else {
            return Err(WatchError::NotConnected);
        };
        let fetches: Vec<_> = session
            .uid_fetch(uid.to_string(), "(UID RFC822.SIZE)")
            .await
            .map_err(|e| self.fail(e))?
            .try_collect()
            .await
            .map_err(|e| self.fail(e))?;
        Ok(fetches.iter().find_map(|f| f.size))
    }

    async fn fetch(&self, uid: u32) -> WatchResult<Option<RawMessage>> {
        let mut guard = self.acquire().await?;
        let Some(session) = guard.as_mut() else {
            return Err(WatchError::NotConnected);
        };
        let fetches: Vec<_> = session
            .uid_fetch(uid.to_string(), "(UID RFC822.SIZE BODY.PEEK[])")
            .await
            .map_err(|e| self.fail(e))?
            .try_collect()
            .await
            .map_err(|e| self.fail(e))?;

        Ok(fetches
            .iter()
            .find(|f| f.uid == Some(uid) || f.uid.is_none())
            .and_then(|f| {
                f.body().map(|body| RawMessage {
                    uid,
                    size: f.size,
                    body: body.to_vec(),
                })
            }))
    }

    async fn mark_seen(&self, uid: u32) -> WatchResult<()> {
        let mut guard = self.acquire().await?;
        let Some(session) = guard.as_mut() else {
            return Err(WatchError::NotConnected);
        };
        let _updates: Vec<_> = session
            .uid_store(uid.to_string(), "+FLAGS.SILENT (\\Seen)")
            .await
            .map_err(|e| self.fail(e))?
            .try_collect()
            .await
            .map_err(|e| self.fail(e))?;
        Ok(())
    }

    fn is_usable(&self) -> bool {
        self.usable.load(Ordering::SeqCst)
    }

    async fn logout(&self) -> WatchResult<()> {
        self.interrupt_idle();
        let mut guard = self.session.lock().await;
        self.usable.store(false, Ordering::SeqCst);
        match guard.take() {
            Some(mut session) => session.logout().await.map_err(map_imap_error),
            None => Ok(()),
        }
    }
}

async fn open_stream(target: &ConnectTarget, secure: bool) -> WatchResult<Box<dyn ImapStream>> {
    let tcp = match (&target.proxy, target.addr) {
        (Some(proxy_url), _) => proxy::tunnel(proxy_url, &target.host, target.port).await?,
        (None, Some(addr)) => TcpStream::connect(addr).await?,
        (None, None) => TcpStream::connect((target.host.as_str(), target.port)).await?,
    };
    tcp.set_nodelay(true).ok();

    if !secure {
        return Ok(Box::new(tcp));
    }

    let mut root_store = RootCertStore::empty();
    let certs = load_native_certs()
        .map_err(|e| WatchError::Config(format!("failed to load native certs: {e}")))?;
    for cert in certs {
        if let Err(e) = root_store.add(&tokio_rustls::rustls::Certificate(cert.0)) {
            debug!(error = %e, "Skipping unusable root certificate");
        }
    }

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    // SNI carries the hostname even when we dial a resolved address.
    let server_name = ServerName::try_from(target.host.as_str())
        .map_err(|_| WatchError::Config(format!("invalid DNS name {}", target.host)))?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| WatchError::Network(format!("TLS handshake with {} failed: {e}", target.host)))?;

    Ok(Box::new(tls))
}

async fn handshake(
    stream: Box<dyn ImapStream>,
    credentials: &AccountCredentials,
    announce_identity: bool,
) -> WatchResult<ImapSession> {
    let mut client = Client::new(stream.compat());

    let _greeting = client
        .read_response()
        .await
        .map_err(|e| WatchError::Network(format!("reading IMAP greeting: {e}")))?
        .ok_or_else(|| WatchError::Network("unexpected end of stream, expected greeting".into()))?;

    let mut session = match credentials.auth {
        AuthMechanism::Login => client
            .login(&credentials.address, &credentials.secret)
            .await
            .map_err(|(err, _client)| auth_error(err))?,
        AuthMechanism::Xoauth2 => {
            let xoauth = Xoauth2 {
                user: credentials.address.clone(),
                access_token: credentials.secret.clone(),
            };
            client
                .authenticate("XOAUTH2", xoauth)
                .await
                .map_err(|(err, _client)| auth_error(err))?
        }
    };

    if announce_identity {
        // Best effort; servers that need it reject the login, not the ID.
        if let Err(e) = session.run_command_and_check_ok(CLIENT_ID).await {
            warn!(account = %credentials.address, error = %e, "IMAP ID command failed");
        }
    }

    Ok(session)
}

fn auth_error(err: async_imap::error::Error) -> WatchError {
    match err {
        async_imap::error::Error::No(text) | async_imap::error::Error::Bad(text) => WatchError::Auth(text),
        async_imap::error::Error::Io(e) => WatchError::from(e),
        other => WatchError::Auth(other.to_string()),
    }
}

fn map_imap_error(err: async_imap::error::Error) -> WatchError {
    match err {
        async_imap::error::Error::Io(e) => WatchError::from(e),
        async_imap::error::Error::ConnectionLost => WatchError::Network("connection lost".into()),
        other => WatchError::Protocol(other.to_string()),
    }
}

struct Xoauth2 {
    user: String,
    access_token: String,
}

impl Authenticator for Xoauth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> String {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}
