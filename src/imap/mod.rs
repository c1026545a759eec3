//! Mailbox protocol seam.
//!
//! The session and the sync engine only talk to [`MailTransport`]; the
//! async-imap backed implementation lives in [`client`].

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::WatchResult;
use crate::message::RawMessage;
use crate::resolver::ConnectTarget;
use crate::types::AccountCredentials;

pub mod client;
pub mod proxy;

pub use client::{ImapConnector, ImapTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    pub exists: u32,
    pub uid_validity: Option<u32>,
}

/// How one IDLE round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// Server reported a new message count.
    Exists(u32),
    /// Some other unsolicited update (flags, expunge, ...).
    Other,
    /// The maximum IDLE window elapsed; re-issue.
    Timeout,
    /// Another command on this transport needed the connection.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchQuery {
    Unseen { since: Option<NaiveDate> },
    Since(NaiveDate),
    All,
}

impl SearchQuery {
    pub fn to_imap(&self) -> String {
        match self {
            SearchQuery::Unseen { since: None } => "UNSEEN".to_string(),
            SearchQuery::Unseen { since: Some(d) } => format!("UNSEEN SINCE {}", imap_date(*d)),
            SearchQuery::Since(d) => format!("SINCE {}", imap_date(*d)),
            SearchQuery::All => "ALL".to_string(),
        }
    }
}

fn imap_date(d: NaiveDate) -> String {
    d.format("%d-%b-%Y").to_string()
}

/// Timeouts for opening a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectTimeouts {
    pub connect: Duration,
    pub auth: Duration,
}

/// One open, authenticated protocol connection. Methods take `&self`; the
/// implementation serializes commands internally, so concurrent callers queue
/// rather than interleave.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn open_mailbox(&self, name: &str) -> WatchResult<MailboxStatus>;

    /// Cheap round-trip. Returns the newest EXISTS count the server pushed
    /// while the command ran, if any.
    async fn noop(&self) -> WatchResult<Option<u32>>;

    /// Wait for a server notification for at most `max`.
    async fn idle(&self, max: Duration) -> WatchResult<IdleEvent>;

    async fn search(&self, query: SearchQuery) -> WatchResult<Vec<u32>>;

    /// Advertised RFC822.SIZE, without downloading the body.
    async fn fetch_size(&self, uid: u32) -> WatchResult<Option<u32>>;

    /// Full message, or `None` if the UID no longer exists.
    async fn fetch(&self, uid: u32) -> WatchResult<Option<RawMessage>>;

    async fn mark_seen(&self, uid: u32) -> WatchResult<()>;

    /// Local view: false once the underlying stream has errored or closed.
    fn is_usable(&self) -> bool;

    async fn logout(&self) -> WatchResult<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &ConnectTarget,
        credentials: &AccountCredentials,
        timeouts: ConnectTimeouts,
        announce_identity: bool,
    ) -> WatchResult<Arc<dyn MailTransport>>;
}
