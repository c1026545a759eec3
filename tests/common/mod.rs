#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mailwatch::config::RuntimeOptions;
use mailwatch::errors::{WatchError, WatchResult};
use mailwatch::imap::{
    ConnectTimeouts, Connector, IdleEvent, MailTransport, MailboxStatus, SearchQuery,
};
use mailwatch::message::{ParsedMessage, RawMessage};
use mailwatch::resolver::{AddressLookup, ConnectTarget};
use mailwatch::session::SessionHandler;
use mailwatch::types::{AccountCredentials, AuthMechanism, ConnectionState, StatusEvent};

pub fn credentials(address: &str) -> AccountCredentials {
    AccountCredentials {
        host: "127.0.0.1".into(),
        port: 993,
        secure: true,
        address: address.into(),
        secret: "hunter2".into(),
        auth: AuthMechanism::Login,
        proxy: None,
        announce_identity: false,
    }
}

/// Fast, quiet defaults for driving a session under paused time.
pub fn options() -> RuntimeOptions {
    RuntimeOptions {
        reconnect_interval: Duration::from_secs(1),
        health_check: false,
        ..RuntimeOptions::default()
    }
}

pub fn rfc822(uid: u32, subject: &str) -> Vec<u8> {
    format!(
        "From: Sender <sender@example.com>\r\n\
         To: user@example.com\r\n\
         Subject: {subject}\r\n\
         Message-ID: <{uid}@example.com>\r\n\
         Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         Body of message {uid}\r\n"
    )
    .into_bytes()
}

#[derive(Debug, Clone)]
pub enum IdleMode {
    /// Wait out the IDLE window, then report a timeout.
    Quiet,
    /// Hand out these events one per call, then behave like `Quiet`.
    Script(VecDeque<IdleEvent>),
    Unsupported,
    Fail,
}

pub struct MockTransport {
    pub calls: Mutex<Vec<String>>,
    pub messages: Mutex<BTreeMap<u32, Vec<u8>>>,
    pub seen: Mutex<HashSet<u32>>,
    /// Advertised sizes that differ from the body length.
    pub sizes: Mutex<HashMap<u32, u32>>,
    /// Fetch delays that apply to the first fetch of a UID only.
    pub slow_once: Mutex<HashMap<u32, Duration>>,
    /// Fetch delays that apply every time.
    pub slow_always: Mutex<HashMap<u32, Duration>>,
    pub idle_mode: Mutex<IdleMode>,
    /// This many IDLE calls fail before `idle_mode` applies.
    pub idle_failures: AtomicUsize,
    pub uid_validity: Mutex<Option<u32>>,
    pub noop_fails: AtomicBool,
    pub usable: AtomicBool,
    pub logged_out: AtomicBool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            messages: Mutex::new(BTreeMap::new()),
            seen: Mutex::new(HashSet::new()),
            sizes: Mutex::new(HashMap::new()),
            slow_once: Mutex::new(HashMap::new()),
            slow_always: Mutex::new(HashMap::new()),
            idle_mode: Mutex::new(IdleMode::Quiet),
            idle_failures: AtomicUsize::new(0),
            uid_validity: Mutex::new(Some(1)),
            noop_fails: AtomicBool::new(false),
            usable: AtomicBool::new(true),
            logged_out: AtomicBool::new(false),
        }
    }
}

impl MockTransport {
    pub fn with_messages(count: u32) -> Self {
        let t = Self::default();
        for uid in 1..=count {
            t.add_message(uid, &format!("Message {uid}"));
        }
        t
    }

    pub fn add_message(&self, uid: u32, subject: &str) {
        self.messages.lock().unwrap().insert(uid, rfc822(uid, subject));
    }

    pub fn add_raw(&self, uid: u32, body: &str) {
        self.messages.lock().unwrap().insert(uid, body.as_bytes().to_vec());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.as_str() == name).count()
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn open_mailbox(&self, _name: &str) -> WatchResult<MailboxStatus> {
        self.record("select");
        Ok(MailboxStatus {
            exists: self.messages.lock().unwrap().len() as u32,
            uid_validity: *self.uid_validity.lock().unwrap(),
        })
    }

    async fn noop(&self) -> WatchResult<Option<u32>> {
        self.record("noop");
        if self.noop_fails.load(Ordering::SeqCst) {
            return Err(WatchError::Network("connection reset by peer".into()));
        }
        Ok(None)
    }

    async fn idle(&self, max: Duration) -> WatchResult<IdleEvent> {
        self.record("idle");
        let failing = self
            .idle_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WatchError::Network("broken pipe".into()));
        }
        let next = {
            let mut mode = self.idle_mode.lock().unwrap();
            match &mut *mode {
                IdleMode::Quiet => None,
                IdleMode::Script(events) => events.pop_front(),
                IdleMode::Unsupported => {
                    return Err(WatchError::Unsupported("IDLE not advertised".into()))
                }
                IdleMode::Fail => return Err(WatchError::Network("broken pipe".into())),
            }
        };
        match next {
            Some(event) => {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(event)
            }
            None => {
                tokio::time::sleep(max).await;
                Ok(IdleEvent::Timeout)
            }
        }
    }

    async fn search(&self, query: SearchQuery) -> WatchResult<Vec<u32>> {
        self.record("search");
        let messages = self.messages.lock().unwrap();
        let seen = self.seen.lock().unwrap();
        Ok(match query {
            SearchQuery::Unseen { .. } => messages
                .keys()
                .copied()
                .filter(|uid| !seen.contains(uid))
                .collect(),
            SearchQuery::Since(_) | SearchQuery::All => messages.keys().copied().collect(),
        })
    }

    async fn fetch_size(&self, uid: u32) -> WatchResult<Option<u32>> {
        self.record("fetch_size");
        if let Some(size) = self.sizes.lock().unwrap().get(&uid) {
            return Ok(Some(*size));
        }
        Ok(self.messages.lock().unwrap().get(&uid).map(|b| b.len() as u32))
    }

    async fn fetch(&self, uid: u32) -> WatchResult<Option<RawMessage>> {
        self.record("fetch");
        let once = self.slow_once.lock().unwrap().remove(&uid);
        let always = self.slow_always.lock().unwrap().get(&uid).copied();
        if let Some(delay) = once.or(always) {
            tokio::time::sleep(delay).await;
        }
        let body = self.messages.lock().unwrap().get(&uid).cloned();
        Ok(body.map(|body| RawMessage {
            uid,
            size: Some(body.len() as u32),
            body,
        }))
    }

    async fn mark_seen(&self, uid: u32) -> WatchResult<()> {
        self.record("mark_seen");
        self.seen.lock().unwrap().insert(uid);
        Ok(())
    }

    fn is_usable(&self) -> bool {
        self.usable.load(Ordering::SeqCst)
    }

    async fn logout(&self) -> WatchResult<()> {
        self.record("logout");
        self.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }
}

type Setup = Box<dyn Fn(usize) -> MockTransport + Send + Sync>;

/// Hands out a fresh [`MockTransport`] per successful connect. Scripted
/// failures are consumed first, one per attempt.
pub struct MockConnector {
    pub attempts: AtomicUsize,
    pub failures: Mutex<VecDeque<WatchError>>,
    pub always_fail: Mutex<Option<WatchError>>,
    pub transports: Mutex<Vec<Arc<MockTransport>>>,
    pub announced: Mutex<Vec<bool>>,
    setup: Setup,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::with_setup(|_| MockTransport::default())
    }

    pub fn with_setup(setup: impl Fn(usize) -> MockTransport + Send + Sync + 'static) -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            transports: Mutex::new(Vec::new()),
            announced: Mutex::new(Vec::new()),
            setup: Box::new(setup),
        }
    }

    pub fn failing(err: WatchError) -> Self {
        let c = Self::new();
        *c.always_fail.lock().unwrap() = Some(err);
        c
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.transports.lock().unwrap()[index].clone()
    }

    pub fn transport_count(&self) -> usize {
        self.transports.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _target: &ConnectTarget,
        _credentials: &AccountCredentials,
        _timeouts: ConnectTimeouts,
        announce_identity: bool,
    ) -> WatchResult<Arc<dyn MailTransport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.announced.lock().unwrap().push(announce_identity);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.always_fail.lock().unwrap().clone() {
            return Err(err);
        }
        let index = self.transports.lock().unwrap().len();
        let transport = Arc::new((self.setup)(index));
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// Answers every lookup with a fixed list and counts calls.
pub struct StaticLookup {
    pub answers: Mutex<VecDeque<Vec<Ipv4Addr>>>,
    pub fallback: Vec<Ipv4Addr>,
    pub calls: AtomicUsize,
}

impl StaticLookup {
    pub fn new(fallback: Vec<Ipv4Addr>) -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressLookup for StaticLookup {
    async fn lookup_ipv4(&self, _host: &str) -> WatchResult<Vec<Ipv4Addr>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

#[derive(Default)]
pub struct Recorder {
    pub statuses: Mutex<Vec<(String, StatusEvent)>>,
    pub messages: Mutex<Vec<(String, ParsedMessage)>>,
}

impl Recorder {
    pub fn states(&self) -> Vec<ConnectionState> {
        self.statuses.lock().unwrap().iter().map(|(_, s)| s.state).collect()
    }

    pub fn states_for(&self, account: &str) -> Vec<ConnectionState> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == account)
            .map(|(_, s)| s.state)
            .collect()
    }

    pub fn last_message(&self) -> Option<String> {
        self.statuses
            .lock()
            .unwrap()
            .last()
            .and_then(|(_, s)| s.message.clone())
    }

    pub fn delivered_subjects(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.subject.clone().unwrap_or_default())
            .collect()
    }

    pub fn delivered_uids(&self) -> Vec<u32> {
        self.messages.lock().unwrap().iter().map(|(_, m)| m.uid).collect()
    }
}

impl SessionHandler for Recorder {
    fn on_new_message(&self, account_id: &str, message: ParsedMessage) {
        self.messages.lock().unwrap().push((account_id.to_string(), message));
    }

    fn on_status_changed(&self, account_id: &str, status: &StatusEvent) {
        self.statuses
            .lock()
            .unwrap()
            .push((account_id.to_string(), status.clone()));
    }
}
