//! One account's long-lived mailbox connection.
//!
//! A [`Session`] owns the transport, the reconnect policy, the health monitor
//! and the listener loops. Every background task hangs off one cancellation
//! token tree:
//!
//! ```text
//! disposed ─┬─ reconnect timer
//!           └─ link (one per open connection) ─┬─ health monitor
//!                                              ├─ push loop / poll loop
//!                                              └─ scanner
//! ```
//!
//! Disposing the session cancels the root, so nothing it spawned can touch the
//! transport or the connection state afterwards.

use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RuntimeOptions;
use crate::errors::{WatchError, WatchResult};
use crate::imap::{ConnectTimeouts, Connector, ImapConnector, MailTransport};
use crate::message::ParsedMessage;
use crate::provider::{self, ProviderProfile};
use crate::resolver::{self, AddressLookup, ConnectTarget, DnsLookup, ResolveOptions};
use crate::sync::{HistorySync, SyncReport};
use crate::types::{AccountCredentials, ConnectionState, StatusEvent};

mod listener;
pub mod state;

use state::{HealthVerdict, ListenerState, ReconnectDecision, SessionState};

/// How long `connect` waits for a teardown already in progress.
const TEARDOWN_WAIT: Duration = Duration::from_secs(10);
const TEARDOWN_POLL: Duration = Duration::from_millis(100);
/// Grace period for LOGOUT before the transport is simply dropped.
const LOGOUT_GRACE: Duration = Duration::from_secs(5);
/// Upper bound for one NOOP probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(20);
/// Slack on top of connect + auth timeouts for the whole handshake.
const HANDSHAKE_SLACK: Duration = Duration::from_secs(5);

/// Receives what a session observes. Called from background tasks; keep it
/// quick and never block.
pub trait SessionHandler: Send + Sync {
    fn on_new_message(&self, account_id: &str, message: ParsedMessage);
    fn on_status_changed(&self, account_id: &str, status: &StatusEvent);
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

pub struct SessionBuilder {
    account_id: String,
    credentials: AccountCredentials,
    options: RuntimeOptions,
    handler: Arc<dyn SessionHandler>,
    profile: Option<ProviderProfile>,
    connector: Option<Arc<dyn Connector>>,
    lookup: Option<Arc<dyn AddressLookup>>,
}

impl SessionBuilder {
    pub fn profile(mut self, profile: ProviderProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn lookup(mut self, lookup: Arc<dyn AddressLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn build(self) -> Session {
        let profile = self
            .profile
            .unwrap_or_else(|| provider::profile_for(&self.credentials).clone());
        debug!(account = %self.account_id, provider = profile.name, "Session created");
        Session {
            inner: Arc::new(Inner {
                account_id: self.account_id,
                credentials: self.credentials,
                options: self.options,
                profile,
                handler: self.handler,
                connector: self.connector.unwrap_or_else(|| Arc::new(ImapConnector)),
                lookup: self.lookup.unwrap_or_else(|| Arc::new(DnsLookup::new())),
                disposed: AtomicBool::new(false),
                root: CancellationToken::new(),
                state: StdMutex::new(SessionState::default()),
                link: StdMutex::new(None),
                reconnect_timer: StdMutex::new(None),
                listener: StdMutex::new(ListenerState::default()),
                connect_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) account_id: String,
    credentials: AccountCredentials,
    pub(crate) options: RuntimeOptions,
    pub(crate) profile: ProviderProfile,
    pub(crate) handler: Arc<dyn SessionHandler>,
    connector: Arc<dyn Connector>,
    lookup: Arc<dyn AddressLookup>,
    disposed: AtomicBool,
    root: CancellationToken,
    state: StdMutex<SessionState>,
    link: StdMutex<Option<Link>>,
    reconnect_timer: StdMutex<Option<CancellationToken>>,
    pub(crate) listener: StdMutex<ListenerState>,
    connect_lock: Mutex<()>,
    generation: AtomicU64,
}

/// The live connection: transport plus the token its loops run under.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) transport: Arc<dyn MailTransport>,
    pub(crate) cancel: CancellationToken,
    pub(crate) generation: u64,
    pub(crate) scan_tx: mpsc::Sender<()>,
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Session {
    pub fn builder(
        account_id: impl Into<String>,
        credentials: AccountCredentials,
        options: RuntimeOptions,
        handler: Arc<dyn SessionHandler>,
    ) -> SessionBuilder {
        SessionBuilder {
            account_id: account_id.into(),
            credentials,
            options,
            handler,
            profile: None,
            connector: None,
            lookup: None,
        }
    }

    pub fn new(
        account_id: impl Into<String>,
        credentials: AccountCredentials,
        options: RuntimeOptions,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        Self::builder(account_id, credentials, options, handler).build()
    }

    pub fn account_id(&self) -> &str {
        &self.inner.account_id
    }

    pub fn credentials(&self) -> &AccountCredentials {
        &self.inner.credentials
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.inner.profile
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).connection
    }

    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.state).reconnect_attempts
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn listener_snapshot(&self) -> ListenerState {
        lock(&self.inner.listener).clone()
    }

    /// Open the connection. A caller-initiated connect starts a fresh
    /// reconnect budget. Failures are reported through the status callback
    /// and returned; retryable ones also schedule a reconnect.
    pub async fn connect(&self) -> WatchResult<()> {
        if self.inner.is_disposed() {
            return Ok(());
        }
        lock(&self.inner.state).reconnect_attempts = 0;
        self.inner.clone().run_connect().await
    }

    /// Tear everything down for good. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.inner.dispose().await;
    }

    /// Bulk retrieval over the already-open connection.
    pub async fn sync_history<F>(&self, days: Option<u32>, on_batch: F) -> WatchResult<SyncReport>
    where
        F: FnMut(Vec<ParsedMessage>) + Send,
    {
        let link = self.inner.current_link().ok_or(WatchError::NotConnected)?;
        if self.state() != ConnectionState::Connected {
            return Err(WatchError::NotConnected);
        }
        HistorySync::new(
            link.transport.clone(),
            &self.inner.options,
            &self.inner.account_id,
            link.cancel.clone(),
        )
        .run(days, on_batch)
        .await
    }
}

impl Inner {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn current_link(&self) -> Option<Link> {
        lock(&self.link).clone()
    }

    /// Change state and report it, unless the session is already disposed.
    fn transition(&self, state: ConnectionState, message: Option<String>) {
        if self.is_disposed() {
            debug!(account = %self.account_id, %state, "Ignoring transition after dispose");
            return;
        }
        self.publish(state, message);
    }

    fn publish(&self, state: ConnectionState, message: Option<String>) {
        {
            let mut s = lock(&self.state);
            s.connection = state;
            if state == ConnectionState::Error {
                s.last_error = message.clone();
            }
        }
        let event = StatusEvent::new(state, message);
        info!(
            account = %self.account_id,
            state = %event.state,
            message = event.message.as_deref().unwrap_or(""),
            "Connection state changed"
        );
        self.handler.on_status_changed(&self.account_id, &event);
    }

    fn cancel_reconnect_timer(&self) {
        if let Some(timer) = lock(&self.reconnect_timer).take() {
            timer.cancel();
        }
    }

    fn run_connect(self: Arc<Self>) -> BoxFuture<'static, WatchResult<()>> {
        async move { self.connect_once().await }.boxed()
    }

    async fn connect_once(self: &Arc<Self>) -> WatchResult<()> {
        if self.is_disposed() {
            return Ok(());
        }
        self.cancel_reconnect_timer();
        let _guard = self.connect_lock.lock().await;

        self.await_teardown().await?;

        let previous = lock(&self.link).take();
        if let Some(old) = previous {
            debug!(account = %self.account_id, "Replacing existing transport");
            old.cancel.cancel();
            close_transport(&self.account_id, old.transport).await;
        }
        if self.is_disposed() {
            return Ok(());
        }

        self.transition(ConnectionState::Connecting, None);
        let started = Instant::now();

        let transport = match self.open_transport().await {
            Ok(t) => t,
            Err(e) => return Err(self.fail_connect(e)),
        };

        if self.is_disposed() {
            close_transport(&self.account_id, transport).await;
            return Ok(());
        }

        let status = match timeout(self.profile.auth_timeout, transport.open_mailbox(&self.options.mailbox)).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                close_transport(&self.account_id, transport).await;
                return Err(self.fail_connect(e));
            }
            Err(_) => {
                close_transport(&self.account_id, transport).await;
                return Err(self.fail_connect(WatchError::Timeout(format!(
                    "opening mailbox {}",
                    self.options.mailbox
                ))));
            }
        };

        if self.is_disposed() {
            close_transport(&self.account_id, transport).await;
            return Ok(());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (scan_tx, scan_rx) = mpsc::channel(1);
        let link = Link {
            transport,
            cancel: self.root.child_token(),
            generation,
            scan_tx,
        };
        *lock(&self.link) = Some(link.clone());
        lock(&self.listener).reset_connection(status.exists, status.uid_validity);
        lock(&self.state).on_connected();

        info!(
            account = %self.account_id,
            provider = self.profile.name,
            exists = status.exists,
            elapsed_ms = ?started.elapsed().as_millis(),
            "Mailbox opened"
        );
        self.transition(ConnectionState::Connected, None);

        listener::start(self, &link, scan_rx);
        self.start_health_monitor(&link);
        Ok(())
    }

    /// Block while another teardown is still closing the old transport.
    async fn await_teardown(&self) -> WatchResult<()> {
        let deadline = Instant::now() + TEARDOWN_WAIT;
        while lock(&self.state).connection == ConnectionState::Disconnecting {
            if Instant::now() >= deadline {
                let err = WatchError::TeardownStalled(TEARDOWN_WAIT);
                self.transition(ConnectionState::Error, Some(err.to_string()));
                return Err(err);
            }
            sleep(TEARDOWN_POLL).await;
        }
        Ok(())
    }

    async fn open_transport(&self) -> WatchResult<Arc<dyn MailTransport>> {
        let creds = &self.credentials;
        let target = match &creds.proxy {
            // The proxy resolves the name.
            Some(proxy) => ConnectTarget::passthrough(&creds.host, creds.port, Some(proxy.clone())),
            None => {
                let opts = ResolveOptions {
                    probe: self.options.connectivity_test,
                    probe_timeout: self.options.connectivity_test_timeout,
                };
                resolver::resolve(self.lookup.as_ref(), &creds.host, creds.port, &self.profile, &opts)
                    .await?
            }
        };

        let timeouts = ConnectTimeouts {
            connect: self.profile.connect_timeout.max(self.options.connection_timeout),
            auth: self.profile.auth_timeout,
        };
        let budget = timeouts.connect + timeouts.auth + HANDSHAKE_SLACK;
        let announce = self.profile.needs_identity(creds);

        match timeout(budget, self.connector.connect(&target, creds, timeouts, announce)).await {
            Ok(result) => result,
            Err(_) => Err(WatchError::Timeout(format!("handshake exceeded {budget:?}"))),
        }
    }

    fn fail_connect(self: &Arc<Self>, err: WatchError) -> WatchError {
        let class = self.profile.classify(&err);
        warn!(
            account = %self.account_id,
            error = %err,
            retryable = class.retryable,
            "Connect failed"
        );
        self.transition(ConnectionState::Error, Some(class.message));
        if class.retryable {
            self.schedule_reconnect();
        }
        err
    }

    pub(crate) fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        let decision = lock(&self.state).plan_reconnect(&self.options, &self.profile);
        match decision {
            ReconnectDecision::Disabled => {
                debug!(account = %self.account_id, "Auto-reconnect disabled");
            }
            ReconnectDecision::GiveUp { attempts } => {
                warn!(account = %self.account_id, attempts, "Giving up on reconnecting");
                self.transition(
                    ConnectionState::Error,
                    Some(format!("Reconnect stopped: max attempts reached ({attempts})")),
                );
            }
            ReconnectDecision::Retry { attempt, delay } => {
                info!(
                    account = %self.account_id,
                    attempt,
                    delay_ms = ?delay.as_millis(),
                    "Scheduling reconnect"
                );
                let timer = self.root.child_token();
                if let Some(previous) = lock(&self.reconnect_timer).replace(timer.clone()) {
                    previous.cancel();
                }
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = timer.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                    if inner.is_disposed() {
                        return;
                    }
                    let _ = inner.run_connect().await;
                });
            }
        }
    }

    fn start_health_monitor(self: &Arc<Self>, link: &Link) {
        let forced = self.profile.health_check_forced();
        if !self.options.health_check && !forced {
            return;
        }
        let interval = self.profile.health_interval(self.options.health_check_interval);
        let inner = Arc::clone(self);
        let link = link.clone();
        debug!(account = %self.account_id, interval_ms = ?interval.as_millis(), forced, "Health monitor started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = link.cancel.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                if link.cancel.is_cancelled() || inner.is_disposed() {
                    break;
                }
                if lock(&inner.state).connection != ConnectionState::Connected {
                    continue;
                }

                let ok = match timeout(PROBE_TIMEOUT, link.transport.noop()).await {
                    Ok(Ok(exists)) => {
                        if let Some(n) = exists {
                            listener::on_exists(&inner, &link, n);
                        }
                        link.transport.is_usable()
                    }
                    Ok(Err(e)) => {
                        debug!(account = %inner.account_id, error = %e, "Health probe failed");
                        false
                    }
                    Err(_) => {
                        debug!(account = %inner.account_id, "Health probe timed out");
                        false
                    }
                };
                if link.cancel.is_cancelled() {
                    break;
                }

                let verdict = lock(&inner.state).health.record(ok);
                match verdict {
                    HealthVerdict::Healthy => {}
                    HealthVerdict::Degraded(n) => {
                        warn!(account = %inner.account_id, failures = n, "Health probe failing");
                    }
                    HealthVerdict::Zombie => {
                        inner
                            .handle_zombie(
                                link.generation,
                                "Connection unresponsive (health check failed repeatedly); reconnecting",
                            )
                            .await;
                        break;
                    }
                }
            }
        });
    }

    /// The connection claims to be open but is not usable. Treat it exactly
    /// like a transport-reported close without waiting for one.
    pub(crate) async fn handle_zombie(self: &Arc<Self>, generation: u64, reason: &str) {
        if self.is_disposed() {
            return;
        }
        let link = {
            let mut slot = lock(&self.link);
            match slot.as_ref() {
                Some(l) if l.generation == generation => slot.take(),
                _ => None,
            }
        };
        let Some(link) = link else {
            return;
        };

        warn!(account = %self.account_id, reason, "Zombie connection detected");
        lock(&self.state).connection = ConnectionState::Disconnecting;
        link.cancel.cancel();
        close_transport(&self.account_id, link.transport).await;
        lock(&self.state).connection = ConnectionState::Disconnected;

        self.transition(ConnectionState::Disconnected, Some(reason.to_string()));
        self.schedule_reconnect();
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Everything spawned hangs off `root`: loops, health monitor, timers.
        self.root.cancel();
        self.cancel_reconnect_timer();

        let was_active = {
            let mut s = lock(&self.state);
            let active = s.is_active();
            s.connection = ConnectionState::Disconnecting;
            active
        };

        let link = lock(&self.link).take();
        if let Some(link) = link {
            link.cancel.cancel();
            close_transport(&self.account_id, link.transport).await;
        }

        {
            let mut s = lock(&self.state);
            *s = SessionState::default();
        }
        {
            let mut l = lock(&self.listener);
            l.push_active = false;
            l.poll_active = false;
        }

        info!(account = %self.account_id, "Session disposed");
        if was_active {
            self.publish(ConnectionState::Disconnected, None);
        }
    }
}

async fn close_transport(account_id: &str, transport: Arc<dyn MailTransport>) {
    match timeout(LOGOUT_GRACE, transport.logout()).await {
        Ok(Ok(())) => debug!(account = %account_id, "Logged out"),
        Ok(Err(e)) => debug!(account = %account_id, error = %e, "Logout failed; dropping connection"),
        Err(_) => warn!(account = %account_id, "Logout timed out; dropping connection"),
    }
}

/// Validate credentials without keeping a session: connect, log in, log out.
pub async fn test_connection(
    credentials: &AccountCredentials,
    options: &RuntimeOptions,
) -> WatchResult<()> {
    test_connection_with(credentials, options, &ImapConnector, &DnsLookup::new()).await
}

pub async fn test_connection_with(
    credentials: &AccountCredentials,
    options: &RuntimeOptions,
    connector: &dyn Connector,
    lookup: &dyn AddressLookup,
) -> WatchResult<()> {
    let profile = provider::profile_for(credentials);
    let target = match &credentials.proxy {
        Some(proxy) => ConnectTarget::passthrough(&credentials.host, credentials.port, Some(proxy.clone())),
        None => {
            let opts = ResolveOptions {
                probe: options.connectivity_test,
                probe_timeout: options.connectivity_test_timeout,
            };
            resolver::resolve(lookup, &credentials.host, credentials.port, profile, &opts).await?
        }
    };
    let timeouts = ConnectTimeouts {
        connect: profile.connect_timeout.max(options.connection_timeout),
        auth: profile.auth_timeout,
    };
    let transport = connector
        .connect(&target, credentials, timeouts, profile.needs_identity(credentials))
        .await?;
    info!(account = %credentials.address, provider = profile.name, "Test connection succeeded");
    transport.logout().await
}
