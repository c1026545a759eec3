//! Account id → live session.
//!
//! Operations on one account run strictly one after another: each account has
//! its own async mutex, and tokio's mutex is fair, so a later call waits for
//! every earlier one. Different accounts never wait on each other.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{AccountConfig, RuntimeOptions};
use crate::errors::{WatchError, WatchResult};
use crate::imap::{Connector, ImapConnector};
use crate::message::ParsedMessage;
use crate::resolver::{AddressLookup, DnsLookup};
use crate::session::{Session, SessionHandler};
use crate::sync::SyncReport;
use crate::types::{AccountCredentials, ConnectionState};

#[derive(Default)]
struct Slot {
    /// Held for the duration of an operation.
    ops: Mutex<()>,
    /// Readable without waiting for `ops`.
    session: StdMutex<Option<Session>>,
}

impl Slot {
    fn current(&self) -> Option<Session> {
        lock(&self.session).clone()
    }

    fn replace(&self, session: Option<Session>) -> Option<Session> {
        std::mem::replace(&mut *lock(&self.session), session)
    }
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ConnectionRegistry {
    options: RuntimeOptions,
    handler: Arc<dyn SessionHandler>,
    connector: Arc<dyn Connector>,
    lookup: Arc<dyn AddressLookup>,
    slots: StdMutex<HashMap<String, Arc<Slot>>>,
}

impl ConnectionRegistry {
    pub fn new(options: RuntimeOptions, handler: Arc<dyn SessionHandler>) -> Self {
        Self::with_transport(
            options,
            handler,
            Arc::new(ImapConnector),
            Arc::new(DnsLookup::new()),
        )
    }

    pub fn with_transport(
        options: RuntimeOptions,
        handler: Arc<dyn SessionHandler>,
        connector: Arc<dyn Connector>,
        lookup: Arc<dyn AddressLookup>,
    ) -> Self {
        Self {
            options,
            handler,
            connector,
            lookup,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    fn slot(&self, id: &str) -> Arc<Slot> {
        lock(&self.slots)
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, id: &str) -> Option<Arc<Slot>> {
        lock(&self.slots).get(id).cloned()
    }

    fn build_session(&self, id: &str, credentials: &AccountCredentials) -> Session {
        Session::builder(id, credentials.clone(), self.options.clone(), self.handler.clone())
            .connector(self.connector.clone())
            .lookup(self.lookup.clone())
            .build()
    }

    /// Start (or restart) the account's session. A running session with the
    /// same credentials is kept; an errored one is asked to connect again.
    pub async fn start_account(&self, account: &AccountConfig) -> WatchResult<()> {
        if !account.enabled {
            debug!(account = %account.id, "Account disabled; not starting");
            return self.stop_account(&account.id).await;
        }
        let slot = self.slot(&account.id);
        let _op = slot.ops.lock().await;

        if let Some(session) = slot.current() {
            if session.credentials() == &account.credentials && !session.is_disposed() {
                return match session.state() {
                    ConnectionState::Connected | ConnectionState::Connecting => Ok(()),
                    _ => session.connect().await,
                };
            }
        }
        self.replace_locked(&slot, account).await
    }

    /// Apply a changed account record: stop when disabled, replace the
    /// session when credentials changed, otherwise leave it alone.
    pub async fn reconfigure(&self, account: &AccountConfig) -> WatchResult<()> {
        if !account.enabled {
            return self.stop_account(&account.id).await;
        }
        let slot = self.slot(&account.id);
        let _op = slot.ops.lock().await;

        match slot.current() {
            Some(session)
                if session.credentials() == &account.credentials && !session.is_disposed() =>
            {
                debug!(account = %account.id, "Credentials unchanged; keeping session");
                Ok(())
            }
            _ => {
                info!(account = %account.id, "Account changed; replacing session");
                self.replace_locked(&slot, account).await
            }
        }
    }

    /// Caller must hold `slot.ops`.
    async fn replace_locked(&self, slot: &Slot, account: &AccountConfig) -> WatchResult<()> {
        if let Some(old) = slot.replace(None) {
            old.disconnect().await;
        }
        let session = self.build_session(&account.id, &account.credentials);
        slot.replace(Some(session.clone()));
        info!(account = %account.id, provider = session.profile().name, "Starting session");
        session.connect().await
    }

    pub async fn stop_account(&self, id: &str) -> WatchResult<()> {
        let Some(slot) = self.existing_slot(id) else {
            return Ok(());
        };
        let _op = slot.ops.lock().await;
        if let Some(session) = slot.replace(None) {
            info!(account = %id, "Stopping session");
            session.disconnect().await;
        }
        Ok(())
    }

    /// Start every enabled account concurrently. Returns the ids that failed
    /// to connect on the first try; their sessions may still be retrying.
    pub async fn start_all(&self, accounts: &[AccountConfig]) -> Vec<(String, WatchError)> {
        let results = join_all(
            accounts
                .iter()
                .filter(|a| a.enabled)
                .map(|a| async move { (a.id.clone(), self.start_account(a).await) }),
        )
        .await;

        results
            .into_iter()
            .filter_map(|(id, r)| match r {
                Ok(()) => None,
                Err(e) => {
                    warn!(account = %id, error = %e, "Account failed to start");
                    Some((id, e))
                }
            })
            .collect()
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = lock(&self.slots).keys().cloned().collect();
        join_all(ids.iter().map(|id| self.stop_account(id))).await;
        info!(count = ids.len(), "All sessions stopped");
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        self.existing_slot(id).and_then(|s| s.current())
    }

    pub fn state(&self, id: &str) -> Option<ConnectionState> {
        self.session(id).map(|s| s.state())
    }

    /// Snapshot of every known account, sorted by id.
    pub fn states(&self) -> Vec<(String, ConnectionState)> {
        let slots: Vec<(String, Arc<Slot>)> = lock(&self.slots)
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        let mut out: Vec<_> = slots
            .into_iter()
            .filter_map(|(id, slot)| slot.current().map(|s| (id, s.state())))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn sync_history<F>(
        &self,
        id: &str,
        days: Option<u32>,
        on_batch: F,
    ) -> WatchResult<SyncReport>
    where
        F: FnMut(Vec<ParsedMessage>) + Send,
    {
        let session = self.session(id).ok_or(WatchError::NotConnected)?;
        session.sync_history(days, on_batch).await
    }
}
