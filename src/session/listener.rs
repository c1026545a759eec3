//! Push and poll loops for one connection, plus the scanner that turns
//! "something may have arrived" into delivered messages.
//!
//! All loops run under the connection's token and stop as soon as it is
//! cancelled. Scan requests go through a one-slot channel: a request made
//! while a scan is already queued is coalesced, so at most one scan runs and
//! at most one waits behind it.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::{lock, Inner, Link, PROBE_TIMEOUT};
use crate::errors::WatchError;
use crate::imap::{IdleEvent, SearchQuery};
use crate::message::{parse_message, ParsedMessage};
use crate::provider::ListenStrategy;
use crate::session::state::ZOMBIE_THRESHOLD;

/// Pause after IDLE yields to another command before re-entering it.
const IDLE_RESUME_DELAY: Duration = Duration::from_millis(250);
const PUSH_BACKOFF_CAP: Duration = Duration::from_secs(60);

pub(crate) fn start(inner: &Arc<Inner>, link: &Link, scan_rx: mpsc::Receiver<()>) {
    let features = &inner.profile.features;
    let push = features.supports_idle && features.strategy != ListenStrategy::PollOnly;
    let poll = !features.supports_idle
        || matches!(
            features.strategy,
            ListenStrategy::PollOnly | ListenStrategy::Hybrid
        );

    info!(
        account = %inner.account_id,
        strategy = ?features.strategy,
        push,
        poll,
        "Starting listeners"
    );

    tokio::spawn(scanner(inner.clone(), link.clone(), scan_rx));
    // Catch up on whatever arrived while we were away.
    request_scan(inner, link, "initial");

    if push {
        lock(&inner.listener).push_active = true;
        tokio::spawn(push_loop(inner.clone(), link.clone()));
    }
    if poll {
        lock(&inner.listener).poll_active = true;
        tokio::spawn(poll_loop(inner.clone(), link.clone()));
    } else if push && features.strategy == ListenStrategy::IdleWithFallback {
        tokio::spawn(fallback_watch(inner.clone(), link.clone()));
    }
}

/// Queue a scan unless one is already waiting.
pub(crate) fn request_scan(inner: &Inner, link: &Link, reason: &'static str) {
    if link.cancel.is_cancelled() {
        return;
    }
    match link.scan_tx.try_send(()) {
        Ok(()) => debug!(account = %inner.account_id, reason, "Scan requested"),
        Err(TrySendError::Full(())) => {
            lock(&inner.listener).scans_coalesced += 1;
            debug!(account = %inner.account_id, reason, "Scan already pending");
        }
        Err(TrySendError::Closed(())) => {}
    }
}

/// A new EXISTS count from any command; scan when the mailbox grew.
pub(crate) fn on_exists(inner: &Inner, link: &Link, exists: u32) {
    let grew = lock(&inner.listener).observe_exists(exists);
    if grew {
        request_scan(inner, link, "exists");
    }
}

async fn scanner(inner: Arc<Inner>, link: Link, mut scan_rx: mpsc::Receiver<()>) {
    loop {
        tokio::select! {
            _ = link.cancel.cancelled() => break,
            req = scan_rx.recv() => {
                if req.is_none() {
                    break;
                }
                scan(&inner, &link).await;
            }
        }
    }
    debug!(account = %inner.account_id, "Scanner stopped");
}

async fn scan(inner: &Inner, link: &Link) {
    let since = inner
        .options
        .retention_days
        .map(|days| (Utc::now() - ChronoDuration::days(i64::from(days))).date_naive());

    let uids = match link.transport.search(SearchQuery::Unseen { since }).await {
        Ok(uids) => uids,
        Err(e) => {
            warn!(account = %inner.account_id, error = %e, "Unseen search failed");
            return;
        }
    };
    let pending: Vec<u32> = {
        let state = lock(&inner.listener);
        uids.into_iter().filter(|uid| state.needs_fetch(*uid)).collect()
    };
    if pending.is_empty() {
        return;
    }
    debug!(account = %inner.account_id, count = pending.len(), "Fetching unseen messages");

    for uid in pending {
        if link.cancel.is_cancelled() {
            return;
        }
        let fetched = fetch_one(inner, link, uid).await;
        // The fetch may have outlived the connection.
        if link.cancel.is_cancelled() || inner.is_disposed() {
            return;
        }
        let message = match fetched {
            Ok(Fetched::Deliver(m)) => m,
            Ok(Fetched::Skip) => {
                lock(&inner.listener).skipped.insert(uid);
                continue;
            }
            Ok(Fetched::Vanished) => continue,
            Err(e) => {
                warn!(account = %inner.account_id, uid, error = %e, "Fetch failed; will retry on next scan");
                continue;
            }
        };

        if let Err(e) = link.transport.mark_seen(uid).await {
            warn!(account = %inner.account_id, uid, error = %e, "Could not mark message seen");
        }
        lock(&inner.listener).delivered.insert(uid);

        if link.cancel.is_cancelled() || inner.is_disposed() {
            return;
        }
        info!(
            account = %inner.account_id,
            uid,
            subject = message.subject.as_deref().unwrap_or(""),
            "New message"
        );
        inner.handler.on_new_message(&inner.account_id, message);
    }
}

enum Fetched {
    Deliver(ParsedMessage),
    /// Never deliverable as it stands; do not fetch again on this connection.
    Skip,
    Vanished,
}

async fn fetch_one(inner: &Inner, link: &Link, uid: u32) -> Result<Fetched, WatchError> {
    let ceiling = inner.options.max_message_bytes;
    if let Some(size) = link.transport.fetch_size(uid).await? {
        if u64::from(size) > ceiling {
            warn!(account = %inner.account_id, uid, size, "Message over size ceiling");
            return Ok(Fetched::Skip);
        }
    }
    let Some(raw) = link.transport.fetch(uid).await? else {
        debug!(account = %inner.account_id, uid, "Message vanished before fetch");
        return Ok(Fetched::Vanished);
    };
    if raw.body.len() as u64 > ceiling {
        warn!(account = %inner.account_id, uid, size = raw.body.len(), "Message over size ceiling");
        return Ok(Fetched::Skip);
    }
    let parsed = match parse_message(&raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(account = %inner.account_id, uid, error = %e, "Unparsable message");
            return Ok(Fetched::Skip);
        }
    };
    if !parsed.is_deliverable() {
        debug!(account = %inner.account_id, uid, "Message has no usable content");
        return Ok(Fetched::Skip);
    }
    Ok(Fetched::Deliver(parsed))
}

async fn push_loop(inner: Arc<Inner>, link: Link) {
    let max_idle = inner.profile.features.max_idle;
    let mut failures: u32 = 0;

    loop {
        if link.cancel.is_cancelled() {
            break;
        }
        let result = tokio::select! {
            _ = link.cancel.cancelled() => break,
            r = link.transport.idle(max_idle) => r,
        };

        match result {
            Ok(IdleEvent::Exists(n)) => {
                failures = 0;
                lock(&inner.listener).record_push();
                on_exists(&inner, &link, n);
            }
            Ok(IdleEvent::Other) => {
                failures = 0;
                lock(&inner.listener).record_push();
            }
            Ok(IdleEvent::Timeout) => {
                failures = 0;
                lock(&inner.listener).push_failures = 0;
                debug!(account = %inner.account_id, "IDLE window elapsed; re-issuing");
            }
            Ok(IdleEvent::Interrupted) => {
                if !pause(&link, IDLE_RESUME_DELAY).await {
                    break;
                }
            }
            Err(WatchError::Unsupported(reason)) => {
                warn!(account = %inner.account_id, %reason, "Server refused IDLE; push disabled");
                let start_poll = {
                    let mut state = lock(&inner.listener);
                    state.push_active = false;
                    !std::mem::replace(&mut state.poll_active, true)
                };
                if start_poll {
                    tokio::spawn(poll_loop(inner.clone(), link.clone()));
                }
                break;
            }
            Err(e) => {
                failures += 1;
                lock(&inner.listener).push_failures = failures;
                warn!(account = %inner.account_id, error = %e, failures, "IDLE failed");

                if failures >= ZOMBIE_THRESHOLD && !link.transport.is_usable() {
                    lock(&inner.listener).push_active = false;
                    inner
                        .handle_zombie(link.generation, "Connection lost while waiting for new mail; reconnecting")
                        .await;
                    return;
                }
                let backoff = Duration::from_secs(1u64 << failures.min(6)).min(PUSH_BACKOFF_CAP);
                if !pause(&link, backoff).await {
                    break;
                }
            }
        }
    }
    lock(&inner.listener).push_active = false;
    debug!(account = %inner.account_id, "Push loop stopped");
}

async fn poll_loop(inner: Arc<Inner>, link: Link) {
    let interval = inner.profile.effective_poll_interval();
    let unreliable = inner.profile.push_is_unreliable();
    let mut failures: u32 = 0;
    debug!(account = %inner.account_id, interval_ms = ?interval.as_millis(), "Poll loop started");

    loop {
        if !pause(&link, interval).await {
            break;
        }

        match timeout(PROBE_TIMEOUT, link.transport.noop()).await {
            Ok(Ok(exists)) => {
                failures = 0;
                if let Some(n) = exists {
                    on_exists(&inner, &link, n);
                }
            }
            outcome => {
                failures += 1;
                match outcome {
                    Ok(Err(e)) => warn!(account = %inner.account_id, error = %e, failures, "Poll probe failed"),
                    _ => warn!(account = %inner.account_id, failures, "Poll probe timed out"),
                }
                if failures >= ZOMBIE_THRESHOLD {
                    lock(&inner.listener).poll_active = false;
                    inner
                        .handle_zombie(link.generation, "Connection unresponsive (poll failed repeatedly); reconnecting")
                        .await;
                    return;
                }
                continue;
            }
        }
        if link.cancel.is_cancelled() {
            break;
        }

        let stale = lock(&inner.listener).push_stale(interval * 2);
        if stale || unreliable {
            request_scan(&inner, &link, "poll");
        }
    }
    lock(&inner.listener).poll_active = false;
    debug!(account = %inner.account_id, "Poll loop stopped");
}

/// After the grace period, fall back to polling if IDLE has not proven itself.
async fn fallback_watch(inner: Arc<Inner>, link: Link) {
    let grace = inner.profile.features.fallback_grace;
    if !pause(&link, grace).await {
        return;
    }
    let (push_active, failures) = {
        let state = lock(&inner.listener);
        (state.push_active, state.push_failures)
    };
    if push_active && failures < ZOMBIE_THRESHOLD {
        debug!(account = %inner.account_id, "IDLE healthy after grace; no fallback polling");
        return;
    }
    info!(account = %inner.account_id, failures, "IDLE unreliable; enabling fallback polling");
    lock(&inner.listener).poll_active = true;
    poll_loop(inner, link).await;
}

/// Sleep unless cancelled first. False when the connection is gone.
async fn pause(link: &Link, d: Duration) -> bool {
    tokio::select! {
        _ = link.cancel.cancelled() => false,
        _ = sleep(d) => !link.cancel.is_cancelled(),
    }
}
