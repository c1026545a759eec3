//! Bulk retrieval of past messages over an already-open connection.
//!
//! Messages are fetched in chunks, each item under its own timeout. Items that
//! timed out get one slower, sequential retry pass at the end, unless so many
//! timed out that the server is clearly struggling.

use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RuntimeOptions;
use crate::errors::{WatchError, WatchResult};
use crate::imap::{MailTransport, SearchQuery};
use crate::message::{parse_message, ParsedMessage, RawMessage};

/// Messages fetched concurrently and handed to the batch callback together.
pub const SYNC_BATCH_SIZE: usize = 30;
/// Skip the retry pass when at least this many items timed out.
pub const RETRY_LIMIT: usize = 50;
/// A whole chunk gets this many item timeouts before stragglers count as timed out.
const CHUNK_TIMEOUT_FACTOR: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub total_found: usize,
    pub total_synced: usize,
    pub oversized: Vec<u32>,
    pub failed: Vec<u32>,
}

enum Outcome {
    Fetched(RawMessage),
    Oversized,
    TimedOut,
    Failed(String),
}

pub struct HistorySync<'a> {
    transport: Arc<dyn MailTransport>,
    options: &'a RuntimeOptions,
    account_id: &'a str,
    cancel: CancellationToken,
}

impl<'a> HistorySync<'a> {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        options: &'a RuntimeOptions,
        account_id: &'a str,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            options,
            account_id,
            cancel,
        }
    }

    /// Retrieve everything from the last `days` days (all mail when `None`),
    /// handing parsed messages to `on_batch` as each chunk completes.
    ///
    /// Every UID found ends up in exactly one of: a delivered batch,
    /// `oversized`, or `failed`.
    pub async fn run<F>(&self, days: Option<u32>, mut on_batch: F) -> WatchResult<SyncReport>
    where
        F: FnMut(Vec<ParsedMessage>) + Send,
    {
        let started = Instant::now();
        let query = match days.filter(|d| *d > 0) {
            Some(d) => SearchQuery::Since((Utc::now() - ChronoDuration::days(i64::from(d))).date_naive()),
            None => SearchQuery::All,
        };
        let uids = self.transport.search(query).await?;

        let mut report = SyncReport {
            total_found: uids.len(),
            ..SyncReport::default()
        };
        info!(account = %self.account_id, found = uids.len(), ?days, "Starting history sync");

        let mut timed_out = Vec::new();
        let item_limit = self.options.sync_item_timeout;

        for (index, chunk) in uids.chunks(SYNC_BATCH_SIZE).enumerate() {
            if self.cancel.is_cancelled() {
                return Err(WatchError::NotConnected);
            }
            let chunk_start = Instant::now();
            let mut fetched = Vec::with_capacity(chunk.len());
            let mut pending: FuturesUnordered<_> = chunk
                .iter()
                .map(|&uid| async move { (uid, self.fetch_item(uid, item_limit).await) })
                .collect();
            let mut unfinished: Vec<u32> = chunk.to_vec();
            let deadline = tokio::time::Instant::now() + item_limit * CHUNK_TIMEOUT_FACTOR;
            loop {
                match timeout_at(deadline, pending.next()).await {
                    Ok(Some((uid, outcome))) => {
                        unfinished.retain(|u| *u != uid);
                        self.sort(uid, outcome, &mut fetched, &mut timed_out, &mut report);
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(
                            account = %self.account_id,
                            chunk = index,
                            stuck = unfinished.len(),
                            "History chunk deadline passed"
                        );
                        timed_out.append(&mut unfinished);
                        break;
                    }
                }
            }
            drop(pending);

            let batch = self.parse_batch(fetched, &mut report).await;
            debug!(
                account = %self.account_id,
                chunk = index,
                count = batch.len(),
                elapsed_ms = ?chunk_start.elapsed().as_millis(),
                "History chunk done"
            );
            if !batch.is_empty() {
                report.total_synced += batch.len();
                on_batch(batch);
            }
        }

        if !timed_out.is_empty() {
            if timed_out.len() >= RETRY_LIMIT {
                warn!(
                    account = %self.account_id,
                    count = timed_out.len(),
                    "Too many timeouts; skipping retry pass"
                );
                report.failed.append(&mut timed_out);
            } else {
                self.retry_pass(timed_out, &mut report, &mut on_batch).await?;
            }
        }

        report.oversized.sort_unstable();
        report.failed.sort_unstable();
        info!(
            account = %self.account_id,
            found = report.total_found,
            synced = report.total_synced,
            oversized = report.oversized.len(),
            failed = report.failed.len(),
            elapsed_ms = ?started.elapsed().as_millis(),
            "History sync finished"
        );
        Ok(report)
    }

    async fn retry_pass<F>(
        &self,
        uids: Vec<u32>,
        report: &mut SyncReport,
        on_batch: &mut F,
    ) -> WatchResult<()>
    where
        F: FnMut(Vec<ParsedMessage>) + Send,
    {
        info!(account = %self.account_id, count = uids.len(), "Retrying timed-out messages");
        let limit = self.options.sync_retry_timeout;
        let mut fetched = Vec::new();
        let mut still_missing = Vec::new();

        for uid in uids {
            if self.cancel.is_cancelled() {
                return Err(WatchError::NotConnected);
            }
            let outcome = self.fetch_item(uid, limit).await;
            self.sort(uid, outcome, &mut fetched, &mut still_missing, report);
        }
        // A second timeout is final.
        report.failed.append(&mut still_missing);

        let recovered = self.parse_batch(fetched, report).await;
        for batch in recovered.chunks(SYNC_BATCH_SIZE) {
            report.total_synced += batch.len();
            on_batch(batch.to_vec());
        }
        Ok(())
    }

    fn sort(
        &self,
        uid: u32,
        outcome: Outcome,
        fetched: &mut Vec<RawMessage>,
        timed_out: &mut Vec<u32>,
        report: &mut SyncReport,
    ) {
        match outcome {
            Outcome::Fetched(raw) => fetched.push(raw),
            Outcome::Oversized => report.oversized.push(uid),
            Outcome::TimedOut => timed_out.push(uid),
            Outcome::Failed(reason) => {
                debug!(account = %self.account_id, uid, %reason, "History item failed");
                report.failed.push(uid);
            }
        }
    }

    async fn fetch_item(&self, uid: u32, limit: Duration) -> Outcome {
        match timeout(limit, self.fetch_checked(uid)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Outcome::Failed(e.to_string()),
            Err(_) => Outcome::TimedOut,
        }
    }

    /// Check the advertised size before downloading, then the actual one.
    async fn fetch_checked(&self, uid: u32) -> WatchResult<Outcome> {
        let ceiling = self.options.max_message_bytes;
        if let Some(size) = self.transport.fetch_size(uid).await? {
            if u64::from(size) > ceiling {
                warn!(account = %self.account_id, uid, size, ceiling, "Skipping oversized message");
                return Ok(Outcome::Oversized);
            }
        }
        Ok(match self.transport.fetch(uid).await? {
            None => Outcome::Failed("message no longer exists".into()),
            Some(raw) if raw.body.len() as u64 > ceiling => {
                warn!(account = %self.account_id, uid, size = raw.body.len(), ceiling, "Skipping oversized message");
                Outcome::Oversized
            }
            Some(raw) => Outcome::Fetched(raw),
        })
    }

    /// MIME parsing is CPU-bound; run it on the blocking pool, in parallel.
    async fn parse_batch(
        &self,
        raws: Vec<RawMessage>,
        report: &mut SyncReport,
    ) -> Vec<ParsedMessage> {
        if raws.is_empty() {
            return Vec::new();
        }
        let uids: Vec<u32> = raws.iter().map(|r| r.uid).collect();
        let parsed = tokio::task::spawn_blocking(move || {
            use rayon::prelude::*;
            raws.par_iter().map(parse_message).collect::<Vec<_>>()
        })
        .await;

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(account = %self.account_id, error = %e, "Parse worker panicked");
                report.failed.extend(uids);
                return Vec::new();
            }
        };

        let mut batch = Vec::with_capacity(parsed.len());
        for (uid, result) in uids.into_iter().zip(parsed) {
            match result {
                Ok(message) => batch.push(message),
                Err(e) => {
                    warn!(account = %self.account_id, uid, error = %e, "Could not parse message");
                    report.failed.push(uid);
                }
            }
        }
        batch.sort_by_key(|m| m.uid);
        batch
    }
}
