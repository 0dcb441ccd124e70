//! Inbox poller: pulls unseen mail on an interval and feeds it to the
//! processor.
//!
//! Each poll:
//! 1. Fetches unseen messages (without marking them)
//! 2. Drops self-sent mail and anything already recorded by message id
//! 3. Runs the rest through `MeetingProcessor::process_batch`
//! 4. Marks everything handled as \Seen
//!
//! Messages whose duplicate check failed stay unseen and are retried on the
//! next poll.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::InboxError;
use crate::mail::{FetchedMail, ImapConfig, fetch_unseen_imap, mark_seen_imap, parse_rfc822};
use crate::pipeline::MeetingProcessor;

/// Where unseen mail comes from.
#[async_trait]
pub trait InboxSource: Send + Sync {
    fn name(&self) -> &str;

    /// Unseen messages, left unseen.
    async fn fetch_unseen(&self) -> Result<Vec<FetchedMail>, InboxError>;

    async fn mark_seen(&self, uids: &[u32]) -> Result<(), InboxError>;
}

/// IMAP mailbox, driven on the blocking pool.
pub struct ImapInbox {
    config: ImapConfig,
}

impl ImapInbox {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl InboxSource for ImapInbox {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch_unseen(&self) -> Result<Vec<FetchedMail>, InboxError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || fetch_unseen_imap(&config))
            .await
            .map_err(|e| InboxError::Protocol(format!("IMAP fetch task failed: {e}")))?
    }

    async fn mark_seen(&self, uids: &[u32]) -> Result<(), InboxError> {
        let config = self.config.clone();
        let uids = uids.to_vec();
        tokio::task::spawn_blocking(move || mark_seen_imap(&config, &uids))
            .await
            .map_err(|e| InboxError::Protocol(format!("IMAP store task failed: {e}")))?
    }
}

/// What one poll did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub fetched: usize,
    pub processed: usize,
    pub self_sent: usize,
    pub duplicates: usize,
    pub unparseable: usize,
    /// Left unseen for the next poll.
    pub deferred: usize,
}

pub struct InboxPoller {
    source: Arc<dyn InboxSource>,
    processor: Arc<MeetingProcessor>,
    own_address: String,
}

impl InboxPoller {
    pub fn new(
        source: Arc<dyn InboxSource>,
        processor: Arc<MeetingProcessor>,
        own_address: impl Into<String>,
    ) -> Self {
        Self {
            source,
            processor,
            own_address: own_address.into(),
        }
    }

    /// Run a single poll cycle: fetch → de-duplicate → process → mark \Seen.
    pub async fn poll_once(&self) -> Result<PollReport, InboxError> {
        let fetched = self.source.fetch_unseen().await?;
        let mut report = PollReport {
            fetched: fetched.len(),
            ..PollReport::default()
        };
        if fetched.is_empty() {
            return Ok(report);
        }
        debug!(count = fetched.len(), source = self.source.name(), "Fetched unseen email");

        let recorder = self.processor.recorder();
        let mut handled: Vec<u32> = Vec::with_capacity(fetched.len());
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut batch = Vec::new();

        for mail in fetched {
            let Some(message) = parse_rfc822(&mail.raw) else {
                warn!(uid = mail.uid, "Skipping unparseable email");
                report.unparseable += 1;
                handled.push(mail.uid);
                continue;
            };

            if message.sender_address().eq_ignore_ascii_case(&self.own_address) {
                debug!(uid = mail.uid, "Skipping self-sent email");
                report.self_sent += 1;
                handled.push(mail.uid);
                continue;
            }

            if !seen_ids.insert(message.id.clone()) {
                report.duplicates += 1;
                handled.push(mail.uid);
                continue;
            }

            match recorder.contains_message(&message.id).await {
                Ok(true) => {
                    debug!(message_id = %message.id, "Already processed, skipping");
                    report.duplicates += 1;
                    handled.push(mail.uid);
                }
                Ok(false) => {
                    handled.push(mail.uid);
                    batch.push(message);
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Duplicate check failed, leaving unseen");
                    report.deferred += 1;
                }
            }
        }

        if !batch.is_empty() {
            report.processed = self.processor.process_batch(batch).await.len();
        }

        if let Err(e) = self.source.mark_seen(&handled).await {
            warn!(error = %e, count = handled.len(), "Failed to mark email as seen");
        }

        info!(
            fetched = report.fetched,
            processed = report.processed,
            duplicates = report.duplicates,
            self_sent = report.self_sent,
            "Inbox poll complete"
        );
        Ok(report)
    }
}

/// Spawn a background task that polls every `interval`.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_inbox_poller(
    poller: InboxPoller,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            source = poller.source.name(),
            "Inbox poller started"
        );
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Inbox poller shutting down");
                return;
            }

            if let Err(e) = poller.poll_once().await {
                error!(error = %e, "Inbox poll failed");
            }
        }
    });

    (handle, shutdown_flag)
}
