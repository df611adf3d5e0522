//! Per-campaign send pipeline
//!
//! A pipe is the runtime handle for one running campaign: it streams
//! subscriber batches from storage, renders them, and either pushes the
//! messages straight to the worker queue or staggers them over the current
//! UTC hour when a daily quota is configured. A waitgroup tracks in-flight
//! messages; cleanup fires exactly once when it drains.

use super::interval::{SendWindow, SendWindowError};
use super::waitgroup::WaitGroup;
use super::{CampaignMessage, Inner};
use crate::messenger::{OutgoingMessage, CAMPAIGN_UUID_HEADER, SUBSCRIBER_UUID_HEADER};
use crate::notify::CampaignEvent;
use crate::template::CampaignTemplate;
use chrono::{DateTime, Utc};
use listmill_common::types::CampaignStatus;
use listmill_storage::models::{Campaign, Subscriber};
use listmill_storage::store::StoreError;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counter flush thresholds: the worker-side sent counter is pushed to
/// storage after this many sends or this much time, whichever comes first.
const FLUSH_EVERY: i64 = 50;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Pipe creation errors
#[derive(Error, Debug)]
pub enum PipeError {
    #[error("Unknown messenger: {0}")]
    UnknownMessenger(String),

    #[error(transparent)]
    SendWindow(#[from] SendWindowError),

    #[error("Template error: {0}")]
    Template(String),
}

/// A message staged for release at a specific instant
pub(crate) struct SchedEntry {
    msg: CampaignMessage,
    release_at: Instant,
}

/// Runtime pipeline for one running campaign
pub struct Pipe {
    pub(crate) campaign: Campaign,
    template: CampaignTemplate,
    send_window: Option<SendWindow>,

    sent: AtomicI64,
    last_id: AtomicI64,
    errors: AtomicU64,
    stopped: AtomicBool,
    with_errors: AtomicBool,

    /// Messages released toward the current UTC hour's allowance
    scheduled: AtomicI64,
    /// Hours-since-epoch marker for `scheduled`
    scheduled_hour: AtomicI64,

    /// Render-skipped subscribers, flushed as a negative to_send delta
    skipped: AtomicI64,
    /// Successful sends not yet flushed to storage
    pending_sent: AtomicI64,
    last_flush: Mutex<Instant>,

    pub(crate) wg: WaitGroup,
    sentinel_released: AtomicBool,
    sched_tx: Mutex<Option<mpsc::Sender<SchedEntry>>>,
    stop_token: CancellationToken,
}

impl Pipe {
    /// Build the pipe for a campaign, start its scheduler task and its
    /// cleanup watcher. The caller registers the returned handle.
    pub(crate) async fn create(
        inner: &Arc<Inner>,
        campaign: Campaign,
    ) -> Result<Arc<Self>, PipeError> {
        if !inner
            .messengers
            .read()
            .await
            .contains_key(&campaign.messenger)
        {
            return Err(PipeError::UnknownMessenger(campaign.messenger.clone()));
        }

        let send_window = match &campaign.send_interval {
            Some(spec) if !spec.trim().is_empty() => Some(SendWindow::parse(spec)?),
            _ => None,
        };

        let template = CampaignTemplate::compile(&campaign, &inner.cfg.root_url)
            .map_err(|e| PipeError::Template(e.to_string()))?;

        let (sched_tx, sched_rx) = mpsc::channel(inner.cfg.batch_size * 2);

        let pipe = Arc::new(Self {
            campaign,
            template,
            send_window,
            sent: AtomicI64::new(0),
            last_id: AtomicI64::new(0),
            errors: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            with_errors: AtomicBool::new(false),
            scheduled: AtomicI64::new(0),
            scheduled_hour: AtomicI64::new(hour_epoch(Utc::now())),
            skipped: AtomicI64::new(0),
            pending_sent: AtomicI64::new(0),
            last_flush: Mutex::new(Instant::now()),
            wg: WaitGroup::new(),
            sentinel_released: AtomicBool::new(false),
            sched_tx: Mutex::new(Some(sched_tx)),
            stop_token: CancellationToken::new(),
        });

        // Sentinel ticket, held until subscribers are exhausted so cleanup
        // cannot fire between batches.
        pipe.wg.add(1);

        tokio::spawn(run_scheduler(
            Arc::clone(&pipe),
            Arc::clone(inner),
            sched_rx,
        ));

        {
            let pipe = Arc::clone(&pipe);
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                pipe.wg.wait().await;
                pipe.cleanup(&inner).await;
            });
        }

        info!(
            campaign_id = pipe.campaign.id,
            name = %pipe.campaign.name,
            quota = ?pipe.campaign.quota(),
            "Campaign pipe started"
        );

        Ok(pipe)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop accepting new work. In-flight messages drain; messages still
    /// waiting in the scheduler queue are discarded.
    pub fn stop(&self, with_errors: bool) {
        if with_errors {
            self.with_errors.store(true, Ordering::SeqCst);
        }
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_token.cancel();
        self.release_sentinel();
    }

    /// Fetch, render, and stage the next subscriber batch.
    ///
    /// Returns `Ok(true)` when a batch was processed and the pipe should be
    /// queued for another round, `Ok(false)` when the pipe is waiting on
    /// quota (it requeues itself) or has no work left (cleanup follows once
    /// in-flight messages drain).
    pub(crate) async fn next_subscribers(
        pipe: &Arc<Pipe>,
        inner: &Arc<Inner>,
    ) -> Result<bool, StoreError> {
        // Hold a call ticket so a concurrent stop cannot drain the
        // waitgroup mid-batch.
        pipe.wg.add(1);
        let result = Self::next_subscribers_inner(pipe, inner).await;
        pipe.wg.done();
        result
    }

    async fn next_subscribers_inner(
        pipe: &Arc<Pipe>,
        inner: &Arc<Inner>,
    ) -> Result<bool, StoreError> {
        if pipe.is_stopped() {
            pipe.release_sentinel();
            return Ok(false);
        }

        let now = Utc::now();
        let mut limit = inner.cfg.batch_size as i64;

        // Outside the campaign's send window there is no allowance at all;
        // wait for it to open.
        if let Some(window) = &pipe.send_window {
            if !window.contains(now) {
                let wait = window.until_open(now);
                debug!(
                    campaign_id = pipe.campaign.id,
                    wait_secs = wait.as_secs(),
                    "Outside send window, deferring"
                );
                Self::defer(pipe, inner, wait);
                return Ok(false);
            }
        }

        let quota = pipe.campaign.quota();
        if let Some(quota) = quota {
            let per_hour = per_hour_quota(quota);

            let hour = hour_epoch(now);
            if pipe.scheduled_hour.swap(hour, Ordering::SeqCst) != hour {
                pipe.scheduled.store(0, Ordering::SeqCst);
            }

            let sent_this_hour = inner
                .store
                .campaign_hourly_sent(pipe.campaign.id, now)
                .await?;
            let allowed =
                hourly_allowance(per_hour, sent_this_hour, pipe.scheduled.load(Ordering::SeqCst));

            if allowed <= 0 {
                let wait = until_next_hour(now);
                debug!(
                    campaign_id = pipe.campaign.id,
                    per_hour,
                    sent_this_hour,
                    wait_secs = wait.as_secs(),
                    "Hourly quota exhausted, deferring to next hour"
                );
                Self::defer(pipe, inner, wait);
                return Ok(false);
            }

            limit = limit.min(allowed);
        }

        let subscribers = inner
            .store
            .next_subscribers(pipe.campaign.id, limit)
            .await?;

        if subscribers.is_empty() {
            if !pipe.is_stopped() {
                debug!(campaign_id = pipe.campaign.id, "Subscribers exhausted");
            }
            pipe.release_sentinel();
            return Ok(false);
        }

        let mut messages = Vec::with_capacity(subscribers.len());
        for sub in &subscribers {
            match Self::render_message(pipe, inner, sub) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    warn!(
                        campaign_id = pipe.campaign.id,
                        subscriber_id = sub.id,
                        "Skipping subscriber, render failed: {}",
                        e
                    );
                    pipe.skipped.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        if messages.is_empty() {
            return Ok(true);
        }

        if quota.is_some() {
            pipe.stage_spaced(inner, messages, now).await;
        } else {
            pipe.stage_direct(inner, messages).await;
        }

        Ok(true)
    }

    /// Direct path: hand messages straight to the worker queue, applying
    /// the global sliding window inline. Blocks on a full queue.
    async fn stage_direct(&self, inner: &Arc<Inner>, messages: Vec<CampaignMessage>) {
        for msg in messages {
            self.wg.add(1);
            inner.window.throttle().await;
            tokio::select! {
                sent = inner.msg_tx.send_async(msg) => {
                    if sent.is_err() {
                        self.wg.done();
                        return;
                    }
                }
                // Engine shut down under us; the message future drops with
                // its ticket released.
                _ = inner.shutdown.cancelled() => {
                    self.wg.done();
                    return;
                }
            }
        }
    }

    /// Quota path: spread the batch evenly over the remainder of the
    /// current UTC hour, with a little jitter so batches from many
    /// campaigns do not align.
    async fn stage_spaced(
        &self,
        _inner: &Arc<Inner>,
        messages: Vec<CampaignMessage>,
        now: DateTime<Utc>,
    ) {
        let spacing_ms = spacing_millis(now, messages.len());

        let tx = self.sched_tx.lock().await.clone();
        let Some(tx) = tx else { return };

        for (i, msg) in messages.into_iter().enumerate() {
            let jitter_ms = if spacing_ms > 1000 {
                let j = spacing_ms / 20;
                rand::thread_rng().gen_range(-j..=j)
            } else {
                0
            };
            let offset = (spacing_ms * i as i64 + jitter_ms).max(0) as u64;
            let release_at = Instant::now() + Duration::from_millis(offset);

            self.wg.add(1);
            self.scheduled.fetch_add(1, Ordering::SeqCst);
            if tx.send(SchedEntry { msg, release_at }).await.is_err() {
                self.wg.done();
                self.scheduled.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }
    }

    /// Park the pipe and requeue it after `wait`. The requeue is
    /// non-blocking: when the queue is full the attempt is dropped (and
    /// logged), matching the engine's long-standing behavior under
    /// pressure. A waitgroup ticket spans the wait so cleanup cannot fire.
    fn defer(pipe: &Arc<Pipe>, inner: &Arc<Inner>, wait: Duration) {
        pipe.wg.add(1);
        let pipe = Arc::clone(pipe);
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = pipe.stop_token.cancelled() => {}
                _ = inner.shutdown.cancelled() => {}
            }

            if let Err(e) = inner.next_tx.try_send(Arc::clone(&pipe)) {
                warn!(
                    campaign_id = pipe.campaign.id,
                    "Pipe requeue dropped after quota wait: {}", e
                );
            }
            pipe.wg.done();
        });
    }

    fn render_message(
        pipe: &Arc<Pipe>,
        inner: &Inner,
        sub: &Subscriber,
    ) -> Result<CampaignMessage, listmill_common::Error> {
        let rendered = pipe.template.render(sub)?;

        let from = pipe
            .campaign
            .from_email
            .clone()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| inner.cfg.from_email.clone());

        let headers = vec![
            (
                CAMPAIGN_UUID_HEADER.to_string(),
                pipe.campaign.uuid.to_string(),
            ),
            (SUBSCRIBER_UUID_HEADER.to_string(), sub.uuid.to_string()),
            (
                "List-Unsubscribe".to_string(),
                format!("<{}>", pipe.template.unsubscribe_url(sub)),
            ),
            (
                "List-Unsubscribe-Post".to_string(),
                "List-Unsubscribe=One-Click".to_string(),
            ),
        ];

        Ok(CampaignMessage {
            pipe: Arc::clone(pipe),
            subscriber_id: sub.id,
            messenger: pipe.campaign.messenger.clone(),
            outgoing: OutgoingMessage {
                from,
                to: vec![sub.email.clone()],
                subject: rendered.subject,
                body: rendered.body,
                content_type: pipe.campaign.content_type(),
                headers,
            },
        })
    }

    /// Book-keeping after a successful delivery.
    pub(crate) async fn on_sent(&self, inner: &Inner, subscriber_id: i64) {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.last_id.fetch_max(subscriber_id, Ordering::SeqCst);
        self.pending_sent.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = inner
            .store
            .increment_hourly_sent(self.campaign.id, Utc::now())
            .await
        {
            warn!(
                campaign_id = self.campaign.id,
                "Failed to record hourly send: {}", e
            );
        }

        self.flush_counts(inner, false).await;
    }

    /// Book-keeping after a failed delivery; auto-pauses the campaign once
    /// the error threshold is crossed.
    pub(crate) async fn on_error(&self, inner: &Inner) {
        let errors = self.errors.fetch_add(1, Ordering::SeqCst) + 1;

        if inner.cfg.max_send_errors > 0 && errors >= inner.cfg.max_send_errors && !self.is_stopped()
        {
            error!(
                campaign_id = self.campaign.id,
                errors, "Too many send errors, pausing campaign"
            );
            self.stop(true);
        }
    }

    /// Flush pending counters to storage, throttled unless forced. Deltas
    /// are restored on failure and retried with the next flush.
    async fn flush_counts(&self, inner: &Inner, force: bool) {
        if !force {
            let due_by_count = self.pending_sent.load(Ordering::SeqCst) >= FLUSH_EVERY;
            let due_by_time = self.last_flush.lock().await.elapsed() >= FLUSH_INTERVAL;
            if !due_by_count && !due_by_time {
                return;
            }
        }

        let mut last_flush = self.last_flush.lock().await;
        let sent_delta = self.pending_sent.swap(0, Ordering::SeqCst);
        let skip_delta = self.skipped.swap(0, Ordering::SeqCst);
        if sent_delta == 0 && skip_delta == 0 {
            return;
        }
        *last_flush = Instant::now();
        drop(last_flush);

        if let Err(e) = inner
            .store
            .update_campaign_counts(
                self.campaign.id,
                -skip_delta,
                sent_delta,
                self.last_id.load(Ordering::SeqCst),
            )
            .await
        {
            self.pending_sent.fetch_add(sent_delta, Ordering::SeqCst);
            self.skipped.fetch_add(skip_delta, Ordering::SeqCst);
            warn!(
                campaign_id = self.campaign.id,
                "Failed to flush campaign counters: {}", e
            );
        }
    }

    fn release_sentinel(&self) {
        if !self.sentinel_released.swap(true, Ordering::SeqCst) {
            self.wg.done();
        }
    }

    /// Runs exactly once, after the waitgroup drains: closes the scheduler,
    /// unregisters the pipe, flushes counters, and settles the campaign's
    /// final status.
    async fn cleanup(&self, inner: &Arc<Inner>) {
        self.sched_tx.lock().await.take();
        self.flush_counts(inner, true).await;

        let id = self.campaign.id;
        let name = self.campaign.name.clone();

        if self.with_errors.load(Ordering::SeqCst) {
            if let Err(e) = inner
                .store
                .update_campaign_status(id, CampaignStatus::Paused)
                .await
            {
                error!(campaign_id = id, "Failed to pause campaign: {}", e);
            }
            inner
                .notifier
                .notify(CampaignEvent::Paused {
                    campaign_id: id,
                    name,
                    reason: "Too many errors".to_string(),
                })
                .await;
        } else if self.is_stopped() {
            // Stopped by an operator status change; that status stands.
        } else {
            match inner.store.get_campaign(id).await {
                Ok(Some(c)) if c.status().is_active() => {
                    if let Err(e) = inner
                        .store
                        .update_campaign_status(id, CampaignStatus::Finished)
                        .await
                    {
                        error!(campaign_id = id, "Failed to finish campaign: {}", e);
                    }
                    inner
                        .notifier
                        .notify(CampaignEvent::Finished {
                            campaign_id: id,
                            name,
                        })
                        .await;
                }
                Ok(_) => {}
                Err(e) => error!(campaign_id = id, "Failed to load campaign: {}", e),
            }
        }

        // Unregister last: while the final status is being settled the scan
        // loop must still see this pipe as the campaign's live one.
        inner.pipes.write().await.remove(&self.campaign.id);

        info!(
            campaign_id = id,
            sent = self.sent.load(Ordering::SeqCst),
            errors = self.errors.load(Ordering::SeqCst),
            "Campaign pipe closed"
        );
    }
}

/// Scheduler task: releases staged messages at their instants, discarding
/// once the pipe is stopped. Ends when the pipe's sender is dropped by
/// cleanup.
async fn run_scheduler(pipe: Arc<Pipe>, inner: Arc<Inner>, mut rx: mpsc::Receiver<SchedEntry>) {
    while let Some(entry) = rx.recv().await {
        if !pipe.is_stopped() {
            tokio::select! {
                _ = tokio::time::sleep_until(entry.release_at) => {}
                _ = pipe.stop_token.cancelled() => {}
            }
        }

        if pipe.is_stopped() {
            pipe.wg.done();
            continue;
        }

        inner.window.throttle().await;
        tokio::select! {
            sent = inner.msg_tx.send_async(entry.msg) => {
                if sent.is_err() {
                    pipe.wg.done();
                }
            }
            _ = pipe.stop_token.cancelled() => {
                pipe.wg.done();
            }
        }
    }
}

/// Hours since the Unix epoch; the quota hour marker.
fn hour_epoch(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(3600)
}

/// Ceiling division of a daily quota into a per-UTC-hour allowance.
pub(crate) fn per_hour_quota(daily_quota: i64) -> i64 {
    (daily_quota + 23) / 24
}

/// Remaining allowance for the current hour.
pub(crate) fn hourly_allowance(per_hour: i64, sent_this_hour: i64, already_scheduled: i64) -> i64 {
    per_hour - sent_this_hour - already_scheduled
}

/// Time until the top of the next UTC hour, at least one second.
pub(crate) fn until_next_hour(now: DateTime<Utc>) -> Duration {
    let next = (hour_epoch(now) + 1) * 3600;
    Duration::from_secs((next - now.timestamp()).max(1) as u64)
}

/// Even spacing, in milliseconds, of `count` messages over the remainder
/// of the current UTC hour.
pub(crate) fn spacing_millis(now: DateTime<Utc>, count: usize) -> i64 {
    if count == 0 {
        return 0;
    }
    let next_ms = (hour_epoch(now) + 1) * 3_600_000;
    let remaining_ms = (next_ms - now.timestamp_millis()).max(1000);
    remaining_ms / count as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_per_hour_quota_is_ceiling() {
        assert_eq!(per_hour_quota(24), 1);
        assert_eq!(per_hour_quota(25), 2);
        assert_eq!(per_hour_quota(1), 1);
        assert_eq!(per_hour_quota(240), 10);
    }

    #[test]
    fn test_hourly_allowance() {
        assert_eq!(hourly_allowance(10, 4, 3), 3);
        assert_eq!(hourly_allowance(1, 1, 0), 0);
        assert_eq!(hourly_allowance(1, 0, 1), 0);
        // Over-sent hours go negative and stay closed.
        assert_eq!(hourly_allowance(5, 9, 0), -4);
    }

    #[test]
    fn test_until_next_hour() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 59, 30).unwrap();
        assert_eq!(until_next_hour(now), Duration::from_secs(30));

        // One second before the boundary still waits the minimum second.
        let edge = Utc.with_ymd_and_hms(2024, 6, 1, 11, 59, 59).unwrap();
        assert_eq!(until_next_hour(edge), Duration::from_secs(1));
    }

    #[test]
    fn test_spacing_spreads_over_hour_remainder() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        // 60 minutes left, 60 messages: one per minute.
        assert_eq!(spacing_millis(now, 60), 60_000);

        let late = Utc.with_ymd_and_hms(2024, 6, 1, 10, 50, 0).unwrap();
        // 10 minutes left, 10 messages: one per minute.
        assert_eq!(spacing_millis(late, 10), 60_000);

        assert_eq!(spacing_millis(now, 0), 0);
    }

    #[test]
    fn test_hour_epoch_rolls_on_the_hour() {
        let a = Utc.with_ymd_and_hms(2024, 6, 1, 10, 59, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap();
        assert_eq!(hour_epoch(a) + 1, hour_epoch(b));
    }
}
