//! Campaign manager
//!
//! The top-level coordinator of the send engine. Owns the messenger and
//! pipe registries, the shared worker queue, and three kinds of background
//! tasks: a scan loop that discovers running campaigns in storage, a
//! dispatcher that pumps subscriber batches through each pipe, and a pool
//! of workers that hand rendered messages to messengers.

pub mod interval;
pub mod pipe;
pub mod waitgroup;
pub mod window;

use crate::messenger::{Messenger, OutgoingMessage};
use crate::notify::{CampaignEvent, Notifier};
use listmill_common::config::{CampaignConfig, ServerConfig};
use listmill_common::types::{CampaignId, CampaignStatus, SubscriberId};
use listmill_common::{Error, Result};
use listmill_storage::store::{Store, StoreError};
use pipe::{Pipe, PipeError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use window::SlidingWindow;

/// Capacity of the pipe dispatch queue
const NEXT_PIPES_CAPACITY: usize = 1000;

/// Campaign engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max subscribers per fetch; also sizes the message queues
    pub batch_size: usize,
    /// Worker task count
    pub concurrency: usize,
    /// Error threshold that auto-pauses a campaign; 0 disables
    pub max_send_errors: u64,
    pub sliding_window: bool,
    pub sliding_window_rate: u64,
    pub sliding_window_duration: Duration,
    /// Legacy per-worker hint; carried for configuration compatibility,
    /// not consulted by the scheduler
    pub message_rate: usize,
    /// Default From for campaigns that omit one
    pub from_email: String,
    /// How often storage is scanned for newly running campaigns
    pub scan_interval: Duration,
    /// Base URL for unsubscribe links and tracking pixels
    pub root_url: String,
}

impl EngineConfig {
    /// Derive the engine configuration from the loaded config sections
    pub fn from_config(campaign: &CampaignConfig, server: &ServerConfig) -> Self {
        Self {
            batch_size: campaign.batch_size.max(1),
            concurrency: campaign.concurrency.max(1),
            max_send_errors: campaign.max_send_errors,
            sliding_window: campaign.sliding_window,
            sliding_window_rate: campaign.sliding_window_rate,
            sliding_window_duration: Duration::from_secs(campaign.sliding_window_duration_secs),
            message_rate: campaign.message_rate,
            from_email: campaign.from_email.clone(),
            scan_interval: Duration::from_secs(campaign.scan_interval_secs.max(1)),
            root_url: server.root_url.clone(),
        }
    }
}

/// A rendered message travelling from a pipe to a worker
pub struct CampaignMessage {
    pub(crate) pipe: Arc<Pipe>,
    pub(crate) subscriber_id: SubscriberId,
    pub(crate) messenger: String,
    pub(crate) outgoing: OutgoingMessage,
}

/// State shared by the manager, its tasks, and every pipe
pub(crate) struct Inner {
    pub cfg: EngineConfig,
    pub store: Arc<dyn Store>,
    pub messengers: RwLock<HashMap<String, Arc<dyn Messenger>>>,
    pub pipes: RwLock<HashMap<CampaignId, Arc<Pipe>>>,
    pub msg_tx: flume::Sender<CampaignMessage>,
    pub msg_rx: flume::Receiver<CampaignMessage>,
    pub next_tx: flume::Sender<Arc<Pipe>>,
    pub next_rx: flume::Receiver<Arc<Pipe>>,
    pub window: SlidingWindow,
    pub notifier: Notifier,
    pub shutdown: CancellationToken,
}

/// The campaign send engine
pub struct Manager {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    /// Create a manager over a store. Messengers are registered separately
    /// before `run`.
    pub fn new(cfg: EngineConfig, store: Arc<dyn Store>, notifier: Notifier) -> Self {
        let (msg_tx, msg_rx) = flume::bounded(cfg.batch_size * 2);
        let (next_tx, next_rx) = flume::bounded(NEXT_PIPES_CAPACITY);
        let window = SlidingWindow::new(
            cfg.sliding_window,
            cfg.sliding_window_rate,
            cfg.sliding_window_duration,
        );

        Self {
            inner: Arc::new(Inner {
                cfg,
                store,
                messengers: RwLock::new(HashMap::new()),
                pipes: RwLock::new(HashMap::new()),
                msg_tx,
                msg_rx,
                next_tx,
                next_rx,
                window,
                notifier,
                shutdown: CancellationToken::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a messenger; the name must be unique.
    pub async fn add_messenger(&self, messenger: Arc<dyn Messenger>) -> Result<()> {
        let name = messenger.name().to_string();
        let mut registry = self.inner.messengers.write().await;
        if registry.contains_key(&name) {
            return Err(Error::Messenger(format!(
                "Messenger {:?} is already registered",
                name
            )));
        }
        info!(name = %name, "Registered messenger");
        registry.insert(name, messenger);
        Ok(())
    }

    /// Close and unregister all messengers. Refused while campaigns are
    /// running: a settings reload then requires a restart.
    pub async fn clear_messengers(&self) -> Result<()> {
        if self.has_running_campaigns().await {
            return Err(Error::Messenger(
                "Messengers cannot be replaced while campaigns are running; restart required"
                    .to_string(),
            ));
        }

        let messengers: Vec<_> = {
            let mut registry = self.inner.messengers.write().await;
            registry.drain().map(|(_, m)| m).collect()
        };
        for messenger in messengers {
            if let Err(e) = messenger.close().await {
                warn!("Messenger close failed: {}", e);
            }
        }
        Ok(())
    }

    /// Whether any campaign currently has a live pipe
    pub async fn has_running_campaigns(&self) -> bool {
        !self.inner.pipes.read().await.is_empty()
    }

    /// Start the worker pool, the campaign scan loop, and the dispatcher.
    pub async fn run(&self) {
        let mut tasks = self.tasks.lock().await;

        for worker_id in 0..self.inner.cfg.concurrency {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(async move {
                Self::worker_loop(inner, worker_id).await;
            }));
        }

        {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(async move {
                Self::scan_loop(inner).await;
            }));
        }

        {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(async move {
                Self::dispatch_loop(inner).await;
            }));
        }

        info!(
            workers = self.inner.cfg.concurrency,
            batch_size = self.inner.cfg.batch_size,
            sliding_window = self.inner.window.is_active(),
            "Campaign manager started"
        );
    }

    /// Stop every pipe, cancel the background tasks, drain the message
    /// queue, and close all messengers.
    pub async fn close(&self) {
        info!("Campaign manager shutting down");

        {
            let pipes: Vec<_> = self.inner.pipes.read().await.values().cloned().collect();
            for pipe in pipes {
                pipe.stop(false);
            }
        }

        self.inner.shutdown.cancel();
        for handle in self.tasks.lock().await.drain(..) {
            let _ = handle.await;
        }

        // Messages the workers never picked up still hold waitgroup
        // tickets; release them so pipe cleanups can settle.
        while let Ok(msg) = self.inner.msg_rx.try_recv() {
            msg.pipe.wg.done();
        }

        let messengers: Vec<_> = {
            let mut registry = self.inner.messengers.write().await;
            registry.drain().map(|(_, m)| m).collect()
        };
        for messenger in messengers {
            if let Err(e) = messenger.close().await {
                warn!("Messenger close failed: {}", e);
            }
        }

        info!("Campaign manager shutdown complete");
    }

    /// Worker: pull messages off the shared queue and deliver them.
    async fn worker_loop(inner: Arc<Inner>, worker_id: usize) {
        debug!(worker_id, "Worker started");
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                msg = inner.msg_rx.recv_async() => {
                    let Ok(msg) = msg else { break };
                    Self::deliver(&inner, msg).await;
                }
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    async fn deliver(inner: &Arc<Inner>, msg: CampaignMessage) {
        let CampaignMessage {
            pipe,
            subscriber_id,
            messenger,
            outgoing,
        } = msg;

        let backend = inner.messengers.read().await.get(&messenger).cloned();
        let result = match backend {
            Some(backend) => backend.push(outgoing).await,
            None => Err(anyhow::anyhow!("Unknown messenger: {:?}", messenger)),
        };

        match result {
            Ok(()) => {
                debug!(
                    campaign_id = pipe.campaign.id,
                    subscriber_id, "Message delivered"
                );
                pipe.on_sent(inner, subscriber_id).await;
            }
            Err(e) => {
                warn!(
                    campaign_id = pipe.campaign.id,
                    subscriber_id, "Send failed: {:#}", e
                );
                pipe.on_error(inner).await;
            }
        }

        pipe.wg.done();
    }

    /// Scan loop: discover newly running campaigns and propagate operator
    /// status changes to live pipes.
    async fn scan_loop(inner: Arc<Inner>) {
        let mut ticker = tokio::time::interval(inner.cfg.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = Self::scan_once(&inner).await {
                error!("Campaign scan failed: {}", e);
            }
        }
    }

    async fn scan_once(inner: &Arc<Inner>) -> std::result::Result<(), StoreError> {
        let campaigns = inner.store.running_campaigns().await?;
        let running_ids: HashSet<CampaignId> = campaigns.iter().map(|c| c.id).collect();

        // A pipe whose campaign left running|scheduled was paused or
        // cancelled by an operator; stop it cooperatively.
        let stale: Vec<Arc<Pipe>> = {
            let pipes = inner.pipes.read().await;
            pipes
                .iter()
                .filter(|(id, _)| !running_ids.contains(id))
                .map(|(_, pipe)| Arc::clone(pipe))
                .collect()
        };
        for pipe in stale {
            info!(
                campaign_id = pipe.campaign.id,
                "Campaign left running state, stopping pipe"
            );
            pipe.stop(false);
        }

        for campaign in campaigns {
            if inner.pipes.read().await.contains_key(&campaign.id) {
                continue;
            }

            let id = campaign.id;
            let name = campaign.name.clone();

            match Pipe::create(inner, campaign).await {
                Ok(pipe) => {
                    inner.pipes.write().await.insert(id, Arc::clone(&pipe));
                    Self::requeue(inner, pipe);
                }
                Err(PipeError::UnknownMessenger(messenger)) => {
                    error!(
                        campaign_id = id,
                        messenger = %messenger,
                        "Unknown messenger, cancelling campaign"
                    );
                    if let Err(e) = inner
                        .store
                        .update_campaign_status(id, CampaignStatus::Cancelled)
                        .await
                    {
                        error!(campaign_id = id, "Failed to cancel campaign: {}", e);
                    }
                    inner
                        .notifier
                        .notify(CampaignEvent::Cancelled {
                            campaign_id: id,
                            name,
                            reason: format!("Unknown messenger {:?}", messenger),
                        })
                        .await;
                }
                Err(e) => {
                    error!(campaign_id = id, "Failed to start campaign: {}", e);
                    if let Err(err) = inner
                        .store
                        .update_campaign_status(id, CampaignStatus::Paused)
                        .await
                    {
                        error!(campaign_id = id, "Failed to pause campaign: {}", err);
                    }
                    inner
                        .notifier
                        .notify(CampaignEvent::Paused {
                            campaign_id: id,
                            name,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        }

        Ok(())
    }

    /// Dispatcher: round-robin over pipes with subscribers to fetch.
    async fn dispatch_loop(inner: Arc<Inner>) {
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                pipe = inner.next_rx.recv_async() => {
                    let Ok(pipe) = pipe else { break };
                    match Pipe::next_subscribers(&pipe, &inner).await {
                        Ok(true) => Self::requeue(&inner, pipe),
                        Ok(false) => {}
                        Err(e) => {
                            warn!(
                                campaign_id = pipe.campaign.id,
                                "Fetching subscribers failed: {}", e
                            );
                            Self::requeue_delayed(&inner, pipe, Duration::from_secs(1));
                        }
                    }
                }
            }
        }
    }

    /// Requeue without ever blocking the dispatcher: when the queue is
    /// momentarily full the send moves to a task.
    fn requeue(inner: &Arc<Inner>, pipe: Arc<Pipe>) {
        if let Err(flume::TrySendError::Full(pipe)) = inner.next_tx.try_send(pipe) {
            let tx = inner.next_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send_async(pipe).await;
            });
        }
    }

    /// Requeue after a pause; used to back off a pipe whose storage read
    /// failed.
    fn requeue_delayed(inner: &Arc<Inner>, pipe: Arc<Pipe>, delay: Duration) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = inner.shutdown.cancelled() => return,
            }
            let _ = inner.next_tx.send_async(pipe).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use listmill_common::config::NotificationConfig;
    use listmill_storage::models::{Bounce, Campaign, Subscriber};
    use listmill_storage::store::StoreResult;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    fn test_config() -> EngineConfig {
        EngineConfig {
            batch_size: 10,
            concurrency: 2,
            max_send_errors: 0,
            sliding_window: false,
            sliding_window_rate: 0,
            sliding_window_duration: Duration::ZERO,
            message_rate: 0,
            from_email: "News <news@example.com>".to_string(),
            scan_interval: Duration::from_millis(50),
            root_url: "https://news.example.com".to_string(),
        }
    }

    fn test_campaign(id: i64) -> Campaign {
        Campaign {
            id,
            uuid: Uuid::new_v4(),
            name: format!("campaign-{}", id),
            subject: "Hello {{name}}".to_string(),
            from_email: None,
            body: "Hi {{name}}, this is {{email}}".to_string(),
            content_type: "richtext".to_string(),
            messenger: "email".to_string(),
            status: "running".to_string(),
            daily_quota: None,
            send_interval: None,
            to_send: 0,
            sent: 0,
            last_subscriber_id: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_subscribers(n: i64) -> Vec<Subscriber> {
        (1..=n)
            .map(|i| Subscriber {
                id: i,
                uuid: Uuid::new_v4(),
                email: format!("sub{}@example.com", i),
                name: format!("Sub {}", i),
                attribs: serde_json::json!({}),
                status: "enabled".to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .collect()
    }

    /// In-memory store with the same cursor semantics as the SQL one.
    struct MemoryStore {
        campaigns: StdMutex<HashMap<i64, Campaign>>,
        subscribers: StdMutex<Vec<Subscriber>>,
        hourly: StdMutex<HashMap<(i64, i64), i64>>,
        fetches: AtomicUsize,
    }

    impl MemoryStore {
        fn new(campaigns: Vec<Campaign>, subscribers: Vec<Subscriber>) -> Self {
            Self {
                campaigns: StdMutex::new(campaigns.into_iter().map(|c| (c.id, c)).collect()),
                subscribers: StdMutex::new(subscribers),
                hourly: StdMutex::new(HashMap::new()),
                fetches: AtomicUsize::new(0),
            }
        }

        fn campaign(&self, id: i64) -> Campaign {
            self.campaigns.lock().unwrap().get(&id).cloned().unwrap()
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn running_campaigns(&self) -> StoreResult<Vec<Campaign>> {
            let campaigns = self.campaigns.lock().unwrap();
            let mut out: Vec<_> = campaigns
                .values()
                .filter(|c| c.status().is_active())
                .cloned()
                .collect();
            out.sort_by_key(|c| c.id);
            Ok(out)
        }

        async fn get_campaign(&self, id: i64) -> StoreResult<Option<Campaign>> {
            Ok(self.campaigns.lock().unwrap().get(&id).cloned())
        }

        async fn next_subscribers(&self, campaign_id: i64, limit: i64) -> StoreResult<Vec<Subscriber>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut campaigns = self.campaigns.lock().unwrap();
            let campaign = campaigns.get_mut(&campaign_id).unwrap();
            let cursor = campaign.last_subscriber_id;

            let subscribers = self.subscribers.lock().unwrap();
            let mut batch: Vec<_> = subscribers
                .iter()
                .filter(|s| s.id > cursor && s.status == "enabled")
                .cloned()
                .collect();
            batch.sort_by_key(|s| s.id);
            batch.truncate(limit.max(0) as usize);

            if let Some(last) = batch.last() {
                campaign.last_subscriber_id = last.id;
            }
            Ok(batch)
        }

        async fn update_campaign_status(&self, id: i64, status: CampaignStatus) -> StoreResult<()> {
            if let Some(c) = self.campaigns.lock().unwrap().get_mut(&id) {
                c.status = status.to_string();
            }
            Ok(())
        }

        async fn update_campaign_counts(
            &self,
            id: i64,
            to_send_delta: i64,
            sent_delta: i64,
            last_subscriber_id: i64,
        ) -> StoreResult<()> {
            if let Some(c) = self.campaigns.lock().unwrap().get_mut(&id) {
                c.to_send = (c.to_send + to_send_delta).max(0);
                c.sent += sent_delta;
                c.last_subscriber_id = c.last_subscriber_id.max(last_subscriber_id);
            }
            Ok(())
        }

        async fn campaign_hourly_sent(&self, id: i64, at: DateTime<Utc>) -> StoreResult<i64> {
            let key = (id, at.timestamp() / 3600);
            Ok(*self.hourly.lock().unwrap().get(&key).unwrap_or(&0))
        }

        async fn increment_hourly_sent(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()> {
            let key = (id, at.timestamp() / 3600);
            *self.hourly.lock().unwrap().entry(key).or_insert(0) += 1;
            Ok(())
        }

        async fn record_bounce(&self, _bounce: Bounce) -> StoreResult<()> {
            Ok(())
        }
    }

    /// Messenger that records pushes, optionally failing each one.
    struct MockMessenger {
        name: String,
        fail: bool,
        pushes: StdMutex<Vec<OutgoingMessage>>,
        attempts: AtomicUsize,
    }

    impl MockMessenger {
        fn new(name: &str, fail: bool) -> Self {
            Self {
                name: name.to_string(),
                fail,
                pushes: StdMutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Messenger for MockMessenger {
        fn name(&self) -> &str {
            &self.name
        }

        async fn push(&self, msg: OutgoingMessage) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("connection refused");
            }
            self.pushes.lock().unwrap().push(msg);
            Ok(())
        }

        async fn flush(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
        for _ in 0..250 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("Timed out waiting for: {}", what);
    }

    #[tokio::test]
    async fn test_direct_path_sends_every_subscriber_once_and_finishes() {
        let store = Arc::new(MemoryStore::new(vec![test_campaign(1)], test_subscribers(10)));
        let manager = Manager::new(
            test_config(),
            store.clone(),
            Notifier::new(&NotificationConfig::default()),
        );
        let messenger = Arc::new(MockMessenger::new("email", false));
        manager.add_messenger(messenger.clone()).await.unwrap();
        manager.run().await;

        wait_until(
            || store.campaign(1).status == "finished",
            "campaign to finish",
        )
        .await;

        let pushes = messenger.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 10);

        // At most once per subscriber.
        let recipients: HashSet<String> =
            pushes.iter().map(|m| m.to[0].clone()).collect();
        assert_eq!(recipients.len(), 10);

        // Rendered per subscriber, with the attribution headers attached.
        assert!(pushes[0].subject.starts_with("Hello Sub"));
        assert!(pushes[0]
            .headers
            .iter()
            .any(|(k, _)| k == "X-Listmonk-Campaign"));
        drop(pushes);

        let campaign = store.campaign(1);
        assert_eq!(campaign.sent, 10);
        assert_eq!(campaign.last_subscriber_id, 10);

        manager.close().await;
        assert!(!manager.has_running_campaigns().await);
    }

    #[tokio::test]
    async fn test_error_threshold_auto_pauses_campaign() {
        let mut campaign = test_campaign(1);
        campaign.name = "flaky".to_string();
        let store = Arc::new(MemoryStore::new(vec![campaign], test_subscribers(50)));

        let mut cfg = test_config();
        cfg.max_send_errors = 5;

        let notifier = Notifier::new(&NotificationConfig::default());
        let mut events = notifier.subscribe();

        let manager = Manager::new(cfg, store.clone(), notifier);
        let messenger = Arc::new(MockMessenger::new("email", true));
        manager.add_messenger(messenger.clone()).await.unwrap();
        manager.run().await;

        wait_until(|| store.campaign(1).status == "paused", "campaign to pause").await;

        assert!(messenger.attempts.load(Ordering::SeqCst) >= 5);

        // No further batches are fetched once the pipe has stopped.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let fetches = store.fetches.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.fetches.load(Ordering::SeqCst), fetches);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("notification should arrive")
            .expect("notifier channel open");
        assert_eq!(
            event,
            CampaignEvent::Paused {
                campaign_id: 1,
                name: "flaky".to_string(),
                reason: "Too many errors".to_string(),
            }
        );

        manager.close().await;
    }

    #[tokio::test]
    async fn test_inactive_status_never_gets_a_pipe() {
        let store = Arc::new(MemoryStore::new(vec![test_campaign(1)], test_subscribers(5)));
        let manager = Manager::new(
            test_config(),
            store.clone(),
            Notifier::new(&NotificationConfig::default()),
        );
        let messenger = Arc::new(MockMessenger::new("email", false));
        manager.add_messenger(messenger.clone()).await.unwrap();
        manager.run().await;

        wait_until(
            || store.campaign(1).status == "finished",
            "campaign to finish",
        )
        .await;

        // A campaign in a non-active status stays pipeless.
        store
            .update_campaign_status(1, CampaignStatus::Paused)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!manager.has_running_campaigns().await);
        assert_eq!(store.campaign(1).status, "paused");

        manager.close().await;
    }

    #[tokio::test]
    async fn test_unknown_messenger_cancels_campaign() {
        let mut campaign = test_campaign(1);
        campaign.messenger = "pigeon".to_string();
        let store = Arc::new(MemoryStore::new(vec![campaign], test_subscribers(3)));

        let notifier = Notifier::new(&NotificationConfig::default());
        let mut events = notifier.subscribe();

        let manager = Manager::new(test_config(), store.clone(), notifier);
        let messenger = Arc::new(MockMessenger::new("email", false));
        manager.add_messenger(messenger.clone()).await.unwrap();
        manager.run().await;

        wait_until(
            || store.campaign(1).status == "cancelled",
            "campaign to cancel",
        )
        .await;

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("notification should arrive")
            .expect("notifier channel open");
        assert!(matches!(event, CampaignEvent::Cancelled { campaign_id: 1, .. }));
        assert_eq!(messenger.attempts.load(Ordering::SeqCst), 0);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_invalid_send_interval_pauses_campaign() {
        let mut campaign = test_campaign(1);
        campaign.send_interval = Some("9am to 5pm".to_string());
        let store = Arc::new(MemoryStore::new(vec![campaign], test_subscribers(3)));

        let manager = Manager::new(
            test_config(),
            store.clone(),
            Notifier::new(&NotificationConfig::default()),
        );
        let messenger = Arc::new(MockMessenger::new("email", false));
        manager.add_messenger(messenger.clone()).await.unwrap();
        manager.run().await;

        wait_until(|| store.campaign(1).status == "paused", "campaign to pause").await;
        assert_eq!(messenger.attempts.load(Ordering::SeqCst), 0);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_messenger_rejected() {
        let store = Arc::new(MemoryStore::new(vec![], vec![]));
        let manager = Manager::new(
            test_config(),
            store,
            Notifier::new(&NotificationConfig::default()),
        );

        manager
            .add_messenger(Arc::new(MockMessenger::new("email", false)))
            .await
            .unwrap();
        assert!(manager
            .add_messenger(Arc::new(MockMessenger::new("email", false)))
            .await
            .is_err());

        // With no pipes running, messengers may be swapped.
        manager.clear_messengers().await.unwrap();
        manager
            .add_messenger(Arc::new(MockMessenger::new("email", false)))
            .await
            .unwrap();
    }
}
