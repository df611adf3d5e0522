//! Bounce mailbox pipeline
//!
//! Each configured POP3 mailbox is scanned on its own interval: messages
//! are downloaded, parsed, classified, emitted onto an in-memory channel,
//! and then deleted from the server. A recorder task drains the channel
//! into the store, which resolves attribution and applies the configured
//! bounce action.

pub mod classify;
pub mod parse;
pub(crate) mod pop3;

use chrono::Utc;
use classify::Classifier;
use listmill_common::config::{BounceConfig, BounceMailboxConfig};
use listmill_storage::models::Bounce;
use listmill_storage::store::Store;
use parse::BounceParser;
use pop3::{Pop3Client, Pop3Error};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the in-memory bounce channel
const BOUNCE_QUEUE_CAPACITY: usize = 256;

/// Coordinates mailbox scan tasks and the bounce recorder
pub struct BounceManager {
    cfg: BounceConfig,
    store: Arc<dyn Store>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BounceManager {
    pub fn new(cfg: BounceConfig, store: Arc<dyn Store>) -> Self {
        Self {
            cfg,
            store,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the recorder and one scan task per mailbox.
    pub async fn run(&self) {
        if !self.cfg.enabled || self.cfg.mailbox.is_empty() {
            info!("Bounce processing disabled");
            return;
        }

        let (tx, rx) = mpsc::channel::<Bounce>(BOUNCE_QUEUE_CAPACITY);
        let mut tasks = self.tasks.lock().await;

        {
            let store = Arc::clone(&self.store);
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                record_loop(store, rx, shutdown).await;
            }));
        }

        for mailbox in self.cfg.mailbox.clone() {
            let tx = tx.clone();
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                scan_loop(mailbox, tx, shutdown).await;
            }));
        }

        info!(mailboxes = self.cfg.mailbox.len(), "Bounce processing started");
    }

    /// Stop scanning and drain the recorder.
    pub async fn close(&self) {
        self.shutdown.cancel();
        for handle in self.tasks.lock().await.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn record_loop(
    store: Arc<dyn Store>,
    mut rx: mpsc::Receiver<Bounce>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            bounce = rx.recv() => {
                let Some(bounce) = bounce else { break };
                if let Err(e) = store.record_bounce(bounce).await {
                    error!("Failed to record bounce: {}", e);
                }
            }
        }
    }
}

async fn scan_loop(
    mailbox: BounceMailboxConfig,
    tx: mpsc::Sender<Bounce>,
    shutdown: CancellationToken,
) {
    let parser = BounceParser::new(&mailbox.username);
    let classifier = Classifier::new();
    let mut ticker =
        tokio::time::interval(Duration::from_secs(mailbox.scan_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match scan_mailbox(&mailbox, &parser, &classifier, &tx).await {
            Ok(0) => {}
            Ok(n) => info!(host = %mailbox.host, count = n, "Processed bounce messages"),
            Err(e) => warn!(host = %mailbox.host, "Bounce scan failed: {}", e),
        }
    }
}

/// One scan cycle: fetch up to the limit, emit bounces, delete everything
/// downloaded.
async fn scan_mailbox(
    mailbox: &BounceMailboxConfig,
    parser: &BounceParser,
    classifier: &Classifier,
    tx: &mpsc::Sender<Bounce>,
) -> Result<usize, Pop3Error> {
    let mut client = Pop3Client::connect(mailbox).await?;
    client.login(mailbox).await?;

    let (count, _) = client.stat().await?;
    if count == 0 {
        client.quit().await?;
        return Ok(0);
    }

    let fetch = count.min(mailbox.fetch_limit.max(1));
    debug!(host = %mailbox.host, count, fetch, "Scanning bounce mailbox");

    let mut emitted = 0;
    for number in 1..=fetch {
        let raw = client.retr(number).await?;
        if let Some(bounce) = build_bounce(mailbox, parser, classifier, &raw) {
            if tx.send(bounce).await.is_err() {
                // Recorder is gone; leave the mail on the server.
                return Ok(emitted);
            }
            emitted += 1;
        }
    }

    for number in 1..=fetch {
        client.dele(number).await?;
    }
    client.quit().await?;

    Ok(emitted)
}

/// Parse and classify one raw message into a recordable bounce. Messages
/// with no usable attribution at all are dropped.
fn build_bounce(
    mailbox: &BounceMailboxConfig,
    parser: &BounceParser,
    classifier: &Classifier,
    raw: &[u8],
) -> Option<Bounce> {
    let parsed = parser.parse(raw);
    let text = String::from_utf8_lossy(raw);
    let classification = classifier.classify(&text);

    if parsed.email.is_empty() && parsed.subscriber_uuid.is_none() {
        debug!(host = %mailbox.host, "Bounce message carries no attribution, dropping");
        return None;
    }

    let mut meta = match parsed.meta {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    meta.insert("reason".to_string(), classification.reason.into());

    let source = if mailbox.username.is_empty() {
        mailbox.host.clone()
    } else {
        mailbox.username.clone()
    };

    Some(Bounce {
        email: parsed.email,
        campaign_uuid: parsed.campaign_uuid,
        subscriber_uuid: parsed.subscriber_uuid,
        kind: classification.kind,
        source,
        meta: serde_json::Value::Object(meta),
        created_at: Utc::now(),
    })
}
