//! Per-topic rendezvous between event producers and WebSocket subscribers.
//!
//! Each topic carries an unbuffered-style unicast channel pair (batch out,
//! ack back), a broadcast channel for fan-out mode, and a closing token. A
//! producer blocked on the unicast rendezvous is woken when the subscriber
//! disconnects: the hub cancels the topic's closing token and installs a
//! fresh one, so the next subscriber starts clean.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Reserved topic carrying terminal receipts to `listenReplies` subscribers.
pub const REPLIES_TOPIC: &str = "replies";

const BROADCAST_CAPACITY: usize = 64;

/// One numbered batch of events.
#[derive(Debug, Clone)]
pub struct WsBatch {
    pub batch_number: u64,
    pub events: Vec<Value>,
}

/// Ack value per delivered batch: `None` on success, `Some(message)` when
/// the client reported a processing error.
pub type BatchAck = Option<String>;

/// A topic's channel set. Created lazily, never destroyed for the process
/// lifetime; shared between producers and subscribed connections without
/// either side owning it.
pub struct WsTopic {
    pub name: String,
    batch_tx: mpsc::Sender<WsBatch>,
    batch_rx: tokio::sync::Mutex<mpsc::Receiver<WsBatch>>,
    broadcast_tx: broadcast::Sender<WsBatch>,
    ack_tx: mpsc::Sender<BatchAck>,
    ack_rx: tokio::sync::Mutex<mpsc::Receiver<BatchAck>>,
    closing: Mutex<CancellationToken>,
}

impl WsTopic {
    fn new(name: String) -> Self {
        let (batch_tx, batch_rx) = mpsc::channel(1);
        let (ack_tx, ack_rx) = mpsc::channel(1);
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            name,
            batch_tx,
            batch_rx: tokio::sync::Mutex::new(batch_rx),
            broadcast_tx,
            ack_tx,
            ack_rx: tokio::sync::Mutex::new(ack_rx),
            closing: Mutex::new(CancellationToken::new()),
        }
    }

    /// Producer side of the unicast batch channel.
    pub fn batch_sender(&self) -> mpsc::Sender<WsBatch> {
        self.batch_tx.clone()
    }

    /// Subscriber side of the unicast batch channel. One listener at a
    /// time holds this; the lock is released on disconnect.
    pub fn batch_receiver(&self) -> &tokio::sync::Mutex<mpsc::Receiver<WsBatch>> {
        &self.batch_rx
    }

    /// Subscriber side of the ack channel.
    pub fn ack_sender(&self) -> mpsc::Sender<BatchAck> {
        self.ack_tx.clone()
    }

    /// Producer side of the ack channel.
    pub fn ack_receiver(&self) -> &tokio::sync::Mutex<mpsc::Receiver<BatchAck>> {
        &self.ack_rx
    }

    /// Fan-out a batch to every broadcast subscriber; dropped when nobody
    /// is listening.
    pub fn broadcast(&self, batch: WsBatch) {
        if self.broadcast_tx.send(batch).is_err() {
            debug!(topic = %self.name, "Broadcast batch dropped, no subscribers");
        }
    }

    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<WsBatch> {
        self.broadcast_tx.subscribe()
    }

    /// The current closing token. Cancelled (and replaced) every time a
    /// subscriber on this topic disconnects.
    pub fn closing(&self) -> CancellationToken {
        self.lock_closing().clone()
    }

    fn lock_closing(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.closing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Process-wide topic map.
pub struct WsChannelHub {
    topics: Mutex<HashMap<String, Arc<WsTopic>>>,
    processing_timeout: Duration,
}

impl WsChannelHub {
    pub fn new(processing_timeout: Duration) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            processing_timeout,
        }
    }

    /// Upper bound for any single blocking interaction with a client.
    pub fn processing_timeout(&self) -> Duration {
        self.processing_timeout
    }

    /// Fetch a topic's channel set, creating the topic on first use.
    pub fn get_channels(&self, topic: &str) -> Arc<WsTopic> {
        let mut topics = self.lock_topics();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                debug!(topic = %topic, "WebSocket topic created");
                Arc::new(WsTopic::new(topic.to_string()))
            })
            .clone()
    }

    /// Wake producers blocked against a topic whose subscriber went away,
    /// then install a fresh closing token for the next subscriber.
    pub fn cycle_topic(&self, topic: &WsTopic) {
        let _topics = self.lock_topics();
        let mut closing = topic.lock_closing();
        closing.cancel();
        *closing = CancellationToken::new();
        info!(topic = %topic.name, "WebSocket topic cycled");
    }

    /// Cancel every topic's closing token; producers blocked anywhere
    /// observe an interrupt.
    pub fn close(&self) {
        let topics = self.lock_topics();
        for topic in topics.values() {
            topic.lock_closing().cancel();
        }
    }

    fn lock_topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<WsTopic>>> {
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for WsChannelHub {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
