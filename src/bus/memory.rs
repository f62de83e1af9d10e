//! In-process bus implementation.
//!
//! Backs tests and standalone mode with the same contract the broker driver
//! honours: per-partition append logs, producer acknowledgements carrying
//! the assigned coordinates, committed-offset tracking per partition, and
//! re-delivery of uncommitted messages after a consumer restart.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tracing::{debug, info};

use super::{BusError, BusGateway, BusMessage, RebalanceEvent};

#[derive(Debug, Clone)]
struct Record {
    key: Option<String>,
    value: Vec<u8>,
}

#[derive(Default)]
struct ConsumerState {
    /// Next offset to deliver, per partition of the consume topic
    positions: HashMap<i32, i64>,
    /// Next offset after the last committed message, per partition
    committed: HashMap<i32, i64>,
}

struct ProduceRequest {
    topic: String,
    key: Option<String>,
    value: Vec<u8>,
    ack: oneshot::Sender<Result<(i32, i64), BusError>>,
}

struct BusInner {
    partitions: i32,
    consume_topic: String,
    logs: Mutex<HashMap<String, Vec<Vec<Record>>>>,
    consumer: Mutex<ConsumerState>,
    notify: Notify,
    rebalance_tx: broadcast::Sender<RebalanceEvent>,
    closed: AtomicBool,
    round_robin: AtomicU64,
    fail_next_produce: Mutex<Option<BusError>>,
}

impl BusInner {
    fn select_partition(&self, key: Option<&str>) -> i32 {
        match key {
            Some(k) => {
                let mut hasher = DefaultHasher::new();
                k.hash(&mut hasher);
                (hasher.finish() % self.partitions as u64) as i32
            }
            None => {
                let n = self.round_robin.fetch_add(1, Ordering::Relaxed);
                (n % self.partitions as u64) as i32
            }
        }
    }
}

/// In-memory partitioned bus.
pub struct InMemoryBus {
    inner: Arc<BusInner>,
    produce_tx: mpsc::Sender<ProduceRequest>,
}

impl InMemoryBus {
    /// Create a bus consuming `consume_topic` with `partitions` partitions
    /// per topic. Spawns the producer dispatch task that assigns
    /// coordinates and answers acknowledgements.
    pub fn new(consume_topic: impl Into<String>, partitions: i32) -> Self {
        let partitions = partitions.max(1);
        let consume_topic = consume_topic.into();
        let (rebalance_tx, _) = broadcast::channel(16);
        let inner = Arc::new(BusInner {
            partitions,
            consume_topic: consume_topic.clone(),
            logs: Mutex::new(HashMap::new()),
            consumer: Mutex::new(ConsumerState::default()),
            notify: Notify::new(),
            rebalance_tx,
            closed: AtomicBool::new(false),
            round_robin: AtomicU64::new(0),
            fail_next_produce: Mutex::new(None),
        });

        let (produce_tx, produce_rx) = mpsc::channel(64);
        tokio::spawn(producer_dispatch_loop(inner.clone(), produce_rx));

        let _ = inner.rebalance_tx.send(RebalanceEvent::Assigned {
            topic: consume_topic,
            partitions: (0..partitions).collect(),
        });

        Self { inner, produce_tx }
    }

    /// Rewind in-flight consumer positions to the last committed offsets,
    /// as a restarted member of the consumer group would.
    pub fn restart_consumer(&self) {
        {
            let mut consumer = lock(&self.inner.consumer);
            let committed = consumer.committed.clone();
            consumer.positions = committed;
        }
        let _ = self.inner.rebalance_tx.send(RebalanceEvent::Assigned {
            topic: self.inner.consume_topic.clone(),
            partitions: (0..self.inner.partitions).collect(),
        });
        self.inner.notify.notify_waiters();
        info!(topic = %self.inner.consume_topic, "Consumer restarted from committed offsets");
    }

    /// Inject a failure for the next produce call. Test hook.
    pub fn fail_next_produce(&self, err: BusError) {
        *lock(&self.inner.fail_next_produce) = Some(err);
    }

    /// Number of records appended to a topic across all partitions.
    pub fn topic_len(&self, topic: &str) -> usize {
        lock(&self.inner.logs)
            .get(topic)
            .map(|parts| parts.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Read back a produced record. Test hook.
    pub fn record(&self, topic: &str, partition: i32, offset: i64) -> Option<BusMessage> {
        let logs = lock(&self.inner.logs);
        let rec = logs.get(topic)?.get(partition as usize)?.get(offset as usize)?;
        Some(BusMessage {
            topic: topic.to_string(),
            partition,
            offset,
            key: rec.key.clone(),
            value: rec.value.clone(),
        })
    }
}

/// Drains produce requests, appends to the partition log, and answers each
/// request with its assigned `(partition, offset)` — the producer ack loop.
async fn producer_dispatch_loop(inner: Arc<BusInner>, mut rx: mpsc::Receiver<ProduceRequest>) {
    while let Some(req) = rx.recv().await {
        if inner.closed.load(Ordering::SeqCst) {
            let _ = req.ack.send(Err(BusError::Closed));
            continue;
        }
        if let Some(err) = lock(&inner.fail_next_produce).take() {
            let _ = req.ack.send(Err(err));
            continue;
        }
        let partition = inner.select_partition(req.key.as_deref());
        let offset;
        {
            let mut logs = lock(&inner.logs);
            let parts = logs
                .entry(req.topic.clone())
                .or_insert_with(|| vec![Vec::new(); inner.partitions as usize]);
            let log = &mut parts[partition as usize];
            offset = log.len() as i64;
            log.push(Record {
                key: req.key,
                value: req.value,
            });
        }
        debug!(topic = %req.topic, partition, offset, "Produced message");
        let _ = req.ack.send(Ok((partition, offset)));
        inner.notify.notify_waiters();
    }
}

#[async_trait]
impl BusGateway for InMemoryBus {
    async fn produce(
        &self,
        topic: &str,
        key: Option<String>,
        value: Vec<u8>,
    ) -> Result<(i32, i64), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.produce_tx
            .send(ProduceRequest {
                topic: topic.to_string(),
                key,
                value,
                ack: ack_tx,
            })
            .await
            .map_err(|_| BusError::Closed)?;
        ack_rx.await.map_err(|_| BusError::Closed)?
    }

    async fn next_message(&self) -> Option<BusMessage> {
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            // Register for wakeups before checking the logs, otherwise a
            // produce landing between the check and the await is lost.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let logs = lock(&self.inner.logs);
                let mut consumer = lock(&self.inner.consumer);
                if let Some(parts) = logs.get(&self.inner.consume_topic) {
                    for (p, log) in parts.iter().enumerate() {
                        let partition = p as i32;
                        let position = *consumer.positions.get(&partition).unwrap_or(&0);
                        if (position as usize) < log.len() {
                            let rec = &log[position as usize];
                            consumer.positions.insert(partition, position + 1);
                            return Some(BusMessage {
                                topic: self.inner.consume_topic.clone(),
                                partition,
                                offset: position,
                                key: rec.key.clone(),
                                value: rec.value.clone(),
                            });
                        }
                    }
                }
            }
            notified.await;
        }
    }

    async fn commit(&self, msg: &BusMessage) -> Result<(), BusError> {
        if msg.topic != self.inner.consume_topic {
            return Err(BusError::Config(format!(
                "commit for unsubscribed topic {}",
                msg.topic
            )));
        }
        let mut consumer = lock(&self.inner.consumer);
        let committed = consumer.committed.entry(msg.partition).or_insert(0);
        if msg.offset + 1 > *committed {
            *committed = msg.offset + 1;
        }
        Ok(())
    }

    fn rebalance_events(&self) -> broadcast::Receiver<RebalanceEvent> {
        self.inner.rebalance_tx.subscribe()
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        info!("Bus gateway closed");
    }
}

/// Lock a mutex, recovering the guard if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
