//! Event stream driver.
//!
//! Buffers events, assembles numbered batches, and pushes them through a
//! [`WsAction`] with retry. Reconfiguration cancels the in-flight delivery
//! attempt through the stream's update-interrupt token; the retry loop then
//! picks the batch up again under the new spec.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::websocket::WsChannelHub;

use super::ws_action::{DeliveryError, WsAction};
use super::DistributionMode;

/// Stream definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    #[serde(default)]
    pub topic: String,
    #[serde(rename = "distributionMode", default)]
    pub distribution_mode: DistributionMode,
    #[serde(rename = "batchSize", default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(rename = "batchTimeoutMS", default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
}

fn default_batch_size() -> usize {
    1
}

fn default_batch_timeout_ms() -> u64 {
    500
}

/// Retry policy for failed or interrupted batch deliveries.
#[derive(Debug, Clone)]
pub struct StreamRetryConf {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for StreamRetryConf {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

const BUFFER_CAPACITY: usize = 256;

/// A running event stream.
pub struct EventStream {
    spec: Mutex<StreamSpec>,
    retry: StreamRetryConf,
    hub: Arc<WsChannelHub>,
    events_tx: mpsc::Sender<Value>,
    update_interrupt: Mutex<CancellationToken>,
    suspended: AtomicBool,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventStream {
    /// Create the stream and start its delivery task.
    pub fn start(
        spec: StreamSpec,
        hub: Arc<WsChannelHub>,
        retry: StreamRetryConf,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(BUFFER_CAPACITY);
        let stream = Arc::new(Self {
            spec: Mutex::new(spec),
            retry,
            hub,
            events_tx,
            update_interrupt: Mutex::new(CancellationToken::new()),
            suspended: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        });
        let task = tokio::spawn(run_delivery(stream.clone(), events_rx));
        *lock(&stream.handle) = Some(task);
        info!(stream = %lock(&stream.spec).name, "Event stream started");
        stream
    }

    /// Queue an event for delivery. Applies backpressure once the buffer
    /// is full.
    pub async fn enqueue(&self, event: Value) -> bool {
        self.events_tx.send(event).await.is_ok()
    }

    pub fn spec(&self) -> StreamSpec {
        lock(&self.spec).clone()
    }

    /// Reconfigure the stream. The in-flight delivery attempt observes the
    /// interrupt and retries under the new spec.
    pub fn update(&self, new_spec: StreamSpec) {
        {
            let mut spec = lock(&self.spec);
            *spec = new_spec;
        }
        let mut interrupt = lock(&self.update_interrupt);
        interrupt.cancel();
        *interrupt = CancellationToken::new();
        info!(stream = %lock(&self.spec).name, "Event stream updated");
    }

    /// Pause batch delivery without dropping buffered events.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Stop the delivery task and interrupt any in-flight attempt.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        lock(&self.update_interrupt).cancel();
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn update_token(&self) -> CancellationToken {
        lock(&self.update_interrupt).clone()
    }
}

async fn run_delivery(stream: Arc<EventStream>, mut events_rx: mpsc::Receiver<Value>) {
    let mut batch_number: u64 = 0;

    loop {
        let spec = stream.spec();
        let batch = tokio::select! {
            batch = assemble_batch(&mut events_rx, spec.batch_size, spec.batch_timeout_ms) => {
                match batch {
                    Some(batch) => batch,
                    None => break,
                }
            }
            _ = stream.shutdown.cancelled() => break,
        };
        batch_number += 1;

        if !deliver_with_retry(&stream, batch_number, batch).await {
            break;
        }
    }
    debug!("Event stream delivery task ended");
}

/// Collect up to `batch_size` events, cutting the batch after the timeout
/// once at least one event is buffered. `None` when the buffer closed.
async fn assemble_batch(
    events_rx: &mut mpsc::Receiver<Value>,
    batch_size: usize,
    batch_timeout_ms: u64,
) -> Option<Vec<Value>> {
    let first = events_rx.recv().await?;
    let mut events = vec![first];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(batch_timeout_ms);
    while events.len() < batch_size.max(1) {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => events.push(event),
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }
    Some(events)
}

/// Retry one batch until delivered or shut down. Returns false on shutdown.
async fn deliver_with_retry(stream: &Arc<EventStream>, batch_number: u64, events: Vec<Value>) -> bool {
    let mut attempt: u64 = 0;
    let mut delay = Duration::from_millis(stream.retry.initial_delay_ms);
    let max_delay = Duration::from_millis(stream.retry.max_delay_ms);

    loop {
        if stream.shutdown.is_cancelled() {
            return false;
        }
        if stream.is_suspended() {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
                _ = stream.shutdown.cancelled() => return false,
            }
        }

        attempt += 1;
        let spec = stream.spec();
        let action = WsAction::new(
            spec.topic.clone(),
            spec.distribution_mode,
            stream.hub.clone(),
        );
        match action
            .attempt_batch(batch_number, attempt, events.clone(), &stream.update_token())
            .await
        {
            Ok(()) => {
                debug!(stream = %spec.name, batch_number, attempt, "Batch delivered");
                return true;
            }
            Err(DeliveryError::Client(message)) => {
                warn!(stream = %spec.name, batch_number, attempt, message = %message, "Client rejected batch, retrying");
            }
            Err(err) => {
                debug!(stream = %spec.name, batch_number, attempt, error = %err, "Batch delivery interrupted, retrying");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stream.shutdown.cancelled() => return false,
        }
        delay = (delay * 2).min(max_delay);
    }
}

/// Lock a mutex, recovering the guard if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
