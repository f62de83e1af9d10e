//! Background task startup functions.
//!
//! The bridge runs one reply-consumer task and one rebalance-observer task
//! per process; the bus implementation runs its own producer loops.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::BusGateway;
use crate::receipts::ReceiptStore;

/// Start the reply-consumer loop: consume → process → commit.
///
/// The offset commit happens only after the receipt is persisted, so an
/// uncommitted reply is re-delivered after a restart; the store's
/// idempotency makes the re-delivery observationally safe. A fatal store
/// error (retry deadline exhausted) aborts the process — there is no
/// durable outbox to fall back to.
pub fn start_reply_consumer(
    bus: Arc<dyn BusGateway>,
    store: Arc<ReceiptStore>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = bus.next_message() => msg,
                _ = shutdown.cancelled() => break,
            };
            let Some(msg) = msg else {
                info!("Bus consumer stream closed");
                break;
            };
            if let Err(e) = store.process_reply(&msg.value).await {
                if e.is_fatal() {
                    error!(error = %e, "Reply persistence retry deadline exhausted");
                    std::process::exit(1);
                }
                error!(error = %e, "Failed to process reply");
            }
            if let Err(e) = bus.commit(&msg).await {
                error!(error = %e, req_offset = %msg.req_offset(), "Failed to commit reply offset");
            }
        }
        info!("Reply consumer task ended");
    })
}

/// Observe consumer-group rebalances. Notifications are logged, never fatal;
/// consumption resumes across rebalances.
pub fn start_rebalance_observer(
    bus: Arc<dyn BusGateway>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut events = bus.rebalance_events();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => debug!(?event, "Bus consumer rebalanced"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(lagged = n, "Rebalance observer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::receipts::{get_string, MemoryReceipts, ReceiptStoreConf};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_consumer_loop_processes_and_commits() {
        let bus = Arc::new(InMemoryBus::new("replies", 1));
        let store = Arc::new(
            ReceiptStore::new(ReceiptStoreConf::default())
                .with_persistence(Arc::new(MemoryReceipts::new(250))),
        );
        let shutdown = CancellationToken::new();
        let handle = start_reply_consumer(bus.clone(), store.clone(), shutdown.clone());

        let reply = json!({
            "headers": {"requestId": "req-1", "type": "transaction-success"},
            "transactionHash": "0xabcd"
        });
        bus.produce("replies", None, reply.to_string().into_bytes())
            .await
            .unwrap();

        // Wait for the loop to persist the receipt
        let mut stored = None;
        for _ in 0..50 {
            if let Ok(Some(receipt)) = store.receipt("req-1").await {
                stored = Some(receipt);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stored = stored.expect("reply should be persisted by the consumer loop");
        assert_eq!(get_string(&stored, "transactionHash"), Some("0xabcd"));

        // The offset was committed: a restart re-delivers nothing
        bus.restart_consumer();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        bus.close().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_consumer_loop_exits_when_bus_closes() {
        let bus = Arc::new(InMemoryBus::new("replies", 1));
        let store = Arc::new(ReceiptStore::new(ReceiptStoreConf::default()));
        let handle = start_reply_consumer(bus.clone(), store, CancellationToken::new());

        bus.close().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("consumer task should end when the bus closes")
            .unwrap();
    }
}
