use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use crate::gateway::{ContractGateway, GatewayError, TransactionReceipt};
use crate::receipts::{
    get_string, headers, Document, MemoryReceipts, PersistenceError, ReceiptPersistence,
    ReceiptQuery, ReceiptStore, ReceiptStoreConf, StoreError, ERROR_CODE_RESUBMISSION_PREVENTED,
    MSG_TYPE_TX_SUCCESS,
};
use crate::websocket::{WsChannelHub, REPLIES_TOPIC};

use async_trait::async_trait;

fn doc(v: Value) -> Document {
    v.as_object().unwrap().clone()
}

fn store_with_memory() -> ReceiptStore {
    ReceiptStore::new(ReceiptStoreConf::default())
        .with_persistence(Arc::new(MemoryReceipts::new(250)))
}

/// Persistence wrapper that fails `add_receipt` a configured number of
/// times before delegating.
struct FlakyPersistence {
    inner: MemoryReceipts,
    failures_left: Mutex<usize>,
    attempts: Mutex<usize>,
}

impl FlakyPersistence {
    fn new(failures: usize) -> Self {
        Self {
            inner: MemoryReceipts::new(250),
            failures_left: Mutex::new(failures),
            attempts: Mutex::new(0),
        }
    }
}

#[async_trait]
impl ReceiptPersistence for FlakyPersistence {
    async fn get_receipt(&self, id: &str) -> Result<Option<Document>, PersistenceError> {
        self.inner.get_receipt(id).await
    }

    async fn get_receipts(&self, query: &ReceiptQuery) -> Result<Vec<Document>, PersistenceError> {
        self.inner.get_receipts(query).await
    }

    async fn add_receipt(
        &self,
        id: &str,
        receipt: Document,
        overwrite: bool,
    ) -> Result<(), PersistenceError> {
        *self.attempts.lock().unwrap() += 1;
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(PersistenceError::Transient("store unavailable".into()));
            }
        }
        self.inner.add_receipt(id, receipt, overwrite).await
    }
}

#[derive(Default)]
struct MockGateway {
    deploys: Mutex<Vec<TransactionReceipt>>,
    replies: Mutex<Vec<Document>>,
}

#[async_trait]
impl ContractGateway for MockGateway {
    async fn post_deploy(&self, receipt: &TransactionReceipt) -> Result<(), GatewayError> {
        self.deploys.lock().unwrap().push(receipt.clone());
        Ok(())
    }

    async fn send_reply(&self, receipt: Document) {
        self.replies.lock().unwrap().push(receipt);
    }
}

// ---------------------------------------------------------------------------
// Reservation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_second_reservation_conflicts_until_release() {
    let store = store_with_memory();

    let reservation = store.reserve_id("req-2").await.unwrap();
    assert_eq!(reservation.id(), "req-2");
    assert!(matches!(
        store.reserve_id("req-2").await,
        Err(StoreError::KeyNotUnique)
    ));

    drop(reservation);
    store.reserve_id("req-2").await.unwrap();
}

#[tokio::test]
async fn test_reservation_conflicts_with_persisted_receipt() {
    let store = store_with_memory();
    let reservation = store.reserve_id("req-1").await.unwrap();
    store
        .write_accepted("req-1", "requests:0:0", doc(json!({"headers": {}})))
        .await
        .unwrap();
    drop(reservation);

    // The reservation is gone, but the stored receipt still blocks reuse
    assert!(matches!(
        store.reserve_id("req-1").await,
        Err(StoreError::KeyNotUnique)
    ));
}

#[tokio::test]
async fn test_reservation_released_on_error_path() {
    let store = ReceiptStore::new(ReceiptStoreConf::default())
        .with_persistence(Arc::new(FlakyPersistence::new(1)));

    {
        let _reservation = store.reserve_id("req-9").await.unwrap();
        // Accepted write fails immediately (overwrite == false, no retry);
        // the guard drops with the scope.
        let err = store
            .write_accepted("req-9", "requests:0:0", doc(json!({"headers": {}})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Persistence(_)));
    }

    store.reserve_id("req-9").await.unwrap();
}

// ---------------------------------------------------------------------------
// Accepted writes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_write_accepted_stamps_pending_fields() {
    let store = store_with_memory();
    store
        .write_accepted(
            "req-1",
            "requests:0:42",
            doc(json!({"headers": {"requestId": "req-1", "reqOffset": "requests:0:42"}, "from": "0xfeed"})),
        )
        .await
        .unwrap();

    let stored = store.receipt("req-1").await.unwrap().unwrap();
    assert_eq!(get_string(&stored, "_id"), Some("req-1"));
    assert_eq!(get_string(&stored, "msgAck"), Some("requests:0:42"));
    assert_eq!(stored.get("pending"), Some(&json!(true)));
    assert!(stored.get("receivedAt").and_then(Value::as_i64).is_some());
    assert_eq!(
        headers(&stored).and_then(|h| get_string(h, "reqOffset")),
        Some("requests:0:42")
    );
}

#[tokio::test]
async fn test_write_accepted_duplicate_fails_without_retry() {
    let store = store_with_memory();
    let msg = doc(json!({"headers": {}}));
    store
        .write_accepted("req-1", "requests:0:0", msg.clone())
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let err = store
        .write_accepted("req-1", "requests:0:1", msg)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Persistence(PersistenceError::KeyNotUnique)
    ));
    // First-attempt failure surfaces immediately on the ingress path
    assert!(started.elapsed() < Duration::from_millis(400));
}

// ---------------------------------------------------------------------------
// Reply ingestion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_successful_reply_overwrites_pending_receipt() {
    let gateway = Arc::new(MockGateway::default());
    let store = ReceiptStore::new(ReceiptStoreConf::default())
        .with_persistence(Arc::new(MemoryReceipts::new(250)))
        .with_contract_gateway(gateway.clone());

    store
        .write_accepted(
            "req-1",
            "requests:0:42",
            doc(json!({"headers": {"requestId": "req-1"}})),
        )
        .await
        .unwrap();

    let reply = json!({
        "headers": {"requestId": "req-1", "reqOffset": "replies:0:7", "type": MSG_TYPE_TX_SUCCESS},
        "transactionHash": "0xabcd",
        "blockNumber": "112"
    });
    store
        .process_reply(reply.to_string().as_bytes())
        .await
        .unwrap();

    let stored = store.receipt("req-1").await.unwrap().unwrap();
    assert_eq!(get_string(&stored, "transactionHash"), Some("0xabcd"));
    assert_eq!(get_string(&stored, "_id"), Some("req-1"));
    assert!(stored.get("receivedAt").and_then(Value::as_i64).is_some());
    assert!(stored.get("pending").is_none(), "reply replaces the pending doc");
    assert_eq!(
        headers(&stored).and_then(|h| get_string(h, "type")),
        Some(MSG_TYPE_TX_SUCCESS)
    );

    // Terminal write reached the gateway reply hook
    let replies = gateway.replies.lock().unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(get_string(&replies[0], "transactionHash"), Some("0xabcd"));
}

#[tokio::test]
async fn test_deploy_hook_called_for_contract_creation() {
    let gateway = Arc::new(MockGateway::default());
    let store = ReceiptStore::new(ReceiptStoreConf::default())
        .with_persistence(Arc::new(MemoryReceipts::new(250)))
        .with_contract_gateway(gateway.clone());

    let reply = json!({
        "headers": {"requestId": "req-1", "type": MSG_TYPE_TX_SUCCESS},
        "transactionHash": "0xabcd",
        "contractAddress": "0x1234"
    });
    store
        .process_reply(reply.to_string().as_bytes())
        .await
        .unwrap();

    let deploys = gateway.deploys.lock().unwrap();
    assert_eq!(deploys.len(), 1);
    assert_eq!(deploys[0].contract_address.as_deref(), Some("0x1234"));
}

#[tokio::test]
async fn test_deploy_hook_skipped_without_contract_address() {
    let gateway = Arc::new(MockGateway::default());
    let store = ReceiptStore::new(ReceiptStoreConf::default())
        .with_persistence(Arc::new(MemoryReceipts::new(250)))
        .with_contract_gateway(gateway.clone());

    let reply = json!({
        "headers": {"requestId": "req-1", "type": MSG_TYPE_TX_SUCCESS},
        "transactionHash": "0xabcd"
    });
    store
        .process_reply(reply.to_string().as_bytes())
        .await
        .unwrap();

    assert!(gateway.deploys.lock().unwrap().is_empty());
    assert_eq!(gateway.replies.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_malformed_replies_dropped_without_error() {
    let store = store_with_memory();

    store.process_reply(b"not json at all").await.unwrap();
    store.process_reply(b"[1,2,3]").await.unwrap();
    store
        .process_reply(br#"{"noHeaders": true}"#)
        .await
        .unwrap();
    store
        .process_reply(br#"{"headers": {"type": "error"}}"#)
        .await
        .unwrap();

    let all = store.receipts(&ReceiptQuery::default()).await.unwrap();
    assert!(all.is_empty(), "dropped replies must not be persisted");
}

#[tokio::test]
async fn test_error_reply_persists_error_message() {
    let store = store_with_memory();
    let reply = json!({
        "headers": {"requestId": "req-1", "type": "error"},
        "errorMessage": "nonce too low"
    });
    store
        .process_reply(reply.to_string().as_bytes())
        .await
        .unwrap();

    let stored = store.receipt("req-1").await.unwrap().unwrap();
    assert_eq!(get_string(&stored, "errorMessage"), Some("nonce too low"));
}

// ---------------------------------------------------------------------------
// Redelivery-prevented handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_redelivery_prevented_while_pending_becomes_synthetic_error() {
    let store = store_with_memory();
    store
        .write_accepted(
            "req-3",
            "requests:0:1",
            doc(json!({"headers": {"requestId": "req-3"}})),
        )
        .await
        .unwrap();

    let reply = json!({
        "headers": {"requestId": "req-3", "type": "transaction-redelivery-prevented"},
        "transactionHash": "0xdead"
    });
    store
        .process_reply(reply.to_string().as_bytes())
        .await
        .unwrap();

    let stored = store.receipt("req-3").await.unwrap().unwrap();
    assert_eq!(
        get_string(&stored, "errorCode"),
        Some(ERROR_CODE_RESUBMISSION_PREVENTED)
    );
    assert!(get_string(&stored, "errorMessage")
        .unwrap()
        .contains("transaction hash"));
    // The hash survives so the caller can reconcile
    assert_eq!(get_string(&stored, "transactionHash"), Some("0xdead"));
}

#[tokio::test]
async fn test_redelivery_prevented_after_terminal_receipt_is_ignored() {
    let store = store_with_memory();

    let success = json!({
        "headers": {"requestId": "req-4", "type": MSG_TYPE_TX_SUCCESS},
        "transactionHash": "0xabcd"
    });
    store
        .process_reply(success.to_string().as_bytes())
        .await
        .unwrap();
    let before = store.receipt("req-4").await.unwrap().unwrap();

    let redelivery = json!({
        "headers": {"requestId": "req-4", "type": "transaction-redelivery-prevented"},
        "transactionHash": "0xdead"
    });
    store
        .process_reply(redelivery.to_string().as_bytes())
        .await
        .unwrap();

    let after = store.receipt("req-4").await.unwrap().unwrap();
    assert_eq!(before, after, "terminal receipt must be left unchanged");
    assert_eq!(get_string(&after, "transactionHash"), Some("0xabcd"));
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_reply_write_retries_with_backoff() {
    let persistence = Arc::new(FlakyPersistence::new(3));
    let store = ReceiptStore::new(ReceiptStoreConf::default())
        .with_persistence(persistence.clone());

    let reply = json!({
        "headers": {"requestId": "req-6", "type": MSG_TYPE_TX_SUCCESS},
        "transactionHash": "0x6666"
    });

    let started = tokio::time::Instant::now();
    store
        .process_reply(reply.to_string().as_bytes())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(*persistence.attempts.lock().unwrap(), 4);
    // 500ms + 550ms + 605ms of backoff before the fourth attempt succeeds
    assert!(
        elapsed >= Duration::from_millis(1655),
        "elapsed {elapsed:?} shorter than the backoff schedule"
    );

    let stored = store.receipt("req-6").await.unwrap().unwrap();
    assert_eq!(get_string(&stored, "transactionHash"), Some("0x6666"));
}

#[tokio::test(start_paused = true)]
async fn test_retry_deadline_exhaustion_is_fatal() {
    let persistence = Arc::new(FlakyPersistence::new(usize::MAX));
    let store = ReceiptStore::new(ReceiptStoreConf {
        retry_initial_delay_ms: 100,
        retry_timeout_ms: 1_000,
        ..ReceiptStoreConf::default()
    })
    .with_persistence(persistence);

    let reply = json!({
        "headers": {"requestId": "req-7", "type": MSG_TYPE_TX_SUCCESS},
        "transactionHash": "0x7777"
    });
    let err = store
        .process_reply(reply.to_string().as_bytes())
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, StoreError::RetryExhausted { .. }));
}

// ---------------------------------------------------------------------------
// WebSocket forwarding
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_terminal_receipt_broadcast_to_replies_topic() {
    let hub = Arc::new(WsChannelHub::default());
    let mut rx = hub.get_channels(REPLIES_TOPIC).subscribe_broadcast();
    let store = ReceiptStore::new(ReceiptStoreConf::default())
        .with_persistence(Arc::new(MemoryReceipts::new(250)))
        .with_ws_hub(hub);

    let reply = json!({
        "headers": {"requestId": "req-1", "type": MSG_TYPE_TX_SUCCESS},
        "transactionHash": "0xabcd"
    });
    store
        .process_reply(reply.to_string().as_bytes())
        .await
        .unwrap();

    let batch = rx.recv().await.unwrap();
    assert_eq!(batch.events.len(), 1);
    assert_eq!(batch.events[0]["transactionHash"], json!("0xabcd"));
}

// ---------------------------------------------------------------------------
// Disabled store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_disabled_store_rest_accessors() {
    let store = ReceiptStore::new(ReceiptStoreConf::default());
    assert!(!store.persistence_configured());
    assert!(matches!(
        store.receipt("any").await,
        Err(StoreError::Disabled)
    ));
    assert!(matches!(
        store.receipts(&ReceiptQuery::default()).await,
        Err(StoreError::Disabled)
    ));
}

#[tokio::test]
async fn test_disabled_store_still_processes_replies() {
    let store = ReceiptStore::new(ReceiptStoreConf::default());
    let reply = json!({
        "headers": {"requestId": "req-1", "type": MSG_TYPE_TX_SUCCESS},
        "transactionHash": "0xabcd"
    });
    // No persistence: the reply is consumed and dropped without error
    store
        .process_reply(reply.to_string().as_bytes())
        .await
        .unwrap();
}
