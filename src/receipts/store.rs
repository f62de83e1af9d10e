//! The receipt store: reply correlation, idempotent admission, persistence
//! with bounded retry, and post-terminal notifications.
//!
//! Ingress reserves a request ID here before producing to the bus; the bus
//! consumer loop feeds every reply through [`ReceiptStore::process_reply`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::gateway::{ContractGateway, TransactionReceipt};
use crate::websocket::hub::{WsBatch, WsChannelHub, REPLIES_TOPIC};

use super::{
    get_string, headers, is_terminal, now_millis, Document, PersistenceError, ReceiptPersistence,
    ReceiptQuery, ERROR_CODE_RESUBMISSION_PREVENTED, ERROR_MSG_RESUBMISSION_PREVENTED,
    MSG_TYPE_ERROR, MSG_TYPE_TX_REDELIVERY_PREVENTED, MSG_TYPE_TX_SUCCESS,
};

const BACKOFF_FACTOR: f64 = 1.1;

/// Receipt store configuration, with the persistence retry policy.
#[derive(Debug, Clone)]
pub struct ReceiptStoreConf {
    /// Upper bound for any REST query `limit`
    pub query_limit: usize,
    /// Capacity of the bounded in-memory store
    pub max_docs: usize,
    pub retry_initial_delay_ms: u64,
    pub retry_timeout_ms: u64,
}

impl Default for ReceiptStoreConf {
    fn default() -> Self {
        Self {
            query_limit: 100,
            max_docs: 250,
            retry_initial_delay_ms: 500,
            retry_timeout_ms: 120_000,
        }
    }
}

/// Receipt store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The request ID is already reserved or persisted
    #[error("request ID is not unique")]
    KeyNotUnique,

    /// No persistence configured
    #[error("receipt store disabled")]
    Disabled,

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// The reply-path retry deadline was exhausted. The owning consumer
    /// loop aborts the process on this: losing a reply silently is worse
    /// than crashing.
    #[error("failed to persist receipt {request_id} after {elapsed_ms}ms: {message}")]
    RetryExhausted {
        request_id: String,
        elapsed_ms: u64,
        message: String,
    },
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }
}

/// An admitted request ID, held between admission and the first receipt
/// write. Dropping the reservation releases the ID, so every ingress exit
/// path releases without explicit bookkeeping.
pub struct IdReservation {
    reserved: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl IdReservation {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for IdReservation {
    fn drop(&mut self) {
        if let Ok(mut set) = self.reserved.lock() {
            set.remove(&self.id);
        }
    }
}

pub struct ReceiptStore {
    conf: ReceiptStoreConf,
    persistence: Option<Arc<dyn ReceiptPersistence>>,
    contract_gw: Option<Arc<dyn ContractGateway>>,
    ws_hub: Option<Arc<WsChannelHub>>,
    reserved_ids: Arc<Mutex<HashSet<String>>>,
}

impl ReceiptStore {
    pub fn new(conf: ReceiptStoreConf) -> Self {
        Self {
            conf,
            persistence: None,
            contract_gw: None,
            ws_hub: None,
            reserved_ids: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn ReceiptPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_contract_gateway(mut self, gateway: Arc<dyn ContractGateway>) -> Self {
        self.contract_gw = Some(gateway);
        self
    }

    /// Wire the WebSocket hub so terminal receipts reach `listenReplies`
    /// subscribers.
    pub fn with_ws_hub(mut self, hub: Arc<WsChannelHub>) -> Self {
        self.ws_hub = Some(hub);
        self
    }

    pub fn conf(&self) -> &ReceiptStoreConf {
        &self.conf
    }

    pub fn persistence_configured(&self) -> bool {
        self.persistence.is_some()
    }

    /// Reserve a request ID ahead of producing to the bus. Fails with
    /// [`StoreError::KeyNotUnique`] if a receipt already exists for the ID
    /// or another in-flight admission holds it.
    pub async fn reserve_id(&self, id: &str) -> Result<IdReservation, StoreError> {
        if self.lock_reserved().contains(id) {
            return Err(StoreError::KeyNotUnique);
        }
        if let Some(persistence) = &self.persistence {
            if persistence.get_receipt(id).await?.is_some() {
                return Err(StoreError::KeyNotUnique);
            }
        }
        let mut set = self.lock_reserved();
        if !set.insert(id.to_string()) {
            return Err(StoreError::KeyNotUnique);
        }
        Ok(IdReservation {
            reserved: self.reserved_ids.clone(),
            id: id.to_string(),
        })
    }

    /// Write the pending receipt once the bus has acknowledged the request.
    pub async fn write_accepted(
        &self,
        msg_id: &str,
        msg_ack: &str,
        mut msg: Document,
    ) -> Result<(), StoreError> {
        msg.insert("receivedAt".to_string(), Value::from(now_millis()));
        msg.insert("pending".to_string(), Value::Bool(true));
        msg.insert("msgAck".to_string(), Value::from(msg_ack));
        msg.insert("_id".to_string(), Value::from(msg_id));
        self.write_receipt(msg_id, &msg, false).await
    }

    /// Process one reply message from the bus consumer loop.
    ///
    /// Malformed or uncorrelatable messages are dropped with an error log;
    /// the only error returned is the fatal retry-exhaustion case.
    pub async fn process_reply(&self, msg_bytes: &[u8]) -> Result<(), StoreError> {
        let mut parsed = match serde_json::from_slice::<Value>(msg_bytes) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                error!(payload = %other, "Reply message is not a JSON object");
                return Ok(());
            }
            Err(e) => {
                error!(
                    error = %e,
                    payload = %String::from_utf8_lossy(msg_bytes),
                    "Unable to parse reply message as JSON"
                );
                return Ok(());
            }
        };

        let Some(hdrs) = headers(&parsed) else {
            error!("Failed to extract reply headers");
            return Ok(());
        };
        let Some(request_id) = get_string(hdrs, "requestId").map(str::to_string) else {
            error!("Failed to extract headers.requestId from reply");
            return Ok(());
        };
        let req_offset = get_string(hdrs, "reqOffset").unwrap_or_default().to_string();
        let msg_type = get_string(hdrs, "type").unwrap_or_default().to_string();
        let contract_addr = get_string(&parsed, "contractAddress")
            .unwrap_or_default()
            .to_string();

        let result = match msg_type.as_str() {
            MSG_TYPE_ERROR => get_string(&parsed, "errorMessage")
                .unwrap_or_default()
                .to_string(),
            MSG_TYPE_TX_REDELIVERY_PREVENTED => {
                let result = get_string(&parsed, "transactionHash")
                    .unwrap_or_default()
                    .to_string();
                // Either we already hold a good receipt, or the caller has
                // to check the transaction status from the hash themselves.
                if let Some(persistence) = &self.persistence {
                    if let Ok(Some(existing)) = persistence.get_receipt(&request_id).await {
                        if is_terminal(&existing) {
                            warn!(
                                request_id = %request_id,
                                req_offset = %req_offset,
                                result = %result,
                                "Ignoring redelivery reply message; terminal receipt already stored"
                            );
                            return Ok(());
                        }
                    }
                }
                parsed.insert(
                    "errorCode".to_string(),
                    Value::from(ERROR_CODE_RESUBMISSION_PREVENTED),
                );
                parsed.insert(
                    "errorMessage".to_string(),
                    Value::from(ERROR_MSG_RESUBMISSION_PREVENTED),
                );
                result
            }
            _ => get_string(&parsed, "transactionHash")
                .unwrap_or_default()
                .to_string(),
        };
        info!(
            request_id = %request_id,
            req_offset = %req_offset,
            msg_type = %msg_type,
            result = %result,
            "Received reply message"
        );

        if msg_type == MSG_TYPE_TX_SUCCESS && !contract_addr.is_empty() {
            if let Some(gateway) = &self.contract_gw {
                match serde_json::from_slice::<TransactionReceipt>(msg_bytes) {
                    Ok(receipt) => {
                        if let Err(e) = gateway.post_deploy(&receipt).await {
                            error!(error = %e, "Failed to process receipt in contract gateway");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to parse message as transaction receipt");
                    }
                }
            }
        }

        parsed.insert("receivedAt".to_string(), Value::from(now_millis()));
        parsed.insert("_id".to_string(), Value::from(request_id.clone()));

        if self.persistence.is_some() {
            self.write_receipt(&request_id, &parsed, true).await?;
            if let Some(gateway) = &self.contract_gw {
                gateway.send_reply(parsed.clone()).await;
            }
            self.forward_reply_to_ws(&parsed);
        }
        Ok(())
    }

    /// Write a receipt, retrying with backoff on the reply path.
    ///
    /// With `overwrite_and_retry == false` (ingress accepted-write) the
    /// first failure is returned immediately. With `true` (reply path) the
    /// write retries — initial delay from config, factor 1.1 — until it
    /// succeeds or the deadline passes, which is fatal to the caller.
    pub async fn write_receipt(
        &self,
        request_id: &str,
        receipt: &Document,
        overwrite_and_retry: bool,
    ) -> Result<(), StoreError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };

        let start = tokio::time::Instant::now();
        let retry_timeout = Duration::from_millis(self.conf.retry_timeout_ms);
        let mut delay = Duration::from_millis(self.conf.retry_initial_delay_ms);
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                info!(
                    request_id = %request_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Waiting before receipt write re-attempt"
                );
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(BACKOFF_FACTOR);
            }
            attempt += 1;
            match persistence
                .add_receipt(request_id, receipt.clone(), overwrite_and_retry)
                .await
            {
                Ok(()) => {
                    info!(request_id = %request_id, "Inserted receipt into receipt store");
                    return Ok(());
                }
                Err(err) => {
                    if !overwrite_and_retry {
                        return Err(StoreError::Persistence(err));
                    }
                    error!(
                        request_id = %request_id,
                        attempt,
                        error = %err,
                        "Receipt write attempt failed"
                    );
                    let elapsed = start.elapsed();
                    if elapsed > retry_timeout {
                        return Err(StoreError::RetryExhausted {
                            request_id: request_id.to_string(),
                            elapsed_ms: elapsed.as_millis() as u64,
                            message: err.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Fetch a single receipt for the REST layer.
    pub async fn receipt(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let persistence = self.persistence.as_ref().ok_or(StoreError::Disabled)?;
        Ok(persistence.get_receipt(id).await?)
    }

    /// List receipts for the REST layer.
    pub async fn receipts(&self, query: &ReceiptQuery) -> Result<Vec<Document>, StoreError> {
        let persistence = self.persistence.as_ref().ok_or(StoreError::Disabled)?;
        Ok(persistence.get_receipts(query).await?)
    }

    fn forward_reply_to_ws(&self, receipt: &Document) {
        if let Some(hub) = &self.ws_hub {
            let topic = hub.get_channels(REPLIES_TOPIC);
            topic.broadcast(WsBatch {
                batch_number: 0,
                events: vec![Value::Object(receipt.clone())],
            });
        }
    }

    fn lock_reserved(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.reserved_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests;
