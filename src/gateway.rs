//! Contract-gateway collaborator contract.
//!
//! The smart-contract gateway (registry, ABI cache, REST routing) lives
//! outside this crate; the receipt store only needs its two hooks: deploy
//! registration on transaction success, and reply forwarding after a
//! terminal receipt write.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::receipts::Document;

/// Typed view of a transaction-success reply, for the deploy hook.
/// Unrecognized reply fields are retained in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionReceipt {
    #[serde(default)]
    pub headers: ReceiptHeaders,
    #[serde(rename = "transactionHash", skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(rename = "contractAddress", skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "blockNumber", skip_serializing_if = "Option::is_none")]
    pub block_number: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Correlation headers carried on every reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiptHeaders {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(rename = "reqOffset", skip_serializing_if = "Option::is_none")]
    pub req_offset: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Error)]
#[error("contract gateway error: {0}")]
pub struct GatewayError(pub String);

/// Hooks the receipt store invokes on the contract gateway.
#[async_trait]
pub trait ContractGateway: Send + Sync {
    /// Called for successful transactions that created a contract.
    /// Failures are logged by the caller, never fatal.
    async fn post_deploy(&self, receipt: &TransactionReceipt) -> Result<(), GatewayError>;

    /// Called with every receipt after a successful terminal write.
    async fn send_reply(&self, receipt: Document);
}
