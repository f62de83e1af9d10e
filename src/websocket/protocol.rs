//! WebSocket wire protocol.
//!
//! Clients drive the connection with small JSON frames: declare a listen or
//! send role on a topic, then acknowledge (or reject) delivered batches.
//! The server pushes event batches and terminal receipts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Own the receive side of a topic's event channels
    Listen {
        #[serde(default)]
        topic: String,
    },
    /// Listen on the reserved replies topic
    ListenReplies,
    /// Declare the ack-sending role on a topic
    Send {
        #[serde(default)]
        topic: String,
    },
    /// Batch processed successfully
    Ack {
        #[serde(default)]
        topic: String,
        #[serde(rename = "batchNumber", skip_serializing_if = "Option::is_none")]
        batch_number: Option<u64>,
    },
    /// Batch processing failed client-side
    Error {
        #[serde(default)]
        topic: String,
        #[serde(default)]
        message: String,
        #[serde(rename = "batchNumber", skip_serializing_if = "Option::is_none")]
        batch_number: Option<u64>,
    },
}

impl ClientFrame {
    pub fn topic(&self) -> &str {
        match self {
            Self::Listen { topic }
            | Self::Send { topic }
            | Self::Ack { topic, .. }
            | Self::Error { topic, .. } => topic,
            Self::ListenReplies => super::hub::REPLIES_TOPIC,
        }
    }
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    /// A batch of events on a listened topic
    Events {
        topic: String,
        #[serde(rename = "batchNumber")]
        batch_number: u64,
        events: Vec<Value>,
    },
    /// A terminal receipt, for `listenReplies` subscribers
    Receipt { receipt: Value },
    /// Protocol-level error report
    Error { message: String },
}
