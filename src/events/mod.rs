//! Event streams: buffered batch delivery to WebSocket topics.

pub mod stream;
pub mod ws_action;

pub use stream::{EventStream, StreamRetryConf, StreamSpec};
pub use ws_action::{DeliveryError, WsAction};

use serde::{Deserialize, Serialize};

/// How batches reach the subscribers of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionMode {
    /// Single subscriber, each batch individually acknowledged
    Unicast,
    /// Fire-and-forget fan-out to every subscriber
    Broadcast,
}

impl Default for DistributionMode {
    fn default() -> Self {
        Self::Unicast
    }
}
