//! Batch delivery to a WebSocket topic.
//!
//! The central rendezvous idiom: every blocking interaction with a
//! subscriber races against two cancellation sources — the stream's update
//! interrupt (reconfiguration) and the topic's closing signal (subscriber
//! gone) — so a producer can never stay wedged on a dead peer.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::websocket::hub::{WsBatch, WsChannelHub};

use super::DistributionMode;

/// Delivery failures reported to the stream's retry policy, not end users.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Topic cycled or stream updated while sending the batch
    #[error("batch send interrupted")]
    InterruptedSend,

    /// Topic cycled or stream updated while waiting for the ack
    #[error("batch acknowledgement interrupted")]
    InterruptedReceive,

    /// The subscriber processed the batch and reported a failure
    #[error("client error: {0}")]
    Client(String),
}

/// Delivers event batches to one WebSocket topic.
pub struct WsAction {
    topic: String,
    distribution_mode: DistributionMode,
    channels: Arc<WsChannelHub>,
}

impl WsAction {
    pub fn new(
        topic: impl Into<String>,
        distribution_mode: DistributionMode,
        channels: Arc<WsChannelHub>,
    ) -> Self {
        Self {
            topic: topic.into(),
            distribution_mode,
            channels,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Attempt to deliver one batch.
    ///
    /// Broadcast mode fans the batch out without waiting for an ack.
    /// Unicast mode blocks until the single subscriber receives the batch
    /// and then waits for its per-batch ack; `Ok(())` means the client
    /// acknowledged cleanly.
    pub async fn attempt_batch(
        &self,
        batch_number: u64,
        attempt: u64,
        events: Vec<Value>,
        update_interrupt: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let topic = self.channels.get_channels(&self.topic);
        let closing = topic.closing();
        let batch = WsBatch {
            batch_number,
            events,
        };
        tracing::debug!(
            topic = %self.topic,
            batch_number,
            attempt,
            "Attempting batch delivery"
        );

        if self.distribution_mode == DistributionMode::Broadcast {
            topic.broadcast(batch);
            return Ok(());
        }

        let sender = topic.batch_sender();
        tokio::select! {
            sent = sender.send(batch) => {
                if sent.is_err() {
                    return Err(DeliveryError::InterruptedSend);
                }
            }
            _ = update_interrupt.cancelled() => return Err(DeliveryError::InterruptedSend),
            _ = closing.cancelled() => return Err(DeliveryError::InterruptedSend),
        }

        let mut ack_rx = topic.ack_receiver().lock().await;
        tokio::select! {
            ack = ack_rx.recv() => match ack {
                Some(None) => Ok(()),
                Some(Some(client_error)) => Err(DeliveryError::Client(client_error)),
                None => Err(DeliveryError::InterruptedReceive),
            },
            _ = update_interrupt.cancelled() => Err(DeliveryError::InterruptedReceive),
            _ = closing.cancelled() => Err(DeliveryError::InterruptedReceive),
        }
    }
}
