//! Per-connection WebSocket handling.
//!
//! Each connection runs a read pump (this task) and a writer task, plus one
//! forwarder task per listened topic. A forwarder owns the topic's unicast
//! receiver and a broadcast subscription for the connection's lifetime; on
//! disconnect the forwarders are torn down first, then every listened topic
//! is cycled so producers blocked mid-delivery observe the closing signal.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::middleware::auth::RequireAuth;

use super::hub::{BatchAck, WsChannelHub, WsTopic, REPLIES_TOPIC};
use super::protocol::{ClientFrame, ServerFrame};

const OUTBOUND_BUFFER: usize = 16;

/// WebSocket upgrade handler for `GET /ws`.
pub async fn ws_handler(
    RequireAuth(_auth): RequireAuth,
    ws: WebSocketUpgrade,
    Extension(hub): Extension<Arc<WsChannelHub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Drive one WebSocket connection until it closes.
pub async fn handle_socket(socket: WebSocket, hub: Arc<WsChannelHub>) {
    let conn_id = Uuid::new_v4();
    info!(conn_id = %conn_id, "WebSocket connection established");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    // Writer pump: everything the connection sends funnels through here
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut listens: HashMap<String, (Arc<WsTopic>, JoinHandle<()>)> = HashMap::new();

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => {
                    handle_frame(frame, conn_id, &hub, &out_tx, &mut listens).await;
                }
                Err(e) => {
                    warn!(conn_id = %conn_id, error = %e, "Invalid WebSocket frame");
                    send_frame(
                        &out_tx,
                        &ServerFrame::Error {
                            message: format!("invalid frame: {e}"),
                        },
                    )
                    .await;
                }
            },
            Ok(Message::Ping(data)) => {
                let _ = out_tx.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                info!(conn_id = %conn_id, "WebSocket connection closed by client");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Tear down forwarders before cycling, so the topic receivers are free
    // for the next subscriber by the time producers retry.
    for (_, (topic, handle)) in listens.drain() {
        handle.abort();
        hub.cycle_topic(&topic);
    }
    writer.abort();
    info!(conn_id = %conn_id, "WebSocket connection ended");
}

async fn handle_frame(
    frame: ClientFrame,
    conn_id: Uuid,
    hub: &Arc<WsChannelHub>,
    out_tx: &mpsc::Sender<Message>,
    listens: &mut HashMap<String, (Arc<WsTopic>, JoinHandle<()>)>,
) {
    let name = frame.topic().to_string();
    match frame {
        ClientFrame::Listen { .. } | ClientFrame::ListenReplies => {
            if listens.contains_key(&name) {
                debug!(conn_id = %conn_id, topic = %name, "Duplicate listen ignored");
                return;
            }
            let topic = hub.get_channels(&name);
            let handle = tokio::spawn(forward_topic(topic.clone(), out_tx.clone(), conn_id));
            info!(conn_id = %conn_id, topic = %name, "Connection listening on topic");
            listens.insert(name, (topic, handle));
        }
        ClientFrame::Send { topic } => {
            hub.get_channels(&topic);
            info!(conn_id = %conn_id, topic = %topic, "Connection declared sender role");
        }
        ClientFrame::Ack {
            topic,
            batch_number,
        } => {
            debug!(conn_id = %conn_id, topic = %topic, batch_number, "Batch acknowledged");
            deliver_ack(hub, &topic, None).await;
        }
        ClientFrame::Error {
            topic,
            message,
            batch_number,
        } => {
            warn!(conn_id = %conn_id, topic = %topic, batch_number, message = %message, "Batch rejected by client");
            deliver_ack(hub, &topic, Some(message)).await;
        }
    }
}

/// Hand a client ack (or error) to the producer waiting on the topic.
/// Bounded by the hub's processing timeout so a stray ack cannot wedge the
/// read pump.
async fn deliver_ack(hub: &Arc<WsChannelHub>, topic: &str, ack: BatchAck) {
    let topic = hub.get_channels(topic);
    let ack_sender = topic.ack_sender();
    let send = ack_sender.send_timeout(ack, hub.processing_timeout());
    if send.await.is_err() {
        warn!(topic = %topic.name, "No event producer consumed the acknowledgement");
    }
}

/// Forward batches from a topic to the connection until it disconnects.
async fn forward_topic(topic: Arc<WsTopic>, out_tx: mpsc::Sender<Message>, conn_id: Uuid) {
    let mut broadcast_rx = topic.subscribe_broadcast();
    let mut unicast_rx = topic.batch_receiver().lock().await;
    loop {
        let batch = tokio::select! {
            batch = unicast_rx.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
            batch = broadcast_rx.recv() => match batch {
                Ok(batch) => batch,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(conn_id = %conn_id, topic = %topic.name, lagged = n, "Broadcast subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if topic.name == REPLIES_TOPIC {
            for receipt in batch.events {
                if !send_frame(&out_tx, &ServerFrame::Receipt { receipt }).await {
                    return;
                }
            }
        } else if !send_frame(
            &out_tx,
            &ServerFrame::Events {
                topic: topic.name.clone(),
                batch_number: batch.batch_number,
                events: batch.events,
            },
        )
        .await
        {
            return;
        }
    }
}

/// Serialize and queue a frame; false when the connection is gone.
async fn send_frame(out_tx: &mpsc::Sender<Message>, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => out_tx.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            error!(error = %e, "Failed to serialize WebSocket frame");
            true
        }
    }
}
