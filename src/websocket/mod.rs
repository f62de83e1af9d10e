//! WebSocket layer: topic hub, wire protocol, and connection handling.

pub mod connection;
pub mod hub;
pub mod protocol;

pub use connection::ws_handler;
pub use hub::{WsBatch, WsChannelHub, REPLIES_TOPIC};

use axum::{routing::get, Router};

/// Create the WebSocket router
pub fn websocket_router() -> Router {
    Router::new().route("/ws", get(ws_handler))
}
