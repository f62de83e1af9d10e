//! ethbridge — async request/reply bridge for an Ethereum-connect gateway.
//!
//! Accepts transaction/contract requests over HTTP, forwards them to a
//! partitioned at-least-once message bus, correlates worker replies back to
//! their requests, persists receipts with retry and idempotency guarantees,
//! and streams events to WebSocket subscribers.

#![forbid(unsafe_code)]

pub mod api;
pub mod bus;
pub mod error;
pub mod events;
pub mod gateway;
pub mod middleware;
pub mod pipeline;
pub mod receipts;
pub mod server;
pub mod websocket;
