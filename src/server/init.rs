//! Server initialization and main run loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Extension, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::params::ControlPrefixes;
use crate::api::{health_routes, replies_routes};
use crate::bus::{BusGateway, InMemoryBus};
use crate::middleware::auth::AuthGate;
use crate::pipeline::{requests_routes, RequestPipeline};
use crate::receipts::{MemoryReceipts, ReceiptStore};
use crate::websocket::{websocket_router, WsChannelHub};

use super::background_tasks::{start_rebalance_observer, start_reply_consumer};
use super::loader::load_config;

/// Run the bridge until a shutdown signal arrives.
pub async fn run() -> Result<()> {
    info!("Starting ethbridge v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    info!("Configuration loaded");

    let client_id = if config.kafka.client_id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        config.kafka.client_id.clone()
    };
    info!(
        client_id = %client_id,
        brokers = ?config.kafka.brokers,
        consumer_group = %config.kafka.consumer_group,
        topic_in = %config.kafka.topic_in,
        topic_out = %config.kafka.topic_out,
        "Bus configuration"
    );

    // The broker driver is an external collaborator; without one wired in,
    // the bridge runs against the in-process bus.
    let bus: Arc<dyn BusGateway> = Arc::new(InMemoryBus::new(
        config.kafka.topic_in.clone(),
        config.kafka.partitions,
    ));
    warn!("No broker driver configured, running against the in-process bus");

    let hub = Arc::new(WsChannelHub::new(Duration::from_secs(
        config.events.ws_processing_timeout_secs,
    )));
    let auth = Arc::new(AuthGate::open());
    let persistence = Arc::new(MemoryReceipts::new(config.receipts.max_docs));
    let store = Arc::new(
        ReceiptStore::new((&config.receipts).into())
            .with_persistence(persistence)
            .with_ws_hub(hub.clone()),
    );
    info!(
        query_limit = config.receipts.query_limit,
        max_docs = config.receipts.max_docs,
        "Receipt store initialized (in-memory persistence)"
    );

    let prefixes: ControlPrefixes = (&config.prefix).into();
    let pipeline = Arc::new(RequestPipeline::new(
        bus.clone(),
        store.clone(),
        config.kafka.topic_out.clone(),
        prefixes,
    ));

    let shutdown = CancellationToken::new();
    let consumer_handle =
        start_reply_consumer(bus.clone(), store.clone(), shutdown.child_token());
    let rebalance_handle = start_rebalance_observer(bus.clone(), shutdown.child_token());
    info!("Bus consumer tasks started");

    let app = build_router(store, pipeline, hub.clone(), auth);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "Server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Producer closes asynchronously, consumer stops, then the loops drain.
    info!("Shutting down");
    bus.close().await;
    hub.close();
    shutdown.cancel();
    let _ = consumer_handle.await;
    let _ = rebalance_handle.await;
    info!("Bridge shutdown complete");
    Ok(())
}

/// Assemble the application router with its shared state.
pub fn build_router(
    store: Arc<ReceiptStore>,
    pipeline: Arc<RequestPipeline>,
    hub: Arc<WsChannelHub>,
    auth: Arc<AuthGate>,
) -> Router {
    Router::new()
        .merge(replies_routes())
        .merge(requests_routes())
        .merge(websocket_router())
        .merge(health_routes())
        .layer(Extension(store))
        .layer(Extension(pipeline))
        .layer(Extension(hub))
        .layer(Extension(auth))
        .layer(CorsLayer::permissive())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
