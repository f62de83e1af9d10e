//! HTTP ingress for asynchronous requests.
//!
//! `POST /requests` validates the request, reserves its ID, produces it to
//! the outbound bus topic keyed by sender address, writes the pending
//! receipt, and answers 202 with the acknowledgement reference. The ID
//! reservation is dropped on every exit path, so a failed produce frees the
//! ID immediately.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::RawQuery,
    http::{HeaderMap, StatusCode},
    routing::post,
    Extension, Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::params::{control_param, query_pairs, ControlPrefixes};
use crate::bus::BusGateway;
use crate::error::ApiError;
use crate::middleware::auth::RequireAuth;
use crate::receipts::{get_string, headers_mut, is_valid_request_id, Document, ReceiptStore};

/// Upper bound for the bus produce round-trip.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Successful admission response: the caller polls `/replies/:id` or
/// subscribes to the replies WebSocket for the outcome.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptedResponse {
    pub id: String,
    #[serde(rename = "msgAck")]
    pub msg_ack: String,
    pub sent: bool,
}

pub struct RequestPipeline {
    bus: Arc<dyn BusGateway>,
    store: Arc<ReceiptStore>,
    topic_out: String,
    prefixes: ControlPrefixes,
    rpc_timeout: Duration,
}

impl RequestPipeline {
    pub fn new(
        bus: Arc<dyn BusGateway>,
        store: Arc<ReceiptStore>,
        topic_out: impl Into<String>,
        prefixes: ControlPrefixes,
    ) -> Self {
        Self {
            bus,
            store,
            topic_out: topic_out.into(),
            prefixes,
            rpc_timeout: RPC_TIMEOUT,
        }
    }

    pub fn with_rpc_timeout(mut self, rpc_timeout: Duration) -> Self {
        self.rpc_timeout = rpc_timeout;
        self
    }

    /// Admit one request: validate → reserve → produce → pending receipt.
    pub async fn submit(
        &self,
        supplied_id: Option<String>,
        mut msg: Document,
    ) -> Result<AcceptedResponse, ApiError> {
        let id = match supplied_id {
            Some(id) => {
                if !is_valid_request_id(&id) {
                    return Err(ApiError::BadRequest(format!("invalid request ID '{id}'")));
                }
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        // Held until the pending receipt is written or a failure path runs
        let _reservation = self.store.reserve_id(&id).await.map_err(ApiError::from)?;

        headers_mut(&mut msg).insert("id".to_string(), Value::from(id.clone()));
        let key = get_string(&msg, "from").map(str::to_string);
        let value = serde_json::to_vec(&msg)
            .map_err(|e| ApiError::Internal(format!("failed to serialize request: {e}")))?;

        let (partition, offset) =
            match tokio::time::timeout(self.rpc_timeout, self.bus.produce(&self.topic_out, key, value))
                .await
            {
                Ok(Ok(coords)) => coords,
                Ok(Err(e)) => {
                    warn!(id = %id, error = %e, "Failed to produce request to bus");
                    return Err(ApiError::Internal(format!(
                        "failed to produce request: {e}"
                    )));
                }
                Err(_) => {
                    warn!(id = %id, "Timed out producing request to bus");
                    return Err(ApiError::Internal(
                        "timed out producing request to bus".to_string(),
                    ));
                }
            };
        let msg_ack = format!("{}:{}:{}", self.topic_out, partition, offset);
        info!(id = %id, msg_ack = %msg_ack, "Request produced to bus");

        let mut receipt = msg;
        {
            let hdrs = headers_mut(&mut receipt);
            hdrs.insert("requestId".to_string(), Value::from(id.clone()));
            hdrs.insert("reqOffset".to_string(), Value::from(msg_ack.clone()));
        }
        self.store
            .write_accepted(&id, &msg_ack, receipt)
            .await
            .map_err(ApiError::from)?;

        Ok(AcceptedResponse {
            id,
            msg_ack,
            sent: true,
        })
    }
}

/// Accept an asynchronous request
async fn submit_request(
    RequireAuth(_auth): RequireAuth,
    Extension(pipeline): Extension<Arc<RequestPipeline>>,
    RawQuery(raw_query): RawQuery,
    request_headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let Value::Object(msg) = body else {
        return Err(ApiError::BadRequest(
            "request body must be a JSON object".to_string(),
        ));
    };
    let pairs = query_pairs(raw_query.as_deref());
    let supplied_id = control_param("id", &pairs, &request_headers, &pipeline.prefixes);
    let accepted = pipeline.submit(supplied_id, msg).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// Create the ingress router
pub fn requests_routes() -> Router {
    Router::new().route("/requests", post(submit_request))
}
