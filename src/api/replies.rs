//! REST surface for stored receipts.
//!
//! `GET /replies` lists receipts with paging and filters; `GET /replies/:id`
//! and the legacy `GET /reply/:id` fetch one. Every path consults the auth
//! collaborator first and answers 405 when no persistence is configured.

use std::sync::Arc;

use axum::{
    extract::{Path, RawQuery},
    routing::get,
    Extension, Json, Router,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::middleware::auth::RequireAuth;
use crate::receipts::{is_valid_request_id, Document, ReceiptQuery, ReceiptStore};

use super::params::query_pairs;

/// Page size when the caller does not set a limit.
pub const DEFAULT_RECEIPT_LIMIT: usize = 10;

/// Create the replies router
pub fn replies_routes() -> Router {
    Router::new()
        .route("/replies", get(get_replies))
        .route("/replies/:id", get(get_reply))
        .route("/reply/:id", get(get_reply))
}

/// Build a [`ReceiptQuery`] from the raw query pairs.
///
/// Receipt IDs must pass the ID-character check; `limit` above the
/// configured query limit is rejected rather than clamped; a present but
/// non-positive `skip` is rejected. When IDs are supplied the default limit
/// drops to zero: no imposed bound beyond the query limit itself.
pub fn parse_replies_query(
    pairs: &[(String, String)],
    query_limit: usize,
) -> Result<ReceiptQuery, ApiError> {
    let ids: Vec<String> = pairs
        .iter()
        .filter(|(k, _)| k == "id")
        .map(|(_, v)| v.clone())
        .collect();
    for id in &ids {
        if !is_valid_request_id(id) {
            warn!(id = %id, "Invalid receipt ID in query");
            return Err(ApiError::BadRequest(format!("invalid request ID '{id}'")));
        }
    }

    let mut limit = if ids.is_empty() {
        DEFAULT_RECEIPT_LIMIT
    } else {
        0
    };
    if let Some(limit_str) = query_value(pairs, "limit") {
        match limit_str.parse::<i64>() {
            Ok(custom) if custom > query_limit as i64 => {
                return Err(ApiError::BadRequest(format!(
                    "limit above maximum of {query_limit}"
                )));
            }
            Ok(custom) if custom > 0 => limit = custom as usize,
            Ok(_) => {}
            Err(_) => {
                return Err(ApiError::BadRequest("invalid limit value".to_string()));
            }
        }
    }

    let mut skip = 0;
    if let Some(skip_str) = query_value(pairs, "skip") {
        match skip_str.parse::<i64>() {
            Ok(value) if value > 0 => skip = value as usize,
            _ => return Err(ApiError::BadRequest("invalid skip value".to_string())),
        }
    }

    let mut since_ms = 0;
    if let Some(since) = query_value(pairs, "since") {
        since_ms = parse_since(since).ok_or_else(|| {
            ApiError::BadRequest(format!(
                "since '{since}' cannot be parsed as RFC3339 or millisecond timestamp"
            ))
        })?;
    }

    Ok(ReceiptQuery {
        skip,
        limit,
        ids,
        since_ms,
        from: query_value(pairs, "from").map(str::to_string),
        to: query_value(pairs, "to").map(str::to_string),
        start: query_value(pairs, "start").map(str::to_string),
    })
}

fn query_value<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn parse_since(since: &str) -> Option<i64> {
    if let Ok(iso) = chrono::DateTime::parse_from_rfc3339(since) {
        return Some(iso.timestamp_millis());
    }
    since.parse::<i64>().ok()
}

/// List recent replies
async fn get_replies(
    RequireAuth(_auth): RequireAuth,
    Extension(store): Extension<Arc<ReceiptStore>>,
    RawQuery(raw_query): RawQuery,
) -> Result<Json<Vec<Document>>, ApiError> {
    if !store.persistence_configured() {
        return Err(ApiError::Disabled);
    }

    let pairs = query_pairs(raw_query.as_deref());
    let query = parse_replies_query(&pairs, store.conf().query_limit)?;

    let results = store.receipts(&query).await.map_err(|e| {
        warn!(error = %e, "Error querying replies");
        ApiError::from(e)
    })?;
    debug!(
        skip = query.skip,
        limit = query.limit,
        replies = results.len(),
        "Replies query"
    );
    Ok(Json(results))
}

/// Fetch an individual reply by request ID
async fn get_reply(
    RequireAuth(_auth): RequireAuth,
    Extension(store): Extension<Arc<ReceiptStore>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !store.persistence_configured() {
        return Err(ApiError::Disabled);
    }

    match store.receipt(&id).await {
        Ok(Some(receipt)) => {
            info!(id = %id, "Reply found");
            Ok(Json(Value::Object(receipt)))
        }
        Ok(None) => {
            info!(id = %id, "Reply not found");
            Err(ApiError::NotFound)
        }
        Err(e) => {
            warn!(id = %id, error = %e, "Error querying reply");
            Err(ApiError::from(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::params::query_pairs;

    const QUERY_LIMIT: usize = 100;

    fn parse(query: &str) -> Result<ReceiptQuery, ApiError> {
        parse_replies_query(&query_pairs(Some(query)), QUERY_LIMIT)
    }

    #[test]
    fn test_defaults() {
        let q = parse("").unwrap();
        assert_eq!(q.limit, DEFAULT_RECEIPT_LIMIT);
        assert_eq!(q.skip, 0);
        assert_eq!(q.since_ms, 0);
        assert!(q.ids.is_empty());
    }

    #[test]
    fn test_ids_drop_default_limit_to_zero() {
        let q = parse("id=req-1&id=req-2").unwrap();
        assert_eq!(q.ids, vec!["req-1", "req-2"]);
        assert_eq!(q.limit, 0);
    }

    #[test]
    fn test_ids_with_explicit_limit() {
        let q = parse("id=req-1&limit=5").unwrap();
        assert_eq!(q.limit, 5);
    }

    #[test]
    fn test_invalid_id_rejected() {
        assert!(matches!(
            parse("id=bad%20id"),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn test_limit_above_query_limit_rejected() {
        assert!(matches!(parse("limit=101"), Err(ApiError::BadRequest(_))));
        assert_eq!(parse("limit=100").unwrap().limit, 100);
    }

    #[test]
    fn test_non_numeric_limit_rejected() {
        assert!(matches!(parse("limit=ten"), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_zero_limit_keeps_default() {
        let q = parse("limit=0").unwrap();
        assert_eq!(q.limit, DEFAULT_RECEIPT_LIMIT);
    }

    #[test]
    fn test_skip_must_be_positive_when_present() {
        assert_eq!(parse("skip=3").unwrap().skip, 3);
        assert!(matches!(parse("skip=0"), Err(ApiError::BadRequest(_))));
        assert!(matches!(parse("skip=-1"), Err(ApiError::BadRequest(_))));
        assert!(matches!(parse("skip=x"), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_since_accepts_rfc3339_and_epoch_millis() {
        let q = parse("since=2024-01-02T00%3A00%3A00Z").unwrap();
        assert_eq!(q.since_ms, 1_704_153_600_000);

        let q = parse("since=1704153600000").unwrap();
        assert_eq!(q.since_ms, 1_704_153_600_000);

        assert!(matches!(
            parse("since=yesterday"),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn test_range_params_pass_through() {
        let q = parse("from=0xaa&to=0xbb&start=5").unwrap();
        assert_eq!(q.from.as_deref(), Some("0xaa"));
        assert_eq!(q.to.as_deref(), Some("0xbb"));
        assert_eq!(q.start.as_deref(), Some("5"));
    }
}
