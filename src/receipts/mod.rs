//! Receipt model and store.
//!
//! Receipts are schemaless JSON documents: reply fields must round-trip
//! verbatim into persistence, with only `_id` and `receivedAt` stamped on
//! top. The helpers here give typed access to the handful of fields the
//! bridge itself reads.

pub mod memory;
pub mod persistence;
pub mod store;

pub use memory::MemoryReceipts;
pub use persistence::{PersistenceError, ReceiptPersistence, ReceiptQuery};
pub use store::{IdReservation, ReceiptStore, ReceiptStoreConf, StoreError};

use serde_json::{Map, Value};

/// A receipt (or reply) document.
pub type Document = Map<String, Value>;

/// Reply message types understood by the bridge.
pub const MSG_TYPE_ERROR: &str = "error";
pub const MSG_TYPE_TX_SUCCESS: &str = "transaction-success";
pub const MSG_TYPE_TX_FAILURE: &str = "transaction-failure";
pub const MSG_TYPE_TX_REDELIVERY_PREVENTED: &str = "transaction-redelivery-prevented";

/// Error code stamped on a receipt when a redelivery-prevented reply lands
/// while the request is still pending.
pub const ERROR_CODE_RESUBMISSION_PREVENTED: &str = "resubmission_prevented";
pub const ERROR_MSG_RESUBMISSION_PREVENTED: &str =
    "Resubmission of this transaction was prevented. Check the transaction hash to determine the outcome";

/// Safely read a string field from a document.
pub fn get_string<'a>(doc: &'a Document, key: &str) -> Option<&'a str> {
    doc.get(key).and_then(Value::as_str)
}

/// The `headers` sub-object of a document, if present and an object.
pub fn headers(doc: &Document) -> Option<&Document> {
    doc.get("headers").and_then(Value::as_object)
}

/// The `headers` sub-object, created if absent.
pub fn headers_mut(doc: &mut Document) -> &mut Document {
    if !doc.get("headers").map(Value::is_object).unwrap_or(false) {
        doc.insert("headers".to_string(), Value::Object(Map::new()));
    }
    doc.get_mut("headers")
        .and_then(Value::as_object_mut)
        .unwrap_or_else(|| unreachable!("headers inserted above"))
}

/// A receipt is terminal once it records a transaction success or failure;
/// later replies may not downgrade it.
pub fn is_terminal(doc: &Document) -> bool {
    matches!(
        headers(doc).and_then(|h| get_string(h, "type")),
        Some(MSG_TYPE_TX_SUCCESS) | Some(MSG_TYPE_TX_FAILURE)
    )
}

/// Request IDs are either server-generated UUIDs or caller-supplied strings
/// restricted to the UUID character set.
pub fn is_valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Current time as epoch milliseconds, the `receivedAt` representation.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_is_valid_request_id() {
        assert!(is_valid_request_id("req-1"));
        assert!(is_valid_request_id(
            "2f87c0f1-3c75-41b1-8aa0-1a8e3e6be4c8"
        ));
        assert!(is_valid_request_id("ABCdef012"));
        assert!(!is_valid_request_id(""));
        assert!(!is_valid_request_id("bad id"));
        assert!(!is_valid_request_id("semi;colon"));
        assert!(!is_valid_request_id("slash/"));
    }

    #[test]
    fn test_terminal_detection() {
        let success = doc(json!({"headers": {"type": MSG_TYPE_TX_SUCCESS}}));
        let failure = doc(json!({"headers": {"type": MSG_TYPE_TX_FAILURE}}));
        let error = doc(json!({"headers": {"type": MSG_TYPE_ERROR}}));
        let pending = doc(json!({"pending": true, "headers": {}}));
        let headerless = doc(json!({"x": 1}));

        assert!(is_terminal(&success));
        assert!(is_terminal(&failure));
        assert!(!is_terminal(&error));
        assert!(!is_terminal(&pending));
        assert!(!is_terminal(&headerless));
    }

    #[test]
    fn test_headers_mut_replaces_non_object() {
        let mut d = doc(json!({"headers": "not-an-object"}));
        headers_mut(&mut d).insert("id".to_string(), json!("abc"));
        assert_eq!(
            headers(&d).and_then(|h| get_string(h, "id")),
            Some("abc")
        );
    }
}
