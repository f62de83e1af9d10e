//! In-memory receipt persistence.
//!
//! A bounded list ordered by insertion, newest first; the oldest receipt is
//! evicted once `max_docs` is reached. Does not support `ids`-filtered
//! queries.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{get_string, Document, PersistenceError, ReceiptPersistence, ReceiptQuery};

pub struct MemoryReceipts {
    max_docs: usize,
    receipts: Mutex<VecDeque<Document>>,
}

impl MemoryReceipts {
    pub fn new(max_docs: usize) -> Self {
        debug!(max_docs, "Memory receipt store created");
        Self {
            max_docs: max_docs.max(1),
            receipts: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Document>> {
        self.receipts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ReceiptPersistence for MemoryReceipts {
    async fn get_receipt(&self, id: &str) -> Result<Option<Document>, PersistenceError> {
        let receipts = self.lock();
        Ok(receipts
            .iter()
            .find(|r| get_string(r, "_id") == Some(id))
            .cloned())
    }

    async fn get_receipts(&self, query: &ReceiptQuery) -> Result<Vec<Document>, PersistenceError> {
        if !query.ids.is_empty() {
            return Err(PersistenceError::Other(
                "memory receipts do not support id filtering".to_string(),
            ));
        }

        let receipts = self.lock();
        let mut results = Vec::new();
        for receipt in receipts.iter().skip(query.skip) {
            if query.limit > 0 && results.len() >= query.limit {
                break;
            }
            results.push(receipt.clone());
        }
        Ok(results)
    }

    async fn add_receipt(
        &self,
        id: &str,
        receipt: Document,
        overwrite: bool,
    ) -> Result<(), PersistenceError> {
        let mut receipts = self.lock();
        if let Some(pos) = receipts
            .iter()
            .position(|r| get_string(r, "_id") == Some(id))
        {
            if !overwrite {
                return Err(PersistenceError::KeyNotUnique);
            }
            receipts.remove(pos);
        }
        if receipts.len() >= self.max_docs {
            receipts.pop_back();
        }
        receipts.push_front(receipt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn receipt(id: &str) -> Document {
        json!({"_id": id}).as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_newest_first_with_skip_and_limit() {
        let store = MemoryReceipts::new(10);
        for i in 0..5 {
            store
                .add_receipt(&format!("r{i}"), receipt(&format!("r{i}")), false)
                .await
                .unwrap();
        }

        let page = store
            .get_receipts(&ReceiptQuery {
                skip: 1,
                limit: 2,
                ..ReceiptQuery::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|r| get_string(r, "_id").unwrap()).collect();
        assert_eq!(ids, vec!["r3", "r2"]);
    }

    #[tokio::test]
    async fn test_zero_limit_returns_everything() {
        let store = MemoryReceipts::new(10);
        for i in 0..4 {
            store
                .add_receipt(&format!("r{i}"), receipt(&format!("r{i}")), false)
                .await
                .unwrap();
        }
        let all = store.get_receipts(&ReceiptQuery::default()).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_eviction_at_max_docs() {
        let store = MemoryReceipts::new(3);
        for i in 0..5 {
            store
                .add_receipt(&format!("r{i}"), receipt(&format!("r{i}")), false)
                .await
                .unwrap();
        }
        assert!(store.get_receipt("r0").await.unwrap().is_none());
        assert!(store.get_receipt("r1").await.unwrap().is_none());
        assert!(store.get_receipt("r4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ids_filtering_rejected() {
        let store = MemoryReceipts::new(3);
        let err = store
            .get_receipts(&ReceiptQuery {
                ids: vec!["abc".to_string()],
                ..ReceiptQuery::default()
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "memory receipts do not support id filtering"
        );
    }

    #[tokio::test]
    async fn test_duplicate_insert_without_overwrite() {
        let store = MemoryReceipts::new(3);
        store.add_receipt("dup", receipt("dup"), false).await.unwrap();
        let err = store
            .add_receipt("dup", receipt("dup"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::KeyNotUnique));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_in_place() {
        let store = MemoryReceipts::new(3);
        store.add_receipt("r1", receipt("r1"), false).await.unwrap();
        let mut updated = receipt("r1");
        updated.insert("transactionHash".to_string(), json!("0xabcd"));
        store.add_receipt("r1", updated, true).await.unwrap();

        let got = store.get_receipt("r1").await.unwrap().unwrap();
        assert_eq!(get_string(&got, "transactionHash"), Some("0xabcd"));
        let all = store.get_receipts(&ReceiptQuery::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_result_is_empty_vec() {
        let store = MemoryReceipts::new(3);
        let none = store.get_receipts(&ReceiptQuery::default()).await.unwrap();
        assert!(none.is_empty());
    }
}
