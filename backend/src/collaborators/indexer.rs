//! Provenance-only knowledge indexer
//!
//! Records which sources fed a valuation. Nothing here is read back by the
//! valuation core. Only the most recent receipts of each collection are kept.

use crate::collaborators::{CollaboratorError, IngestionReceipt, KnowledgeIndexer};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;

/// Receipts kept per collection before the oldest are dropped
pub const DEFAULT_RECEIPTS_PER_COLLECTION: usize = 256;

#[derive(Debug)]
pub struct ProvenanceLogIndexer {
    receipts: RwLock<Vec<IngestionReceipt>>,
    max_per_collection: usize,
}

impl Default for ProvenanceLogIndexer {
    fn default() -> Self {
        ProvenanceLogIndexer::with_capacity(DEFAULT_RECEIPTS_PER_COLLECTION)
    }
}

impl ProvenanceLogIndexer {
    pub fn new() -> Self {
        ProvenanceLogIndexer::default()
    }

    pub fn with_capacity(max_per_collection: usize) -> Self {
        ProvenanceLogIndexer {
            receipts: RwLock::new(Vec::new()),
            max_per_collection: max_per_collection.max(1),
        }
    }

    pub async fn receipts(&self) -> Vec<IngestionReceipt> {
        self.receipts.read().await.clone()
    }
}

#[async_trait]
impl KnowledgeIndexer for ProvenanceLogIndexer {
    async fn ingest(
        &self,
        paths: &[String],
        collection: &str,
        recreate: bool,
    ) -> Result<IngestionReceipt, CollaboratorError> {
        if collection.trim().is_empty() {
            return Err(CollaboratorError::Terminal("collection name must not be empty".to_string()));
        }

        let receipt = IngestionReceipt {
            collection: collection.to_string(),
            ingested_items: paths.len(),
            recreated: recreate,
            indexed_at: Utc::now(),
        };

        let mut receipts = self.receipts.write().await;
        if recreate {
            receipts.retain(|r| r.collection != collection);
        }
        receipts.push(receipt.clone());

        let kept = receipts.iter().filter(|r| r.collection == collection).count();
        if kept > self.max_per_collection {
            if let Some(oldest) = receipts.iter().position(|r| r.collection == collection) {
                receipts.remove(oldest);
            }
        }

        info!(
            "Indexed {} provenance items into '{}' (recreate: {}): {}",
            paths.len(),
            collection,
            recreate,
            paths.join(", ")
        );

        Ok(receipt)
    }
}
