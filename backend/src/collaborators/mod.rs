//! External collaborators - the only places the valuation core touches I/O
//!
//! Each collaborator is a trait so the pipeline can run against real adapters
//! (CSV files, Postgres, an HTTP model server) or in-memory fakes in tests.

pub mod csv_provider;
pub mod indexer;
pub mod model_runner;
pub mod pg_provider;
pub mod registry;
pub mod retry;

use crate::valuation::normalize::RawRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub use registry::{DatasetRegistry, RegistryAction, RegistryError, RegistryRecord};

/// Failure of an external call, classified for the retry loop
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    /// Transient: worth another attempt after backoff
    #[error("recoverable: {0}")]
    Recoverable(String),

    /// Permanent: retrying cannot help
    #[error("terminal: {0}")]
    Terminal(String),
}

/// What a data provider is asked to look up
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectQuery {
    pub address: String,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub radius_km: Option<f64>,
    #[serde(default)]
    pub max_results: Option<usize>,
    /// Known subject attributes (sqft, bedrooms, ...) passed through as-is
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl SubjectQuery {
    /// The subject as a raw record, for providers that do not look it up
    pub fn subject_record(&self, source: &str) -> RawRecord {
        let mut attributes = self.attributes.clone();
        attributes.insert("address".to_string(), Value::from(self.address.clone()));
        RawRecord::new(crate::valuation::normalize::RecordRole::Subject, source, attributes)
    }
}

/// Supplies the subject and comparable sales as raw records; the Normalizer validates them
#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn fetch(&self, query: &SubjectQuery) -> Result<Vec<RawRecord>, CollaboratorError>;
}

/// Model output; a missing prediction is a normal outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction: Option<f64>,
    #[serde(default)]
    pub explanation: Map<String, Value>,
}

#[async_trait]
pub trait ModelRunner: Send + Sync {
    async fn predict(
        &self,
        model_name: &str,
        features: &BTreeMap<String, f64>,
        version: Option<&str>,
    ) -> Result<Prediction, CollaboratorError>;
}

/// Receipt returned by a knowledge indexer, used for provenance logging only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionReceipt {
    pub collection: String,
    pub ingested_items: usize,
    pub recreated: bool,
    pub indexed_at: DateTime<Utc>,
}

#[async_trait]
pub trait KnowledgeIndexer: Send + Sync {
    async fn ingest(
        &self,
        paths: &[String],
        collection: &str,
        recreate: bool,
    ) -> Result<IngestionReceipt, CollaboratorError>;
}
