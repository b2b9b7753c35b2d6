//! Dataset registry - versioned metadata for reference datasets
//!
//! Revisions are append-only. Writers take the write lock for the whole
//! check-and-append, so readers see either the previous latest revision or
//! the new one, never a half-written record.

use crate::valuation::types::ReferenceDataset;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryAction {
    Register,
    Update,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub action: RegistryAction,
    pub name: String,
    pub version: Option<String>,
    pub schema: Option<Value>,
    pub revision: u32,
    pub updated_at: DateTime<Utc>,
}

impl RegistryRecord {
    pub fn to_reference(&self) -> ReferenceDataset {
        ReferenceDataset {
            name: self.name.clone(),
            version: self.version.clone(),
            revision: self.revision,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("dataset '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("dataset '{0}' is not registered")]
    NotFound(String),

    #[error("dataset name must not be empty")]
    EmptyName,
}

#[async_trait]
pub trait DatasetRegistry: Send + Sync {
    async fn apply(
        &self,
        action: RegistryAction,
        name: &str,
        schema: Option<Value>,
        version: Option<String>,
    ) -> Result<RegistryRecord, RegistryError>;

    /// Latest revision of a dataset
    async fn info(&self, name: &str) -> Result<RegistryRecord, RegistryError> {
        self.apply(RegistryAction::Info, name, None, None).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDatasetRegistry {
    datasets: RwLock<HashMap<String, Vec<RegistryRecord>>>,
}

impl InMemoryDatasetRegistry {
    pub fn new() -> Self {
        InMemoryDatasetRegistry::default()
    }

    /// Every revision of a dataset, oldest first
    pub async fn history(&self, name: &str) -> Result<Vec<RegistryRecord>, RegistryError> {
        self.datasets
            .read()
            .await
            .get(name.trim())
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }
}

#[async_trait]
impl DatasetRegistry for InMemoryDatasetRegistry {
    async fn apply(
        &self,
        action: RegistryAction,
        name: &str,
        schema: Option<Value>,
        version: Option<String>,
    ) -> Result<RegistryRecord, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        if action == RegistryAction::Info {
            let datasets = self.datasets.read().await;
            return datasets
                .get(name)
                .and_then(|revisions| revisions.last())
                .map(|latest| RegistryRecord {
                    action: RegistryAction::Info,
                    ..latest.clone()
                })
                .ok_or_else(|| RegistryError::NotFound(name.to_string()));
        }

        let mut datasets = self.datasets.write().await;
        let previous = datasets.get(name).and_then(|revisions| revisions.last()).cloned();

        match (action, &previous) {
            (RegistryAction::Register, Some(_)) => {
                return Err(RegistryError::AlreadyRegistered(name.to_string()));
            }
            (RegistryAction::Update, None) => {
                return Err(RegistryError::NotFound(name.to_string()));
            }
            _ => {}
        }

        let record = RegistryRecord {
            action,
            name: name.to_string(),
            // An update without a new schema keeps the previous one
            schema: schema.or_else(|| previous.as_ref().and_then(|p| p.schema.clone())),
            version,
            revision: previous.as_ref().map(|p| p.revision + 1).unwrap_or(1),
            updated_at: Utc::now(),
        };

        datasets.entry(name.to_string()).or_default().push(record.clone());
        info!(
            "Dataset registry: {:?} '{}' -> revision {} (version {:?})",
            action, record.name, record.revision, record.version
        );
        Ok(record)
    }
}
