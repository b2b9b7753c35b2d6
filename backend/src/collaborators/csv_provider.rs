//! CSV-backed data provider for comparable sales
//!
//! Rows are handed to the normalizer as string maps; coercion (dollar signs,
//! thousands separators, DD/MM/YYYY dates) happens there, not here.

use crate::collaborators::{CollaboratorError, DataProvider, SubjectQuery};
use crate::valuation::normalize::{RawRecord, RecordRole};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CsvDataProvider {
    path: PathBuf,
    source_id: String,
}

impl CsvDataProvider {
    pub fn new(path: impl Into<PathBuf>, source_id: impl Into<String>) -> Self {
        CsvDataProvider {
            path: path.into(),
            source_id: source_id.into(),
        }
    }
}

#[async_trait]
impl DataProvider for CsvDataProvider {
    async fn fetch(&self, query: &SubjectQuery) -> Result<Vec<RawRecord>, CollaboratorError> {
        let path = self.path.clone();
        let source_id = self.source_id.clone();

        let comps = tokio::task::spawn_blocking(move || read_comparables(&path, &source_id))
            .await
            .map_err(|e| CollaboratorError::Recoverable(format!("csv reader task failed: {}", e)))??;

        let fetched = comps.len();
        let mut comps: Vec<RawRecord> = comps
            .into_iter()
            .filter(|record| within_radius(record, query.radius_km))
            .collect();
        if let Some(max) = query.max_results {
            comps.truncate(max);
        }

        info!(
            "Loaded {} comparable rows from {:?} ({} within radius)",
            fetched,
            self.path,
            comps.len()
        );

        let mut records = Vec::with_capacity(comps.len() + 1);
        records.push(query.subject_record("request"));
        records.extend(comps);
        Ok(records)
    }
}

fn read_comparables(path: &Path, source_id: &str) -> Result<Vec<RawRecord>, CollaboratorError> {
    if !path.exists() {
        return Err(CollaboratorError::Terminal(format!("comparables file {:?} not found", path)));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| CollaboratorError::Terminal(e.to_string()))?;

    let mut records = Vec::new();
    let mut read_errors = 0;

    for (idx, result) in reader.deserialize::<HashMap<String, String>>().enumerate() {
        match result {
            Ok(row) => {
                let attributes: Map<String, Value> = row
                    .into_iter()
                    .filter(|(_, v)| !v.is_empty())
                    .map(|(k, v)| (k.trim().to_lowercase(), Value::String(v)))
                    .collect();
                records.push(RawRecord::new(RecordRole::Comparable, source_id, attributes));
            }
            Err(e) => {
                read_errors += 1;
                if read_errors <= 10 {
                    warn!("Failed to read comparables row {}: {}", idx, e);
                }
            }
        }
    }

    Ok(records)
}

/// Rows without a usable distance are kept; the normalizer decides what they are worth
fn within_radius(record: &RawRecord, radius_km: Option<f64>) -> bool {
    let Some(radius) = radius_km else {
        return true;
    };
    let distance = record
        .attributes
        .get("distance_km")
        .or_else(|| record.attributes.get("distance"))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<f64>().ok());

    match distance {
        Some(d) => d <= radius,
        None => true,
    }
}
