//! Batch valuation - runs one request file through the pipeline and prints the report
//!
//! Usage: valuation-run <request.json> [comparables.csv]
//!
//! The request file holds a `ValuationRequest` (inline records and/or a
//! `query`). When a comparables CSV is given, the query is answered from it.

use anyhow::{bail, Context, Result};
use property_valuation_backend::collaborators::csv_provider::CsvDataProvider;
use property_valuation_backend::collaborators::indexer::ProvenanceLogIndexer;
use property_valuation_backend::collaborators::model_runner::{HeuristicModelRunner, HttpModelRunner};
use property_valuation_backend::collaborators::{DataProvider, ModelRunner, SubjectQuery};
use property_valuation_backend::config::ValuationConfig;
use property_valuation_backend::valuation::normalize::RecordRole;
use property_valuation_backend::valuation::pipeline::{ValuationPipeline, ValuationRequest};
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only the report
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();
    let config = ValuationConfig::from_env()?;

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: {} <request.json> [comparables.csv]", args[0]);
    }

    let request_path = &args[1];
    let raw = tokio::fs::read_to_string(request_path)
        .await
        .with_context(|| format!("Failed to read {}", request_path))?;
    let mut request: ValuationRequest =
        serde_json::from_str(&raw).with_context(|| format!("{} is not a valid valuation request", request_path))?;

    let comps_path = args.get(2).cloned().or_else(|| config.comps_csv.clone());
    let provider: Option<CsvDataProvider> = comps_path.map(|path| {
        info!("Comparables from {}", path);
        CsvDataProvider::new(path, "comps_csv")
    });

    // A CSV without a query still needs the subject, taken from the inline records
    if provider.is_some() && request.query.is_none() {
        let subject_address = request
            .records
            .iter()
            .filter(|r| r.role == RecordRole::Subject)
            .find_map(|r| r.attributes.get("address").and_then(|a| a.as_str()))
            .map(str::to_string);
        request.query = subject_address.map(|address| SubjectQuery {
            address,
            ..Default::default()
        });
    }

    let model_runner: Option<Arc<dyn ModelRunner>> = match &config.model_url {
        Some(url) => Some(Arc::new(HttpModelRunner::new(url, config.retry.timeout)?)),
        None if config.model_heuristic => Some(Arc::new(HeuristicModelRunner)),
        None => None,
    };

    let mut pipeline = ValuationPipeline::new(config).with_indexer(Arc::new(ProvenanceLogIndexer::new()));
    if let Some(runner) = model_runner {
        pipeline = pipeline.with_model_runner(runner);
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let provider_ref = provider.as_ref().map(|p| p as &dyn DataProvider);
    match pipeline.run(request, provider_ref, cancel).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!("Valuation failed at {}: {}", e.stage(), e);
            Err(e.into())
        }
    }
}
