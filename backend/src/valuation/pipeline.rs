//! Valuation pipeline - sequences the stages for one request
//!
//! ```text
//! DataProvider -> Normalizer -> ModelRunner -> ValuationEngine -> MarketComparator
//!   -> CrossValidationChecker -> SourceConsistencyAuditor -> AdvisoryPolicyEngine
//! ```
//!
//! Every stage is a pure function over the previous stage's output; only the
//! collaborators touch I/O, and each collaborator call is bounded by the
//! retry policy. A request carries its own cancellation token, checked before
//! every stage.

use crate::collaborators::retry::call_with_retry;
use crate::collaborators::{DataProvider, DatasetRegistry, KnowledgeIndexer, ModelRunner, SubjectQuery};
use crate::config::ValuationConfig;
use crate::valuation::advise::{advise, advise_without_delta, maintenance_plan, negotiation_points, MaintenanceCosts};
use crate::valuation::engine::ValuationEngine;
use crate::valuation::error::{Result, Stage, ValuationError};
use crate::valuation::market::MarketComparator;
use crate::valuation::normalize::{normalize, NormalizedRecords, RawRecord};
use crate::valuation::types::{
    ComparableSale, CyclePhase, FinalReport, MethodId, PropertyRecord, ReferenceDataset, RiskLevel,
    SourceAudit, TrendContext, ValidationReport,
};
use crate::valuation::utils::median;
use crate::valuation::validate::{CrossValidationChecker, FreshnessPolicy, SourceConsistencyAuditor};
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

const PROVENANCE_COLLECTION: &str = "valuation_provenance";
const MODERATE_VOLATILITY: f64 = 0.15;

/// One valuation request.
///
/// Records may be supplied inline, fetched through a provider `query`, or
/// both; inline records come after fetched ones, so their subject attributes
/// win the merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValuationRequest {
    #[serde(default)]
    pub records: Vec<RawRecord>,
    #[serde(default)]
    pub query: Option<SubjectQuery>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub horizon_months: Option<u32>,
    #[serde(default)]
    pub trend: Option<TrendContext>,
    /// Reference date for sale ages and building age; defaults to today
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
}

/// Per-request state: never shared between requests
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub as_of: NaiveDate,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(as_of: NaiveDate, cancel: CancellationToken) -> Self {
        RequestContext {
            request_id: Uuid::new_v4(),
            as_of,
            cancel,
        }
    }

    pub fn checkpoint(&self, stage: Stage) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!("Request {} cancelled before {}", self.request_id, stage);
            return Err(ValuationError::Cancelled { stage });
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ValuationPipeline {
    config: ValuationConfig,
    model_runner: Option<Arc<dyn ModelRunner>>,
    registry: Option<Arc<dyn DatasetRegistry>>,
    reference_dataset: Option<String>,
    indexer: Option<Arc<dyn KnowledgeIndexer>>,
    maintenance_costs: MaintenanceCosts,
}

impl ValuationPipeline {
    pub fn new(config: ValuationConfig) -> Self {
        ValuationPipeline {
            config,
            model_runner: None,
            registry: None,
            reference_dataset: None,
            indexer: None,
            maintenance_costs: MaintenanceCosts::default(),
        }
    }

    pub fn with_model_runner(mut self, runner: Arc<dyn ModelRunner>) -> Self {
        self.model_runner = Some(runner);
        self
    }

    /// Attach the registry and the dataset whose latest revision backs the local comps
    pub fn with_registry(mut self, registry: Arc<dyn DatasetRegistry>, dataset: impl Into<String>) -> Self {
        self.registry = Some(registry);
        self.reference_dataset = Some(dataset.into());
        self
    }

    pub fn with_indexer(mut self, indexer: Arc<dyn KnowledgeIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn config(&self) -> &ValuationConfig {
        &self.config
    }

    /// Fetch raw records through a provider, bounded by the retry policy
    pub async fn fetch_records(&self, provider: &dyn DataProvider, query: &SubjectQuery) -> Result<Vec<RawRecord>> {
        call_with_retry(Stage::DataProvider, &self.config.retry, move || provider.fetch(query)).await
    }

    /// Run one request end to end.
    ///
    /// Stops at the first fatal error; a cancelled request yields no partial
    /// report.
    pub async fn run(
        &self,
        request: ValuationRequest,
        provider: Option<&dyn DataProvider>,
        cancel: CancellationToken,
    ) -> Result<FinalReport> {
        let ctx = RequestContext::new(request.as_of.unwrap_or_else(|| Utc::now().date_naive()), cancel);
        let span = info_span!("valuation", request_id = %ctx.request_id);

        async move {
            info!("Valuation request received (as of {})", ctx.as_of);
            let result = self.run_stages(request, provider, &ctx).await;
            match &result {
                Ok(report) => info!(
                    "Valuation complete: {:.2} -> {}",
                    report.final_valuation.value, report.recommendation.decision
                ),
                Err(e) => warn!("Valuation failed: {}", e),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        request: ValuationRequest,
        provider: Option<&dyn DataProvider>,
        ctx: &RequestContext,
    ) -> Result<FinalReport> {
        let ValuationRequest {
            records,
            query,
            risk_level,
            horizon_months,
            trend,
            ..
        } = request;

        // Stage 1: data provider; an outage degrades to the inline records
        let mut raw = Vec::new();
        let mut provider_issue = None;
        if let Some(query) = &query {
            ctx.checkpoint(Stage::DataProvider)?;
            let fetched = match provider {
                Some(provider) => self.fetch_records(provider, query).await,
                None => Err(ValuationError::unavailable(Stage::DataProvider, "no data provider configured")),
            };
            match fetched {
                Ok(records) => raw = records,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Continuing with inline records only: {}", e);
                    provider_issue = Some(format!("data provider unavailable: {}", e));
                    raw.push(query.subject_record("request"));
                }
            }
        }
        raw.extend(records);

        // Stage 2: normalize
        ctx.checkpoint(Stage::Normalizer)?;
        let normalized = normalize(&raw)?;
        self.record_provenance(&normalized).await;

        // Stage 3: model runner (optional)
        ctx.checkpoint(Stage::ModelRunner)?;
        let ml_prediction = self.predict(&normalized.subject, &normalized.comparables).await;

        // Stage 4: valuation engine
        ctx.checkpoint(Stage::ValuationEngine)?;
        let engine = ValuationEngine::new(self.config.weights.clone(), self.config.adjustments.clone());
        let final_valuation = engine.valuate(&normalized.subject, &normalized.comparables, ml_prediction)?;

        // Stage 5: market comparator
        ctx.checkpoint(Stage::MarketComparator)?;
        let reference = self.reference().await;
        let market = MarketComparator::with_reference(reference).compare(
            &final_valuation,
            normalized.subject.sqft,
            &normalized.comparables,
            trend.as_ref(),
        );

        // Stage 6: cross-validation
        ctx.checkpoint(Stage::CrossValidationChecker)?;
        let priced: Vec<ComparableSale> = normalized
            .comparables
            .iter()
            .filter(|c| c.sale_price.is_some())
            .cloned()
            .collect();
        let validation = CrossValidationChecker::new(self.config.thresholds.clone()).check(
            &final_valuation.method_values(),
            priced.len(),
            days_since_sales_avg(&priced, ctx.as_of),
        );

        // Stage 7: source audit
        ctx.checkpoint(Stage::SourceConsistencyAuditor)?;
        let freshness = self.config.thresholds.freshness_max_age_days.map(|max_age_days| FreshnessPolicy {
            max_age_days,
            as_of: ctx.as_of,
        });
        let mut audit = SourceConsistencyAuditor::new(self.config.thresholds.dispersion, freshness)
            .audit(&normalized.comparables);
        audit.issues.extend(provider_issue);

        // Stage 8: advice
        ctx.checkpoint(Stage::AdvisoryPolicyEngine)?;
        let risk_level = risk_level.unwrap_or_else(|| derive_risk(&validation, &audit, trend.as_ref()));
        let horizon_months = horizon_months.unwrap_or(self.config.default_horizon_months);
        let recommendation = match market.delta_to_market_pct {
            Some(delta) => advise(delta, risk_level, horizon_months),
            None => advise_without_delta(risk_level, horizon_months),
        };
        let plan = maintenance_plan(&normalized.subject, ctx.as_of.year(), &self.maintenance_costs);
        let points = negotiation_points(&market, &validation, &audit, &plan);

        let valuation_methods: BTreeMap<MethodId, _> = MethodId::ALL
            .iter()
            .map(|id| {
                let result = final_valuation.methods.iter().find(|m| m.method_id == *id).cloned();
                (*id, result)
            })
            .collect();

        Ok(FinalReport {
            valuation_methods,
            final_valuation,
            market_positioning: market,
            validation_report: validation,
            source_audit: audit,
            recommendation,
            maintenance_plan: plan,
            negotiation_points: points,
        })
    }

    /// Model prediction, or None when no runner is configured or every attempt failed
    async fn predict(&self, subject: &PropertyRecord, comps: &[ComparableSale]) -> Option<f64> {
        let runner = self.model_runner.as_deref()?;
        let features = model_features(subject, comps);
        let features = &features;
        let model_name = self.config.model_name.as_str();
        let version = self.config.model_version.as_deref();

        match call_with_retry(Stage::ModelRunner, &self.config.retry, move || {
            runner.predict(model_name, features, version)
        })
        .await
        {
            Ok(prediction) => prediction.prediction,
            Err(e) => {
                warn!("Model prediction unavailable, regression_ml will be skipped: {}", e);
                None
            }
        }
    }

    async fn reference(&self) -> Option<ReferenceDataset> {
        let (registry, name) = (self.registry.as_deref()?, self.reference_dataset.as_deref()?);
        match registry.info(name).await {
            Ok(record) => Some(record.to_reference()),
            Err(e) => {
                warn!("Reference dataset lookup failed: {}", e);
                None
            }
        }
    }

    /// Provenance only: failures are logged and the request continues
    async fn record_provenance(&self, normalized: &NormalizedRecords) {
        let Some(indexer) = self.indexer.as_deref() else {
            return;
        };
        let sources: Vec<String> = normalized
            .source_metadata
            .sources
            .iter()
            .map(|s| s.source.clone())
            .collect();

        match tokio::time::timeout(self.config.retry.timeout, indexer.ingest(&sources, PROVENANCE_COLLECTION, false)).await
        {
            Ok(Ok(receipt)) => info!(
                "Provenance recorded: {} sources into {}",
                receipt.ingested_items, receipt.collection
            ),
            Ok(Err(e)) => warn!("Provenance indexing failed: {}", e),
            Err(_) => warn!("Provenance indexing timed out"),
        }
    }
}

/// Feature map for the model runner: subject attributes plus the local median ppsf
pub fn model_features(subject: &PropertyRecord, comps: &[ComparableSale]) -> BTreeMap<String, f64> {
    let mut features = BTreeMap::new();
    features.insert("sqft".to_string(), subject.sqft as f64);
    if let Some(bedrooms) = subject.bedrooms {
        features.insert("bedrooms".to_string(), bedrooms as f64);
    }
    if let Some(bathrooms) = subject.bathrooms {
        features.insert("bathrooms".to_string(), bathrooms);
    }
    if let Some(lot_size) = subject.lot_size {
        features.insert("lot_size".to_string(), lot_size);
    }
    if let Some(year_built) = subject.year_built {
        features.insert("year_built".to_string(), year_built as f64);
    }

    let ppsfs: Vec<f64> = comps.iter().filter_map(ComparableSale::ppsf).collect();
    if let Some(ppsf) = median(&ppsfs) {
        features.insert("price_per_sqft".to_string(), ppsf);
    }
    features
}

/// Mean age in days of the given sales; infinite when there are none.
///
/// The pipeline passes the priced comparables, the same sample it counts.
pub fn days_since_sales_avg(comps: &[ComparableSale], as_of: NaiveDate) -> f64 {
    if comps.is_empty() {
        return f64::INFINITY;
    }
    let total: i64 = comps
        .iter()
        .map(|c| (as_of - c.sale_date).num_days().max(0))
        .sum();
    total as f64 / comps.len() as f64
}

/// Risk level for requests that do not state one
pub fn derive_risk(validation: &ValidationReport, audit: &SourceAudit, trend: Option<&TrendContext>) -> RiskLevel {
    if !validation.consistency || audit.has_dispersion_issue() {
        return RiskLevel::High;
    }
    match trend {
        Some(t) if matches!(t.cycle_phase, CyclePhase::Peak | CyclePhase::Contraction) => RiskLevel::Moderate,
        Some(t) if t.volatility > MODERATE_VOLATILITY => RiskLevel::Moderate,
        _ => RiskLevel::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::indexer::ProvenanceLogIndexer;
    use crate::collaborators::registry::InMemoryDatasetRegistry;
    use crate::collaborators::{CollaboratorError, Prediction, RegistryAction};
    use crate::config::RetryPolicy;
    use crate::valuation::normalize::RecordRole;
    use crate::valuation::types::Decision;
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::time::Duration;

    struct FixedModel(f64);

    #[async_trait]
    impl ModelRunner for FixedModel {
        async fn predict(
            &self,
            _model_name: &str,
            _features: &BTreeMap<String, f64>,
            _version: Option<&str>,
        ) -> std::result::Result<Prediction, CollaboratorError> {
            Ok(Prediction {
                prediction: Some(self.0),
                explanation: Map::new(),
            })
        }
    }

    struct BrokenModel;

    #[async_trait]
    impl ModelRunner for BrokenModel {
        async fn predict(
            &self,
            _model_name: &str,
            _features: &BTreeMap<String, f64>,
            _version: Option<&str>,
        ) -> std::result::Result<Prediction, CollaboratorError> {
            Err(CollaboratorError::Terminal("model not deployed".to_string()))
        }
    }

    struct StaticProvider(Vec<RawRecord>);

    #[async_trait]
    impl DataProvider for StaticProvider {
        async fn fetch(&self, query: &SubjectQuery) -> std::result::Result<Vec<RawRecord>, CollaboratorError> {
            let mut records = vec![query.subject_record("request")];
            records.extend(self.0.clone());
            Ok(records)
        }
    }

    struct DownProvider;

    #[async_trait]
    impl DataProvider for DownProvider {
        async fn fetch(&self, _query: &SubjectQuery) -> std::result::Result<Vec<RawRecord>, CollaboratorError> {
            Err(CollaboratorError::Recoverable("connection refused".to_string()))
        }
    }

    fn attrs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn config() -> ValuationConfig {
        ValuationConfig {
            retry: RetryPolicy {
                timeout: Duration::from_millis(100),
                max_attempts: 2,
                backoff: Duration::from_millis(1),
            },
            ..ValuationConfig::default()
        }
    }

    fn subject() -> RawRecord {
        RawRecord::new(
            RecordRole::Subject,
            "request",
            attrs(json!({
                "address": "1 Main St",
                "sqft": 2000,
                "bedrooms": 3,
                "bathrooms": 2,
                "year_built": 2000
            })),
        )
    }

    fn comps() -> Vec<RawRecord> {
        [
            ("12 Oak St", 2000, 400_000, "2024-05-01"),
            ("9 Elm St", 2100, 420_000, "2024-04-15"),
            ("3 Ash St", 2050, 410_000, "2024-03-20"),
        ]
        .into_iter()
        .map(|(address, sqft, price, date)| {
            RawRecord::new(
                RecordRole::Comparable,
                "mls",
                attrs(json!({
                    "address": address,
                    "sqft": sqft,
                    "bedrooms": 3,
                    "bathrooms": 2,
                    "year_built": 2000,
                    "sale_price": price,
                    "sale_date": date,
                    "distance_km": 1.0
                })),
            )
        })
        .collect()
    }

    fn request(records: Vec<RawRecord>) -> ValuationRequest {
        ValuationRequest {
            records,
            as_of: NaiveDate::from_ymd_opt(2024, 6, 1),
            ..Default::default()
        }
    }

    fn all_records() -> Vec<RawRecord> {
        let mut records = vec![subject()];
        records.extend(comps());
        records
    }

    #[tokio::test]
    async fn test_end_to_end_report() {
        let pipeline = ValuationPipeline::new(config()).with_model_runner(Arc::new(FixedModel(410_000.0)));

        let report = pipeline
            .run(request(all_records()), None, CancellationToken::new())
            .await
            .unwrap();

        // ppsf 400,000; comps_adjusted 402,500; regression_ml 410,000
        assert!((report.final_valuation.value - 404_000.0).abs() < 0.01);
        assert!(report.valuation_methods.values().all(Option::is_some));
        let weight_sum: f64 = report.final_valuation.weights.values().sum();
        assert!((weight_sum - 1.0).abs() < 1e-9);

        let delta = report.market_positioning.delta_to_market_pct.unwrap();
        assert!((delta - 1.0).abs() < 1e-9);

        assert!(report.validation_report.consistency);
        assert_eq!(report.validation_report.confidence_bonus, 0.4);
        assert_eq!(report.validation_report.confidence_score, 0.9);
        assert!(report.source_audit.issues.is_empty());

        assert_eq!(report.recommendation.decision, Decision::Hold);
        assert_eq!(report.recommendation.inputs_snapshot.risk_level, RiskLevel::Low);
        assert_eq!(report.recommendation.inputs_snapshot.horizon_months, 12);
    }

    #[tokio::test]
    async fn test_missing_subject_sqft_halts_before_valuation() {
        let mut records = all_records();
        records[0].attributes.remove("sqft");

        let err = ValuationPipeline::new(config())
            .run(request(records), None, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ValuationError::MalformedInput { stage: Stage::Normalizer, .. }));
    }

    #[tokio::test]
    async fn test_no_method_available() {
        let err = ValuationPipeline::new(config())
            .run(request(vec![subject()]), None, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ValuationError::NoMethodAvailable { stage: Stage::ValuationEngine, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_request_yields_no_report() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ValuationPipeline::new(config())
            .run(request(all_records()), None, cancel)
            .await
            .unwrap_err();

        assert_eq!(err, ValuationError::Cancelled { stage: Stage::Normalizer });
    }

    #[tokio::test]
    async fn test_model_failure_skips_regression_only() {
        let pipeline = ValuationPipeline::new(config()).with_model_runner(Arc::new(BrokenModel));

        let report = pipeline
            .run(request(all_records()), None, CancellationToken::new())
            .await
            .unwrap();

        assert!(report.valuation_methods[&MethodId::RegressionMl].is_none());
        assert!(report.valuation_methods[&MethodId::Ppsf].is_some());
        assert_eq!(report.final_valuation.skipped[0].method_id, MethodId::RegressionMl);
        assert!(!report.final_valuation.weights.contains_key(&MethodId::RegressionMl));
    }

    #[tokio::test]
    async fn test_query_goes_through_provider() {
        let provider = StaticProvider(comps());
        let mut attributes = Map::new();
        attributes.insert("sqft".to_string(), json!(2000));
        let request = ValuationRequest {
            query: Some(SubjectQuery {
                address: "1 Main St".to_string(),
                attributes,
                ..Default::default()
            }),
            risk_level: Some(RiskLevel::High),
            horizon_months: Some(3),
            as_of: NaiveDate::from_ymd_opt(2024, 6, 1),
            ..Default::default()
        };

        let report = ValuationPipeline::new(config())
            .run(request, Some(&provider), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.market_positioning.comps_used, 3);
        assert_eq!(report.recommendation.inputs_snapshot.risk_level, RiskLevel::High);
        assert_eq!(report.recommendation.inputs_snapshot.horizon_months, 3);
    }

    fn outage_request(records: Vec<RawRecord>) -> ValuationRequest {
        let mut attributes = Map::new();
        attributes.insert("sqft".to_string(), json!(2000));
        ValuationRequest {
            records,
            query: Some(SubjectQuery {
                address: "1 Main St".to_string(),
                attributes,
                ..Default::default()
            }),
            as_of: NaiveDate::from_ymd_opt(2024, 6, 1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_provider_outage_continues_with_inline_records() {
        let report = ValuationPipeline::new(config())
            .run(outage_request(comps()), Some(&DownProvider), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.market_positioning.comps_used, 3);
        assert!(report.final_valuation.value > 0.0);
        let issue = report
            .source_audit
            .issues
            .iter()
            .find(|i| i.starts_with("data provider unavailable"))
            .unwrap();
        assert!(issue.contains("gave up after 2 attempts"));
    }

    #[tokio::test]
    async fn test_missing_provider_is_flagged_not_fatal() {
        let report = ValuationPipeline::new(config())
            .run(outage_request(comps()), None, CancellationToken::new())
            .await
            .unwrap();

        assert!(report
            .source_audit
            .issues
            .iter()
            .any(|i| i.contains("no data provider configured")));
    }

    #[tokio::test]
    async fn test_provider_outage_without_comparables_reaches_engine() {
        let err = ValuationPipeline::new(config())
            .run(outage_request(vec![]), Some(&DownProvider), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ValuationError::NoMethodAvailable { stage: Stage::ValuationEngine, .. }));
    }

    #[tokio::test]
    async fn test_reference_dataset_and_provenance() {
        let registry = Arc::new(InMemoryDatasetRegistry::new());
        registry
            .apply(RegistryAction::Register, "local_sales", None, Some("2024-q2".to_string()))
            .await
            .unwrap();
        let indexer = Arc::new(ProvenanceLogIndexer::new());

        let pipeline = ValuationPipeline::new(config())
            .with_registry(registry.clone(), "local_sales")
            .with_indexer(indexer.clone());

        let report = pipeline
            .run(request(all_records()), None, CancellationToken::new())
            .await
            .unwrap();

        let reference = report.market_positioning.reference_dataset.unwrap();
        assert_eq!(reference.name, "local_sales");
        assert_eq!(reference.revision, 1);

        let receipts = indexer.receipts().await;
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].ingested_items, 2);
    }

    #[test]
    fn test_derive_risk() {
        let consistent = ValidationReport {
            consistency: true,
            flags: vec![],
            confidence_bonus: 0.4,
            max_relative_deviation: Some(0.02),
            confidence_score: 0.9,
        };
        let clean = SourceAudit {
            freshness_ok: true,
            dispersion: 0.05,
            issues: vec![],
        };
        let calm = TrendContext {
            growth_rate: 0.03,
            volatility: 0.05,
            cycle_phase: CyclePhase::Expansion,
        };

        assert_eq!(derive_risk(&consistent, &clean, None), RiskLevel::Low);
        assert_eq!(derive_risk(&consistent, &clean, Some(&calm)), RiskLevel::Low);

        let peak = TrendContext {
            cycle_phase: CyclePhase::Peak,
            ..calm.clone()
        };
        assert_eq!(derive_risk(&consistent, &clean, Some(&peak)), RiskLevel::Moderate);

        let volatile = TrendContext {
            volatility: 0.2,
            ..calm
        };
        assert_eq!(derive_risk(&consistent, &clean, Some(&volatile)), RiskLevel::Moderate);

        let dispersed = SourceAudit {
            dispersion: 0.5,
            issues: vec!["high price dispersion: 50.0% exceeds 35%".to_string()],
            ..clean
        };
        assert_eq!(derive_risk(&consistent, &dispersed, None), RiskLevel::High);
    }

    #[test]
    fn test_model_features_include_local_ppsf() {
        let normalized = normalize(&all_records()).unwrap();
        let features = model_features(&normalized.subject, &normalized.comparables);

        assert_eq!(features["sqft"], 2000.0);
        assert_eq!(features["year_built"], 2000.0);
        assert!((features["price_per_sqft"] - 200.0).abs() < 1e-9);
        assert!(!features.contains_key("lot_size"));
    }

    #[tokio::test]
    async fn test_sale_age_uses_priced_comparables_only() {
        let mut records = all_records();
        records.push(RawRecord::new(
            RecordRole::Comparable,
            "listing",
            attrs(json!({
                "address": "40 Old Rd",
                "sqft": 2000,
                "sale_date": "2014-06-01",
                "distance_km": 1.0
            })),
        ));

        let report = ValuationPipeline::new(config())
            .with_model_runner(Arc::new(FixedModel(410_000.0)))
            .run(request(records), None, CancellationToken::new())
            .await
            .unwrap();

        // A decade-old unpriced listing must not age the priced sample past the recency limit
        assert!(report.validation_report.consistency);
        assert_eq!(report.validation_report.confidence_bonus, 0.4);
    }

    #[test]
    fn test_days_since_sales_avg() {
        let normalized = normalize(&all_records()).unwrap();
        let as_of = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

        // 31 + 47 + 73 days
        assert!((days_since_sales_avg(&normalized.comparables, as_of) - 151.0 / 3.0).abs() < 1e-9);
        assert_eq!(days_since_sales_avg(&[], as_of), f64::INFINITY);
    }
}
