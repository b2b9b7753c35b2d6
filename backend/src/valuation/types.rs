//! Core data types for the valuation pipeline
//! Pure data structures, created fresh per request and never mutated downstream

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Property condition grades
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Condition {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "poor" => Ok(Condition::Poor),
            "fair" => Ok(Condition::Fair),
            "good" => Ok(Condition::Good),
            "excellent" => Ok(Condition::Excellent),
            other => Err(format!("unknown condition '{}'", other)),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::Poor => write!(f, "Poor"),
            Condition::Fair => write!(f, "Fair"),
            Condition::Good => write!(f, "Good"),
            Condition::Excellent => write!(f, "Excellent"),
        }
    }
}

/// Where a record came from and when it was collected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub collected_at: DateTime<Utc>,
}

/// Subject property - sqft and address are guaranteed by the normalizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub address: String,
    pub sqft: u32,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<f64>,
    pub lot_size: Option<f64>, // acres
    pub year_built: Option<i32>,
    pub condition: Option<Condition>,
    pub amenities: BTreeSet<String>,
}

/// A previously sold property used as a reference point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparableSale {
    pub address: String,
    pub sqft: Option<u32>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<f64>,
    pub lot_size: Option<f64>,
    pub year_built: Option<i32>,
    pub condition: Option<Condition>,
    pub amenities: BTreeSet<String>,
    pub sale_price: Option<f64>,
    pub sale_date: NaiveDate,
    pub distance_km: Option<f64>,
    pub provenance: Provenance,
}

impl ComparableSale {
    /// Price per square foot, only when both price and sqft are present and positive
    pub fn ppsf(&self) -> Option<f64> {
        match (self.sale_price, self.sqft) {
            (Some(price), Some(sqft)) => crate::price_per_sqft(price, sqft),
            _ => None,
        }
    }
}

/// Per-source record counts reported by the normalizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source: String,
    pub records: usize,
    pub latest_collected_at: DateTime<Utc>,
}

/// Provenance summary for a normalized record set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub sources: Vec<SourceSummary>,
    pub dropped_count: usize,
    pub duplicates_replaced: usize,
    pub drop_reasons: Vec<String>,
}

/// Valuation methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodId {
    Ppsf,
    CompsAdjusted,
    RegressionMl,
}

impl MethodId {
    pub const ALL: [MethodId; 3] = [MethodId::Ppsf, MethodId::CompsAdjusted, MethodId::RegressionMl];
}

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodId::Ppsf => write!(f, "ppsf"),
            MethodId::CompsAdjusted => write!(f, "comps_adjusted"),
            MethodId::RegressionMl => write!(f, "regression_ml"),
        }
    }
}

/// Output of a single valuation method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationMethodResult {
    pub method_id: MethodId,
    pub value: f64,
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// A method that could not contribute, and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedMethod {
    pub method_id: MethodId,
    pub reason: String,
}

/// Weighted reconciliation of the available methods
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalValuation {
    pub value: f64,
    pub weights: BTreeMap<MethodId, f64>,
    pub methods: Vec<ValuationMethodResult>,
    pub skipped: Vec<SkippedMethod>,
    pub computed_at: DateTime<Utc>,
}

impl FinalValuation {
    pub fn method_values(&self) -> BTreeMap<MethodId, f64> {
        self.methods.iter().map(|m| (m.method_id, m.value)).collect()
    }
}

/// Market cycle phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Expansion,
    Peak,
    Contraction,
    Trough,
}

/// Trend figures supplied by an external market-trend source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendContext {
    pub growth_rate: f64,
    pub volatility: f64,
    pub cycle_phase: CyclePhase,
}

/// Local ppsf quartiles
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
}

/// Version metadata of the reference dataset the market figures came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDataset {
    pub name: String,
    pub version: Option<String>,
    pub revision: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketPosition {
    /// None when the valuation or the subject's sqft is not positive
    pub ppsf_subject: Option<f64>,
    pub percentiles: Option<Percentiles>,
    pub delta_to_market_pct: Option<f64>,
    pub trend_context: Option<TrendContext>,
    pub comps_used: usize,
    pub reference_dataset: Option<ReferenceDataset>,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub consistency: bool,
    pub flags: Vec<String>,
    pub confidence_bonus: f64,
    pub max_relative_deviation: Option<f64>,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAudit {
    pub freshness_ok: bool,
    pub dispersion: f64,
    pub issues: Vec<String>,
}

impl SourceAudit {
    pub fn has_dispersion_issue(&self) -> bool {
        self.issues.iter().any(|i| i.starts_with("high price dispersion"))
    }
}

/// Buy/hold/sell decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Buy,
    Hold,
    Sell,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Buy => write!(f, "buy"),
            Decision::Hold => write!(f, "hold"),
            Decision::Sell => write!(f, "sell"),
        }
    }
}

/// Investor risk levels ("elevated" is accepted as a synonym of high)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    #[serde(alias = "elevated")]
    High,
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "moderate" | "medium" => Ok(RiskLevel::Moderate),
            "high" | "elevated" => Ok(RiskLevel::High),
            other => Err(format!("unknown risk level '{}'", other)),
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Moderate => write!(f, "moderate"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputsSnapshot {
    pub delta_to_market_pct: Option<f64>,
    pub risk_level: RiskLevel,
    pub horizon_months: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub decision: Decision,
    pub rationale: Vec<String>,
    pub inputs_snapshot: InputsSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceItem {
    pub item: String,
    pub priority: Priority,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenancePlan {
    pub items: Vec<MaintenanceItem>,
    pub total_estimated_cost: f64,
}

/// The report returned for one valuation request.
///
/// `valuation_methods` always lists all three methods; a skipped method is
/// serialized as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub valuation_methods: BTreeMap<MethodId, Option<ValuationMethodResult>>,
    pub final_valuation: FinalValuation,
    pub market_positioning: MarketPosition,
    pub validation_report: ValidationReport,
    pub source_audit: SourceAudit,
    pub recommendation: Recommendation,
    pub maintenance_plan: MaintenancePlan,
    pub negotiation_points: Vec<String>,
}
