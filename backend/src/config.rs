//! Configuration loaded from environment variables

use crate::valuation::types::MethodId;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Dollar adjustments applied per unit of difference between subject and comp
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustmentRates {
    pub price_per_sqft: f64,
    pub bedroom: f64,
    pub bathroom: f64,
    pub age_per_year: f64,
}

impl Default for AdjustmentRates {
    fn default() -> Self {
        AdjustmentRates {
            price_per_sqft: 150.0,
            bedroom: 10_000.0,
            bathroom: 7_500.0,
            age_per_year: 1_000.0,
        }
    }
}

/// Timeout and retry bounds for external collaborator calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            timeout: Duration::from_millis(5_000),
            max_attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Thresholds and bonuses used by the validation stages
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationThresholds {
    pub consistency: f64,
    pub dispersion: f64,
    pub min_comparables_for_bonus: usize,
    pub recent_sales_days: f64,
    pub bonus_step: f64,
    pub base_confidence: f64,
    pub freshness_max_age_days: Option<i64>,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        ValidationThresholds {
            consistency: 0.20,
            dispersion: 0.35,
            min_comparables_for_bonus: 3,
            recent_sales_days: 180.0,
            bonus_step: 0.20,
            base_confidence: 0.5,
            freshness_max_age_days: None,
        }
    }
}

/// Everything the pipeline and binaries need, with defaults for every value
#[derive(Debug, Clone)]
pub struct ValuationConfig {
    pub bind_addr: String,
    pub database_url: Option<String>,
    pub comps_csv: Option<String>,
    pub model_url: Option<String>,
    pub model_name: String,
    pub model_version: Option<String>,
    /// Use the offline sqft × ppsf model when no model server is configured
    pub model_heuristic: bool,
    pub weights: BTreeMap<MethodId, f64>,
    pub adjustments: AdjustmentRates,
    pub thresholds: ValidationThresholds,
    pub retry: RetryPolicy,
    pub default_horizon_months: u32,
}

pub fn default_weights() -> BTreeMap<MethodId, f64> {
    BTreeMap::from([
        (MethodId::Ppsf, 0.3),
        (MethodId::CompsAdjusted, 0.4),
        (MethodId::RegressionMl, 0.3),
    ])
}

impl Default for ValuationConfig {
    fn default() -> Self {
        ValuationConfig {
            bind_addr: "127.0.0.1:3001".to_string(),
            database_url: None,
            comps_csv: None,
            model_url: None,
            model_name: "avm-regression".to_string(),
            model_version: None,
            model_heuristic: false,
            weights: default_weights(),
            adjustments: AdjustmentRates::default(),
            thresholds: ValidationThresholds::default(),
            retry: RetryPolicy::default(),
            default_horizon_months: 12,
        }
    }
}

impl ValuationConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = ValuationConfig::default();

        let weights = BTreeMap::from([
            (MethodId::Ppsf, parse_or("WEIGHT_PPSF", defaults.weights[&MethodId::Ppsf])?),
            (
                MethodId::CompsAdjusted,
                parse_or("WEIGHT_COMPS_ADJUSTED", defaults.weights[&MethodId::CompsAdjusted])?,
            ),
            (
                MethodId::RegressionMl,
                parse_or("WEIGHT_REGRESSION_ML", defaults.weights[&MethodId::RegressionMl])?,
            ),
        ]);
        validate_weights(&weights)?;

        let adjustments = AdjustmentRates {
            price_per_sqft: parse_or("ADJ_PRICE_PER_SQFT", defaults.adjustments.price_per_sqft)?,
            bedroom: parse_or("ADJ_BEDROOM", defaults.adjustments.bedroom)?,
            bathroom: parse_or("ADJ_BATHROOM", defaults.adjustments.bathroom)?,
            age_per_year: parse_or("ADJ_AGE_PER_YEAR", defaults.adjustments.age_per_year)?,
        };

        let thresholds = ValidationThresholds {
            consistency: parse_or("CONSISTENCY_THRESHOLD", defaults.thresholds.consistency)?,
            dispersion: parse_or("DISPERSION_THRESHOLD", defaults.thresholds.dispersion)?,
            base_confidence: parse_or("BASE_CONFIDENCE", defaults.thresholds.base_confidence)?,
            freshness_max_age_days: parse_opt("FRESHNESS_MAX_AGE_DAYS")?,
            ..defaults.thresholds
        };

        let retry = RetryPolicy {
            timeout: Duration::from_millis(parse_or("COLLABORATOR_TIMEOUT_MS", 5_000u64)?),
            max_attempts: parse_or("COLLABORATOR_MAX_ATTEMPTS", defaults.retry.max_attempts)?.max(1),
            backoff: Duration::from_millis(parse_or("COLLABORATOR_BACKOFF_MS", 200u64)?),
        };

        Ok(ValuationConfig {
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: env::var("DATABASE_URL").ok(),
            comps_csv: env::var("COMPS_CSV").ok(),
            model_url: env::var("MODEL_URL").ok(),
            model_name: env::var("MODEL_NAME").unwrap_or(defaults.model_name),
            model_version: env::var("MODEL_VERSION").ok(),
            model_heuristic: parse_or("MODEL_HEURISTIC", defaults.model_heuristic)?,
            weights,
            adjustments,
            thresholds,
            retry,
            default_horizon_months: parse_or("DEFAULT_HORIZON_MONTHS", defaults.default_horizon_months)?,
        })
    }
}

/// Weights must be non-negative with a positive total
pub fn validate_weights(weights: &BTreeMap<MethodId, f64>) -> Result<()> {
    if let Some((method, w)) = weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
        anyhow::bail!("weight for {} must be a non-negative number, got {}", method, w);
    }
    if weights.values().sum::<f64>() <= 0.0 {
        anyhow::bail!("method weights must have a positive total");
    }
    Ok(())
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parse_opt(name)?.unwrap_or(default))
}

fn parse_opt<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} has an invalid value: {}", name, raw.trim())),
        Err(_) => Ok(None),
    }
}
