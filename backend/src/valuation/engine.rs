//! Valuation engine - per-method estimates and weighted reconciliation

use crate::config::{default_weights, AdjustmentRates};
use crate::valuation::error::{Result, Stage, ValuationError};
use crate::valuation::types::{
    ComparableSale, FinalValuation, MethodId, PropertyRecord, SkippedMethod, ValuationMethodResult,
};
use crate::valuation::utils::median;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ValuationEngine {
    weights: BTreeMap<MethodId, f64>,
    rates: AdjustmentRates,
}

impl Default for ValuationEngine {
    fn default() -> Self {
        ValuationEngine::new(default_weights(), AdjustmentRates::default())
    }
}

impl ValuationEngine {
    pub fn new(weights: BTreeMap<MethodId, f64>, rates: AdjustmentRates) -> Self {
        ValuationEngine { weights, rates }
    }

    pub fn valuate(
        &self,
        subject: &PropertyRecord,
        comps: &[ComparableSale],
        ml_prediction: Option<f64>,
    ) -> Result<FinalValuation> {
        self.valuate_at(subject, comps, ml_prediction, Utc::now())
    }

    /// Run every method, skip the unavailable ones and aggregate the rest.
    ///
    /// Fails with `NoMethodAvailable` only when all three methods are skipped.
    pub fn valuate_at(
        &self,
        subject: &PropertyRecord,
        comps: &[ComparableSale],
        ml_prediction: Option<f64>,
        computed_at: DateTime<Utc>,
    ) -> Result<FinalValuation> {
        let outcomes = [
            (MethodId::Ppsf, ppsf_method(subject, comps)),
            (MethodId::CompsAdjusted, comps_adjusted_method(subject, comps, &self.rates)),
            (MethodId::RegressionMl, regression_ml_method(ml_prediction)),
        ];

        let mut methods = Vec::new();
        let mut skipped = Vec::new();
        for (method_id, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    debug!("Method {} valued subject at {:.2}", method_id, result.value);
                    methods.push(result);
                }
                Err(e) => {
                    debug!("Method {} skipped: {}", method_id, e);
                    skipped.push(SkippedMethod {
                        method_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let available: Vec<MethodId> = methods.iter().map(|m| m.method_id).collect();
        let weights = redistribute_weights(&self.weights, &available).ok_or_else(|| {
            ValuationError::NoMethodAvailable {
                stage: Stage::ValuationEngine,
                detail: skipped
                    .iter()
                    .map(|s| s.reason.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            }
        })?;

        let value = methods
            .iter()
            .map(|m| weights.get(&m.method_id).copied().unwrap_or(0.0) * m.value)
            .sum();

        info!(
            "Final valuation {:.2} from {} methods ({} skipped)",
            value,
            methods.len(),
            skipped.len()
        );

        Ok(FinalValuation {
            value,
            weights,
            methods,
            skipped,
            computed_at,
        })
    }
}

/// Scale the weights of the available methods so they sum to 1.0.
///
/// Returns None when no method is available. If every available method has a
/// zero configured weight, they share the total equally.
pub fn redistribute_weights(
    configured: &BTreeMap<MethodId, f64>,
    available: &[MethodId],
) -> Option<BTreeMap<MethodId, f64>> {
    if available.is_empty() {
        return None;
    }
    let total: f64 = available
        .iter()
        .map(|m| configured.get(m).copied().unwrap_or(0.0))
        .sum();

    let weights = available
        .iter()
        .map(|m| {
            let w = if total > 0.0 {
                configured.get(m).copied().unwrap_or(0.0) / total
            } else {
                1.0 / available.len() as f64
            };
            (*m, w)
        })
        .collect();
    Some(weights)
}

/// Median comp ppsf scaled to the subject's area
fn ppsf_method(subject: &PropertyRecord, comps: &[ComparableSale]) -> Result<ValuationMethodResult> {
    let ppsfs: Vec<f64> = comps.iter().filter_map(ComparableSale::ppsf).collect();
    let median_ppsf = median(&ppsfs).ok_or_else(|| {
        ValuationError::unavailable(Stage::ValuationEngine, "ppsf: no comparable with both sale_price and sqft")
    })?;

    Ok(ValuationMethodResult {
        method_id: MethodId::Ppsf,
        value: median_ppsf * subject.sqft as f64,
        parameters: BTreeMap::from([
            ("median_ppsf".to_string(), json!(median_ppsf)),
            ("comps_used".to_string(), json!(ppsfs.len())),
            ("subject_sqft".to_string(), json!(subject.sqft)),
        ]),
    })
}

/// Adjust each comp's price toward the subject, then take a distance-weighted mean
fn comps_adjusted_method(
    subject: &PropertyRecord,
    comps: &[ComparableSale],
    rates: &AdjustmentRates,
) -> Result<ValuationMethodResult> {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    let mut used = 0usize;
    let mut without_distance = 0usize;

    for comp in comps {
        let (price, sqft) = match (comp.sale_price, comp.sqft) {
            (Some(price), Some(sqft)) if price > 0.0 && sqft > 0 => (price, sqft),
            _ => continue,
        };

        let adjusted = adjusted_price(subject, comp, price, sqft, rates);

        let weight = match comp.distance_km {
            Some(d) => 1.0 / (1.0 + d),
            None => {
                without_distance += 1;
                1.0
            }
        };

        weighted_sum += weight * adjusted;
        total_weight += weight;
        used += 1;
    }

    if used == 0 {
        return Err(ValuationError::unavailable(
            Stage::ValuationEngine,
            "comps_adjusted: no comparable with both sale_price and sqft",
        ));
    }

    let value = weighted_sum / total_weight;
    if !value.is_finite() || value <= 0.0 {
        return Err(ValuationError::unavailable(
            Stage::ValuationEngine,
            "comps_adjusted: non-positive adjusted value",
        ));
    }

    Ok(ValuationMethodResult {
        method_id: MethodId::CompsAdjusted,
        value,
        parameters: BTreeMap::from([
            ("comps_used".to_string(), json!(used)),
            ("comps_without_distance".to_string(), json!(without_distance)),
            ("total_distance_weight".to_string(), json!(total_weight)),
            ("price_per_sqft_rate".to_string(), json!(rates.price_per_sqft)),
            ("bedroom_adj".to_string(), json!(rates.bedroom)),
            ("bathroom_adj".to_string(), json!(rates.bathroom)),
            ("age_adj_per_year".to_string(), json!(rates.age_per_year)),
        ]),
    })
}

/// sale_price + Δsqft·rate + Δbedrooms·adj + Δbathrooms·adj + Δage·adj.
///
/// Deltas are subject minus comp; Δage is counted in years newer, so a newer
/// subject adjusts upward. An attribute missing on either side contributes
/// no adjustment.
pub fn adjusted_price(
    subject: &PropertyRecord,
    comp: &ComparableSale,
    price: f64,
    comp_sqft: u32,
    rates: &AdjustmentRates,
) -> f64 {
    let d_sqft = subject.sqft as f64 - comp_sqft as f64;
    let d_bed = match (subject.bedrooms, comp.bedrooms) {
        (Some(s), Some(c)) => s as f64 - c as f64,
        _ => 0.0,
    };
    let d_bath = match (subject.bathrooms, comp.bathrooms) {
        (Some(s), Some(c)) => s - c,
        _ => 0.0,
    };
    let d_age = match (subject.year_built, comp.year_built) {
        (Some(s), Some(c)) => (s - c) as f64,
        _ => 0.0,
    };

    price
        + d_sqft * rates.price_per_sqft
        + d_bed * rates.bedroom
        + d_bath * rates.bathroom
        + d_age * rates.age_per_year
}

fn regression_ml_method(prediction: Option<f64>) -> Result<ValuationMethodResult> {
    match prediction {
        Some(value) if value.is_finite() && value > 0.0 => Ok(ValuationMethodResult {
            method_id: MethodId::RegressionMl,
            value,
            parameters: BTreeMap::from([("source".to_string(), json!("model_runner"))]),
        }),
        Some(value) => Err(ValuationError::unavailable(
            Stage::ValuationEngine,
            format!("regression_ml: unusable prediction {}", value),
        )),
        None => Err(ValuationError::unavailable(
            Stage::ValuationEngine,
            "regression_ml: no model prediction supplied",
        )),
    }
}
