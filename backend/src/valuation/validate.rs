//! Validation functions - cross-method agreement and comparable-source quality

use crate::config::ValidationThresholds;
use crate::valuation::types::{ComparableSale, MethodId, SourceAudit, ValidationReport};
use crate::valuation::utils::{max_relative_deviation, round_to, Deviation};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct CrossValidationChecker {
    thresholds: ValidationThresholds,
}

impl CrossValidationChecker {
    pub fn new(thresholds: ValidationThresholds) -> Self {
        CrossValidationChecker { thresholds }
    }

    /// Measure agreement between method values and derive the confidence bonus.
    ///
    /// A single value is trivially consistent. An empty map or a zero mean is
    /// reported as inconsistent with an explicit flag.
    pub fn check(
        &self,
        method_values: &BTreeMap<MethodId, f64>,
        comparables_count: usize,
        days_since_sales_avg: f64,
    ) -> ValidationReport {
        let t = &self.thresholds;
        let values: Vec<f64> = method_values.values().copied().collect();
        let mut flags = Vec::new();

        let (consistency, max_relative) = match max_relative_deviation(&values) {
            Deviation::Empty => {
                flags.push("no method values to compare".to_string());
                (false, None)
            }
            Deviation::ZeroMean => {
                flags.push("division guard: mean of method values is zero".to_string());
                (false, None)
            }
            Deviation::Value { mean, max_relative } => {
                debug!("Method mean {:.2}, max relative deviation {:.4}", mean, max_relative);
                let consistent = max_relative <= t.consistency;
                if !consistent {
                    flags.push(format!(
                        "method divergence {:.1}% exceeds {:.0}%",
                        max_relative * 100.0,
                        t.consistency * 100.0
                    ));
                }
                (consistent, Some(max_relative))
            }
        };

        let mut bonus = 0.0;
        if comparables_count >= t.min_comparables_for_bonus {
            bonus += t.bonus_step;
        } else {
            flags.push(format!(
                "only {} comparables (bonus requires {})",
                comparables_count, t.min_comparables_for_bonus
            ));
        }
        if days_since_sales_avg < t.recent_sales_days {
            bonus += t.bonus_step;
        } else {
            flags.push(format!(
                "average comparable sale age {:.0} days is not recent",
                days_since_sales_avg
            ));
        }
        // Clamped: two large steps must not push the bonus past 1.0
        let confidence_bonus = round_to(bonus.clamp(0.0, 1.0), 2);
        let confidence_score = round_to((t.base_confidence + confidence_bonus).clamp(0.0, 1.0), 2);

        info!(
            "Cross-validation: consistency={}, bonus={:.2}, {} flags",
            consistency,
            confidence_bonus,
            flags.len()
        );

        ValidationReport {
            consistency,
            flags,
            confidence_bonus,
            max_relative_deviation: max_relative,
            confidence_score,
        }
    }
}

/// Optional freshness rule for comparable sales
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreshnessPolicy {
    pub max_age_days: i64,
    pub as_of: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct SourceConsistencyAuditor {
    dispersion_threshold: f64,
    freshness: Option<FreshnessPolicy>,
}

impl SourceConsistencyAuditor {
    pub fn new(dispersion_threshold: f64, freshness: Option<FreshnessPolicy>) -> Self {
        SourceConsistencyAuditor {
            dispersion_threshold,
            freshness,
        }
    }

    /// Dispersion of comparable sale prices and, if a policy is set, freshness.
    ///
    /// Without a freshness policy `freshness_ok` stays true; freshness is owned
    /// by whoever configures the policy.
    pub fn audit(&self, sources: &[ComparableSale]) -> SourceAudit {
        let mut issues = Vec::new();

        let prices: Vec<f64> = sources.iter().filter_map(|s| s.sale_price).collect();
        let dispersion = if prices.len() < 2 {
            issues.push(format!("only {} priced sources, dispersion not measured", prices.len()));
            0.0
        } else {
            match max_relative_deviation(&prices) {
                Deviation::Value { max_relative, .. } => max_relative,
                Deviation::ZeroMean | Deviation::Empty => {
                    issues.push("division guard: mean sale price is zero".to_string());
                    0.0
                }
            }
        };

        if dispersion > self.dispersion_threshold {
            issues.push(format!(
                "high price dispersion: {:.1}% exceeds {:.0}%",
                dispersion * 100.0,
                self.dispersion_threshold * 100.0
            ));
        }

        let freshness_ok = match self.freshness {
            None => true,
            Some(policy) => {
                let stale = sources
                    .iter()
                    .filter(|s| (policy.as_of - s.sale_date).num_days() > policy.max_age_days)
                    .count();
                if stale > 0 {
                    issues.push(format!(
                        "{} of {} sources older than {} days",
                        stale,
                        sources.len(),
                        policy.max_age_days
                    ));
                }
                stale == 0
            }
        };

        info!(
            "Source audit: dispersion={:.3}, freshness_ok={}, {} issues",
            dispersion,
            freshness_ok,
            issues.len()
        );

        SourceAudit {
            freshness_ok,
            dispersion,
            issues,
        }
    }
}
