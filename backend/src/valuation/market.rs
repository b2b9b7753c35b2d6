//! Market comparison - position the valuation against local ppsf quartiles

use crate::valuation::types::{
    ComparableSale, FinalValuation, MarketPosition, Percentiles, ReferenceDataset, TrendContext,
};
use crate::valuation::utils::quartiles;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct MarketComparator {
    reference: Option<ReferenceDataset>,
}

impl MarketComparator {
    pub fn new() -> Self {
        MarketComparator::default()
    }

    /// Attach version metadata of the reference dataset backing the local comps
    pub fn with_reference(reference: Option<ReferenceDataset>) -> Self {
        MarketComparator { reference }
    }

    /// Compare the subject's unit price against local comps.
    ///
    /// Percentiles use linear interpolation between order statistics (see
    /// [`crate::valuation::utils::percentile`]). The delta is null, never zero,
    /// when there are no priced local comps or the median is zero. The trend
    /// context is passed through untouched.
    pub fn compare(
        &self,
        valuation: &FinalValuation,
        subject_sqft: u32,
        local_comps: &[ComparableSale],
        trend: Option<&TrendContext>,
    ) -> MarketPosition {
        let mut flags = Vec::new();

        let ppsf_subject = crate::price_per_sqft(valuation.value, subject_sqft);
        if ppsf_subject.is_none() {
            flags.push("subject ppsf undefined (non-positive valuation or sqft)".to_string());
        }

        let ppsfs: Vec<f64> = local_comps.iter().filter_map(ComparableSale::ppsf).collect();
        let percentiles = quartiles(&ppsfs).map(|(p25, p50, p75)| Percentiles { p25, p50, p75 });

        let delta_to_market_pct = match (ppsf_subject, percentiles) {
            (_, None) => {
                flags.push("delta undefined: no priced local comparables".to_string());
                None
            }
            (_, Some(p)) if p.p50 == 0.0 => {
                flags.push("division guard: local median ppsf is zero".to_string());
                None
            }
            (None, Some(_)) => None,
            (Some(subject), Some(p)) => Some((subject - p.p50) / p.p50 * 100.0),
        };

        if trend.is_none() {
            flags.push("no trend context supplied".to_string());
        }

        match delta_to_market_pct {
            Some(delta) => info!(
                "Subject ppsf {:.2} vs local median {:.2} ({:+.2}%)",
                ppsf_subject.unwrap_or_default(),
                percentiles.map(|p| p.p50).unwrap_or_default(),
                delta
            ),
            None => warn!("Market delta unavailable: {}", flags.join("; ")),
        }

        MarketPosition {
            ppsf_subject,
            percentiles,
            delta_to_market_pct,
            trend_context: trend.cloned(),
            comps_used: ppsfs.len(),
            reference_dataset: self.reference.clone(),
            flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::valuation::types::{CyclePhase, MethodId, Provenance};
    use chrono::{NaiveDate, Utc};
    use std::collections::{BTreeMap, BTreeSet};

    fn valuation(value: f64) -> FinalValuation {
        FinalValuation {
            value,
            weights: BTreeMap::from([(MethodId::Ppsf, 1.0)]),
            methods: Vec::new(),
            skipped: Vec::new(),
            computed_at: Utc::now(),
        }
    }

    /// Comps of 1 sqft so that sale price equals ppsf
    fn unit_comp(price: f64) -> ComparableSale {
        ComparableSale {
            address: format!("{} Unit Rd", price),
            sqft: Some(1),
            bedrooms: None,
            bathrooms: None,
            lot_size: None,
            year_built: None,
            condition: None,
            amenities: BTreeSet::new(),
            sale_price: Some(price),
            sale_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            distance_km: None,
            provenance: Provenance {
                source: "test".to_string(),
                collected_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_percentiles_interpolate_linearly() {
        let comps: Vec<ComparableSale> = [400_000.0, 420_000.0, 450_000.0, 480_000.0]
            .into_iter()
            .map(unit_comp)
            .collect();

        let position = MarketComparator::new().compare(&valuation(435_000.0), 1, &comps, None);
        let p = position.percentiles.unwrap();

        assert_eq!(p.p50, 435_000.0);
        assert_eq!(p.p25, 415_000.0);
        assert_eq!(p.p75, 457_500.0);
        assert_eq!(position.delta_to_market_pct, Some(0.0));
        assert_eq!(position.comps_used, 4);
    }

    #[test]
    fn test_delta_to_market() {
        let comps: Vec<ComparableSale> = [180.0, 200.0, 220.0].into_iter().map(unit_comp).collect();
        // 2000 sqft at 370k -> 185/sqft, 7.5% below the 200 median
        let position = MarketComparator::new().compare(&valuation(370_000.0), 2000, &comps, None);

        assert_eq!(position.ppsf_subject, Some(185.0));
        let delta = position.delta_to_market_pct.unwrap();
        assert!((delta + 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_comps_give_null_delta() {
        let position = MarketComparator::new().compare(&valuation(400_000.0), 2000, &[], None);

        assert!(position.percentiles.is_none());
        assert!(position.delta_to_market_pct.is_none());
        assert!(position.flags.iter().any(|f| f.contains("no priced local comparables")));
    }

    #[test]
    fn test_non_positive_valuation_leaves_ppsf_undefined() {
        let comps: Vec<ComparableSale> = [180.0, 200.0, 220.0].into_iter().map(unit_comp).collect();

        for value in [0.0, -50_000.0] {
            let position = MarketComparator::new().compare(&valuation(value), 2000, &comps, None);

            assert_eq!(position.ppsf_subject, None);
            assert!(position.delta_to_market_pct.is_none());
            assert!(position.percentiles.is_some());
            assert!(position.flags.iter().any(|f| f.contains("subject ppsf undefined")));

            let json = serde_json::to_value(&position).unwrap();
            assert!(json["ppsf_subject"].is_null());
            assert!(json["delta_to_market_pct"].is_null());
        }
    }

    #[test]
    fn test_trend_context_passes_through() {
        let trend = TrendContext {
            growth_rate: 0.04,
            volatility: 0.08,
            cycle_phase: CyclePhase::Expansion,
        };
        let comps = vec![unit_comp(200.0)];
        let position =
            MarketComparator::new().compare(&valuation(400_000.0), 2000, &comps, Some(&trend));

        assert_eq!(position.trend_context, Some(trend));
        assert!(!position.flags.iter().any(|f| f.contains("trend")));
    }

    #[test]
    fn test_reference_dataset_is_attached() {
        let reference = ReferenceDataset {
            name: "local_ppsf".to_string(),
            version: Some("2024-q2".to_string()),
            revision: 3,
            updated_at: Utc::now(),
        };
        let comparator = MarketComparator::with_reference(Some(reference.clone()));
        let position = comparator.compare(&valuation(400_000.0), 2000, &[], None);

        assert_eq!(position.reference_dataset, Some(reference));
    }
}
