//! Advisory functions - decision table, maintenance plan and negotiation points

use crate::valuation::types::{
    Condition, Decision, InputsSnapshot, MaintenanceItem, MaintenancePlan, MarketPosition,
    Priority, PropertyRecord, Recommendation, RiskLevel, SourceAudit, ValidationReport,
};
use tracing::{debug, info};

const BUY_BELOW_PCT: f64 = -5.0;
const SELL_ABOVE_PCT: f64 = 5.0;
const SHORT_HORIZON_MONTHS: u32 = 6;

/// Deterministic buy/hold/sell rules.
///
/// Rules run in a fixed order and later rules may only downgrade a buy to a
/// hold. Every rule that fires appends one rationale line.
pub fn advise(delta_to_market_pct: f64, risk_level: RiskLevel, horizon_months: u32) -> Recommendation {
    let mut rationale = Vec::new();

    // Rule 1: market position
    let mut decision = if delta_to_market_pct < BUY_BELOW_PCT {
        rationale.push(format!(
            "undervalued: {:.2}% below the local median ppsf",
            delta_to_market_pct.abs()
        ));
        Decision::Buy
    } else if delta_to_market_pct > SELL_ABOVE_PCT {
        rationale.push(format!(
            "overvalued: {:.2}% above the local median ppsf",
            delta_to_market_pct
        ));
        Decision::Sell
    } else {
        Decision::Hold
    };

    // Rule 2: risk override
    if risk_level == RiskLevel::High && decision == Decision::Buy {
        decision = Decision::Hold;
        rationale.push(format!("risk override: {} risk caps the decision at hold", risk_level));
    }

    // Rule 3: short horizon
    if horizon_months < SHORT_HORIZON_MONTHS && decision == Decision::Buy {
        decision = Decision::Hold;
        rationale.push(format!(
            "short horizon: {} months is under {}, liquidity comes first",
            horizon_months, SHORT_HORIZON_MONTHS
        ));
    }

    info!("Advice: {} ({} rules fired)", decision, rationale.len());

    Recommendation {
        decision,
        rationale,
        inputs_snapshot: InputsSnapshot {
            delta_to_market_pct: Some(delta_to_market_pct),
            risk_level,
            horizon_months,
        },
    }
}

/// Recommendation when the market delta is undefined: hold, with the reason
pub fn advise_without_delta(risk_level: RiskLevel, horizon_months: u32) -> Recommendation {
    Recommendation {
        decision: Decision::Hold,
        rationale: vec!["market delta unavailable: no basis to buy or sell".to_string()],
        inputs_snapshot: InputsSnapshot {
            delta_to_market_pct: None,
            risk_level,
            horizon_months,
        },
    }
}

/// Unit costs for the maintenance estimator
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceCosts {
    pub roof_per_sqft: f64,
    pub hvac_flat: f64,
    pub water_heater_flat: f64,
    pub exterior_paint_per_sqft: f64,
    pub interior_refresh_per_sqft: f64,
    pub systems_inspection_flat: f64,
    pub pool_service_flat: f64,
}

impl Default for MaintenanceCosts {
    fn default() -> Self {
        MaintenanceCosts {
            roof_per_sqft: 4.5,
            hvac_flat: 9_000.0,
            water_heater_flat: 1_800.0,
            exterior_paint_per_sqft: 2.0,
            interior_refresh_per_sqft: 8.0,
            systems_inspection_flat: 750.0,
            pool_service_flat: 1_200.0,
        }
    }
}

/// Prioritized maintenance items from age, condition and area
pub fn maintenance_plan(subject: &PropertyRecord, current_year: i32, costs: &MaintenanceCosts) -> MaintenancePlan {
    let sqft = subject.sqft as f64;
    let mut items = Vec::new();

    match subject.year_built {
        Some(year) => {
            let age = (current_year - year).max(0);
            if age >= 20 {
                items.push(item("roof replacement", Priority::High, sqft * costs.roof_per_sqft));
            }
            if age >= 15 {
                items.push(item("HVAC replacement", Priority::Medium, costs.hvac_flat));
            }
            if age >= 10 {
                items.push(item("water heater replacement", Priority::Medium, costs.water_heater_flat));
            }
            if age >= 8 {
                items.push(item("exterior repaint", Priority::Low, sqft * costs.exterior_paint_per_sqft));
            }
        }
        None => items.push(item(
            "inspection to establish system ages",
            Priority::High,
            costs.systems_inspection_flat,
        )),
    }

    match subject.condition {
        Some(Condition::Poor) => {
            items.push(item("structural and systems inspection", Priority::High, costs.systems_inspection_flat));
            items.push(item("interior renovation", Priority::High, sqft * costs.interior_refresh_per_sqft * 2.0));
        }
        Some(Condition::Fair) => {
            items.push(item("interior refresh", Priority::Medium, sqft * costs.interior_refresh_per_sqft));
        }
        _ => {}
    }

    if subject.amenities.contains("pool") {
        items.push(item("pool servicing", Priority::Low, costs.pool_service_flat));
    }

    // Stable sort keeps insertion order within a priority
    items.sort_by_key(|i| i.priority);
    let total_estimated_cost = items.iter().map(|i| i.estimated_cost).sum();
    debug!("Maintenance plan: {} items, {:.0} total", items.len(), total_estimated_cost);

    MaintenancePlan {
        items,
        total_estimated_cost,
    }
}

fn item(name: &str, priority: Priority, cost: f64) -> MaintenanceItem {
    MaintenanceItem {
        item: name.to_string(),
        priority,
        estimated_cost: cost.round(),
    }
}

/// Short, ordered list of points a buyer or seller can raise
pub fn negotiation_points(
    market: &MarketPosition,
    validation: &ValidationReport,
    audit: &SourceAudit,
    plan: &MaintenancePlan,
) -> Vec<String> {
    let mut points = Vec::new();

    if let (Some(delta), Some(p)) = (market.delta_to_market_pct, market.percentiles) {
        if delta > SELL_ABOVE_PCT {
            points.push(format!(
                "Valuation sits {:.1}% above the local median of ${:.0}/sqft; anchor offers near the median",
                delta, p.p50
            ));
        } else if delta < BUY_BELOW_PCT {
            points.push(format!(
                "Valuation sits {:.1}% below the local median of ${:.0}/sqft; expect competing offers",
                delta.abs(),
                p.p50
            ));
        }
    }

    if !validation.consistency {
        points.push(
            "Valuation methods disagree; request additional comparables before committing".to_string(),
        );
    }

    if audit.has_dispersion_issue() {
        points.push(format!(
            "Comparable prices disperse by {:.0}%; challenge comps outside the p25-p75 band",
            audit.dispersion * 100.0
        ));
    }

    if !audit.freshness_ok {
        points.push("Some comparable sales are stale; ask for recent sales evidence".to_string());
    }

    if plan.total_estimated_cost > 0.0 {
        let high: Vec<&str> = plan
            .items
            .iter()
            .filter(|i| i.priority == Priority::High)
            .map(|i| i.item.as_str())
            .collect();
        let mut point = format!(
            "Estimated maintenance of ${:.0} supports a price concession",
            plan.total_estimated_cost
        );
        if !high.is_empty() {
            point.push_str(&format!(" (urgent: {})", high.join(", ")));
        }
        points.push(point);
    }

    points
}
