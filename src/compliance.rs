// 📐 CB Calculator - Compliance Balance from GHG intensity
//
// Formula (per route record):
//   energy_in_scope = fuel_consumption * energy_mj_per_tonne
//   cb              = (target_intensity - actual_intensity) * energy_in_scope
//
// Positive = surplus, negative = deficit. Everything here is a pure function of
// route data and configuration, so a CB can be re-derived at any time for audit.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::banking;
use crate::config::{ComparisonRule, ComplianceConfig};
use crate::error::{ComplianceError, ComplianceResult};
use crate::pooling;
use crate::routes::{routes_for_ship_year, RouteRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceBalance {
    pub ship_id: String,
    pub year: i32,
    pub cb_gco2eq: f64,
}

/// CB after banking and borrowing have been taken into account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustedComplianceBalance {
    pub ship_id: String,
    pub year: i32,
    pub cb_gco2eq: f64,
    /// Surplus banked out of this year
    pub banked: f64,
    pub applied: f64,
    pub borrowed: f64,
    pub repayment_due: f64,
    /// Net CB moved in (+) or out (-) by pools for this year
    pub pooled: f64,
    pub adjusted_cb_gco2eq: f64,
}

// ============================================================================
// PURE FORMULAS
// ============================================================================

pub fn energy_in_scope(fuel_consumption: f64, energy_mj_per_tonne: f64) -> f64 {
    fuel_consumption * energy_mj_per_tonne
}

pub fn compliance_balance(target_intensity: f64, actual_intensity: f64, energy_mj: f64) -> f64 {
    (target_intensity - actual_intensity) * energy_mj
}

/// Sum of per-record balances for one ship-year
pub fn balance_for_routes(routes: &[RouteRecord], config: &ComplianceConfig) -> f64 {
    routes
        .iter()
        .map(|route| {
            compliance_balance(
                config.target_for(route.year),
                route.ghg_intensity,
                energy_in_scope(route.fuel_consumption, config.energy_mj_per_tonne),
            )
        })
        .sum()
}

pub fn energy_for_routes(routes: &[RouteRecord], config: &ComplianceConfig) -> f64 {
    routes
        .iter()
        .map(|route| energy_in_scope(route.fuel_consumption, config.energy_mj_per_tonne))
        .sum()
}

/// (comparison / baseline - 1) * 100
pub fn percent_diff(baseline_intensity: f64, comparison_intensity: f64) -> ComplianceResult<f64> {
    if baseline_intensity == 0.0 {
        return Err(ComplianceError::Validation(
            "baseline intensity is zero, percent difference is undefined".to_string(),
        ));
    }
    Ok((comparison_intensity - baseline_intensity) / baseline_intensity * 100.0)
}

pub fn is_compliant(
    rule: &ComparisonRule,
    baseline_intensity: f64,
    comparison_intensity: f64,
    target_intensity: f64,
) -> bool {
    match rule {
        ComparisonRule::Baseline => comparison_intensity <= baseline_intensity,
        ComparisonRule::Allowance { percent } => {
            comparison_intensity <= baseline_intensity * (1.0 + percent / 100.0)
        }
        ComparisonRule::RegulatoryTarget => comparison_intensity <= target_intensity,
    }
}

// ============================================================================
// STORE-BACKED COMPUTATION
// ============================================================================

pub fn compute_cb(
    conn: &Connection,
    config: &ComplianceConfig,
    ship_id: &str,
    year: i32,
) -> ComplianceResult<ComplianceBalance> {
    let routes = routes_for_ship_year(conn, ship_id, year)?;
    if routes.is_empty() {
        return Err(ComplianceError::route_not_found(ship_id, year));
    }

    Ok(ComplianceBalance {
        ship_id: ship_id.to_string(),
        year,
        cb_gco2eq: balance_for_routes(&routes, config),
    })
}

/// cb - banked + applied + borrowed - (borrowed last year * repayment multiplier) + pooled
pub fn compute_adjusted_cb(
    conn: &Connection,
    config: &ComplianceConfig,
    ship_id: &str,
    year: i32,
) -> ComplianceResult<AdjustedComplianceBalance> {
    let cb = compute_cb(conn, config, ship_id, year)?;
    let entry = banking::entry(conn, ship_id, year)?;
    let previous = banking::entry(conn, ship_id, year - 1)?;

    let pooled = pooling::pool_delta(conn, ship_id, year)?;

    let repayment_due = previous.borrowed * config.borrowing.repayment_multiplier;
    let adjusted = cb.cb_gco2eq - entry.banked + entry.applied + entry.borrowed - repayment_due + pooled;

    Ok(AdjustedComplianceBalance {
        ship_id: cb.ship_id,
        year,
        cb_gco2eq: cb.cb_gco2eq,
        banked: entry.banked,
        applied: entry.applied,
        borrowed: entry.borrowed,
        repayment_due,
        pooled,
        adjusted_cb_gco2eq: adjusted,
    })
}

// ============================================================================
// TESTS
// ============================================================================
