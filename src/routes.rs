// 🚢 Route Intensity Store - per-ship, per-year route telemetry
//
// The route id doubles as the ship identifier. Exactly one route may carry the
// baseline flag; every other route is compared against it.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::compliance::{is_compliant, percent_diff};
use crate::config::ComplianceConfig;
use crate::db::{insert_event, Event};
use crate::error::{ComplianceError, ComplianceResult};

// ============================================================================
// ROUTE RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRecord {
    /// Store-assigned identity, used to address baseline selection
    pub id: i64,
    pub route_id: String,
    pub vessel_type: String,
    pub fuel_type: String,
    pub year: i32,
    /// gCO2e/MJ
    pub ghg_intensity: f64,
    /// tonnes of fuel
    pub fuel_consumption: f64,
    /// km
    pub distance: f64,
    /// tonnes CO2e, stored for audit
    pub total_emissions: f64,
    pub is_baseline: bool,
}

impl RouteRecord {
    /// Ship identifier (routeId convention)
    pub fn ship_id(&self) -> &str {
        &self.route_id
    }
}

/// Already-computed telemetry handed to the store by ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRoute {
    pub route_id: String,
    pub vessel_type: String,
    pub fuel_type: String,
    pub year: i32,
    pub ghg_intensity: f64,
    pub fuel_consumption: f64,
    pub distance: f64,
    pub total_emissions: f64,
    #[serde(default)]
    pub is_baseline: bool,
}

impl NewRoute {
    pub fn validate(&self) -> ComplianceResult<()> {
        if self.route_id.trim().is_empty() {
            return Err(ComplianceError::Validation("routeId must not be empty".to_string()));
        }

        let numbers = [
            ("ghgIntensity", self.ghg_intensity),
            ("fuelConsumption", self.fuel_consumption),
            ("distance", self.distance),
            ("totalEmissions", self.total_emissions),
        ];
        for (name, value) in numbers {
            if !value.is_finite() || value < 0.0 {
                return Err(ComplianceError::Validation(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }
}

/// Optional filters for listing routes
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteFilter {
    pub vessel_type: Option<String>,
    pub fuel_type: Option<String>,
    pub year: Option<i32>,
}

impl RouteFilter {
    pub fn matches(&self, route: &RouteRecord) -> bool {
        self.vessel_type
            .as_ref()
            .map_or(true, |v| route.vessel_type.eq_ignore_ascii_case(v))
            && self
                .fuel_type
                .as_ref()
                .map_or(true, |f| route.fuel_type.eq_ignore_ascii_case(f))
            && self.year.map_or(true, |y| route.year == y)
    }
}

// ============================================================================
// COMPARISON
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub route_id: String,
    pub baseline_intensity: f64,
    pub comparison_intensity: f64,
    pub percent_diff: f64,
    pub compliant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    /// routeId of the active baseline
    pub baseline: String,
    pub comparisons: Vec<Comparison>,
}

// ============================================================================
// QUERIES
// ============================================================================

const ROUTE_COLUMNS: &str = "id, route_id, vessel_type, fuel_type, year, ghg_intensity,
                             fuel_consumption, distance, total_emissions, is_baseline";

fn route_from_row(row: &Row) -> rusqlite::Result<RouteRecord> {
    Ok(RouteRecord {
        id: row.get(0)?,
        route_id: row.get(1)?,
        vessel_type: row.get(2)?,
        fuel_type: row.get(3)?,
        year: row.get(4)?,
        ghg_intensity: row.get(5)?,
        fuel_consumption: row.get(6)?,
        distance: row.get(7)?,
        total_emissions: row.get(8)?,
        is_baseline: row.get(9)?,
    })
}

/// All routes in identity order
pub fn list_routes(conn: &Connection) -> ComplianceResult<Vec<RouteRecord>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM routes ORDER BY id", ROUTE_COLUMNS))?;

    let routes = stmt
        .query_map([], route_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(routes)
}

pub fn list_routes_filtered(
    conn: &Connection,
    filter: &RouteFilter,
) -> ComplianceResult<Vec<RouteRecord>> {
    Ok(list_routes(conn)?
        .into_iter()
        .filter(|route| filter.matches(route))
        .collect())
}

pub fn get_route(conn: &Connection, id: i64) -> ComplianceResult<RouteRecord> {
    conn.query_row(
        &format!("SELECT {} FROM routes WHERE id = ?1", ROUTE_COLUMNS),
        params![id],
        route_from_row,
    )
    .optional()?
    .ok_or_else(|| ComplianceError::NotFound(format!("route {}", id)))
}

/// Route records for one ship-year, identity order
pub fn routes_for_ship_year(
    conn: &Connection,
    ship_id: &str,
    year: i32,
) -> ComplianceResult<Vec<RouteRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM routes WHERE route_id = ?1 AND year = ?2 ORDER BY id",
        ROUTE_COLUMNS
    ))?;

    let routes = stmt
        .query_map(params![ship_id, year], route_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(routes)
}

pub fn baseline_route(conn: &Connection) -> ComplianceResult<Option<RouteRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM routes WHERE is_baseline = 1 ORDER BY id LIMIT 1", ROUTE_COLUMNS),
            [],
            route_from_row,
        )
        .optional()?)
}

// ============================================================================
// MUTATIONS (caller supplies the SQL transaction)
// ============================================================================

/// Mark `id` as the only baseline. One UPDATE flips every row, so no reader
/// ever sees zero or two baselines.
pub fn set_baseline(conn: &Connection, id: i64) -> ComplianceResult<RouteRecord> {
    let previous = baseline_route(conn)?;
    let route = get_route(conn, id)?;

    conn.execute(
        "UPDATE routes SET is_baseline = CASE WHEN id = ?1 THEN 1 ELSE 0 END
         WHERE is_baseline = 1 OR id = ?1",
        params![id],
    )?;

    let event = Event::new(
        "baseline_set",
        "route",
        &route.route_id,
        serde_json::json!({
            "id": id,
            "previous": previous.map(|p| p.id),
        }),
        "route_store",
    );
    insert_event(conn, &event)?;

    Ok(RouteRecord {
        is_baseline: true,
        ..route
    })
}

/// Compare every non-baseline route against the active baseline
pub fn get_comparison(
    conn: &Connection,
    config: &ComplianceConfig,
) -> ComplianceResult<ComparisonReport> {
    let routes = list_routes(conn)?;

    let baseline = routes
        .iter()
        .find(|route| route.is_baseline)
        .ok_or(ComplianceError::NoBaselineSet)?;

    let comparisons = routes
        .iter()
        .filter(|route| route.id != baseline.id)
        .map(|route| {
            Ok(Comparison {
                route_id: route.route_id.clone(),
                baseline_intensity: baseline.ghg_intensity,
                comparison_intensity: route.ghg_intensity,
                percent_diff: percent_diff(baseline.ghg_intensity, route.ghg_intensity)?,
                compliant: is_compliant(
                    &config.comparison,
                    baseline.ghg_intensity,
                    route.ghg_intensity,
                    config.target_for(route.year),
                ),
            })
        })
        .collect::<ComplianceResult<Vec<_>>>()?;

    Ok(ComparisonReport {
        baseline: baseline.route_id.clone(),
        comparisons,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ComparisonRule;
    use crate::testing::{seeded_connection, test_route, insert_test_routes};

    #[test]
    fn test_list_routes_identity_order() {
        let conn = seeded_connection();

        let routes = list_routes(&conn).unwrap();
        let ids: Vec<&str> = routes.iter().map(|r| r.route_id.as_str()).collect();

        assert_eq!(ids, vec!["R001", "R002", "R003", "R004", "R005"]);
        assert_eq!(routes, list_routes(&conn).unwrap(), "reads must be stable");
    }

    #[test]
    fn test_filtered_listing() {
        let conn = seeded_connection();

        let filter = RouteFilter {
            fuel_type: Some("lng".to_string()),
            ..RouteFilter::default()
        };
        let routes = list_routes_filtered(&conn, &filter).unwrap();
        assert_eq!(routes.len(), 2);
        assert!(routes.iter().all(|r| r.fuel_type == "LNG"));

        let filter = RouteFilter {
            year: Some(2025),
            ..RouteFilter::default()
        };
        assert_eq!(list_routes_filtered(&conn, &filter).unwrap().len(), 2);
    }

    #[test]
    fn test_set_baseline_is_exclusive() {
        let conn = seeded_connection();

        for id in [2, 3, 3, 1, 5] {
            set_baseline(&conn, id).unwrap();

            let baselines: Vec<i64> = list_routes(&conn)
                .unwrap()
                .into_iter()
                .filter(|r| r.is_baseline)
                .map(|r| r.id)
                .collect();
            assert_eq!(baselines, vec![id]);
        }
    }

    #[test]
    fn test_set_baseline_unknown_route() {
        let conn = seeded_connection();

        let err = set_baseline(&conn, 999).unwrap_err();
        assert!(matches!(err, ComplianceError::NotFound(_)));

        // Previous baseline untouched
        assert_eq!(baseline_route(&conn).unwrap().unwrap().route_id, "R001");
    }

    #[test]
    fn test_comparison_scenario() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::db::setup_database(&conn).unwrap();

        let mut baseline = test_route("R001", 2024, 85.0);
        baseline.is_baseline = true;
        insert_test_routes(&mut conn, &[baseline, test_route("R002", 2024, 90.0)]);

        let report = get_comparison(&conn, &ComplianceConfig::default()).unwrap();

        assert_eq!(report.baseline, "R001");
        assert_eq!(report.comparisons.len(), 1);

        let r002 = &report.comparisons[0];
        assert_eq!(r002.route_id, "R002");
        assert!((r002.percent_diff - 5.882352941).abs() < 1e-6);
        assert!(!r002.compliant);
    }

    #[test]
    fn test_comparison_allowance_rule() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::db::setup_database(&conn).unwrap();

        let mut baseline = test_route("R001", 2024, 85.0);
        baseline.is_baseline = true;
        insert_test_routes(&mut conn, &[baseline, test_route("R002", 2024, 86.0)]);

        let mut config = ComplianceConfig::default();
        config.comparison = ComparisonRule::Allowance { percent: 2.0 };

        let report = get_comparison(&conn, &config).unwrap();
        assert!(report.comparisons[0].compliant);
    }

    #[test]
    fn test_comparison_without_baseline() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::db::setup_database(&conn).unwrap();
        insert_test_routes(&mut conn, &[test_route("R001", 2024, 85.0)]);

        let err = get_comparison(&conn, &ComplianceConfig::default()).unwrap_err();
        assert!(matches!(err, ComplianceError::NoBaselineSet));
    }

    #[test]
    fn test_new_route_validation() {
        let mut route = test_route("R001", 2024, 85.0);
        assert!(route.validate().is_ok());

        route.fuel_consumption = f64::NAN;
        assert!(route.validate().is_err());

        let route = test_route("  ", 2024, 85.0);
        assert!(route.validate().is_err());
    }
}
