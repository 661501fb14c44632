// Shared fixtures for unit tests

use rusqlite::Connection;

use crate::db::{insert_routes, setup_database};
use crate::routes::NewRoute;

pub fn test_route(route_id: &str, year: i32, intensity: f64) -> NewRoute {
    NewRoute {
        route_id: route_id.to_string(),
        vessel_type: "Container".to_string(),
        fuel_type: "HFO".to_string(),
        year,
        ghg_intensity: intensity,
        fuel_consumption: 5000.0,
        distance: 12000.0,
        total_emissions: 4500.0,
        is_baseline: false,
    }
}

pub fn insert_test_routes(conn: &mut Connection, routes: &[NewRoute]) {
    insert_routes(conn, routes).unwrap();
}

/// Route whose CB is exactly `cb` under `flat_config()`:
/// energy = fuel consumption, target 90, intensity 89 or 91 → cb = ±fuel
pub fn route_with_cb(ship_id: &str, year: i32, cb: f64) -> NewRoute {
    let mut route = test_route(ship_id, year, if cb >= 0.0 { 89.0 } else { 91.0 });
    route.fuel_consumption = cb.abs();
    route
}

/// Target 90 gCO2e/MJ for every year and 1 MJ per tonne, so CB values stay readable
pub fn flat_config() -> crate::config::ComplianceConfig {
    let mut config = crate::config::ComplianceConfig::with_flat_target(90.0);
    config.energy_mj_per_tonne = 1.0;
    config
}

/// In-memory store with the five reference routes, R001 as baseline
pub fn seeded_connection() -> Connection {
    let mut conn = Connection::open_in_memory().unwrap();
    setup_database(&conn).unwrap();

    let rows = [
        ("R001", "Container", "HFO", 2024, 91.0, 5000.0, 12000.0, 4500.0, true),
        ("R002", "BulkCarrier", "LNG", 2024, 88.0, 4800.0, 11500.0, 4200.0, false),
        ("R003", "Tanker", "MGO", 2024, 93.5, 5100.0, 12500.0, 4700.0, false),
        ("R004", "RoRo", "HFO", 2025, 89.2, 4900.0, 11800.0, 4300.0, false),
        ("R005", "Container", "LNG", 2025, 90.5, 4950.0, 11900.0, 4400.0, false),
    ];

    let routes: Vec<NewRoute> = rows
        .into_iter()
        .map(
            |(route_id, vessel, fuel, year, intensity, fuel_t, distance, emissions, baseline)| NewRoute {
                route_id: route_id.to_string(),
                vessel_type: vessel.to_string(),
                fuel_type: fuel.to_string(),
                year,
                ghg_intensity: intensity,
                fuel_consumption: fuel_t,
                distance,
                total_emissions: emissions,
                is_baseline: baseline,
            },
        )
        .collect();

    insert_test_routes(&mut conn, &routes);
    conn
}

/// In-memory store holding exactly the given routes
pub fn connection_with(routes: &[NewRoute]) -> Connection {
    let mut conn = Connection::open_in_memory().unwrap();
    setup_database(&conn).unwrap();
    insert_test_routes(&mut conn, routes);
    conn
}
