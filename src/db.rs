use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

use crate::routes::NewRoute;

/// Event for audit trail - every ledger mutation leaves one behind
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Open (or create) the database file and make sure the schema exists
pub fn open_database(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database: {:?}", db_path))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    // ==========================================================================
    // Routes (telemetry records, baseline flag)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS routes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            route_id TEXT NOT NULL,
            vessel_type TEXT NOT NULL,
            fuel_type TEXT NOT NULL,
            year INTEGER NOT NULL,
            ghg_intensity REAL NOT NULL,
            fuel_consumption REAL NOT NULL,
            distance REAL NOT NULL,
            total_emissions REAL NOT NULL,
            is_baseline INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Banking: running balance per ship, per ship-year entry, transaction log
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bank_accounts (
            ship_id TEXT PRIMARY KEY,
            banked_balance REAL NOT NULL DEFAULT 0 CHECK (banked_balance >= 0),
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bank_entries (
            ship_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            banked REAL NOT NULL DEFAULT 0,
            applied REAL NOT NULL DEFAULT 0,
            borrowed REAL NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (ship_id, year)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bank_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tx_id TEXT UNIQUE NOT NULL,
            ship_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            kind TEXT NOT NULL,
            amount REAL NOT NULL,
            balance_after REAL NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Pools (immutable once written)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pools (
            pool_id TEXT PRIMARY KEY,
            year INTEGER NOT NULL,
            total_cb REAL NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pool_members (
            pool_id TEXT NOT NULL REFERENCES pools(pool_id),
            position INTEGER NOT NULL,
            ship_id TEXT NOT NULL,
            cb_before REAL NOT NULL,
            cb_after REAL NOT NULL,
            PRIMARY KEY (pool_id, position)
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_routes_ship_year ON routes(route_id, year)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bank_tx_ship ON bank_transactions(ship_id, year)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pools_year ON pools(year)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pool_members_ship ON pool_members(ship_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

/// Idempotency hash for route records - same telemetry imported twice is one row
pub fn route_idempotency_hash(route: &NewRoute) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        route.route_id,
        route.year,
        route.vessel_type,
        route.fuel_type,
        route.ghg_intensity,
        route.fuel_consumption,
        route.distance,
        route.total_emissions
    ));
    format!("{:x}", hasher.finalize())
}

pub fn load_csv(csv_path: &Path) -> Result<Vec<NewRoute>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut routes = Vec::new();

    for (line, result) in rdr.deserialize().enumerate() {
        let route: NewRoute = result.with_context(|| format!("Failed to deserialize route on row {}", line + 1))?;
        route
            .validate()
            .with_context(|| format!("Invalid route on row {}", line + 1))?;
        routes.push(route);
    }

    Ok(routes)
}

/// Insert routes in one SQL transaction. Duplicates (same hash) are skipped.
/// At most one imported row may carry the baseline flag; it replaces any existing baseline.
pub fn insert_routes(conn: &mut Connection, routes: &[NewRoute]) -> Result<usize> {
    for route in routes {
        route
            .validate()
            .with_context(|| format!("Invalid route {} ({})", route.route_id, route.year))?;
    }

    let baseline_count = routes.iter().filter(|r| r.is_baseline).count();
    if baseline_count > 1 {
        anyhow::bail!("{} routes are flagged as baseline, at most one is allowed", baseline_count);
    }

    let tx = conn.transaction()?;
    let mut inserted = 0;
    let mut duplicates = 0;

    for route in routes {
        let hash = route_idempotency_hash(route);

        let result = tx.execute(
            "INSERT INTO routes (
                idempotency_hash, route_id, vessel_type, fuel_type, year,
                ghg_intensity, fuel_consumption, distance, total_emissions
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                hash,
                route.route_id,
                route.vessel_type,
                route.fuel_type,
                route.year,
                route.ghg_intensity,
                route.fuel_consumption,
                route.distance,
                route.total_emissions,
            ],
        );

        match result {
            Ok(_) => {
                inserted += 1;
                let id = tx.last_insert_rowid();

                if route.is_baseline {
                    tx.execute(
                        "UPDATE routes SET is_baseline = CASE WHEN id = ?1 THEN 1 ELSE 0 END",
                        params![id],
                    )?;
                }

                let event = Event::new(
                    "route_imported",
                    "route",
                    &route.route_id,
                    serde_json::json!({
                        "id": id,
                        "year": route.year,
                        "ghgIntensity": route.ghg_intensity,
                        "fuelConsumption": route.fuel_consumption,
                    }),
                    "csv_importer",
                );
                insert_event(&tx, &event)?;
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                duplicates += 1;
                debug!(route_id = %route.route_id, year = route.year, "skipping duplicate route");
            }
            Err(e) => return Err(e.into()),
        }
    }

    tx.commit()?;
    info!(inserted, duplicates, "route import committed");

    Ok(inserted)
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> rusqlite::Result<()> {
    let data_json = event.data.to_string();

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(&timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

pub fn route_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM routes", [], |row| row.get(0))?;

    Ok(count)
}

/// RFC 3339 column → DateTime<Utc>, usable inside row mappers
pub(crate) fn parse_timestamp(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}
