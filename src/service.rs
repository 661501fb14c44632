// Compliance Service - one entry point per external operation
//
// The SQLite connection is shared behind a mutex; every operation holds it for
// exactly one logical transaction. Mutations run in an IMMEDIATE transaction that
// commits only when the whole operation succeeds; any error drops (rolls back) it.

use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, warn};

use crate::banking::{self, BankingOutcome, BankingRecords};
use crate::compliance::{self, AdjustedComplianceBalance, ComplianceBalance};
use crate::config::ComplianceConfig;
use crate::db;
use crate::error::{ComplianceError, ComplianceResult};
use crate::pooling::{self, Pool};
use crate::routes::{self, ComparisonReport, NewRoute, RouteFilter, RouteRecord};

#[derive(Clone)]
pub struct ComplianceService {
    conn: Arc<Mutex<Connection>>,
    config: Arc<ComplianceConfig>,
}

impl ComplianceService {
    /// Wrap an already initialised connection
    pub fn new(conn: Connection, config: ComplianceConfig) -> Self {
        ComplianceService {
            conn: Arc::new(Mutex::new(conn)),
            config: Arc::new(config),
        }
    }

    pub fn open(db_path: &Path, config: ComplianceConfig) -> anyhow::Result<Self> {
        let conn = db::open_database(db_path)?;
        Ok(Self::new(conn, config))
    }

    pub fn in_memory(config: ComplianceConfig) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        db::setup_database(&conn)?;
        Ok(Self::new(conn, config))
    }

    pub fn config(&self) -> &ComplianceConfig {
        &self.config
    }

    fn lock(&self) -> ComplianceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ComplianceError::Internal("database lock poisoned".to_string()))
    }

    fn read<T>(&self, op: impl FnOnce(&Connection) -> ComplianceResult<T>) -> ComplianceResult<T> {
        let conn = self.lock()?;
        op(&conn)
    }

    fn write<T>(
        &self,
        name: &str,
        op: impl FnOnce(&Connection) -> ComplianceResult<T>,
    ) -> ComplianceResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        match op(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if err.is_domain() {
                    warn!(operation = name, error = %err, "operation rejected");
                } else {
                    error!(operation = name, error = %err, "operation failed, rolled back");
                }
                Err(err)
            }
        }
    }

    // ========================================================================
    // ROUTES
    // ========================================================================

    pub fn import_routes(&self, new_routes: &[NewRoute]) -> anyhow::Result<usize> {
        let mut conn = self.lock()?;
        db::insert_routes(&mut conn, new_routes)
    }

    pub fn list_routes(&self, filter: &RouteFilter) -> ComplianceResult<Vec<RouteRecord>> {
        self.read(|conn| routes::list_routes_filtered(conn, filter))
    }

    pub fn set_baseline(&self, id: i64) -> ComplianceResult<RouteRecord> {
        self.write("set_baseline", |conn| routes::set_baseline(conn, id))
    }

    pub fn comparison(&self) -> ComplianceResult<ComparisonReport> {
        self.read(|conn| routes::get_comparison(conn, &self.config))
    }

    // ========================================================================
    // COMPLIANCE BALANCE
    // ========================================================================

    pub fn compute_cb(&self, ship_id: &str, year: i32) -> ComplianceResult<ComplianceBalance> {
        self.read(|conn| compliance::compute_cb(conn, &self.config, ship_id, year))
    }

    pub fn adjusted_cb(&self, ship_id: &str, year: i32) -> ComplianceResult<AdjustedComplianceBalance> {
        self.read(|conn| compliance::compute_adjusted_cb(conn, &self.config, ship_id, year))
    }

    // ========================================================================
    // BANKING
    // ========================================================================

    pub fn bank_surplus(&self, ship_id: &str, year: i32, amount: f64) -> ComplianceResult<BankingOutcome> {
        self.write("bank_surplus", |conn| {
            banking::bank_surplus(conn, &self.config, ship_id, year, amount)
        })
    }

    pub fn apply_banked(&self, ship_id: &str, year: i32, amount: f64) -> ComplianceResult<BankingOutcome> {
        self.write("apply_banked", |conn| {
            banking::apply_banked(conn, &self.config, ship_id, year, amount)
        })
    }

    pub fn borrow_forward(&self, ship_id: &str, year: i32, amount: f64) -> ComplianceResult<BankingOutcome> {
        self.write("borrow_forward", |conn| {
            banking::borrow_forward(conn, &self.config, ship_id, year, amount)
        })
    }

    pub fn banking_records(&self, ship_id: &str, year: Option<i32>) -> ComplianceResult<BankingRecords> {
        self.read(|conn| banking::records(conn, ship_id, year))
    }

    // ========================================================================
    // POOLING
    // ========================================================================

    pub fn create_pool(&self, year: i32, ship_ids: &[String]) -> ComplianceResult<Pool> {
        self.write("create_pool", |conn| {
            pooling::create_pool(conn, &self.config, year, ship_ids)
        })
    }

    pub fn list_pools(&self, year: Option<i32>) -> ComplianceResult<Vec<Pool>> {
        self.read(|conn| pooling::list_pools(conn, year))
    }

    pub fn get_pool(&self, pool_id: &str) -> ComplianceResult<Pool> {
        self.read(|conn| pooling::get_pool(conn, pool_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{flat_config, route_with_cb};
    use std::thread;

    fn service(routes: &[NewRoute]) -> ComplianceService {
        let service = ComplianceService::in_memory(flat_config()).unwrap();
        service.import_routes(routes).unwrap();
        service
    }

    #[test]
    fn test_failed_pool_leaves_no_trace() {
        let service = service(&[
            route_with_cb("R004", 2025, -200.0),
            route_with_cb("R005", 2025, 150.0),
        ]);
        let members = vec!["R004".to_string(), "R005".to_string()];

        for _ in 0..3 {
            assert!(matches!(
                service.create_pool(2025, &members),
                Err(ComplianceError::InvalidPool { .. })
            ));
            assert!(service.list_pools(None).unwrap().is_empty());
        }
    }

    #[test]
    fn test_concurrent_bank_and_apply_do_not_lose_updates() {
        let service = service(&[route_with_cb("R001", 2024, 1000.0)]);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let service = service.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        if i % 2 == 0 {
                            service.bank_surplus("R001", 2024, 10.0).unwrap();
                        } else {
                            // May legitimately fail when nothing is banked yet
                            let _ = service.apply_banked("R001", 2024, 5.0);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let records = service.banking_records("R001", None).unwrap();
        let banked: f64 = records.transactions.iter()
            .filter(|t| t.kind == banking::BankTransactionKind::Bank)
            .map(|t| t.amount)
            .sum();
        let applied: f64 = records.transactions.iter()
            .filter(|t| t.kind == banking::BankTransactionKind::Apply)
            .map(|t| t.amount)
            .sum();

        assert_eq!(banked, 400.0);
        assert!((records.banked_balance - (banked - applied)).abs() < 1e-9);
        assert_eq!(records.entries[0].banked, 400.0);
        assert_eq!(records.entries[0].applied, applied);
    }

    #[test]
    fn test_concurrent_baseline_switches_keep_one_baseline() {
        let service = ComplianceService::in_memory(flat_config()).unwrap();
        service
            .import_routes(&[
                route_with_cb("A", 2024, 1.0),
                route_with_cb("B", 2024, 2.0),
                route_with_cb("C", 2024, 3.0),
            ])
            .unwrap();

        let handles: Vec<_> = (1..=3)
            .map(|id| {
                let service = service.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        service.set_baseline(id).unwrap();
                        let baselines = service
                            .list_routes(&RouteFilter::default())
                            .unwrap()
                            .into_iter()
                            .filter(|r| r.is_baseline)
                            .count();
                        assert_eq!(baselines, 1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    /// Adjusted CB plus what was banked out of the year, summed over ships
    fn ledger_total(service: &ComplianceService, ships: &[&str], year: i32) -> f64 {
        ships
            .iter()
            .map(|ship| {
                let adjusted = service.adjusted_cb(ship, year).unwrap();
                adjusted.adjusted_cb_gco2eq + adjusted.banked
            })
            .sum()
    }

    #[test]
    fn test_bank_then_pool_conserves_cb() {
        let service = service(&[
            route_with_cb("R004", 2025, -200.0),
            route_with_cb("R005", 2025, 300.0),
        ]);
        let ships = ["R004", "R005"];
        let members: Vec<String> = ships.iter().map(|s| s.to_string()).collect();

        service.bank_surplus("R005", 2025, 100.0).unwrap();
        let pool = service.create_pool(2025, &members).unwrap();

        assert!((pool.sum_after() - pool.total_cb).abs() < 1e-9);
        assert!((ledger_total(&service, &ships, 2025) - 100.0).abs() < 1e-9);
        assert!(matches!(
            service.bank_surplus("R005", 2025, 1.0),
            Err(ComplianceError::InsufficientSurplus { .. })
        ));
    }

    #[test]
    fn test_pool_then_bank_conserves_cb() {
        let service = service(&[
            route_with_cb("R004", 2025, -200.0),
            route_with_cb("R005", 2025, 300.0),
        ]);
        let ships = ["R004", "R005"];
        let members: Vec<String> = ships.iter().map(|s| s.to_string()).collect();

        service.create_pool(2025, &members).unwrap();
        assert!((ledger_total(&service, &ships, 2025) - 100.0).abs() < 1e-9);

        service.bank_surplus("R005", 2025, 100.0).unwrap();
        assert!((ledger_total(&service, &ships, 2025) - 100.0).abs() < 1e-9);
        assert_eq!(service.banking_records("R005", None).unwrap().banked_balance, 100.0);

        assert!(matches!(
            service.bank_surplus("R005", 2025, 1.0),
            Err(ComplianceError::InsufficientSurplus { .. })
        ));
    }

    #[test]
    fn test_cb_reads_are_stable() {
        let service = service(&[route_with_cb("R001", 2024, 500.0)]);

        let first = service.compute_cb("R001", 2024).unwrap();
        assert_eq!(first.cb_gco2eq, 500.0);
        assert_eq!(first, service.compute_cb("R001", 2024).unwrap());
    }
}
