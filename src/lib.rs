// FuelEU Compliance Core - Library
// Exposes all modules for use in CLI, API server, and tests

pub mod config;
pub mod error;
pub mod db;
pub mod routes;         // Route Intensity Store
pub mod compliance;     // CB Calculator
pub mod banking;        // Banking Ledger
pub mod pooling;        // Pooling Engine
pub mod service;

#[cfg(feature = "server")]
pub mod api;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::{BorrowingConfig, ComparisonRule, ComplianceConfig, TargetStep};
pub use error::{ComplianceError, ComplianceResult};
pub use db::{
    Event,
    open_database, setup_database, load_csv, insert_routes, route_count,
    insert_event, get_events_for_entity,
};
pub use routes::{
    RouteRecord, NewRoute, RouteFilter, Comparison, ComparisonReport,
};
pub use compliance::{
    ComplianceBalance, AdjustedComplianceBalance,
    compliance_balance, energy_in_scope, percent_diff,
};
pub use banking::{
    BankingEntry, BankTransaction, BankTransactionKind, BankingOutcome, BankingRecords,
};
pub use pooling::{Pool, PoolMember, allocate};
pub use service::ComplianceService;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
