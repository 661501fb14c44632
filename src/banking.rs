// 🏦 Banking Ledger - carry CB surplus forward in time
//
// Per ship-year entry:   banked (out of that year), applied (into that year),
//                        borrowed (pulled forward into that year)
// Per ship account:      banked_balance, the running pool of banked credit
//
// Invariants:
//   banked_balance >= 0
//   banked(year)   <= cb(year) + pooled(year)
//
// Every function that mutates expects to run inside the caller's SQL transaction,
// so the balance update and the transaction-log append commit together.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::compliance::{compute_adjusted_cb, compute_cb, energy_for_routes};
use crate::config::ComplianceConfig;
use crate::db::{insert_event, parse_timestamp, Event};
use crate::error::{ComplianceError, ComplianceResult};
use crate::routes::routes_for_ship_year;

/// Absorbs floating-point noise in balance comparisons
pub const AMOUNT_EPSILON: f64 = 1e-6;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BankTransactionKind {
    Bank,
    Apply,
    Borrow,
}

impl BankTransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BankTransactionKind::Bank => "bank",
            BankTransactionKind::Apply => "apply",
            BankTransactionKind::Borrow => "borrow",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bank" => Some(BankTransactionKind::Bank),
            "apply" => Some(BankTransactionKind::Apply),
            "borrow" => Some(BankTransactionKind::Borrow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankingEntry {
    pub ship_id: String,
    pub year: i32,
    pub banked: f64,
    pub applied: f64,
    pub borrowed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankTransaction {
    pub tx_id: String,
    pub ship_id: String,
    pub year: i32,
    pub kind: BankTransactionKind,
    pub amount: f64,
    pub balance_after: f64,
    pub created_at: DateTime<Utc>,
}

/// Result of a successful bank/apply/borrow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankingOutcome {
    pub ship_id: String,
    pub year: i32,
    pub banked_balance: f64,
    pub entry: BankingEntry,
    pub transaction: BankTransaction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankingRecords {
    pub ship_id: String,
    pub banked_balance: f64,
    pub entries: Vec<BankingEntry>,
    pub transactions: Vec<BankTransaction>,
}

// ============================================================================
// READS
// ============================================================================

/// Entry for a ship-year; zeros when nothing has happened yet
pub fn entry(conn: &Connection, ship_id: &str, year: i32) -> ComplianceResult<BankingEntry> {
    let found = conn
        .query_row(
            "SELECT banked, applied, borrowed FROM bank_entries WHERE ship_id = ?1 AND year = ?2",
            params![ship_id, year],
            |row| {
                Ok(BankingEntry {
                    ship_id: ship_id.to_string(),
                    year,
                    banked: row.get(0)?,
                    applied: row.get(1)?,
                    borrowed: row.get(2)?,
                })
            },
        )
        .optional()?;

    Ok(found.unwrap_or_else(|| BankingEntry {
        ship_id: ship_id.to_string(),
        year,
        ..BankingEntry::default()
    }))
}

pub fn banked_balance(conn: &Connection, ship_id: &str) -> ComplianceResult<f64> {
    let balance = conn
        .query_row(
            "SELECT banked_balance FROM bank_accounts WHERE ship_id = ?1",
            params![ship_id],
            |row| row.get(0),
        )
        .optional()?;

    Ok(balance.unwrap_or(0.0))
}

pub fn transactions(
    conn: &Connection,
    ship_id: &str,
    year: Option<i32>,
) -> ComplianceResult<Vec<BankTransaction>> {
    let mut stmt = conn.prepare(
        "SELECT tx_id, ship_id, year, kind, amount, balance_after, created_at
         FROM bank_transactions
         WHERE ship_id = ?1 AND (?2 IS NULL OR year = ?2)
         ORDER BY id",
    )?;

    let rows = stmt
        .query_map(params![ship_id, year], |row| {
            let kind: String = row.get(3)?;
            let created_at: String = row.get(6)?;

            Ok(BankTransaction {
                tx_id: row.get(0)?,
                ship_id: row.get(1)?,
                year: row.get(2)?,
                kind: BankTransactionKind::parse(&kind).ok_or_else(|| {
                    rusqlite::Error::InvalidColumnType(3, kind.clone(), rusqlite::types::Type::Text)
                })?,
                amount: row.get(4)?,
                balance_after: row.get(5)?,
                created_at: parse_timestamp(&created_at)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub fn records(
    conn: &Connection,
    ship_id: &str,
    year: Option<i32>,
) -> ComplianceResult<BankingRecords> {
    let mut stmt = conn.prepare(
        "SELECT year, banked, applied, borrowed FROM bank_entries
         WHERE ship_id = ?1 AND (?2 IS NULL OR year = ?2)
         ORDER BY year",
    )?;

    let entries = stmt
        .query_map(params![ship_id, year], |row| {
            Ok(BankingEntry {
                ship_id: ship_id.to_string(),
                year: row.get(0)?,
                banked: row.get(1)?,
                applied: row.get(2)?,
                borrowed: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BankingRecords {
        ship_id: ship_id.to_string(),
        banked_balance: banked_balance(conn, ship_id)?,
        entries,
        transactions: transactions(conn, ship_id, year)?,
    })
}

// ============================================================================
// MUTATIONS
// ============================================================================

fn validate_amount(amount: f64) -> ComplianceResult<()> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(ComplianceError::Validation(format!(
            "amount must be a positive number, got {}",
            amount
        )));
    }
    Ok(())
}

/// Bank part of a ship-year's surplus into the ship's running balance
pub fn bank_surplus(
    conn: &Connection,
    config: &ComplianceConfig,
    ship_id: &str,
    year: i32,
    amount: f64,
) -> ComplianceResult<BankingOutcome> {
    validate_amount(amount)?;

    // Earned surplus after pool transfers, capped by the adjusted balance
    let adjusted = compute_adjusted_cb(conn, config, ship_id, year)?;
    let mut current = entry(conn, ship_id, year)?;

    let earned = adjusted.cb_gco2eq + adjusted.pooled - current.banked;
    let available = earned.min(adjusted.adjusted_cb_gco2eq);
    if amount > available + AMOUNT_EPSILON {
        return Err(ComplianceError::InsufficientSurplus {
            requested: amount,
            available: available.max(0.0),
        });
    }

    current.banked += amount;
    let balance = banked_balance(conn, ship_id)? + amount;

    let outcome = write_mutation(conn, current, balance, BankTransactionKind::Bank, amount)?;
    info!(ship_id, year, amount, balance, "surplus banked");
    Ok(outcome)
}

/// Spend banked credit against a ship-year
pub fn apply_banked(
    conn: &Connection,
    config: &ComplianceConfig,
    ship_id: &str,
    year: i32,
    amount: f64,
) -> ComplianceResult<BankingOutcome> {
    validate_amount(amount)?;

    // Target year must exist
    compute_cb(conn, config, ship_id, year)?;

    let available = banked_balance(conn, ship_id)?;
    if amount > available + AMOUNT_EPSILON {
        return Err(ComplianceError::InsufficientBankedBalance {
            requested: amount,
            available,
        });
    }

    let mut current = entry(conn, ship_id, year)?;
    current.applied += amount;
    let balance = (available - amount).max(0.0);

    let outcome = write_mutation(conn, current, balance, BankTransactionKind::Apply, amount)?;
    info!(ship_id, year, amount, balance, "banked surplus applied");
    Ok(outcome)
}

/// Pull credit forward from the next period to cover a deficit (config-gated)
pub fn borrow_forward(
    conn: &Connection,
    config: &ComplianceConfig,
    ship_id: &str,
    year: i32,
    amount: f64,
) -> ComplianceResult<BankingOutcome> {
    if !config.borrowing.enabled {
        return Err(ComplianceError::Validation("borrowing is disabled".to_string()));
    }
    validate_amount(amount)?;

    for neighbour in [year - 1, year + 1] {
        if entry(conn, ship_id, neighbour)?.borrowed > 0.0 {
            return Err(ComplianceError::Validation(format!(
                "ship '{}' already borrowed in {}; consecutive borrowing is not allowed",
                ship_id, neighbour
            )));
        }
    }

    let adjusted = compute_adjusted_cb(conn, config, ship_id, year)?;
    let deficit = -adjusted.adjusted_cb_gco2eq;
    if deficit <= 0.0 {
        return Err(ComplianceError::Validation(format!(
            "ship '{}' has no deficit in {} to borrow against",
            ship_id, year
        )));
    }
    if amount > deficit + AMOUNT_EPSILON {
        return Err(ComplianceError::Validation(format!(
            "borrow amount {:.2} exceeds deficit {:.2}",
            amount, deficit
        )));
    }

    let routes = routes_for_ship_year(conn, ship_id, year)?;
    let cap = config.borrowing.cap_fraction * config.target_for(year) * energy_for_routes(&routes, config);

    let mut current = entry(conn, ship_id, year)?;
    if current.borrowed + amount > cap + AMOUNT_EPSILON {
        return Err(ComplianceError::Validation(format!(
            "borrowing {:.2} would exceed the cap of {:.2} for {}",
            current.borrowed + amount,
            cap,
            year
        )));
    }

    current.borrowed += amount;
    let balance = banked_balance(conn, ship_id)?;

    let outcome = write_mutation(conn, current, balance, BankTransactionKind::Borrow, amount)?;
    info!(ship_id, year, amount, cap, "compliance balance borrowed forward");
    Ok(outcome)
}

/// Persist entry + account + log row + audit event
fn write_mutation(
    conn: &Connection,
    entry: BankingEntry,
    balance: f64,
    kind: BankTransactionKind,
    amount: f64,
) -> ComplianceResult<BankingOutcome> {
    if balance < 0.0 {
        return Err(ComplianceError::Internal(format!(
            "banked balance for '{}' would become negative ({})",
            entry.ship_id, balance
        )));
    }

    let now = Utc::now();
    let now_str = now.to_rfc3339();

    conn.execute(
        "INSERT INTO bank_entries (ship_id, year, banked, applied, borrowed, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(ship_id, year) DO UPDATE SET
            banked = excluded.banked,
            applied = excluded.applied,
            borrowed = excluded.borrowed,
            updated_at = excluded.updated_at",
        params![entry.ship_id, entry.year, entry.banked, entry.applied, entry.borrowed, now_str],
    )?;

    conn.execute(
        "INSERT INTO bank_accounts (ship_id, banked_balance, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(ship_id) DO UPDATE SET
            banked_balance = excluded.banked_balance,
            updated_at = excluded.updated_at",
        params![entry.ship_id, balance, now_str],
    )?;

    let transaction = BankTransaction {
        tx_id: uuid::Uuid::new_v4().to_string(),
        ship_id: entry.ship_id.clone(),
        year: entry.year,
        kind,
        amount,
        balance_after: balance,
        created_at: now,
    };

    conn.execute(
        "INSERT INTO bank_transactions (tx_id, ship_id, year, kind, amount, balance_after, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            transaction.tx_id,
            transaction.ship_id,
            transaction.year,
            kind.as_str(),
            amount,
            balance,
            now_str,
        ],
    )?;

    let event = Event::new(
        &format!("banking_{}", kind.as_str()),
        "ship",
        &entry.ship_id,
        serde_json::json!({
            "txId": transaction.tx_id,
            "year": entry.year,
            "amount": amount,
            "bankedBalance": balance,
        }),
        "banking_ledger",
    );
    insert_event(conn, &event)?;

    Ok(BankingOutcome {
        ship_id: entry.ship_id.clone(),
        year: entry.year,
        banked_balance: balance,
        entry,
        transaction,
    })
}

// ============================================================================
// TESTS
// ============================================================================
