// 🤝 Pooling Engine - Article 21 redistribution of CB across ships
//
// Allocation rule:
//   1. every deficit member is raised to zero
//   2. the total deficit is funded by surplus members pro rata to their surplus
//   3. the rounding remainder goes to the largest surplus holder
//      (ties broken by ship id ascending)
//
// Hard guarantees: sum(cb_after) == sum(cb_before) == total_cb, and a pool with
// total_cb < 0 is never written.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

use crate::compliance::compute_adjusted_cb;
use crate::config::ComplianceConfig;
use crate::db::{insert_event, parse_timestamp, Event};
use crate::error::{ComplianceError, ComplianceResult};

/// Minimum number of ships in a pool
pub const MIN_POOL_MEMBERS: usize = 2;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMember {
    pub ship_id: String,
    pub cb_before: f64,
    pub cb_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub pool_id: String,
    pub year: i32,
    #[serde(rename = "totalCB")]
    pub total_cb: f64,
    pub members: Vec<PoolMember>,
    pub created_at: DateTime<Utc>,
}

impl Pool {
    pub fn sum_after(&self) -> f64 {
        self.members.iter().map(|m| m.cb_after).sum()
    }
}

// ============================================================================
// ALLOCATION (pure)
// ============================================================================

fn tolerance(balances: &[(String, f64)]) -> f64 {
    let scale: f64 = balances.iter().map(|(_, cb)| cb.abs()).sum();
    1e-9 * scale.max(1.0)
}

/// Redistribute `(ship_id, cb_before)` pairs. Output keeps input order.
pub fn allocate(balances: &[(String, f64)]) -> ComplianceResult<Vec<PoolMember>> {
    let total_cb: f64 = balances.iter().map(|(_, cb)| cb).sum();
    if total_cb < 0.0 {
        return Err(ComplianceError::InvalidPool { total_cb });
    }

    let total_deficit: f64 = balances.iter().map(|(_, cb)| (-cb).max(0.0)).sum();
    let total_surplus: f64 = balances.iter().map(|(_, cb)| cb.max(0.0)).sum();

    let mut members: Vec<PoolMember> = balances
        .iter()
        .map(|(ship_id, cb_before)| {
            let cb_after = if total_deficit == 0.0 {
                *cb_before
            } else if *cb_before < 0.0 {
                0.0
            } else {
                cb_before - total_deficit * (cb_before / total_surplus)
            };
            PoolMember {
                ship_id: ship_id.clone(),
                cb_before: *cb_before,
                cb_after,
            }
        })
        .collect();

    // Largest surplus holder absorbs the rounding remainder
    let absorber = members
        .iter()
        .enumerate()
        .filter(|(_, m)| m.cb_before > 0.0)
        .max_by(|(_, a), (_, b)| {
            a.cb_before
                .total_cmp(&b.cb_before)
                .then_with(|| b.ship_id.cmp(&a.ship_id))
        })
        .map(|(index, _)| index);

    if let Some(index) = absorber {
        let allocated: f64 = members.iter().map(|m| m.cb_after).sum();
        members[index].cb_after += total_cb - allocated;
    }

    verify_allocation(&members, total_cb, tolerance(balances))?;
    Ok(members)
}

/// Post-conditions of an allocation; a breach is an engine bug
fn verify_allocation(members: &[PoolMember], total_cb: f64, tolerance: f64) -> ComplianceResult<()> {
    let sum_after: f64 = members.iter().map(|m| m.cb_after).sum();
    if (sum_after - total_cb).abs() > tolerance {
        return Err(ComplianceError::Internal(format!(
            "pool conservation broken: sum(cb_after) = {}, total = {}",
            sum_after, total_cb
        )));
    }

    for member in members {
        if member.cb_before < 0.0 && member.cb_after < member.cb_before - tolerance {
            return Err(ComplianceError::Internal(format!(
                "deficit member '{}' left worse off ({} -> {})",
                member.ship_id, member.cb_before, member.cb_after
            )));
        }
        if member.cb_before >= 0.0 && member.cb_after < -tolerance {
            return Err(ComplianceError::Internal(format!(
                "surplus member '{}' pushed into deficit ({} -> {})",
                member.ship_id, member.cb_before, member.cb_after
            )));
        }
    }

    Ok(())
}

// ============================================================================
// POOL CREATION (caller supplies the SQL transaction)
// ============================================================================

pub fn create_pool(
    conn: &Connection,
    config: &ComplianceConfig,
    year: i32,
    ship_ids: &[String],
) -> ComplianceResult<Pool> {
    let mut seen = HashSet::new();
    for ship_id in ship_ids {
        if ship_id.trim().is_empty() {
            return Err(ComplianceError::Validation("ship id must not be empty".to_string()));
        }
        if !seen.insert(ship_id.as_str()) {
            return Err(ComplianceError::DuplicateMember(ship_id.clone()));
        }
    }
    if ship_ids.len() < MIN_POOL_MEMBERS {
        return Err(ComplianceError::Validation(format!(
            "a pool needs at least {} members, got {}",
            MIN_POOL_MEMBERS,
            ship_ids.len()
        )));
    }

    let mut balances = Vec::with_capacity(ship_ids.len());
    for ship_id in ship_ids {
        let cb = compute_adjusted_cb(conn, config, ship_id, year).map_err(|err| match err {
            ComplianceError::NotFound(_) => ComplianceError::MemberNotFound {
                ship_id: ship_id.clone(),
                year,
            },
            other => other,
        })?;
        balances.push((ship_id.clone(), cb.adjusted_cb_gco2eq));
    }

    let members = allocate(&balances)?;

    let pool = Pool {
        pool_id: uuid::Uuid::new_v4().to_string(),
        year,
        total_cb: balances.iter().map(|(_, cb)| cb).sum(),
        members,
        created_at: Utc::now(),
    };

    insert_pool(conn, &pool)?;
    info!(pool_id = %pool.pool_id, year, total_cb = pool.total_cb, members = pool.members.len(), "pool created");

    Ok(pool)
}

fn insert_pool(conn: &Connection, pool: &Pool) -> ComplianceResult<()> {
    conn.execute(
        "INSERT INTO pools (pool_id, year, total_cb, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![pool.pool_id, pool.year, pool.total_cb, pool.created_at.to_rfc3339()],
    )?;

    for (position, member) in pool.members.iter().enumerate() {
        conn.execute(
            "INSERT INTO pool_members (pool_id, position, ship_id, cb_before, cb_after)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![pool.pool_id, position as i64, member.ship_id, member.cb_before, member.cb_after],
        )?;
    }

    let event = Event::new(
        "pool_created",
        "pool",
        &pool.pool_id,
        serde_json::to_value(pool)?,
        "pooling_engine",
    );
    insert_event(conn, &event)?;

    Ok(())
}

// ============================================================================
// READS
// ============================================================================

fn members_by_pool(conn: &Connection, year: Option<i32>) -> ComplianceResult<BTreeMap<String, Vec<PoolMember>>> {
    let mut stmt = conn.prepare(
        "SELECT m.pool_id, m.ship_id, m.cb_before, m.cb_after
         FROM pool_members m JOIN pools p ON p.pool_id = m.pool_id
         WHERE ?1 IS NULL OR p.year = ?1
         ORDER BY m.pool_id, m.position",
    )?;

    let mut grouped: BTreeMap<String, Vec<PoolMember>> = BTreeMap::new();
    let rows = stmt.query_map(params![year], |row| {
        Ok((
            row.get::<_, String>(0)?,
            PoolMember {
                ship_id: row.get(1)?,
                cb_before: row.get(2)?,
                cb_after: row.get(3)?,
            },
        ))
    })?;

    for row in rows {
        let (pool_id, member) = row?;
        grouped.entry(pool_id).or_default().push(member);
    }

    Ok(grouped)
}

/// Net CB a ship gained (+) or gave away (-) through pools in `year`
pub fn pool_delta(conn: &Connection, ship_id: &str, year: i32) -> ComplianceResult<f64> {
    let delta: f64 = conn.query_row(
        "SELECT COALESCE(SUM(m.cb_after - m.cb_before), 0.0)
         FROM pool_members m JOIN pools p ON p.pool_id = m.pool_id
         WHERE m.ship_id = ?1 AND p.year = ?2",
        params![ship_id, year],
        |row| row.get(0),
    )?;

    Ok(delta)
}

/// Pools in creation order, optionally for one year
pub fn list_pools(conn: &Connection, year: Option<i32>) -> ComplianceResult<Vec<Pool>> {
    let mut members = members_by_pool(conn, year)?;

    let mut stmt = conn.prepare(
        "SELECT pool_id, year, total_cb, created_at FROM pools
         WHERE ?1 IS NULL OR year = ?1
         ORDER BY rowid",
    )?;

    let headers = stmt
        .query_map(params![year], |row| {
            let created_at: String = row.get(3)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, f64>(2)?,
                parse_timestamp(&created_at)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(headers
        .into_iter()
        .map(|(pool_id, year, total_cb, created_at)| Pool {
            members: members.remove(&pool_id).unwrap_or_default(),
            pool_id,
            year,
            total_cb,
            created_at,
        })
        .collect())
}

pub fn get_pool(conn: &Connection, pool_id: &str) -> ComplianceResult<Pool> {
    let header = conn
        .query_row(
            "SELECT year, total_cb, created_at FROM pools WHERE pool_id = ?1",
            params![pool_id],
            |row| {
                let created_at: String = row.get(2)?;
                Ok((row.get::<_, i32>(0)?, row.get::<_, f64>(1)?, parse_timestamp(&created_at)?))
            },
        )
        .optional()?
        .ok_or_else(|| ComplianceError::NotFound(format!("pool {}", pool_id)))?;

    let mut stmt = conn.prepare(
        "SELECT ship_id, cb_before, cb_after FROM pool_members
         WHERE pool_id = ?1 ORDER BY position",
    )?;
    let members = stmt
        .query_map(params![pool_id], |row| {
            Ok(PoolMember {
                ship_id: row.get(0)?,
                cb_before: row.get(1)?,
                cb_after: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let (year, total_cb, created_at) = header;
    Ok(Pool {
        pool_id: pool_id.to_string(),
        year,
        total_cb,
        members,
        created_at,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connection_with, flat_config, route_with_cb};

    fn pairs(values: &[(&str, f64)]) -> Vec<(String, f64)> {
        values.iter().map(|(id, cb)| (id.to_string(), *cb)).collect()
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_pool_scenario_two_members() {
        let conn = connection_with(&[
            route_with_cb("R004", 2025, -200.0),
            route_with_cb("R005", 2025, 300.0),
        ]);

        let pool = create_pool(&conn, &flat_config(), 2025, &ids(&["R004", "R005"])).unwrap();

        assert_eq!(pool.total_cb, 100.0);
        assert_eq!(pool.members[0].ship_id, "R004");
        assert_eq!(pool.members[0].cb_before, -200.0);
        assert_eq!(pool.members[0].cb_after, 0.0);
        assert_eq!(pool.members[1].cb_after, 100.0);
        assert!((pool.sum_after() - 100.0).abs() < 1e-9);

        let stored = get_pool(&conn, &pool.pool_id).unwrap();
        assert_eq!(stored.members, pool.members);
    }

    #[test]
    fn test_negative_pool_persists_nothing() {
        let conn = connection_with(&[
            route_with_cb("R004", 2025, -200.0),
            route_with_cb("R005", 2025, 150.0),
        ]);

        let err = create_pool(&conn, &flat_config(), 2025, &ids(&["R004", "R005"])).unwrap_err();
        match err {
            ComplianceError::InvalidPool { total_cb } => assert!((total_cb - (-50.0)).abs() < 1e-9),
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(list_pools(&conn, None).unwrap().is_empty());
        assert!(list_pools(&conn, Some(2025)).unwrap().is_empty());
    }

    #[test]
    fn test_proportional_funding() {
        let members = allocate(&pairs(&[("A", -300.0), ("B", 400.0), ("C", 200.0), ("D", 0.0)])).unwrap();

        // Deficit 300 funded 2:1 by B and C
        assert_eq!(members[0].cb_after, 0.0);
        assert!((members[1].cb_after - 200.0).abs() < 1e-9);
        assert!((members[2].cb_after - 100.0).abs() < 1e-9);
        assert_eq!(members[3].cb_after, 0.0);

        let sum: f64 = members.iter().map(|m| m.cb_after).sum();
        assert!((sum - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_conservation_with_awkward_fractions() {
        let input = pairs(&[
            ("S1", 1_000_000.0 / 3.0),
            ("S2", -123_456.789),
            ("S3", 7.0 / 11.0),
            ("S4", -0.1),
            ("S5", 98_765.4321),
        ]);
        let total: f64 = input.iter().map(|(_, cb)| cb).sum();

        let members = allocate(&input).unwrap();
        let sum: f64 = members.iter().map(|m| m.cb_after).sum();

        assert!((sum - total).abs() < 1e-6);
        assert!(members.iter().all(|m| m.cb_after >= -1e-6));
    }

    #[test]
    fn test_no_deficit_keeps_balances() {
        let members = allocate(&pairs(&[("A", 10.0), ("B", 0.0), ("C", 5.0)])).unwrap();
        let after: Vec<f64> = members.iter().map(|m| m.cb_after).collect();
        assert_eq!(after, vec![10.0, 0.0, 5.0]);
    }

    #[test]
    fn test_zero_total_pool_zeroes_everyone() {
        let members = allocate(&pairs(&[("A", -50.0), ("B", 50.0)])).unwrap();
        assert!(members.iter().all(|m| m.cb_after.abs() < 1e-9));
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let input = pairs(&[("B", 100.0), ("A", 100.0), ("C", -150.0)]);
        assert_eq!(allocate(&input).unwrap(), allocate(&input).unwrap());
    }

    #[test]
    fn test_duplicate_member() {
        let conn = connection_with(&[
            route_with_cb("R004", 2025, -200.0),
            route_with_cb("R005", 2025, 300.0),
        ]);

        let err = create_pool(&conn, &flat_config(), 2025, &ids(&["R005", "R004", "R005"])).unwrap_err();
        assert!(matches!(err, ComplianceError::DuplicateMember(ref id) if id == "R005"));
    }

    #[test]
    fn test_member_not_found() {
        let conn = connection_with(&[route_with_cb("R005", 2025, 300.0)]);

        let err = create_pool(&conn, &flat_config(), 2025, &ids(&["R005", "R404"])).unwrap_err();
        assert!(matches!(err, ComplianceError::MemberNotFound { ref ship_id, year: 2025 } if ship_id == "R404"));
        assert!(list_pools(&conn, None).unwrap().is_empty());
    }

    #[test]
    fn test_too_few_members() {
        let conn = connection_with(&[route_with_cb("R005", 2025, 300.0)]);

        assert!(matches!(
            create_pool(&conn, &flat_config(), 2025, &ids(&["R005"])),
            Err(ComplianceError::Validation(_))
        ));
        assert!(matches!(
            create_pool(&conn, &flat_config(), 2025, &[]),
            Err(ComplianceError::Validation(_))
        ));
    }

    #[test]
    fn test_applied_banked_credit_counts_toward_pool() {
        let conn = connection_with(&[
            route_with_cb("R001", 2024, 500.0),
            route_with_cb("R001", 2025, -300.0),
            route_with_cb("R002", 2025, 100.0),
        ]);
        let config = flat_config();

        // Without banking the pool would be -200
        crate::banking::bank_surplus(&conn, &config, "R001", 2024, 250.0).unwrap();
        crate::banking::apply_banked(&conn, &config, "R001", 2025, 250.0).unwrap();

        let pool = create_pool(&conn, &config, 2025, &ids(&["R001", "R002"])).unwrap();
        assert_eq!(pool.members[0].cb_before, -50.0);
        assert!((pool.total_cb - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_banked_surplus_is_not_pooled_again() {
        let conn = connection_with(&[
            route_with_cb("R004", 2025, -200.0),
            route_with_cb("R005", 2025, 300.0),
        ]);
        let config = flat_config();

        crate::banking::bank_surplus(&conn, &config, "R005", 2025, 300.0).unwrap();

        let err = create_pool(&conn, &config, 2025, &ids(&["R004", "R005"])).unwrap_err();
        match err {
            ComplianceError::InvalidPool { total_cb } => assert!((total_cb - (-200.0)).abs() < 1e-9),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(list_pools(&conn, None).unwrap().is_empty());
        assert_eq!(crate::banking::banked_balance(&conn, "R005").unwrap(), 300.0);
    }

    #[test]
    fn test_partially_banked_member_pools_the_rest() {
        let conn = connection_with(&[
            route_with_cb("R004", 2025, -200.0),
            route_with_cb("R005", 2025, 300.0),
        ]);
        let config = flat_config();

        crate::banking::bank_surplus(&conn, &config, "R005", 2025, 100.0).unwrap();

        let pool = create_pool(&conn, &config, 2025, &ids(&["R004", "R005"])).unwrap();
        assert_eq!(pool.members[1].cb_before, 200.0);
        assert!(pool.total_cb.abs() < 1e-9);
        assert!(pool.members.iter().all(|m| m.cb_after.abs() < 1e-9));

        assert_eq!(pool_delta(&conn, "R005", 2025).unwrap(), -200.0);
        assert_eq!(pool_delta(&conn, "R004", 2025).unwrap(), 200.0);
        assert_eq!(pool_delta(&conn, "R004", 2026).unwrap(), 0.0);
    }

    #[test]
    fn test_list_pools_by_year() {
        let conn = connection_with(&[
            route_with_cb("A", 2025, 100.0),
            route_with_cb("B", 2025, -50.0),
            route_with_cb("A", 2026, 10.0),
            route_with_cb("B", 2026, 10.0),
        ]);
        let config = flat_config();

        let first = create_pool(&conn, &config, 2025, &ids(&["A", "B"])).unwrap();
        let second = create_pool(&conn, &config, 2026, &ids(&["B", "A"])).unwrap();

        let all = list_pools(&conn, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].pool_id, first.pool_id);
        assert_eq!(all[1].members[0].ship_id, "B");

        let only_2026 = list_pools(&conn, Some(2026)).unwrap();
        assert_eq!(only_2026.len(), 1);
        assert_eq!(only_2026[0].pool_id, second.pool_id);

        assert!(matches!(get_pool(&conn, "missing"), Err(ComplianceError::NotFound(_))));
    }
}
