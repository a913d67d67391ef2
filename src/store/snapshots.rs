//! Balance snapshot persistence.
//!
//! Queries operate on the nearest snapshot within a tolerance window, never
//! on interpolation; ties break toward the earlier instant. Writes are
//! idempotent on `(address, snapshot_instant)` and atomic per batch.

use crate::types::{addr_key, BalanceSnapshot};
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use eyre::WrapErr;
use parking_lot::RwLock;
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::info;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a batch in one transaction. Returns the number of rows
    /// actually written (conflicting rows are silently skipped).
    async fn save_snapshots_batch(&self, snapshots: &[BalanceSnapshot]) -> eyre::Result<u64>;

    /// For each address, the snapshot whose instant is nearest to `target`
    /// within `± tolerance_hours`. Addresses with no snapshot in range are
    /// absent from the map.
    async fn get_snapshots_batch_at_time(
        &self,
        network: &str,
        addresses: &[Address],
        target: DateTime<Utc>,
        tolerance_hours: u32,
    ) -> eyre::Result<HashMap<Address, BalanceSnapshot>>;

    /// The set of addresses ranked `<= top_k` at the snapshot instant nearest
    /// to `target` within tolerance. Empty when no snapshot is in range.
    async fn get_addresses_in_top_at_time(
        &self,
        network: &str,
        target: DateTime<Utc>,
        top_k: u32,
        tolerance_hours: u32,
    ) -> eyre::Result<HashSet<Address>>;

    async fn get_latest_snapshot_instant(&self, network: &str)
        -> eyre::Result<Option<DateTime<Utc>>>;

    /// All snapshots with `from <= snapshot_instant <= to`, loaded for the
    /// validator's pure check logic.
    async fn get_snapshots_in_window(
        &self,
        network: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> eyre::Result<Vec<BalanceSnapshot>>;
}

// ─── Postgres ────────────────────────────────────────────────────────────────

pub struct PgSnapshotStore {
    pool: PgPool,
}

const SNAPSHOT_COLUMNS: &str = "address, snapshot_instant, block_height, \
     native_balance::TEXT AS native_balance, weth_balance::TEXT AS weth_balance, \
     steth_balance::TEXT AS steth_balance, rank, network";

impl PgSnapshotStore {
    pub async fn new(pool: PgPool) -> eyre::Result<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> eyre::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balance_snapshot (
                address          TEXT NOT NULL,
                snapshot_instant TIMESTAMPTZ NOT NULL,
                block_height     BIGINT NOT NULL,
                native_balance   NUMERIC NOT NULL CHECK (native_balance >= 0),
                weth_balance     NUMERIC,
                steth_balance    NUMERIC,
                rank             INTEGER NOT NULL,
                network          TEXT NOT NULL,
                CONSTRAINT balance_snapshot_pkey PRIMARY KEY (address, snapshot_instant)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_snapshot_instant ON balance_snapshot (snapshot_instant)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_snapshot_rank_instant ON balance_snapshot (rank, snapshot_instant)",
        )
        .execute(&self.pool)
        .await?;

        info!("Snapshot schema initialized");
        Ok(())
    }
}

fn row_to_snapshot(row: &sqlx::postgres::PgRow) -> eyre::Result<BalanceSnapshot> {
    let address: String = row.try_get("address")?;
    let native: String = row.try_get("native_balance")?;
    let weth: Option<String> = row.try_get("weth_balance")?;
    let steth: Option<String> = row.try_get("steth_balance")?;

    Ok(BalanceSnapshot {
        address: address
            .parse::<Address>()
            .map_err(|e| eyre::eyre!("corrupt address {address}: {e}"))?,
        snapshot_instant: row.try_get("snapshot_instant")?,
        block_height: row.try_get::<i64, _>("block_height")? as u64,
        native_balance: parse_wei(&native)?,
        weth_balance: weth.as_deref().map(parse_wei).transpose()?,
        steth_balance: steth.as_deref().map(parse_wei).transpose()?,
        rank: row.try_get::<i32, _>("rank")? as u32,
        network: row.try_get("network")?,
    })
}

fn parse_wei(s: &str) -> eyre::Result<U256> {
    U256::from_str_radix(s, 10).wrap_err_with(|| format!("corrupt balance {s}"))
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn save_snapshots_batch(&self, snapshots: &[BalanceSnapshot]) -> eyre::Result<u64> {
        if snapshots.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        // Chunk to stay under Postgres parameter limits (65535 params / 8 cols)
        for chunk in snapshots.chunks(1000) {
            let mut qb = sqlx::QueryBuilder::new(
                "INSERT INTO balance_snapshot (address, snapshot_instant, block_height, \
                 native_balance, weth_balance, steth_balance, rank, network) ",
            );
            qb.push_values(chunk, |mut b, s| {
                b.push_bind(addr_key(&s.address))
                    .push_bind(s.snapshot_instant)
                    .push_bind(s.block_height as i64)
                    .push_bind(s.native_balance.to_string())
                    .push_unseparated("::NUMERIC")
                    .push_bind(s.weth_balance.map(|v| v.to_string()))
                    .push_unseparated("::NUMERIC")
                    .push_bind(s.steth_balance.map(|v| v.to_string()))
                    .push_unseparated("::NUMERIC")
                    .push_bind(s.rank as i32)
                    .push_bind(&s.network);
            });
            qb.push(" ON CONFLICT (address, snapshot_instant) DO NOTHING");
            written += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn get_snapshots_batch_at_time(
        &self,
        network: &str,
        addresses: &[Address],
        target: DateTime<Utc>,
        tolerance_hours: u32,
    ) -> eyre::Result<HashMap<Address, BalanceSnapshot>> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }
        let tolerance = Duration::hours(tolerance_hours as i64);
        let keys: Vec<String> = addresses.iter().map(addr_key).collect();

        let rows = sqlx::query(&format!(
            "SELECT DISTINCT ON (address) {SNAPSHOT_COLUMNS} \
             FROM balance_snapshot \
             WHERE network = $1 AND address = ANY($2) \
               AND snapshot_instant BETWEEN $3 AND $4 \
             ORDER BY address, \
                      ABS(EXTRACT(EPOCH FROM (snapshot_instant - $5))) ASC, \
                      snapshot_instant ASC"
        ))
        .bind(network)
        .bind(&keys)
        .bind(target - tolerance)
        .bind(target + tolerance)
        .bind(target)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let snapshot = row_to_snapshot(row)?;
            out.insert(snapshot.address, snapshot);
        }
        Ok(out)
    }

    async fn get_addresses_in_top_at_time(
        &self,
        network: &str,
        target: DateTime<Utc>,
        top_k: u32,
        tolerance_hours: u32,
    ) -> eyre::Result<HashSet<Address>> {
        let tolerance = Duration::hours(tolerance_hours as i64);

        let nearest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT snapshot_instant FROM balance_snapshot \
             WHERE network = $1 AND snapshot_instant BETWEEN $2 AND $3 \
             ORDER BY ABS(EXTRACT(EPOCH FROM (snapshot_instant - $4))) ASC, \
                      snapshot_instant ASC \
             LIMIT 1",
        )
        .bind(network)
        .bind(target - tolerance)
        .bind(target + tolerance)
        .bind(target)
        .fetch_optional(&self.pool)
        .await?;

        let Some(instant) = nearest else {
            return Ok(HashSet::new());
        };

        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT address FROM balance_snapshot \
             WHERE network = $1 AND snapshot_instant = $2 AND rank <= $3",
        )
        .bind(network)
        .bind(instant)
        .bind(top_k as i32)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|s| {
                s.parse::<Address>()
                    .map_err(|e| eyre::eyre!("corrupt address {s}: {e}"))
            })
            .collect()
    }

    async fn get_latest_snapshot_instant(
        &self,
        network: &str,
    ) -> eyre::Result<Option<DateTime<Utc>>> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(snapshot_instant) FROM balance_snapshot WHERE network = $1",
        )
        .bind(network)
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn get_snapshots_in_window(
        &self,
        network: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> eyre::Result<Vec<BalanceSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM balance_snapshot \
             WHERE network = $1 AND snapshot_instant BETWEEN $2 AND $3 \
             ORDER BY address, snapshot_instant"
        ))
        .bind(network)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_snapshot).collect()
    }
}

// ─── In-memory ───────────────────────────────────────────────────────────────

/// In-memory variant, keyed exactly like the table's primary key. Used by
/// tests and dry runs; semantics mirror the SQL implementation.
#[derive(Default)]
pub struct MemorySnapshotStore {
    rows: RwLock<BTreeMap<(String, DateTime<Utc>), BalanceSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save_snapshots_batch(&self, snapshots: &[BalanceSnapshot]) -> eyre::Result<u64> {
        let mut rows = self.rows.write();
        let mut written = 0u64;
        for s in snapshots {
            let key = (addr_key(&s.address), s.snapshot_instant);
            if !rows.contains_key(&key) {
                rows.insert(key, s.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn get_snapshots_batch_at_time(
        &self,
        network: &str,
        addresses: &[Address],
        target: DateTime<Utc>,
        tolerance_hours: u32,
    ) -> eyre::Result<HashMap<Address, BalanceSnapshot>> {
        let tolerance = Duration::hours(tolerance_hours as i64);
        let wanted: HashSet<String> = addresses.iter().map(addr_key).collect();
        let rows = self.rows.read();

        let mut out: HashMap<Address, BalanceSnapshot> = HashMap::new();
        for ((key, instant), snapshot) in rows.iter() {
            if snapshot.network != network || !wanted.contains(key) {
                continue;
            }
            let distance = (*instant - target).abs();
            if distance > tolerance {
                continue;
            }
            match out.get(&snapshot.address) {
                Some(existing) => {
                    let existing_distance = (existing.snapshot_instant - target).abs();
                    // Nearest wins; on a tie the earlier instant wins.
                    if distance < existing_distance
                        || (distance == existing_distance
                            && *instant < existing.snapshot_instant)
                    {
                        out.insert(snapshot.address, snapshot.clone());
                    }
                }
                None => {
                    out.insert(snapshot.address, snapshot.clone());
                }
            }
        }
        Ok(out)
    }

    async fn get_addresses_in_top_at_time(
        &self,
        network: &str,
        target: DateTime<Utc>,
        top_k: u32,
        tolerance_hours: u32,
    ) -> eyre::Result<HashSet<Address>> {
        let tolerance = Duration::hours(tolerance_hours as i64);
        let rows = self.rows.read();

        let mut nearest: Option<DateTime<Utc>> = None;
        for ((_, instant), snapshot) in rows.iter() {
            if snapshot.network != network || (*instant - target).abs() > tolerance {
                continue;
            }
            nearest = match nearest {
                None => Some(*instant),
                Some(best) => {
                    let (d_new, d_best) = ((*instant - target).abs(), (best - target).abs());
                    if d_new < d_best || (d_new == d_best && *instant < best) {
                        Some(*instant)
                    } else {
                        Some(best)
                    }
                }
            };
        }

        let Some(instant) = nearest else {
            return Ok(HashSet::new());
        };

        Ok(rows
            .values()
            .filter(|s| {
                s.network == network && s.snapshot_instant == instant && s.rank <= top_k
            })
            .map(|s| s.address)
            .collect())
    }

    async fn get_latest_snapshot_instant(
        &self,
        network: &str,
    ) -> eyre::Result<Option<DateTime<Utc>>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|s| s.network == network)
            .map(|s| s.snapshot_instant)
            .max())
    }

    async fn get_snapshots_in_window(
        &self,
        network: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> eyre::Result<Vec<BalanceSnapshot>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|s| {
                s.network == network && s.snapshot_instant >= from && s.snapshot_instant <= to
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use chrono::TimeZone;

    const A1: Address = address!("1111111111111111111111111111111111111111");
    const A2: Address = address!("2222222222222222222222222222222222222222");

    fn snap(address: Address, hour: u32, rank: u32, native: u64) -> BalanceSnapshot {
        BalanceSnapshot {
            address,
            snapshot_instant: Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap(),
            block_height: 22_000_000 + hour as u64 * 300,
            native_balance: U256::from(native),
            weth_balance: None,
            steth_balance: None,
            rank,
            network: "ethereum".to_string(),
        }
    }

    #[tokio::test]
    async fn batch_write_is_idempotent() {
        let store = MemorySnapshotStore::new();
        let rows = vec![snap(A1, 1, 1, 100), snap(A2, 1, 2, 50)];
        assert_eq!(store.save_snapshots_batch(&rows).await.unwrap(), 2);
        // Same keys again: nothing written.
        assert_eq!(store.save_snapshots_batch(&rows).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nearest_lookup_respects_tolerance() {
        let store = MemorySnapshotStore::new();
        store
            .save_snapshots_batch(&[snap(A1, 1, 1, 100), snap(A1, 5, 1, 200)])
            .await
            .unwrap();

        let target = Utc.with_ymd_and_hms(2025, 6, 1, 4, 30, 0).unwrap();
        let found = store
            .get_snapshots_batch_at_time("ethereum", &[A1], target, 1)
            .await
            .unwrap();
        assert_eq!(found[&A1].native_balance, U256::from(200u64));

        // 07:00 with 1h tolerance: nearest row is 05:00, two hours away.
        let target_far = Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap();
        let missing = store
            .get_snapshots_batch_at_time("ethereum", &[A1], target_far, 1)
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn nearest_lookup_tie_prefers_earlier() {
        let store = MemorySnapshotStore::new();
        store
            .save_snapshots_batch(&[snap(A1, 2, 1, 100), snap(A1, 4, 1, 200)])
            .await
            .unwrap();

        // Exactly between 02:00 and 04:00.
        let target = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();
        let found = store
            .get_snapshots_batch_at_time("ethereum", &[A1], target, 2)
            .await
            .unwrap();
        assert_eq!(found[&A1].native_balance, U256::from(100u64));
    }

    #[tokio::test]
    async fn top_at_time_filters_rank() {
        let store = MemorySnapshotStore::new();
        store
            .save_snapshots_batch(&[snap(A1, 3, 1, 100), snap(A2, 3, 50, 1)])
            .await
            .unwrap();

        let target = Utc.with_ymd_and_hms(2025, 6, 1, 3, 10, 0).unwrap();
        let top = store
            .get_addresses_in_top_at_time("ethereum", target, 10, 1)
            .await
            .unwrap();
        assert!(top.contains(&A1));
        assert!(!top.contains(&A2));
    }

    #[tokio::test]
    async fn latest_instant_per_network() {
        let store = MemorySnapshotStore::new();
        assert_eq!(
            store.get_latest_snapshot_instant("ethereum").await.unwrap(),
            None
        );
        store
            .save_snapshots_batch(&[snap(A1, 1, 1, 100), snap(A1, 9, 1, 100)])
            .await
            .unwrap();
        assert_eq!(
            store.get_latest_snapshot_instant("ethereum").await.unwrap(),
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap())
        );
        assert_eq!(
            store.get_latest_snapshot_instant("base").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn window_query_is_inclusive() {
        let store = MemorySnapshotStore::new();
        store
            .save_snapshots_batch(&[snap(A1, 1, 1, 100), snap(A1, 2, 1, 100), snap(A1, 3, 1, 100)])
            .await
            .unwrap();

        let from = Utc.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap();
        let rows = store
            .get_snapshots_in_window("ethereum", from, to)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }
}
