//! Host port pool.
//!
//! Every load balancer forwards to a host port that is unique across live
//! balancers. Claims live in the same store lookups read from and carry the
//! time they were made, so a claim left by a crash between claim and use is
//! found and returned by [`PortAllocator::reclaim`].

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use tracing::{debug, info};

use crate::db::DbError;
use crate::error::{SchedulerError, SchedulerResult};

/// Hands out and reclaims host ports.
#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Claim the lowest free port.
    async fn get(&self) -> SchedulerResult<u16>;

    /// Release a port. Releasing a free port is a no-op.
    async fn put(&self, port: u16) -> SchedulerResult<()>;

    /// Free every port claimed at or before `claimed_before` that is not in
    /// `live`. Returns the freed ports, ascending.
    async fn reclaim(
        &self,
        live: &BTreeSet<u16>,
        claimed_before: DateTime<Utc>,
    ) -> SchedulerResult<Vec<u16>>;
}

/// Postgres-backed pool over the `ports` table.
#[derive(Clone)]
pub struct PgPortAllocator {
    pool: PgPool,
}

impl PgPortAllocator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert every port of `range` that is not yet in the pool.
    ///
    /// Returns the number of ports added.
    pub async fn populate(&self, range: RangeInclusive<u16>) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO ports (port)
            SELECT generate_series($1::INTEGER, $2::INTEGER)
            ON CONFLICT (port) DO NOTHING
            "#,
        )
        .bind(i32::from(*range.start()))
        .bind(i32::from(*range.end()))
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        info!(
            start = *range.start(),
            end = *range.end(),
            added = result.rows_affected(),
            "Populated port pool"
        );
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PortAllocator for PgPortAllocator {
    async fn get(&self) -> SchedulerResult<u16> {
        // Single statement: the claim commits atomically or not at all.
        let port: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE ports
            SET taken = true, claimed_at = now()
            WHERE port = (
                SELECT port
                FROM ports
                WHERE taken IS NOT TRUE
                ORDER BY port
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING port
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let port = port.ok_or(SchedulerError::PortsExhausted)?;
        let port = u16::try_from(port).map_err(|_| DbError::InvalidPort(port))?;
        debug!(port, "Claimed port");
        Ok(port)
    }

    async fn put(&self, port: u16) -> SchedulerResult<()> {
        sqlx::query("UPDATE ports SET taken = false, claimed_at = NULL WHERE port = $1")
            .bind(i32::from(port))
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;

        debug!(port, "Released port");
        Ok(())
    }

    async fn reclaim(
        &self,
        live: &BTreeSet<u16>,
        claimed_before: DateTime<Utc>,
    ) -> SchedulerResult<Vec<u16>> {
        let live: Vec<i32> = live.iter().copied().map(i32::from).collect();
        let freed: Vec<i32> = sqlx::query_scalar(
            r#"
            UPDATE ports
            SET taken = false, claimed_at = NULL
            WHERE taken IS TRUE
              AND (claimed_at IS NULL OR claimed_at <= $1)
              AND port <> ALL($2::INTEGER[])
            RETURNING port
            "#,
        )
        .bind(claimed_before)
        .bind(&live)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let mut ports = freed
            .into_iter()
            .map(|port| u16::try_from(port).map_err(|_| DbError::InvalidPort(port)))
            .collect::<Result<Vec<_>, _>>()?;
        ports.sort_unstable();
        Ok(ports)
    }
}

#[derive(Debug, Default)]
struct PortPool {
    free: BTreeSet<u16>,
    /// Claimed ports and when they were claimed.
    taken: BTreeMap<u16, DateTime<Utc>>,
}

/// In-memory pool for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryPortAllocator {
    pool: Mutex<PortPool>,
}

impl MemoryPortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            pool: Mutex::new(PortPool {
                free: range.collect(),
                taken: BTreeMap::new(),
            }),
        }
    }

    /// Currently claimed ports, ascending.
    pub fn taken(&self) -> Vec<u16> {
        self.lock().taken.keys().copied().collect()
    }

    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PortPool> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PortAllocator for MemoryPortAllocator {
    async fn get(&self) -> SchedulerResult<u16> {
        let mut pool = self.lock();
        let port = pool
            .free
            .pop_first()
            .ok_or(SchedulerError::PortsExhausted)?;
        pool.taken.insert(port, Utc::now());
        Ok(port)
    }

    async fn put(&self, port: u16) -> SchedulerResult<()> {
        let mut pool = self.lock();
        if pool.taken.remove(&port).is_some() {
            pool.free.insert(port);
        }
        Ok(())
    }

    async fn reclaim(
        &self,
        live: &BTreeSet<u16>,
        claimed_before: DateTime<Utc>,
    ) -> SchedulerResult<Vec<u16>> {
        let mut pool = self.lock();
        let orphaned: Vec<u16> = pool
            .taken
            .iter()
            .filter(|(port, claimed_at)| !live.contains(*port) && **claimed_at <= claimed_before)
            .map(|(port, _)| *port)
            .collect();
        for port in &orphaned {
            pool.taken.remove(port);
            pool.free.insert(*port);
        }
        Ok(orphaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claims_lowest_free_port() {
        let ports = MemoryPortAllocator::new(9000..=9002);

        assert_eq!(ports.get().await.unwrap(), 9000);
        assert_eq!(ports.get().await.unwrap(), 9001);

        ports.put(9000).await.unwrap();
        assert_eq!(ports.get().await.unwrap(), 9000);
        assert_eq!(ports.taken(), vec![9000, 9001]);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let ports = MemoryPortAllocator::new(9000..=9000);

        ports.get().await.unwrap();
        assert!(matches!(
            ports.get().await,
            Err(SchedulerError::PortsExhausted)
        ));
    }

    #[tokio::test]
    async fn test_reclaim_frees_only_old_orphans() {
        let ports = MemoryPortAllocator::new(9000..=9003);
        let live = ports.get().await.unwrap();
        let orphan = ports.get().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let recent = ports.get().await.unwrap();

        let freed = ports
            .reclaim(&BTreeSet::from([live]), cutoff)
            .await
            .unwrap();

        assert_eq!(freed, vec![orphan]);
        assert_eq!(ports.taken(), vec![live, recent]);
        assert_eq!(ports.get().await.unwrap(), orphan);
    }

    #[tokio::test]
    async fn test_put_unclaimed_is_noop() {
        let ports = MemoryPortAllocator::new(9000..=9001);

        ports.put(9001).await.unwrap();
        ports.put(12345).await.unwrap();
        assert_eq!(ports.free_count(), 2);
        assert!(ports.taken().is_empty());
    }
}
