//! Per-org concurrency cap, enforced with an advisory lock plus a counted
//! read inside the caller's transaction.
//!
//! The lock serializes concurrent admission checks for one org; the count
//! then decides. Callers pass their own transaction so the INSERT that
//! admits the job runs under the same lock — checking in one transaction
//! and inserting in another would reopen the TOCTOU window the lock
//! exists to close.

use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

use crate::executions::count_in_flight;
use fabric_common::error::Error;

/// Advisory lock namespace for org capacity. The second key is
/// `hashtext(org_id)`.
pub const CAPACITY_LOCK_NAMESPACE: i32 = 1001;

/// Default cap; overridable via MAX_ACTIVE_JOBS_PER_ORG within [1, 1000].
pub const DEFAULT_MAX_ACTIVE_JOBS_PER_ORG: u32 = 10;

pub const LOCK_CONTENTION_RETRY_AFTER: Duration = Duration::from_secs(5);
pub const CAPACITY_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Clamp a configured cap into its allowed range.
pub fn clamp_max_active_jobs(configured: u32) -> u32 {
    configured.clamp(1, 1000)
}

/// Authoritative capacity check. Returns [`Error::RateLimited`] with a
/// 5 s hint when the advisory lock is contended and a 60 s hint when the
/// org is at its cap. The lock releases when the caller's transaction
/// ends.
pub async fn assert_org_capacity(
    tx: &mut Transaction<'_, Postgres>,
    org_id: &str,
    max_active: u32,
) -> Result<(), Error> {
    let locked: bool =
        sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1::int, hashtext($2::text))")
            .bind(CAPACITY_LOCK_NAMESPACE)
            .bind(org_id)
            .fetch_one(&mut **tx)
            .await?;
    if !locked {
        return Err(Error::rate_limited(
            format!("capacity check for org {org_id} is contended"),
            LOCK_CONTENTION_RETRY_AFTER,
        ));
    }

    let in_flight = count_in_flight(&mut **tx, org_id).await?;
    if in_flight >= i64::from(max_active) {
        return Err(Error::rate_limited(
            format!("org {org_id} has {in_flight} jobs in flight (cap {max_active})"),
            CAPACITY_RETRY_AFTER,
        ));
    }
    Ok(())
}

/// Unlocked count of in-flight executions. Display-only: without the
/// advisory lock this number may be stale by the time it is read, so it
/// must never gate admission.
pub async fn check_org_capacity(pool: &PgPool, org_id: &str) -> Result<i64, Error> {
    count_in_flight(pool, org_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executions::insert_started_execution;
    use fabric_common::error::Error;

    #[test]
    fn cap_is_clamped_to_its_bounds() {
        assert_eq!(clamp_max_active_jobs(0), 1);
        assert_eq!(clamp_max_active_jobs(10), 10);
        assert_eq!(clamp_max_active_jobs(1000), 1000);
        assert_eq!(clamp_max_active_jobs(5000), 1000);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn admits_under_the_cap_and_rejects_at_it(pool: PgPool) {
        let max_active = 2;

        for n in 0..max_active {
            let mut tx = pool.begin().await.unwrap();
            assert_org_capacity(&mut tx, "org-1", max_active).await.unwrap();
            insert_started_execution(
                &mut *tx,
                "domain-export",
                "org-1",
                &format!("key-{n}"),
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }

        let mut tx = pool.begin().await.unwrap();
        let error = assert_org_capacity(&mut tx, "org-1", max_active)
            .await
            .unwrap_err();
        match error {
            Error::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, CAPACITY_RETRY_AFTER)
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }

        // Other orgs are unaffected.
        assert_org_capacity(&mut tx, "org-2", max_active).await.unwrap();
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn terminal_executions_free_capacity(pool: PgPool) {
        let mut tx = pool.begin().await.unwrap();
        let execution = insert_started_execution(&mut *tx, "domain-export", "org-1", "key-1")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(check_org_capacity(&pool, "org-1").await.unwrap(), 1);

        crate::executions::mark_execution(
            &pool,
            execution.id,
            crate::executions::ExecutionStatus::Completed,
            None,
        )
        .await
        .unwrap();

        assert_eq!(check_org_capacity(&pool, "org-1").await.unwrap(), 0);

        let mut tx = pool.begin().await.unwrap();
        assert_org_capacity(&mut tx, "org-1", 1).await.unwrap();
    }
}
