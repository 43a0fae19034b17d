// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Time-bound ownership leases on keyed resources.
//!
//! A lease is a row in the `leases` table plus a background task renewing it
//! at half the TTL. Ownership is cooperative: once `expires_at` passes
//! without renewal the reaper deletes the row, and anything pointing at it
//! (async calls, via `ON DELETE SET NULL`) becomes reclaimable. A holder
//! must neither mutate nor assume ownership after losing its lease.

use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DalError, DalResult, SqlxResultExt};

use super::Dal;

/// A held lease. Release it with [`Lease::release`]; dropping it stops
/// renewal, after which the reaper collects the row at expiry.
pub struct Lease {
    pub id: i64,
    pub key: String,
    idempotency_key: Uuid,
    pool: PgPool,
    renewer: JoinHandle<()>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

impl Lease {
    /// Release the lease: stop renewing and delete the row.
    pub async fn release(self) -> DalResult<()> {
        self.renewer.abort();
        let result = sqlx::query("DELETE FROM leases WHERE idempotency_key = $1")
            .bind(self.idempotency_key)
            .execute(&self.pool)
            .await
            .trans()?;
        if result.rows_affected() == 0 {
            warn!(key = %self.key, "lease had already expired at release");
        }
        debug!(key = %self.key, "lease released");
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.renewer.abort();
    }
}

impl Dal {
    /// Acquire a lease on `key` for `ttl`. *Conflict* if it is already held.
    pub async fn acquire_lease(&self, key: &str, ttl: Duration) -> DalResult<Lease> {
        let idempotency_key = Uuid::new_v4();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO leases (idempotency_key, key, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 millisecond'))
            RETURNING id
            "#,
        )
        .bind(idempotency_key)
        .bind(key)
        .bind(ttl.as_millis() as i64)
        .fetch_one(&self.pool)
        .await
        .trans()
        .map_err(|e| {
            if e.is_conflict() {
                DalError::Conflict(format!("lease {key} is held"))
            } else {
                e
            }
        })?;
        Ok(self.lease_handle(id, key.to_string(), idempotency_key, ttl))
    }

    /// Build the in-process handle for an already-inserted lease row and
    /// start its renewal task.
    pub(super) fn lease_handle(
        &self,
        id: i64,
        key: String,
        idempotency_key: Uuid,
        ttl: Duration,
    ) -> Lease {
        let pool = self.pool.clone();
        let renew_pool = pool.clone();
        let renew_key = key.clone();
        let ttl_ms = ttl.as_millis() as i64;
        let renewer = tokio::spawn(async move {
            let interval = ttl / 2;
            loop {
                tokio::time::sleep(interval).await;
                let renewed = sqlx::query(
                    r#"
                    UPDATE leases
                    SET expires_at = NOW() + ($2 * INTERVAL '1 millisecond')
                    WHERE idempotency_key = $1
                    "#,
                )
                .bind(idempotency_key)
                .bind(ttl_ms)
                .execute(&renew_pool)
                .await;
                match renewed {
                    Ok(result) if result.rows_affected() == 0 => {
                        warn!(key = %renew_key, "lease lost, stopping renewal");
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(key = %renew_key, error = %e, "lease renewal failed");
                    }
                }
            }
        });
        Lease {
            id,
            key,
            idempotency_key,
            pool,
            renewer,
        }
    }

    /// Delete expired lease rows. Foreign keys with `ON DELETE SET NULL`
    /// (async calls) make their holders reclaimable. Returns the count.
    pub async fn expire_leases(&self) -> DalResult<u64> {
        let result = sqlx::query("DELETE FROM leases WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await
            .trans()?;
        if result.rows_affected() > 0 {
            debug!(count = result.rows_affected(), "expired leases reaped");
        }
        Ok(result.rows_affected())
    }
}
