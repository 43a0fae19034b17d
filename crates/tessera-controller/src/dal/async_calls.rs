// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The lease-protected durable work queue.
//!
//! An async call moves `pending → executing → {success, error}`. Executing
//! calls are protected by a lease; when the lease reaper deletes an expired
//! lease the call's `lease_id` nulls out and acquisition treats the call as
//! pending again. Eligible calls are acquired oldest-`scheduled_at` first,
//! ties broken by row id.

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use tessera_schema::{Ref, RetryParams};

use crate::error::{DalError, DalResult, SqlxResultExt};

use super::{Dal, Lease};

/// Async call lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "async_call_state", rename_all = "lowercase")]
pub enum AsyncCallState {
    Pending,
    Executing,
    Success,
    Error,
}

/// What scheduled an async call. Persisted as a tagged string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncOrigin {
    /// An FSM transition: `fsm:<module>.<name>:<instance key>`.
    Fsm { fsm: Ref, key: String },
    /// A cron verb: `cron:<module>.<verb>`.
    Cron { verb: Ref },
    /// A pub/sub delivery: `sub:<module>.<subscription>`.
    PubSub { subscription: Ref },
}

impl fmt::Display for AsyncOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncOrigin::Fsm { fsm, key } => write!(f, "fsm:{fsm}:{key}"),
            AsyncOrigin::Cron { verb } => write!(f, "cron:{verb}"),
            AsyncOrigin::PubSub { subscription } => write!(f, "sub:{subscription}"),
        }
    }
}

impl FromStr for AsyncOrigin {
    type Err = DalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || DalError::Constraint(format!("malformed async origin {s:?}"));
        let (tag, rest) = s.split_once(':').ok_or_else(malformed)?;
        match tag {
            "fsm" => {
                let (fsm, key) = rest.split_once(':').ok_or_else(malformed)?;
                Ok(AsyncOrigin::Fsm {
                    fsm: fsm.parse().map_err(|_| malformed())?,
                    key: key.to_string(),
                })
            }
            "cron" => Ok(AsyncOrigin::Cron {
                verb: rest.parse().map_err(|_| malformed())?,
            }),
            "sub" => Ok(AsyncOrigin::PubSub {
                subscription: rest.parse().map_err(|_| malformed())?,
            }),
            _ => Err(malformed()),
        }
    }
}

/// A queued verb invocation.
#[derive(Debug, Clone)]
pub struct AsyncCall {
    pub id: i64,
    pub verb: Ref,
    pub state: AsyncCallState,
    pub origin: AsyncOrigin,
    pub scheduled_at: DateTime<Utc>,
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
    pub remaining_attempts: i32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub lease_id: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct AsyncCallRow {
    id: i64,
    verb: String,
    state: AsyncCallState,
    origin: String,
    scheduled_at: DateTime<Utc>,
    request: serde_json::Value,
    response: Option<serde_json::Value>,
    error: Option<String>,
    remaining_attempts: i32,
    backoff_ms: i64,
    max_backoff_ms: i64,
    lease_id: Option<i64>,
}

impl TryFrom<AsyncCallRow> for AsyncCall {
    type Error = DalError;

    fn try_from(row: AsyncCallRow) -> Result<Self, DalError> {
        Ok(AsyncCall {
            id: row.id,
            verb: row
                .verb
                .parse()
                .map_err(|_| DalError::Constraint(format!("malformed verb ref {:?}", row.verb)))?,
            state: row.state,
            origin: row.origin.parse()?,
            scheduled_at: row.scheduled_at,
            request: row.request,
            response: row.response,
            error: row.error,
            remaining_attempts: row.remaining_attempts,
            backoff: Duration::from_millis(row.backoff_ms as u64),
            max_backoff: Duration::from_millis(row.max_backoff_ms as u64),
            lease_id: row.lease_id,
        })
    }
}

/// An acquired call together with the lease protecting it.
#[derive(Debug)]
pub struct AcquiredCall {
    pub call: AsyncCall,
    pub lease: Lease,
}

/// Outcome reported when completing a call.
#[derive(Debug, Clone)]
pub enum CallResult {
    Success(serde_json::Value),
    Failure(String),
}

/// Extra work attached to a completion's transaction (FSM bookkeeping,
/// cron re-enqueue, subscription cursor release).
pub type TxHook<'a> = Box<
    dyn for<'c> FnOnce(
            &'c mut sqlx::PgConnection,
        ) -> Pin<Box<dyn Future<Output = DalResult<()>> + Send + 'c>>
        + Send
        + 'a,
>;

/// A no-op completion hook.
pub fn no_hook() -> TxHook<'static> {
    Box::new(|_| Box::pin(async { Ok(()) }))
}

const CALL_COLUMNS: &str = "id, verb, state, origin, scheduled_at, request, response, error, \
                            remaining_attempts, backoff_ms, max_backoff_ms, lease_id";

impl Dal {
    /// Enqueue an async call. Returns its id.
    pub async fn create_async_call(
        &self,
        verb: &Ref,
        origin: &AsyncOrigin,
        request: serde_json::Value,
        scheduled_at: DateTime<Utc>,
        retry: RetryParams,
    ) -> DalResult<i64> {
        let id = create_async_call(
            &self.pool,
            verb,
            origin,
            request,
            scheduled_at,
            retry,
        )
        .await?;
        debug!(call = id, verb = %verb, origin = %origin, "async call enqueued");
        Ok(id)
    }

    /// Acquire the oldest eligible call, leasing it for `ttl`.
    ///
    /// Eligible means pending-and-due, or executing with a reaped lease
    /// (reclaim). *Not found* when the queue is empty. Safe under
    /// concurrency: the candidate row is locked with `SKIP LOCKED`.
    pub async fn acquire_async_call(&self, ttl: Duration) -> DalResult<AcquiredCall> {
        let mut tx = self.pool.begin().await.trans()?;

        let row = sqlx::query_as::<_, AsyncCallRow>(&format!(
            r#"
            SELECT {CALL_COLUMNS} FROM async_calls
            WHERE (state = 'pending' AND scheduled_at <= NOW())
               OR (state = 'executing' AND lease_id IS NULL)
            ORDER BY scheduled_at, id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .fetch_optional(&mut *tx)
        .await
        .trans()?
        .ok_or_else(|| DalError::NotFound("async call".to_string()))?;

        let idempotency_key = Uuid::new_v4();
        let lease_key = format!("/system/async_call/{}:{}", row.id, idempotency_key);
        let lease_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO leases (idempotency_key, key, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 millisecond'))
            RETURNING id
            "#,
        )
        .bind(idempotency_key)
        .bind(&lease_key)
        .bind(ttl.as_millis() as i64)
        .fetch_one(&mut *tx)
        .await
        .trans()?;

        sqlx::query("UPDATE async_calls SET state = 'executing', lease_id = $2 WHERE id = $1")
            .bind(row.id)
            .bind(lease_id)
            .execute(&mut *tx)
            .await
            .trans()?;

        tx.commit().await.trans()?;

        let mut call: AsyncCall = row.try_into()?;
        call.state = AsyncCallState::Executing;
        call.lease_id = Some(lease_id);
        let lease = self.lease_handle(lease_id, lease_key, idempotency_key, ttl);
        debug!(call = call.id, verb = %call.verb, "async call acquired");
        Ok(AcquiredCall { call, lease })
    }

    /// Complete an acquired call.
    ///
    /// Success records the response; failure either reschedules with doubled
    /// (clamped) backoff while attempts remain, or parks the call in `error`.
    /// `hook` runs inside the same transaction. *Not found* if the call was
    /// reclaimed out from under the caller.
    pub async fn complete_async_call(
        &self,
        acquired: AcquiredCall,
        result: CallResult,
        hook: TxHook<'_>,
    ) -> DalResult<()> {
        let AcquiredCall { call, lease } = acquired;
        let mut tx = self.pool.begin().await.trans()?;

        let updated = match &result {
            CallResult::Success(response) => sqlx::query(
                r#"
                UPDATE async_calls
                SET state = 'success', response = $2, error = NULL, lease_id = NULL
                WHERE id = $1 AND state = 'executing'
                "#,
            )
            .bind(call.id)
            .bind(response)
            .execute(&mut *tx)
            .await
            .trans()?,
            CallResult::Failure(error) if call.remaining_attempts > 0 => sqlx::query(
                r#"
                UPDATE async_calls
                SET state = 'pending',
                    error = $2,
                    scheduled_at = NOW() + (backoff_ms * INTERVAL '1 millisecond'),
                    backoff_ms = LEAST(backoff_ms * 2, max_backoff_ms),
                    remaining_attempts = remaining_attempts - 1,
                    lease_id = NULL
                WHERE id = $1 AND state = 'executing'
                "#,
            )
            .bind(call.id)
            .bind(error)
            .execute(&mut *tx)
            .await
            .trans()?,
            CallResult::Failure(error) => sqlx::query(
                r#"
                UPDATE async_calls
                SET state = 'error', error = $2, lease_id = NULL
                WHERE id = $1 AND state = 'executing'
                "#,
            )
            .bind(call.id)
            .bind(error)
            .execute(&mut *tx)
            .await
            .trans()?,
        };
        if updated.rows_affected() == 0 {
            return Err(DalError::NotFound(format!(
                "async call {} (reclaimed)",
                call.id
            )));
        }

        hook(&mut *tx).await?;

        tx.commit().await.trans()?;
        lease.release().await?;
        debug!(call = call.id, "async call completed");
        Ok(())
    }

    pub async fn load_async_call(&self, id: i64) -> DalResult<AsyncCall> {
        let row = sqlx::query_as::<_, AsyncCallRow>(&format!(
            "SELECT {CALL_COLUMNS} FROM async_calls WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .trans()
        .map_err(|e| e.context(format!("async call {id}")))?;
        row.try_into()
    }
}

/// Enqueue an async call on any executor (also usable inside completion
/// hooks, e.g. cron re-enqueueing the next occurrence).
pub async fn create_async_call<'e, E>(
    executor: E,
    verb: &Ref,
    origin: &AsyncOrigin,
    request: serde_json::Value,
    scheduled_at: DateTime<Utc>,
    retry: RetryParams,
) -> DalResult<i64>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_scalar(
        r#"
        INSERT INTO async_calls
            (verb, origin, request, scheduled_at, remaining_attempts, backoff_ms, max_backoff_ms)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(verb.to_string())
    .bind(origin.to_string())
    .bind(request)
    .bind(scheduled_at)
    .bind(retry.count as i32)
    .bind(retry.min_backoff.as_millis() as i64)
    .bind(retry.max_backoff.as_millis() as i64)
    .fetch_one(executor)
    .await
    .trans()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_round_trip() {
        let origins = [
            AsyncOrigin::Fsm {
                fsm: Ref::new("test", "test"),
                key: "invoiceID".to_string(),
            },
            AsyncOrigin::Cron {
                verb: Ref::new("time", "tick"),
            },
            AsyncOrigin::PubSub {
                subscription: Ref::new("shop", "invoices"),
            },
        ];
        for origin in origins {
            let text = origin.to_string();
            let parsed: AsyncOrigin = text.parse().unwrap();
            assert_eq!(parsed, origin, "round-tripping {text}");
        }
    }

    #[test]
    fn origin_display_forms() {
        let origin = AsyncOrigin::Fsm {
            fsm: Ref::new("test", "test"),
            key: "invoiceID".to_string(),
        };
        assert_eq!(origin.to_string(), "fsm:test.test:invoiceID");
    }

    #[test]
    fn malformed_origins_rejected() {
        assert!("".parse::<AsyncOrigin>().is_err());
        assert!("fsm:nokey".parse::<AsyncOrigin>().is_err());
        assert!("unknown:a.b".parse::<AsyncOrigin>().is_err());
        assert!("cron:notaref".parse::<AsyncOrigin>().is_err());
    }
}
