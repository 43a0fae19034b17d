// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FSM instances: per-instance single-flight transitions over async calls.
//!
//! Single flight is the product of three guards: the unique `(fsm, key)`
//! constraint, the `destination_state IS NULL` precondition on starting a
//! transition, and the per-instance lease taken while inspecting an
//! instance. At most one transition is in flight per instance.

use std::time::Duration;

use tracing::debug;

use tessera_schema::{Ref, RetryParams};

use crate::error::{DalError, DalResult, SqlxResultExt};
use crate::keys::lease_key;

use super::async_calls::{AsyncOrigin, create_async_call};
use super::{Dal, Lease};

/// FSM instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "fsm_status", rename_all = "lowercase")]
pub enum FsmStatus {
    Running,
    Completed,
    Failed,
}

/// An FSM instance row, held together with its lease.
#[derive(Debug)]
pub struct FsmInstance {
    /// Lease protecting this instance; the caller must release it.
    pub lease: Lease,
    pub fsm: Ref,
    pub key: String,
    pub status: FsmStatus,
    pub current_state: Option<Ref>,
    pub destination_state: Option<Ref>,
    pub async_call_id: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct FsmInstanceRow {
    status: FsmStatus,
    current_state: Option<String>,
    destination_state: Option<String>,
    async_call_id: Option<i64>,
}

fn parse_state(state: Option<String>) -> DalResult<Option<Ref>> {
    match state {
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| DalError::Constraint(format!("malformed state ref {s:?}"))),
        None => Ok(None),
    }
}

impl Dal {
    /// Send an event to an FSM instance, creating the instance if needed.
    ///
    /// This enqueues an async call for the destination state and binds it to
    /// the instance; it does not invoke anything. *Conflict* ("transition
    /// already executing") if the instance already has a transition in
    /// flight. No validation of the FSM definition is performed.
    pub async fn start_fsm_transition(
        &self,
        fsm: Ref,
        instance_key: &str,
        destination_state: Ref,
        request: serde_json::Value,
        retry: RetryParams,
    ) -> DalResult<()> {
        let mut tx = self.pool.begin().await.trans()?;

        let origin = AsyncOrigin::Fsm {
            fsm: fsm.clone(),
            key: instance_key.to_string(),
        };
        let async_call_id = create_async_call(
            &mut *tx,
            &destination_state,
            &origin,
            request,
            chrono::Utc::now(),
            retry,
        )
        .await
        .map_err(|e| e.context("failed to create FSM async call"))?;

        let started: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO fsm_instances (fsm, key, destination_state, async_call_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (fsm, key) DO UPDATE SET
                destination_state = EXCLUDED.destination_state,
                async_call_id = EXCLUDED.async_call_id,
                updated_at = NOW()
            WHERE fsm_instances.destination_state IS NULL
            RETURNING id
            "#,
        )
        .bind(fsm.to_string())
        .bind(instance_key)
        .bind(destination_state.to_string())
        .bind(async_call_id)
        .fetch_optional(&mut *tx)
        .await
        .trans()?;

        if started.is_none() {
            return Err(DalError::Conflict(
                "transition already executing".to_string(),
            ));
        }

        tx.commit().await.trans()?;
        debug!(fsm = %fsm, key = instance_key, to = %destination_state, "FSM transition started");
        Ok(())
    }

    /// Read an FSM instance under a 5-second lease.
    ///
    /// A missing row is synthesized as a running instance with no states.
    /// The caller must release the returned lease.
    pub async fn acquire_fsm_instance(&self, fsm: Ref, instance_key: &str) -> DalResult<FsmInstance> {
        let lease = self
            .acquire_lease(
                &lease_key("fsm_instance", &[&fsm.to_string(), instance_key]),
                Duration::from_secs(5),
            )
            .await
            .map_err(|e| e.context("failed to acquire FSM lease"))?;

        let row = sqlx::query_as::<_, FsmInstanceRow>(
            r#"
            SELECT status, current_state, destination_state, async_call_id
            FROM fsm_instances
            WHERE fsm = $1 AND key = $2
            "#,
        )
        .bind(fsm.to_string())
        .bind(instance_key)
        .fetch_optional(&self.pool)
        .await
        .trans()?;

        let row = row.unwrap_or(FsmInstanceRow {
            status: FsmStatus::Running,
            current_state: None,
            destination_state: None,
            async_call_id: None,
        });

        Ok(FsmInstance {
            lease,
            fsm,
            key: instance_key.to_string(),
            status: row.status,
            current_state: parse_state(row.current_state)?,
            destination_state: parse_state(row.destination_state)?,
            async_call_id: row.async_call_id,
        })
    }

    /// Complete the in-flight transition, promoting `current_state`.
    pub async fn finish_fsm_transition(&self, fsm: &Ref, instance_key: &str) -> DalResult<()> {
        finish_fsm_transition(&self.pool, fsm, instance_key).await
    }

    /// Mark the instance failed and clear the in-flight transition.
    pub async fn fail_fsm_instance(&self, fsm: &Ref, instance_key: &str) -> DalResult<()> {
        fail_fsm_instance(&self.pool, fsm, instance_key).await
    }

    /// Mark the instance completed and clear the in-flight transition.
    pub async fn succeed_fsm_instance(&self, fsm: &Ref, instance_key: &str) -> DalResult<()> {
        succeed_fsm_instance(&self.pool, fsm, instance_key).await
    }
}

/// Executor-generic variants, attachable to a completion transaction.
pub async fn finish_fsm_transition<'e, E: sqlx::PgExecutor<'e>>(
    executor: E,
    fsm: &Ref,
    instance_key: &str,
) -> DalResult<()> {
    let updated: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE fsm_instances
        SET current_state = destination_state,
            destination_state = NULL,
            async_call_id = NULL,
            updated_at = NOW()
        WHERE fsm = $1 AND key = $2
        RETURNING id
        "#,
    )
    .bind(fsm.to_string())
    .bind(instance_key)
    .fetch_optional(executor)
    .await
    .trans()?;
    updated
        .map(|_| ())
        .ok_or_else(|| DalError::NotFound(format!("fsm instance {fsm}:{instance_key}")))
}

pub async fn fail_fsm_instance<'e, E: sqlx::PgExecutor<'e>>(
    executor: E,
    fsm: &Ref,
    instance_key: &str,
) -> DalResult<()> {
    set_terminal_status(executor, fsm, instance_key, FsmStatus::Failed).await
}

pub async fn succeed_fsm_instance<'e, E: sqlx::PgExecutor<'e>>(
    executor: E,
    fsm: &Ref,
    instance_key: &str,
) -> DalResult<()> {
    set_terminal_status(executor, fsm, instance_key, FsmStatus::Completed).await
}

async fn set_terminal_status<'e, E: sqlx::PgExecutor<'e>>(
    executor: E,
    fsm: &Ref,
    instance_key: &str,
    status: FsmStatus,
) -> DalResult<()> {
    let updated: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE fsm_instances
        SET status = $3,
            destination_state = NULL,
            async_call_id = NULL,
            updated_at = NOW()
        WHERE fsm = $1 AND key = $2
        RETURNING id
        "#,
    )
    .bind(fsm.to_string())
    .bind(instance_key)
    .bind(status)
    .fetch_optional(executor)
    .await
    .trans()?;
    updated
        .map(|_| ())
        .ok_or_else(|| DalError::NotFound(format!("fsm instance {fsm}:{instance_key}")))
}
