// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner fleet state: heartbeats, reservation, expiry, liveness.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{DalError, DalResult, SqlxResultExt};

use super::Dal;

/// Runner lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "runner_state", rename_all = "lowercase")]
pub enum RunnerState {
    Idle,
    Reserved,
    Assigned,
    Dead,
}

/// A runner row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Runner {
    pub id: i64,
    pub key: String,
    pub endpoint: String,
    pub state: RunnerState,
    pub labels: serde_json::Value,
    pub last_seen: DateTime<Utc>,
    pub reservation_timeout: Option<DateTime<Utc>>,
    pub module_name: Option<String>,
    pub deployment_key: Option<String>,
}

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "controller_state", rename_all = "lowercase")]
pub enum ControllerState {
    Live,
    Dead,
}

/// A controller row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Controller {
    pub id: i64,
    pub key: String,
    pub endpoint: String,
    pub state: ControllerState,
    pub last_seen: DateTime<Utc>,
}

const RUNNER_COLUMNS: &str = r#"
    r.id, r.key, r.endpoint, r.state, r.labels, r.last_seen,
    r.reservation_timeout, r.module_name,
    (SELECT d.key FROM deployments d WHERE d.id = r.deployment_id) AS deployment_key
"#;

impl Dal {
    /// Heartbeat upsert for a runner.
    ///
    /// A second non-dead runner claiming the same endpoint violates the
    /// partial unique index and surfaces as *conflict*. A heartbeat naming a
    /// missing deployment is *not found*.
    pub async fn upsert_runner(
        &self,
        key: &str,
        endpoint: &str,
        state: RunnerState,
        labels: serde_json::Value,
        deployment_key: Option<&str>,
    ) -> DalResult<()> {
        let deployment_id: Option<i64> = match deployment_key {
            Some(dkey) => Some(
                sqlx::query_scalar("SELECT id FROM deployments WHERE key = $1")
                    .bind(dkey)
                    .fetch_optional(&self.pool)
                    .await
                    .trans()?
                    .ok_or_else(|| DalError::NotFound(format!("deployment {dkey}")))?,
            ),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO runners (key, endpoint, state, labels, deployment_id, last_seen)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (key) DO UPDATE SET
                endpoint = $2,
                state = $3,
                labels = $4,
                deployment_id = $5,
                last_seen = NOW()
            "#,
        )
        .bind(key)
        .bind(endpoint)
        .bind(state)
        .bind(&labels)
        .bind(deployment_id)
        .execute(&self.pool)
        .await
        .trans()
        .map_err(|e| e.context(format!("runner {key}")))?;
        Ok(())
    }

    pub async fn get_runner(&self, key: &str) -> DalResult<Runner> {
        sqlx::query_as::<_, Runner>(&format!(
            "SELECT {RUNNER_COLUMNS} FROM runners r WHERE r.key = $1"
        ))
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .trans()
        .map_err(|e| e.context(format!("runner {key}")))
    }

    pub async fn get_active_runners(&self) -> DalResult<Vec<Runner>> {
        sqlx::query_as::<_, Runner>(&format!(
            "SELECT {RUNNER_COLUMNS} FROM runners r WHERE r.state <> 'dead' ORDER BY r.key"
        ))
        .fetch_all(&self.pool)
        .await
        .trans()
    }

    pub async fn get_runners_for_deployment(&self, deployment_key: &str) -> DalResult<Vec<Runner>> {
        sqlx::query_as::<_, Runner>(&format!(
            r#"
            SELECT {RUNNER_COLUMNS} FROM runners r
            JOIN deployments d ON d.id = r.deployment_id
            WHERE d.key = $1 AND r.state = 'assigned'
            ORDER BY r.key
            "#
        ))
        .bind(deployment_key)
        .fetch_all(&self.pool)
        .await
        .trans()
    }

    /// Atomically reserve one idle runner whose labels are a superset of the
    /// requested labels. *Not found* when no idle runner matches.
    pub async fn reserve_runner(
        &self,
        labels: &serde_json::Value,
        deployment_key: &str,
        reservation_timeout: DateTime<Utc>,
    ) -> DalResult<Runner> {
        let deployment_id: i64 = sqlx::query_scalar("SELECT id FROM deployments WHERE key = $1")
            .bind(deployment_key)
            .fetch_optional(&self.pool)
            .await
            .trans()?
            .ok_or_else(|| DalError::NotFound(format!("deployment {deployment_key}")))?;

        let runner = sqlx::query_as::<_, Runner>(&format!(
            r#"
            UPDATE runners r SET
                state = 'reserved',
                deployment_id = $2,
                reservation_timeout = $3
            WHERE r.id = (
                SELECT id FROM runners
                WHERE state = 'idle' AND labels @> $1
                ORDER BY last_seen DESC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {RUNNER_COLUMNS}
            "#
        ))
        .bind(labels)
        .bind(deployment_id)
        .bind(reservation_timeout)
        .fetch_one(&self.pool)
        .await
        .trans()
        .map_err(|e| {
            if e.is_not_found() {
                DalError::NotFound(format!("idle runner matching {labels}"))
            } else {
                e
            }
        })?;
        debug!(runner = %runner.key, deployment = %deployment_key, "runner reserved");
        Ok(runner)
    }

    /// Return timed-out reservations to `idle`. Returns the expired runners.
    pub async fn expire_runner_reservations(&self) -> DalResult<Vec<Runner>> {
        sqlx::query_as::<_, Runner>(&format!(
            r#"
            UPDATE runners r SET
                state = 'idle',
                deployment_id = NULL,
                reservation_timeout = NULL
            WHERE r.state = 'reserved' AND r.reservation_timeout < NOW()
            RETURNING {RUNNER_COLUMNS}
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .trans()
    }

    /// Mark runners not seen within `interval_ms` as dead. Returns the count.
    pub async fn kill_stale_runners(&self, interval_ms: i64) -> DalResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE runners SET state = 'dead', deployment_id = NULL
            WHERE state <> 'dead' AND last_seen < NOW() - ($1 * INTERVAL '1 millisecond')
            "#,
        )
        .bind(interval_ms)
        .execute(&self.pool)
        .await
        .trans()?;
        Ok(result.rows_affected())
    }

    pub async fn deregister_runner(&self, key: &str) -> DalResult<()> {
        let result = sqlx::query(
            "UPDATE runners SET state = 'dead', deployment_id = NULL WHERE key = $1",
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .trans()?;
        if result.rows_affected() == 0 {
            return Err(DalError::NotFound(format!("runner {key}")));
        }
        Ok(())
    }

    /// An assigned runner endpoint serving the given module, if any.
    /// Ties are broken randomly to spread load.
    pub async fn get_route_for_module(&self, module: &str) -> DalResult<Option<String>> {
        sqlx::query_scalar(
            r#"
            SELECT r.endpoint FROM runners r
            WHERE r.state = 'assigned' AND r.module_name = $1
            ORDER BY RANDOM()
            LIMIT 1
            "#,
        )
        .bind(module)
        .fetch_optional(&self.pool)
        .await
        .trans()
    }

    /// Heartbeat upsert for a controller.
    pub async fn upsert_controller(&self, key: &str, endpoint: &str) -> DalResult<()> {
        sqlx::query(
            r#"
            INSERT INTO controllers (key, endpoint, state, last_seen)
            VALUES ($1, $2, 'live', NOW())
            ON CONFLICT (key) DO UPDATE SET
                endpoint = $2,
                state = 'live',
                last_seen = NOW()
            "#,
        )
        .bind(key)
        .bind(endpoint)
        .execute(&self.pool)
        .await
        .trans()
        .map_err(|e| e.context(format!("controller {key}")))?;
        Ok(())
    }

    pub async fn get_live_controllers(&self) -> DalResult<Vec<Controller>> {
        sqlx::query_as::<_, Controller>(
            r#"
            SELECT id, key, endpoint, state, last_seen
            FROM controllers
            WHERE state = 'live'
            ORDER BY key
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .trans()
    }

    /// Mark controllers not seen within `interval_ms` as dead.
    pub async fn kill_stale_controllers(&self, interval_ms: i64) -> DalResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE controllers SET state = 'dead'
            WHERE state = 'live' AND last_seen < NOW() - ($1 * INTERVAL '1 millisecond')
            "#,
        )
        .bind(interval_ms)
        .execute(&self.pool)
        .await
        .trans()?;
        Ok(result.rows_affected())
    }
}
