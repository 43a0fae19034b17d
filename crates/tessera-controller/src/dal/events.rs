// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The timeline: call, log and deployment events per deployment.

use chrono::{DateTime, Utc};

use crate::error::{DalError, DalResult, SqlxResultExt};

use super::Dal;

/// Kind of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "event_type", rename_all = "snake_case")]
pub enum EventType {
    Call,
    Log,
    DeploymentCreated,
    DeploymentUpdated,
}

/// A timeline event row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Event {
    pub id: i64,
    pub time_stamp: DateTime<Utc>,
    pub deployment_key: String,
    #[sqlx(rename = "type")]
    pub event_type: EventType,
    pub custom_key_1: Option<String>,
    pub custom_key_2: Option<String>,
    pub custom_key_3: Option<String>,
    pub custom_key_4: Option<String>,
    pub payload: serde_json::Value,
}

impl Dal {
    /// Record a verb call against a deployment's timeline.
    pub async fn insert_call_event(
        &self,
        deployment_key: &str,
        request_key: Option<&str>,
        source_verb: Option<&str>,
        dest_verb: &str,
        payload: serde_json::Value,
    ) -> DalResult<()> {
        self.insert_event(
            deployment_key,
            request_key,
            EventType::Call,
            [Some(dest_verb), source_verb, None, None],
            payload,
        )
        .await
    }

    /// Record a log line against a deployment's timeline.
    pub async fn insert_log_event(
        &self,
        deployment_key: &str,
        request_key: Option<&str>,
        level: i32,
        payload: serde_json::Value,
    ) -> DalResult<()> {
        let level = level.to_string();
        self.insert_event(
            deployment_key,
            request_key,
            EventType::Log,
            [Some(level.as_str()), None, None, None],
            payload,
        )
        .await
    }

    /// Record a deployment lifecycle event (created, replica target
    /// changed).
    pub async fn insert_deployment_event(
        &self,
        deployment_key: &str,
        event_type: EventType,
        module_name: Option<&str>,
        payload: serde_json::Value,
    ) -> DalResult<()> {
        insert_deployment_event(&self.pool, deployment_key, event_type, module_name, payload)
            .await
    }

    async fn insert_event(
        &self,
        deployment_key: &str,
        request_key: Option<&str>,
        event_type: EventType,
        custom_keys: [Option<&str>; 4],
        payload: serde_json::Value,
    ) -> DalResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO events
                (deployment_id, request_id, type, custom_key_1, custom_key_2,
                 custom_key_3, custom_key_4, payload)
            SELECT d.id, r.id, $3, $4, $5, $6, $7, $8
            FROM deployments d
            LEFT JOIN requests r ON r.key = $2
            WHERE d.key = $1
            "#,
        )
        .bind(deployment_key)
        .bind(request_key)
        .bind(event_type)
        .bind(custom_keys[0])
        .bind(custom_keys[1])
        .bind(custom_keys[2])
        .bind(custom_keys[3])
        .bind(payload)
        .execute(&self.pool)
        .await
        .trans()?;
        if result.rows_affected() == 0 {
            return Err(DalError::NotFound(format!("deployment {deployment_key}")));
        }
        Ok(())
    }

    /// Recent events for a deployment, newest first.
    pub async fn get_events(&self, deployment_key: &str, limit: i64) -> DalResult<Vec<Event>> {
        sqlx::query_as::<_, Event>(
            r#"
            SELECT e.id, e.time_stamp, d.key AS deployment_key, e.type,
                   e.custom_key_1, e.custom_key_2, e.custom_key_3, e.custom_key_4,
                   e.payload
            FROM events e
            JOIN deployments d ON d.id = e.deployment_id
            WHERE d.key = $1
            ORDER BY e.time_stamp DESC, e.id DESC
            LIMIT $2
            "#,
        )
        .bind(deployment_key)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .trans()
    }
}

/// Executor-generic variant, attachable to deployment transactions.
pub(super) async fn insert_deployment_event<'e, E: sqlx::PgExecutor<'e>>(
    executor: E,
    deployment_key: &str,
    event_type: EventType,
    module_name: Option<&str>,
    payload: serde_json::Value,
) -> DalResult<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO events (deployment_id, type, custom_key_1, payload)
        SELECT id, $2, $3, $4 FROM deployments WHERE key = $1
        "#,
    )
    .bind(deployment_key)
    .bind(event_type)
    .bind(module_name)
    .bind(payload)
    .execute(executor)
    .await
    .trans()?;
    if result.rows_affected() == 0 {
        return Err(DalError::NotFound(format!("deployment {deployment_key}")));
    }
    Ok(())
}
