// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment store: artefact CAS, deployment rows, replica targets and
//! reconciliation queries.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::Row;
use tracing::debug;

use tessera_schema::Module;

use crate::error::{DalError, DalResult, SqlxResultExt};
use crate::keys::DeploymentKey;

use super::events::insert_deployment_event;
use super::{Dal, EventType};

/// A deployment row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Deployment {
    pub id: i64,
    pub key: String,
    pub module_name: String,
    pub language: String,
    #[sqlx(json)]
    pub schema: Module,
    pub labels: serde_json::Value,
    pub min_replicas: i32,
    pub created_at: DateTime<Utc>,
}

/// An artefact attached to a deployment.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Artefact {
    pub id: i64,
    pub digest: Vec<u8>,
    pub path: String,
    pub executable: bool,
}

/// A deployment whose assigned-runner count differs from its target.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Reconciliation {
    pub key: String,
    pub module_name: String,
    pub labels: serde_json::Value,
    pub min_replicas: i32,
    pub assigned_replicas: i64,
}

impl Dal {
    /// Store an artefact, idempotently by content digest. Returns the digest.
    pub async fn create_artefact(&self, content: &[u8]) -> DalResult<Vec<u8>> {
        let digest: Vec<u8> = Sha256::digest(content).to_vec();
        sqlx::query(
            r#"
            INSERT INTO artefacts (digest, content)
            VALUES ($1, $2)
            ON CONFLICT (digest) DO NOTHING
            "#,
        )
        .bind(&digest)
        .bind(content)
        .execute(&self.pool)
        .await
        .trans()?;
        debug!(digest = %hex::encode(&digest), size = content.len(), "artefact stored");
        Ok(digest)
    }

    /// Of the given digests, which are missing from the store?
    pub async fn get_artefact_diffs(&self, digests: &[Vec<u8>]) -> DalResult<Vec<Vec<u8>>> {
        let have: Vec<Vec<u8>> = sqlx::query_scalar(
            "SELECT digest FROM artefacts WHERE digest = ANY($1)",
        )
        .bind(digests)
        .fetch_all(&self.pool)
        .await
        .trans()?;
        Ok(digests
            .iter()
            .filter(|d| !have.contains(d))
            .cloned()
            .collect())
    }

    /// Read a byte range of an artefact's content.
    pub async fn get_artefact_content_range(
        &self,
        artefact_id: i64,
        start: i64,
        count: i64,
    ) -> DalResult<Vec<u8>> {
        sqlx::query_scalar("SELECT substring(content FROM $1::int FOR $2::int) FROM artefacts WHERE id = $3")
            .bind((start + 1) as i32)
            .bind(count as i32)
            .bind(artefact_id)
            .fetch_one(&self.pool)
            .await
            .trans()
    }

    /// Create a deployment for a module schema with `min_replicas = 0`.
    ///
    /// All artefact digests must already be uploaded; a missing digest is a
    /// *not found* error. Returns the new deployment key.
    pub async fn create_deployment(
        &self,
        language: &str,
        schema: &Module,
        artefacts: &[(Vec<u8>, String, bool)],
        labels: serde_json::Value,
    ) -> DalResult<DeploymentKey> {
        let mut tx = self.pool.begin().await.trans()?;

        let module_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO modules (language, name)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET language = $1
            RETURNING id
            "#,
        )
        .bind(language)
        .bind(&schema.name)
        .fetch_one(&mut *tx)
        .await
        .trans()?;

        let key = DeploymentKey::generate(&schema.name);
        let schema_json = serde_json::to_value(schema)
            .map_err(|e| DalError::Constraint(format!("unserializable schema: {e}")))?;
        let deployment_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO deployments (module_id, key, schema, labels)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(module_id)
        .bind(key.to_string())
        .bind(&schema_json)
        .bind(&labels)
        .fetch_one(&mut *tx)
        .await
        .trans()?;

        for (digest, path, executable) in artefacts {
            let artefact_id: Option<i64> =
                sqlx::query_scalar("SELECT id FROM artefacts WHERE digest = $1")
                    .bind(digest)
                    .fetch_optional(&mut *tx)
                    .await
                    .trans()?;
            let artefact_id = artefact_id.ok_or_else(|| {
                DalError::NotFound(format!("artefact {}", hex::encode(digest)))
            })?;
            sqlx::query(
                r#"
                INSERT INTO deployment_artefacts (deployment_id, artefact_id, executable, path)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(deployment_id)
            .bind(artefact_id)
            .bind(executable)
            .bind(path)
            .execute(&mut *tx)
            .await
            .trans()?;
        }

        insert_deployment_event(
            &mut *tx,
            &key.to_string(),
            EventType::DeploymentCreated,
            Some(&schema.name),
            serde_json::json!({"key": key.to_string()}),
        )
        .await?;

        tx.commit().await.trans()?;
        debug!(deployment = %key, module = %schema.name, "deployment created");
        Ok(key)
    }

    pub async fn get_deployment(&self, key: &str) -> DalResult<Deployment> {
        sqlx::query_as::<_, Deployment>(
            r#"
            SELECT d.id, d.key, m.name AS module_name, m.language, d.schema,
                   d.labels, d.min_replicas, d.created_at
            FROM deployments d
            JOIN modules m ON m.id = d.module_id
            WHERE d.key = $1
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .trans()
        .map_err(|e| e.context(format!("deployment {key}")))
    }

    /// The active (replicated) deployment for a module, if any.
    pub async fn get_active_deployment_for_module(
        &self,
        module: &str,
    ) -> DalResult<Option<Deployment>> {
        sqlx::query_as::<_, Deployment>(
            r#"
            SELECT d.id, d.key, m.name AS module_name, m.language, d.schema,
                   d.labels, d.min_replicas, d.created_at
            FROM deployments d
            JOIN modules m ON m.id = d.module_id
            WHERE m.name = $1 AND d.min_replicas > 0
            "#,
        )
        .bind(module)
        .fetch_optional(&self.pool)
        .await
        .trans()
    }

    /// All deployments, optionally only the active ones.
    pub async fn get_deployments(&self, active_only: bool) -> DalResult<Vec<Deployment>> {
        sqlx::query_as::<_, Deployment>(
            r#"
            SELECT d.id, d.key, m.name AS module_name, m.language, d.schema,
                   d.labels, d.min_replicas, d.created_at
            FROM deployments d
            JOIN modules m ON m.id = d.module_id
            WHERE NOT $1 OR d.min_replicas > 0
            ORDER BY d.id
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .trans()
    }

    /// Set a deployment's replica target directly.
    ///
    /// Raising it above zero while another deployment of the same module is
    /// active violates the partial unique index and surfaces as *conflict*.
    pub async fn set_deployment_replicas(&self, key: &str, min_replicas: i32) -> DalResult<()> {
        let result = sqlx::query(
            "UPDATE deployments SET min_replicas = $2 WHERE key = $1",
        )
        .bind(key)
        .bind(min_replicas)
        .execute(&self.pool)
        .await
        .trans()
        .map_err(|e| e.context(format!("deployment {key}")))?;
        if result.rows_affected() == 0 {
            return Err(DalError::NotFound(format!("deployment {key}")));
        }
        insert_deployment_event(
            &self.pool,
            key,
            EventType::DeploymentUpdated,
            None,
            serde_json::json!({"min_replicas": min_replicas}),
        )
        .await?;
        Ok(())
    }

    /// Atomically activate `new_key` with `min_replicas` and drain `old_key`
    /// to zero. The partial unique index on active deployments makes any
    /// competing activation a *conflict*.
    pub async fn replace_deployment(
        &self,
        old_key: &str,
        new_key: &str,
        min_replicas: i32,
    ) -> DalResult<()> {
        let mut tx = self.pool.begin().await.trans()?;

        let drained = sqlx::query(
            "UPDATE deployments SET min_replicas = 0 WHERE key = $1",
        )
        .bind(old_key)
        .execute(&mut *tx)
        .await
        .trans()?;
        if drained.rows_affected() == 0 {
            return Err(DalError::NotFound(format!("deployment {old_key}")));
        }

        let activated = sqlx::query(
            "UPDATE deployments SET min_replicas = $2 WHERE key = $1",
        )
        .bind(new_key)
        .bind(min_replicas)
        .execute(&mut *tx)
        .await
        .trans()
        .map_err(|e| e.context(format!("deployment {new_key}")))?;
        if activated.rows_affected() == 0 {
            return Err(DalError::NotFound(format!("deployment {new_key}")));
        }

        insert_deployment_event(
            &mut *tx,
            new_key,
            EventType::DeploymentUpdated,
            None,
            serde_json::json!({"min_replicas": min_replicas, "replaced": old_key}),
        )
        .await?;

        tx.commit().await.trans()?;
        debug!(old = %old_key, new = %new_key, min_replicas, "deployment replaced");
        Ok(())
    }

    pub async fn get_deployment_artefacts(&self, deployment_key: &str) -> DalResult<Vec<Artefact>> {
        sqlx::query_as::<_, Artefact>(
            r#"
            SELECT a.id, a.digest, da.path, da.executable
            FROM deployment_artefacts da
            JOIN artefacts a ON a.id = da.artefact_id
            JOIN deployments d ON d.id = da.deployment_id
            WHERE d.key = $1
            ORDER BY da.path
            "#,
        )
        .bind(deployment_key)
        .fetch_all(&self.pool)
        .await
        .trans()
    }

    /// Deployments whose assigned-runner count differs from the target.
    pub async fn get_deployments_needing_reconciliation(&self) -> DalResult<Vec<Reconciliation>> {
        sqlx::query_as::<_, Reconciliation>(
            r#"
            SELECT d.key, m.name AS module_name, d.labels, d.min_replicas,
                   (SELECT COUNT(*) FROM runners r
                    WHERE r.deployment_id = d.id AND r.state = 'assigned') AS assigned_replicas
            FROM deployments d
            JOIN modules m ON m.id = d.module_id
            WHERE d.min_replicas > 0
               OR EXISTS (SELECT 1 FROM runners r
                          WHERE r.deployment_id = d.id AND r.state = 'assigned')
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .trans()
        .map(|rows| {
            rows.into_iter()
                .filter(|r| r.assigned_replicas != r.min_replicas as i64)
                .collect()
        })
    }

    /// Total artefact content size for a deployment (used by status output).
    pub async fn get_deployment_artefact_size(&self, deployment_key: &str) -> DalResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(length(a.content)), 0) AS total
            FROM deployment_artefacts da
            JOIN artefacts a ON a.id = da.artefact_id
            JOIN deployments d ON d.id = da.deployment_id
            WHERE d.key = $1
            "#,
        )
        .bind(deployment_key)
        .fetch_one(&self.pool)
        .await
        .trans()?;
        row.try_get::<i64, _>("total").trans()
    }
}
