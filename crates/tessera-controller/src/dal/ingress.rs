// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ingress routes and request provenance.

use crate::error::{DalResult, SqlxResultExt};
use crate::keys::new_suffix;

use super::Dal;

/// Where a request entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "request_origin", rename_all = "lowercase")]
pub enum RequestOrigin {
    Ingress,
    Cron,
    Pubsub,
}

impl RequestOrigin {
    fn key_prefix(self) -> &'static str {
        match self {
            RequestOrigin::Ingress => "ing",
            RequestOrigin::Cron => "crn",
            RequestOrigin::Pubsub => "sub",
        }
    }
}

/// An HTTP ingress route to a verb.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IngressRoute {
    pub deployment_key: String,
    pub endpoint: Option<String>,
    pub module: String,
    pub verb: String,
    pub method: String,
    pub path: String,
}

impl Dal {
    /// Register an ingress route for a deployment.
    pub async fn create_ingress_route(
        &self,
        deployment_key: &str,
        method: &str,
        path: &str,
        module: &str,
        verb: &str,
    ) -> DalResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ingress_routes (deployment_id, method, path, module, verb)
            SELECT id, $2, $3, $4, $5 FROM deployments WHERE key = $1
            "#,
        )
        .bind(deployment_key)
        .bind(method)
        .bind(path)
        .bind(module)
        .bind(verb)
        .execute(&self.pool)
        .await
        .trans()?;
        Ok(())
    }

    /// Resolve `(method, path)` to candidate routes, with the endpoint of an
    /// assigned runner when one exists.
    pub async fn get_ingress_routes(&self, method: &str, path: &str) -> DalResult<Vec<IngressRoute>> {
        sqlx::query_as::<_, IngressRoute>(
            r#"
            SELECT d.key AS deployment_key, r.endpoint, ir.module, ir.verb, ir.method, ir.path
            FROM ingress_routes ir
            JOIN deployments d ON d.id = ir.deployment_id
            LEFT JOIN runners r ON r.deployment_id = d.id AND r.state = 'assigned'
            WHERE ir.method = $1 AND ir.path = $2
            "#,
        )
        .bind(method)
        .bind(path)
        .fetch_all(&self.pool)
        .await
        .trans()
    }

    /// All routes of active deployments (status output).
    pub async fn get_active_ingress_routes(&self) -> DalResult<Vec<IngressRoute>> {
        sqlx::query_as::<_, IngressRoute>(
            r#"
            SELECT d.key AS deployment_key, NULL::TEXT AS endpoint, ir.module, ir.verb, ir.method, ir.path
            FROM ingress_routes ir
            JOIN deployments d ON d.id = ir.deployment_id
            WHERE d.min_replicas > 0
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .trans()
    }

    /// Record an inbound request; returns its key.
    pub async fn create_request(
        &self,
        origin: RequestOrigin,
        source_addr: &str,
    ) -> DalResult<String> {
        let key = format!("{}-{}", origin.key_prefix(), new_suffix());
        sqlx::query("INSERT INTO requests (origin, key, source_addr) VALUES ($1, $2, $3)")
            .bind(origin)
            .bind(&key)
            .bind(source_addr)
            .execute(&self.pool)
            .await
            .trans()?;
        Ok(key)
    }
}
