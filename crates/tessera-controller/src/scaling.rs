// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner autoscaling seam.
//!
//! The reconciler asks the scaler to grow the fleet when no idle runner
//! matches a deployment's labels. How runners come to exist (local
//! processes, a cloud ASG) is behind this trait.

use async_trait::async_trait;
use tracing::info;

/// Errors from a scaling backend.
#[derive(Debug, thiserror::Error)]
#[error("scaling failed: {0}")]
pub struct ScalingError(pub String);

/// Grows the runner fleet on demand.
#[async_trait]
pub trait RunnerScaling: Send + Sync {
    /// Request capacity for `additional` more runners able to satisfy
    /// `labels` for the given deployment.
    async fn grow(
        &self,
        deployment_key: &str,
        labels: &serde_json::Value,
        additional: i32,
    ) -> Result<(), ScalingError>;
}

/// A scaler that only reports demand. Deployments wait for operators (or an
/// external autoscaler watching the same database) to add runners.
pub struct NoScaling;

#[async_trait]
impl RunnerScaling for NoScaling {
    async fn grow(
        &self,
        deployment_key: &str,
        labels: &serde_json::Value,
        additional: i32,
    ) -> Result<(), ScalingError> {
        info!(
            deployment = %deployment_key,
            %labels,
            additional,
            "no idle runners available; waiting for capacity"
        );
        Ok(())
    }
}
