// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build progress listener.

use crate::EngineError;
use crate::moduleconfig::Module;

/// Receives build lifecycle notifications from the engine.
///
/// After `build_failed`, `build_success` is not reported until the next
/// clean pass completes.
pub trait Listener: Send + Sync {
    /// A build started for a module.
    fn build_started(&self, module: &Module);

    /// All modules built and deployed successfully.
    fn build_success(&self);

    /// A build or deploy failed.
    fn build_failed(&self, error: &EngineError);
}

/// Listener that only logs.
pub struct LogListener;

impl Listener for LogListener {
    fn build_started(&self, module: &Module) {
        tracing::info!(module = module.name(), "build started");
    }

    fn build_success(&self) {
        tracing::info!("all modules deployed");
    }

    fn build_failed(&self, error: &EngineError) {
        tracing::error!(error = %error, "build failed");
    }
}
