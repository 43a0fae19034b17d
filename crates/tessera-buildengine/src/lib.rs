// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tessera Build Engine - dependency-aware module builds and deploys
//!
//! The developer-side half of tessera: discovers local modules, resolves
//! their dependency graph against the controller's live schema, builds them
//! in topological order (parallel within a group), deploys the results, and
//! watches the filesystem for hot redeploys.
//!
//! # Data flow
//!
//! ```text
//! Watcher ──► Engine ──► (controller schema ⊕ locally built schemas)
//!                 │
//!                 ▼
//!          ModuleCompiler ──► emitted schema ──► artefact upload ──► Deploy
//! ```
//!
//! The dev loop ([`Engine::dev`]) is a single select over watcher events,
//! controller schema changes, and a quiescence timer; builds and deploys
//! run as short-lived tasks on a worker pool.

pub mod compile;
pub mod deploy;
pub mod discovery;
pub mod engine;
pub mod graph;
pub mod listener;
pub mod moduleconfig;
pub mod topic;
pub mod watcher;

pub use compile::{CommandCompiler, ModuleCompiler};
pub use discovery::discover_modules;
pub use engine::{Engine, SchemaChange};
pub use graph::{Graph, topological_sort};
pub use listener::{Listener, LogListener};
pub use moduleconfig::{ConfigError, Module, ModuleConfig};
pub use topic::Topic;
pub use watcher::{FileHashes, WatchEvent, Watcher};

/// Errors from the build engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("module {0:?} not found")]
    ModuleNotFound(String),

    #[error("dependency cycle involving {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("{module}: build failed: {message}")]
    Build { module: String, message: String },

    #[error("{module}: deploy failed: {message}")]
    Deploy { module: String, message: String },

    #[error("module discovery failed: {0}")]
    Discovery(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no controller attached")]
    NoController,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<EngineError>,
    },

    /// Several independent failures from one build pass.
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Many(Vec<EngineError>),
}

impl EngineError {
    /// Collapse a batch of errors, unwrapping the singleton case.
    pub fn join(mut errors: Vec<EngineError>) -> EngineError {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            EngineError::Many(errors)
        }
    }

    /// Prefix with a module name for context.
    pub fn with_module(self, module: &str) -> EngineError {
        EngineError::Context {
            context: module.to_string(),
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_unwraps_single_error() {
        let err = EngineError::join(vec![EngineError::ModuleNotFound("a".to_string())]);
        assert!(matches!(err, EngineError::ModuleNotFound(_)));
    }

    #[test]
    fn join_concatenates_messages() {
        let err = EngineError::join(vec![
            EngineError::ModuleNotFound("a".to_string()),
            EngineError::ModuleNotFound("b".to_string()),
        ]);
        assert_eq!(err.to_string(), "module \"a\" not found; module \"b\" not found");
    }
}
