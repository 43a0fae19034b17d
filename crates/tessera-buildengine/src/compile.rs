// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The compiler seam.
//!
//! Language toolchains are opaque to the engine: a compiler gets the
//! combined schema of the module's transitive dependencies, the module, and
//! the watcher's committed transaction, and is expected to leave a module
//! schema file at the module's schema path. [`CommandCompiler`] shells out
//! to the `build` command from `tessera.toml`.

use std::path::Path;
use std::process::Stdio;

use tracing::debug;

use tessera_schema::{Module as SchemaModule, Schema};

use crate::EngineError;
use crate::moduleconfig::Module;
use crate::watcher::FileHashes;

/// Builds one module against a dependency schema.
#[async_trait::async_trait]
pub trait ModuleCompiler: Send + Sync {
    async fn build_module(
        &self,
        schema: &Schema,
        module: &Module,
        transaction: &FileHashes,
    ) -> Result<(), EngineError>;
}

/// Compiler that runs the module's configured `build` shell command.
///
/// The dependency schema is written to `<build_dir>/dependencies.json` and
/// its path exported as `TESSERA_DEPENDENCY_SCHEMA`; the command must write
/// the module schema to `TESSERA_MODULE_SCHEMA` (the module's schema path).
pub struct CommandCompiler;

#[async_trait::async_trait]
impl ModuleCompiler for CommandCompiler {
    async fn build_module(
        &self,
        schema: &Schema,
        module: &Module,
        _transaction: &FileHashes,
    ) -> Result<(), EngineError> {
        let name = module.name().to_string();
        let command = module.config.build.clone().ok_or_else(|| {
            EngineError::Build {
                module: name.clone(),
                message: "module has no build command configured".to_string(),
            }
        })?;

        let build_dir = module.dir.join(&module.config.build_dir);
        tokio::fs::create_dir_all(&build_dir)
            .await
            .map_err(|e| build_error(&name, format!("creating build dir: {e}")))?;
        tokio::fs::create_dir_all(module.deploy_dir())
            .await
            .map_err(|e| build_error(&name, format!("creating deploy dir: {e}")))?;

        let dependency_schema = build_dir.join("dependencies.json");
        let schema_json = serde_json::to_vec_pretty(schema)
            .map_err(|e| build_error(&name, format!("encoding dependency schema: {e}")))?;
        tokio::fs::write(&dependency_schema, schema_json)
            .await
            .map_err(|e| build_error(&name, format!("writing dependency schema: {e}")))?;

        debug!(module = %name, %command, "invoking compiler");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&module.dir)
            .env("TESSERA_DEPENDENCY_SCHEMA", &dependency_schema)
            .env("TESSERA_MODULE_SCHEMA", module.schema_path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| build_error(&name, format!("spawning compiler: {e}")))?;

        if !output.status.success() {
            return Err(build_error(
                &name,
                format!(
                    "compiler exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}

fn build_error(module: &str, message: String) -> EngineError {
    EngineError::Build {
        module: module.to_string(),
        message,
    }
}

/// Read the module schema the compiler emitted.
pub async fn read_emitted_schema(module: &Module) -> Result<SchemaModule, EngineError> {
    let path = module.schema_path();
    read_schema_file(module.name(), &path).await
}

async fn read_schema_file(module: &str, path: &Path) -> Result<SchemaModule, EngineError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| EngineError::Build {
        module: module.to_string(),
        message: format!("could not load schema {}: {e}", path.display()),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| EngineError::Build {
        module: module.to_string(),
        message: format!("could not parse schema {}: {e}", path.display()),
    })
}
