// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deploying built modules to the controller.
//!
//! A deploy uploads the artefacts the controller is missing (by content
//! digest), creates a deployment for the emitted schema, then activates it
//! with `ReplaceDeploy`, draining the previously active deployment of the
//! same module.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use tessera_protocol::ControllerClient;
use tessera_protocol::proto::controller_proto;

use crate::EngineError;
use crate::compile::read_emitted_schema;
use crate::moduleconfig::Module;

/// How long to wait for an activated deployment to appear in status.
const ONLINE_TIMEOUT: Duration = Duration::from_secs(120);
const ONLINE_POLL: Duration = Duration::from_millis(500);

struct LocalArtefact {
    path: String,
    abs_path: PathBuf,
    digest: String,
    executable: bool,
}

/// Deploy a compiled module.
pub async fn deploy(
    module: &Module,
    replicas: i32,
    wait_online: bool,
    client: &ControllerClient,
) -> Result<(), EngineError> {
    let name = module.name().to_string();
    let schema = read_emitted_schema(module).await?;
    let schema_json = serde_json::to_vec(&schema)
        .map_err(|e| deploy_error(&name, format!("encoding schema: {e}")))?;

    let artefacts = collect_artefacts(module)?;
    if artefacts.is_empty() {
        return Err(deploy_error(&name, "no artefacts in deploy directory".to_string()));
    }

    let digests: Vec<String> = artefacts.iter().map(|a| a.digest.clone()).collect();
    let diffs = client
        .get_artefact_diffs(digests)
        .await
        .map_err(|e| deploy_error(&name, e.to_string()))?;
    for artefact in &artefacts {
        if !diffs.missing_digests.contains(&artefact.digest) {
            continue;
        }
        debug!(module = %name, path = %artefact.path, "uploading artefact");
        let content = std::fs::read(&artefact.abs_path)
            .map_err(|e| deploy_error(&name, format!("reading {}: {e}", artefact.path)))?;
        let digest = client
            .upload_artefact(content)
            .await
            .map_err(|e| deploy_error(&name, e.to_string()))?;
        if digest != artefact.digest {
            return Err(deploy_error(
                &name,
                format!("uploaded digest mismatch for {}", artefact.path),
            ));
        }
    }

    let key = client
        .create_deployment(controller_proto::CreateDeploymentRequest {
            schema_json,
            artefacts: artefacts
                .iter()
                .map(|a| controller_proto::DeploymentArtefact {
                    digest: a.digest.clone(),
                    path: a.path.clone(),
                    executable: a.executable,
                })
                .collect(),
            labels_json: b"{}".to_vec(),
            language: module.config.language.clone(),
        })
        .await
        .map_err(|e| deploy_error(&name, e.to_string()))?;

    client
        .replace_deploy(key.clone(), replicas)
        .await
        .map_err(|e| deploy_error(&name, e.to_string()))?;
    info!(module = %name, deployment = %key, replicas, "deployed");

    if wait_online {
        wait_for_active(&name, &key, client).await?;
    }
    Ok(())
}

/// Drain the active deployment of a module, if any.
pub async fn terminate_module_deployment(
    client: &ControllerClient,
    module: &str,
) -> Result<(), EngineError> {
    let status = client
        .status()
        .await
        .map_err(|e| deploy_error(module, e.to_string()))?;
    let Some(deployment) = status
        .deployments
        .iter()
        .find(|d| d.module_name == module && d.min_replicas > 0)
    else {
        return Ok(());
    };
    client
        .update_deploy(deployment.key.clone(), 0)
        .await
        .map_err(|e| deploy_error(module, e.to_string()))?;
    info!(module, deployment = %deployment.key, "deployment terminated");
    Ok(())
}

async fn wait_for_active(
    module: &str,
    key: &str,
    client: &ControllerClient,
) -> Result<(), EngineError> {
    let deadline = tokio::time::Instant::now() + ONLINE_TIMEOUT;
    loop {
        let status = client
            .status()
            .await
            .map_err(|e| deploy_error(module, e.to_string()))?;
        if status
            .deployments
            .iter()
            .any(|d| d.key == key && d.min_replicas > 0)
        {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(deploy_error(
                module,
                format!("deployment {key} did not become active"),
            ));
        }
        tokio::time::sleep(ONLINE_POLL).await;
    }
}

fn collect_artefacts(module: &Module) -> Result<Vec<LocalArtefact>, EngineError> {
    let deploy_dir = module.deploy_dir();
    let mut artefacts = Vec::new();
    collect_files(module.name(), &deploy_dir, &deploy_dir, &mut artefacts)?;
    artefacts.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(artefacts)
}

fn collect_files(
    module: &str,
    root: &Path,
    dir: &Path,
    out: &mut Vec<LocalArtefact>,
) -> Result<(), EngineError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| deploy_error(module, format!("reading {}: {e}", dir.display())))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| deploy_error(module, format!("reading {}: {e}", dir.display())))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(module, root, &path, out)?;
            continue;
        }
        let content = std::fs::read(&path)
            .map_err(|e| deploy_error(module, format!("reading {}: {e}", path.display())))?;
        let metadata = entry
            .metadata()
            .map_err(|e| deploy_error(module, format!("stat {}: {e}", path.display())))?;
        let rel = path
            .strip_prefix(root)
            .expect("artefact path is under the deploy dir")
            .to_string_lossy()
            .into_owned();
        out.push(LocalArtefact {
            path: rel,
            abs_path: path,
            digest: hex::encode(Sha256::digest(&content)),
            executable: metadata.permissions().mode() & 0o111 != 0,
        });
    }
    Ok(())
}

fn deploy_error(module: &str, message: impl Into<String>) -> EngineError {
    EngineError::Deploy {
        module: module.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moduleconfig::CONFIG_FILE;

    #[test]
    fn artefacts_are_collected_with_digests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "module = \"echo\"\nlanguage = \"rust\"\n",
        )
        .unwrap();
        let deploy = dir.path().join("_deploy");
        std::fs::create_dir_all(deploy.join("bin")).unwrap();
        std::fs::write(deploy.join("schema.json"), "{}").unwrap();
        std::fs::write(deploy.join("bin").join("main"), "binary").unwrap();

        let module = Module::load(dir.path()).unwrap();
        let artefacts = collect_artefacts(&module).unwrap();
        let paths: Vec<_> = artefacts.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["bin/main", "schema.json"]);
        assert_eq!(
            artefacts[1].digest,
            hex::encode(Sha256::digest(b"{}".as_slice()))
        );
    }
}
