// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem watcher for module directories.
//!
//! Polls the source roots at a fixed period. Per module directory it keeps
//! a committed "transaction": the set of `(path, sha256)` pairs observed on
//! the last tick. Comparing transactions yields added/changed/removed
//! events. The build engine reads the committed transaction before invoking
//! a compiler so files the compiler itself writes don't retrigger a build of
//! the same module; build and deploy directories are never hashed at all.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::discovery::discover_modules;
use crate::moduleconfig::Module;
use crate::topic::Topic;

/// The committed hash set of one module directory.
pub type FileHashes = HashMap<PathBuf, [u8; 32]>;

/// A change observed by the watcher.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    ModuleAdded(Module),
    ModuleRemoved(Module),
    ModuleChanged { module: Module, time: SystemTime },
}

/// Polling watcher over module source roots.
#[derive(Clone, Default)]
pub struct Watcher {
    transactions: Arc<Mutex<HashMap<PathBuf, FileHashes>>>,
}

impl Watcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest committed transaction for a module directory.
    pub async fn transaction(&self, dir: &Path) -> FileHashes {
        self.transactions
            .lock()
            .await
            .get(dir)
            .cloned()
            .unwrap_or_default()
    }

    /// Start watching. Events are published onto the returned topic until
    /// `shutdown` fires.
    pub async fn watch(
        &self,
        period: Duration,
        dirs: Vec<PathBuf>,
        shutdown: Arc<Notify>,
    ) -> Topic<WatchEvent> {
        let topic = Topic::new();
        let watcher = self.clone();
        let out = topic.clone();
        tokio::spawn(async move {
            let mut known: HashMap<PathBuf, Module> = HashMap::new();
            // Seed without events so only subsequent changes are reported.
            watcher.scan(&dirs, &mut known, None).await;
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!("watcher shutting down");
                        return;
                    }
                    _ = tokio::time::sleep(period) => {
                        watcher.scan(&dirs, &mut known, Some(&out)).await;
                    }
                }
            }
        });
        topic
    }

    async fn scan(
        &self,
        dirs: &[PathBuf],
        known: &mut HashMap<PathBuf, Module>,
        topic: Option<&Topic<WatchEvent>>,
    ) {
        let modules = match discover_modules(dirs) {
            Ok(modules) => modules,
            Err(e) => {
                warn!(error = %e, "module discovery failed");
                return;
            }
        };
        let now = SystemTime::now();

        let mut seen: HashMap<PathBuf, Module> = HashMap::new();
        for module in modules {
            seen.insert(module.dir.clone(), module);
        }

        // Removals first: modules we knew that are gone.
        let removed: Vec<Module> = known
            .iter()
            .filter(|(dir, _)| !seen.contains_key(*dir))
            .map(|(_, module)| module.clone())
            .collect();
        for module in removed {
            known.remove(&module.dir);
            self.transactions.lock().await.remove(&module.dir);
            debug!(module = module.name(), "module removed");
            if let Some(topic) = topic {
                topic.publish(WatchEvent::ModuleRemoved(module)).await;
            }
        }

        for (dir, module) in seen {
            let hashes = match hash_module_files(&module) {
                Ok(hashes) => hashes,
                Err(e) => {
                    warn!(module = module.name(), error = %e, "hashing failed");
                    continue;
                }
            };
            let previous = self.transactions.lock().await.insert(dir.clone(), hashes.clone());
            let is_new = known.insert(dir, module.clone()).is_none();

            if is_new {
                debug!(module = module.name(), "module added");
                if let Some(topic) = topic {
                    topic.publish(WatchEvent::ModuleAdded(module)).await;
                }
            } else if previous.as_ref() != Some(&hashes) {
                debug!(module = module.name(), "module changed");
                if let Some(topic) = topic {
                    topic
                        .publish(WatchEvent::ModuleChanged { module, time: now })
                        .await;
                }
            }
        }
    }
}

/// Hash all watched files of a module, skipping its build and deploy
/// directories and hidden entries.
pub fn hash_module_files(module: &Module) -> std::io::Result<FileHashes> {
    let mut hashes = FileHashes::new();
    let skip = [
        module.dir.join(&module.config.build_dir),
        module.dir.join(&module.config.deploy_dir),
    ];
    hash_dir(&module.dir, &skip, &mut hashes)?;
    Ok(hashes)
}

fn hash_dir(dir: &Path, skip: &[PathBuf], out: &mut FileHashes) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if path.is_dir() {
            if skip.contains(&path) {
                continue;
            }
            hash_dir(&path, skip, out)?;
        } else {
            // Files may vanish mid-scan; skip rather than fail the tick.
            match std::fs::read(&path) {
                Ok(content) => {
                    out.insert(path, Sha256::digest(&content).into());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moduleconfig::CONFIG_FILE;

    fn write_module(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(CONFIG_FILE),
            format!("module = \"{name}\"\nlanguage = \"rust\"\n"),
        )
        .unwrap();
        dir
    }

    #[test]
    fn build_and_deploy_dirs_are_not_hashed() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_module(root.path(), "echo");
        std::fs::write(dir.join("main.rs"), "fn main() {}").unwrap();
        std::fs::create_dir_all(dir.join("_build")).unwrap();
        std::fs::write(dir.join("_build").join("generated.rs"), "x").unwrap();
        std::fs::create_dir_all(dir.join("_deploy")).unwrap();
        std::fs::write(dir.join("_deploy").join("schema.json"), "{}").unwrap();

        let module = Module::load(&dir).unwrap();
        let hashes = hash_module_files(&module).unwrap();
        let paths: Vec<_> = hashes.keys().collect();
        assert!(paths.iter().any(|p| p.ends_with("main.rs")));
        assert!(!paths.iter().any(|p| p.to_string_lossy().contains("_build")));
        assert!(!paths.iter().any(|p| p.to_string_lossy().contains("_deploy")));
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_reports_add_change_remove() {
        let root = tempfile::tempdir().unwrap();
        write_module(root.path(), "stable");

        let watcher = Watcher::new();
        let shutdown = Arc::new(Notify::new());
        let topic = watcher
            .watch(
                Duration::from_millis(10),
                vec![root.path().to_path_buf()],
                shutdown.clone(),
            )
            .await;
        let mut events = topic.subscribe().await;

        // Give the seeding scan a tick, then add a module.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let dir = write_module(root.path(), "fresh");
        tokio::time::sleep(Duration::from_millis(20)).await;
        match events.recv().await.unwrap() {
            WatchEvent::ModuleAdded(module) => assert_eq!(module.name(), "fresh"),
            other => panic!("expected add, got {other:?}"),
        }

        std::fs::write(dir.join("lib.rs"), "pub fn x() {}").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        match events.recv().await.unwrap() {
            WatchEvent::ModuleChanged { module, .. } => assert_eq!(module.name(), "fresh"),
            other => panic!("expected change, got {other:?}"),
        }

        std::fs::remove_dir_all(&dir).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        match events.recv().await.unwrap() {
            WatchEvent::ModuleRemoved(module) => assert_eq!(module.name(), "fresh"),
            other => panic!("expected remove, got {other:?}"),
        }

        shutdown.notify_waiters();
    }
}
