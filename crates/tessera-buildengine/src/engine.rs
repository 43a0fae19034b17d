// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The build engine.
//!
//! Maintains the set of local modules, mirrors the controller's schema, and
//! drives dependency-ordered parallel builds. Completely offline builds are
//! possible when the full dependency graph is locally available; with a
//! controller attached, missing schemas are pulled from it and schema
//! changes stream in over `PullSchema`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use tessera_protocol::proto::controller_proto::{self, DeploymentChangeType};
use tessera_protocol::{ControllerClient, retry_server_stream};
use tessera_schema::{Module as SchemaModule, Schema, builtins, module_hash};

use crate::EngineError;
use crate::compile::{ModuleCompiler, read_emitted_schema};
use crate::deploy::{deploy, terminate_module_deployment};
use crate::discovery::discover_modules;
use crate::graph::{Graph, topological_sort};
use crate::listener::Listener;
use crate::moduleconfig::Module;
use crate::topic::Topic;
use crate::watcher::{WatchEvent, Watcher};

/// A module plus the start time of its last build.
///
/// The timestamp guards against stale watcher events: a change observed
/// before the last build started was already picked up by that build.
#[derive(Clone)]
struct ModuleMeta {
    module: Module,
    last_build_start_time: Option<SystemTime>,
}

/// A schema change observed by the engine (controller push or local build).
#[derive(Debug, Clone)]
pub struct SchemaChange {
    pub change: DeploymentChangeType,
    pub name: String,
    /// `None` for removals.
    pub module: Option<SchemaModule>,
}

type DeployFuture = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send>>;
type BuildCallback = Arc<dyn Fn(Module) -> DeployFuture + Send + Sync>;

/// Engine for building a set of modules.
#[derive(Clone)]
pub struct Engine {
    client: Option<ControllerClient>,
    module_metas: Arc<RwLock<HashMap<String, ModuleMeta>>>,
    module_dirs: Arc<Vec<PathBuf>>,
    watcher: Watcher,
    controller_schema: Arc<RwLock<HashMap<String, SchemaModule>>>,
    schema_changes: Topic<SchemaChange>,
    parallelism: usize,
    listener: Option<Arc<dyn Listener>>,
    /// Modules still waiting for their first successful build this session.
    modules_to_build: Arc<RwLock<HashSet<String>>>,
    compiler: Arc<dyn ModuleCompiler>,
    shutdown: Arc<Notify>,
}

impl Engine {
    /// Construct an engine over the modules found under `dirs`.
    ///
    /// With a client, the controller schema is seeded with a blocking
    /// `GetSchema` and kept fresh by a reconnecting `PullSchema` stream.
    pub async fn new(
        client: Option<ControllerClient>,
        dirs: Vec<PathBuf>,
        compiler: Arc<dyn ModuleCompiler>,
    ) -> Result<Self, EngineError> {
        let engine = Self {
            client,
            module_metas: Arc::new(RwLock::new(HashMap::new())),
            module_dirs: Arc::new(dirs),
            watcher: Watcher::new(),
            controller_schema: Arc::new(RwLock::new(HashMap::new())),
            schema_changes: Topic::new(),
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            listener: None,
            modules_to_build: Arc::new(RwLock::new(HashSet::new())),
            compiler,
            shutdown: Arc::new(Notify::new()),
        };
        engine
            .controller_schema
            .write()
            .unwrap()
            .insert("builtin".to_string(), builtins());

        let modules = discover_modules(&engine.module_dirs)
            .map_err(|e| EngineError::Discovery(e.to_string()))?;
        for module in modules {
            let name = module.name().to_string();
            engine.module_metas.write().unwrap().insert(
                name.clone(),
                ModuleMeta {
                    module,
                    last_build_start_time: None,
                },
            );
            engine.modules_to_build.write().unwrap().insert(name);
        }

        if engine.client.is_some() {
            engine.start_schema_sync().await;
        }
        Ok(engine)
    }

    /// Override the build worker pool width (default: CPU count).
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Attach a build progress listener.
    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Stop the schema sync and watcher.
    pub fn close(&self) {
        self.shutdown.notify_waiters();
    }

    /// Names of all local modules.
    pub fn modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.module_metas.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Iterate over all local modules.
    pub fn each<F>(&self, mut f: F) -> Result<(), EngineError>
    where
        F: FnMut(&Module) -> Result<(), EngineError>,
    {
        let metas = self.module_metas.read().unwrap();
        for (name, meta) in metas.iter() {
            f(&meta.module).map_err(|e| e.with_module(name))?;
        }
        Ok(())
    }

    /// Manually import a module schema as if pushed by the controller.
    pub fn import(&self, module: SchemaModule) {
        self.controller_schema
            .write()
            .unwrap()
            .insert(module.name.clone(), module);
    }

    /// Seed the controller schema, then keep it synchronized from the
    /// controller's push stream, republishing changes locally.
    async fn start_schema_sync(&self) {
        let client = self.client.clone().expect("schema sync requires a client");

        match client.get_schema().await {
            Ok(response) => match serde_json::from_slice::<Schema>(&response.schema_json) {
                Ok(schema) => {
                    let mut controller_schema = self.controller_schema.write().unwrap();
                    for module in schema.modules {
                        controller_schema.insert(module.name.clone(), module);
                    }
                }
                Err(e) => debug!(error = %e, "failed to parse schema from controller"),
            },
            Err(e) => debug!(error = %e, "failed to get schema from controller"),
        }

        let engine = self.clone();
        let transport = client.transport();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            retry_server_stream(
                transport,
                ControllerClient::pull_schema_request(),
                shutdown,
                move |msg: controller_proto::PullSchemaResponse| {
                    let engine = engine.clone();
                    async move {
                        engine.apply_schema_change(msg).await;
                        Ok(())
                    }
                },
            )
            .await;
        });
    }

    async fn apply_schema_change(&self, msg: controller_proto::PullSchemaResponse) {
        let change = DeploymentChangeType::try_from(msg.change_type)
            .unwrap_or(DeploymentChangeType::DeploymentChanged);
        match change {
            DeploymentChangeType::DeploymentAdded | DeploymentChangeType::DeploymentChanged => {
                let module: SchemaModule = match serde_json::from_slice(&msg.schema_json) {
                    Ok(module) => module,
                    Err(e) => {
                        warn!(module = %msg.module_name, error = %e, "unparseable schema update");
                        return;
                    }
                };
                self.controller_schema
                    .write()
                    .unwrap()
                    .insert(module.name.clone(), module.clone());
                self.schema_changes
                    .publish(SchemaChange {
                        change,
                        name: module.name.clone(),
                        module: Some(module),
                    })
                    .await;
            }
            DeploymentChangeType::DeploymentRemoved => {
                self.controller_schema
                    .write()
                    .unwrap()
                    .remove(&msg.module_name);
                self.schema_changes
                    .publish(SchemaChange {
                        change,
                        name: msg.module_name.clone(),
                        module: None,
                    })
                    .await;
            }
        }
    }

    /// The dependency graph for the given modules (all local modules when
    /// empty). Names are resolved against local modules first, then the
    /// controller schema; unknown names fail.
    pub fn graph(&self, module_names: &[String]) -> Result<Graph, EngineError> {
        let mut out = Graph::new();
        let names: Vec<String> = if module_names.is_empty() {
            self.modules()
        } else {
            module_names.to_vec()
        };
        for name in names {
            self.build_graph(&name, &mut out)?;
        }
        Ok(out)
    }

    fn build_graph(&self, name: &str, out: &mut Graph) -> Result<(), EngineError> {
        if out.contains_key(name) {
            return Ok(());
        }
        let deps = if let Some(meta) = self.module_metas.read().unwrap().get(name) {
            meta.module.config.dependencies.clone()
        } else if let Some(schema) = self.controller_schema.read().unwrap().get(name) {
            schema.imports()
        } else {
            return Err(EngineError::ModuleNotFound(name.to_string()));
        };
        out.insert(name.to_string(), deps.clone());
        for dep in deps {
            self.build_graph(&dep, out)?;
        }
        Ok(())
    }

    /// Build all (or the named) local modules.
    ///
    /// Returns the map of emitted module schemas, including `builtin`.
    pub async fn build(&self) -> Result<HashMap<String, SchemaModule>, EngineError> {
        self.build_with_callback(None, &[]).await
    }

    /// Build and deploy all (or the named) local modules.
    pub async fn build_and_deploy(
        &self,
        replicas: i32,
        wait_for_deploy_online: bool,
        module_names: &[String],
    ) -> Result<(), EngineError> {
        let client = self.client.clone().ok_or(EngineError::NoController)?;
        let engine = self.clone();
        let callback: BuildCallback = Arc::new(move |module: Module| {
            let client = client.clone();
            let engine = engine.clone();
            Box::pin(async move {
                engine
                    .modules_to_build
                    .write()
                    .unwrap()
                    .remove(module.name());
                deploy(&module, replicas, wait_for_deploy_online, &client).await
            })
        });

        let result = self
            .build_with_callback(Some(callback), module_names)
            .await
            .map(|_| ());

        let pending: Vec<String> = {
            let mut pending: Vec<String> =
                self.modules_to_build.read().unwrap().iter().cloned().collect();
            pending.sort();
            pending
        };
        if !pending.is_empty() {
            info!(modules = %pending.join(", "), "modules waiting to build");
        }
        result
    }

    /// Deploy all already-compiled local modules in dependency order.
    pub async fn deploy(
        &self,
        replicas: i32,
        wait_for_deploy_online: bool,
    ) -> Result<(), EngineError> {
        let client = self.client.clone().ok_or(EngineError::NoController)?;
        let graph = self.graph(&[])?;
        let groups = topological_sort(&graph)?;

        for group in groups {
            let mut handles = Vec::new();
            for name in group {
                if name == "builtin" {
                    continue;
                }
                let meta = self
                    .module_metas
                    .read()
                    .unwrap()
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| EngineError::ModuleNotFound(name.clone()))?;
                let client = client.clone();
                handles.push(tokio::spawn(async move {
                    deploy(&meta.module, replicas, wait_for_deploy_online, &client).await
                }));
            }
            for handle in handles {
                handle
                    .await
                    .map_err(|e| EngineError::Discovery(format!("deploy task panicked: {e}")))??;
            }
        }
        info!("all modules deployed");
        Ok(())
    }

    /// Build the given modules (all local modules when empty), invoking
    /// `callback` after each successful module build.
    async fn build_with_callback(
        &self,
        callback: Option<BuildCallback>,
        module_names: &[String],
    ) -> Result<HashMap<String, SchemaModule>, EngineError> {
        let names: Vec<String> = if module_names.is_empty() {
            self.modules()
        } else {
            module_names.to_vec()
        };

        let mut must_build = HashSet::new();
        for name in &names {
            let meta = self
                .module_metas
                .read()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::ModuleNotFound(name.clone()))?;
            // Re-read the on-disk dependency declaration before building.
            let module = meta.module.update_dependencies()?;
            self.module_metas.write().unwrap().insert(
                name.clone(),
                ModuleMeta {
                    module,
                    last_build_start_time: meta.last_build_start_time,
                },
            );
            must_build.insert(name.clone());
        }

        let graph = self.graph(&names)?;
        let topology = topological_sort(&graph)?;

        let mut built: HashMap<String, SchemaModule> = HashMap::new();
        built.insert("builtin".to_string(), builtins());

        let mut errors: Vec<EngineError> = Vec::new();
        let mut deploys = Vec::new();
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let must_build = Arc::new(must_build);

        for group in topology {
            let built_snapshot = Arc::new(built.clone());
            let mut workers = Vec::new();
            for name in group {
                let engine = self.clone();
                let built_snapshot = built_snapshot.clone();
                let must_build = must_build.clone();
                let callback = callback.clone();
                let semaphore = semaphore.clone();
                workers.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    engine
                        .try_build(&must_build, &name, &built_snapshot, callback)
                        .await
                }));
            }
            for worker in workers {
                match worker.await {
                    Ok(Ok(Some((schema, deploy_handle)))) => {
                        built.insert(schema.name.clone(), schema);
                        if let Some(handle) = deploy_handle {
                            deploys.push(handle);
                        }
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => errors.push(e),
                    Err(e) => errors.push(EngineError::Discovery(format!(
                        "build task panicked: {e}"
                    ))),
                }
            }
        }

        for deploy_handle in deploys {
            match deploy_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(EngineError::Discovery(format!(
                    "deploy task panicked: {e}"
                ))),
            }
        }

        if !errors.is_empty() {
            return Err(EngineError::join(errors));
        }
        Ok(built)
    }

    /// Build one module if it must be built, otherwise emit its known
    /// schema. Skips (without error) when a dependency failed to build.
    #[allow(clippy::type_complexity)]
    async fn try_build(
        &self,
        must_build: &HashSet<String>,
        name: &str,
        built: &HashMap<String, SchemaModule>,
        callback: Option<BuildCallback>,
    ) -> Result<Option<(SchemaModule, Option<tokio::task::JoinHandle<Result<(), EngineError>>>)>, EngineError>
    {
        if !must_build.contains(name) {
            // Prefer the controller's schema; fall back to a local build.
            if let Some(schema) = self.controller_schema.read().unwrap().get(name).cloned() {
                return Ok(Some((schema, None)));
            }
            let schema = self.build_module(name, built).await?;
            return Ok(Some((schema, None)));
        }

        let meta = self
            .module_metas
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ModuleNotFound(name.to_string()))?;

        for dep in &meta.module.config.dependencies {
            if !built.contains_key(dep) {
                warn!(
                    module = name,
                    dependency = %dep,
                    "build skipped because dependency failed to build"
                );
                return Ok(None);
            }
        }

        self.module_metas
            .write()
            .unwrap()
            .entry(name.to_string())
            .and_modify(|meta| meta.last_build_start_time = Some(SystemTime::now()));

        let schema = self.build_module(name, built).await?;
        let deploy_handle = callback.map(|callback| tokio::spawn(callback(meta.module)));
        Ok(Some((schema, deploy_handle)))
    }

    /// Compile a module against the combined schema of its transitive
    /// dependencies and read back the schema it emitted.
    async fn build_module(
        &self,
        name: &str,
        built: &HashMap<String, SchemaModule>,
    ) -> Result<SchemaModule, EngineError> {
        let meta = self
            .module_metas
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ModuleNotFound(name.to_string()))?;

        let schema = Schema {
            modules: self.gather_schemas(built, &meta.module),
        };

        if let Some(listener) = &self.listener {
            listener.build_started(&meta.module);
        }
        let transaction = self.watcher.transaction(&meta.module.dir).await;
        self.compiler
            .build_module(&schema, &meta.module, &transaction)
            .await?;
        read_emitted_schema(&meta.module).await
    }

    /// The combined schema of a module's transitive dependencies.
    fn gather_schemas(
        &self,
        built: &HashMap<String, SchemaModule>,
        module: &Module,
    ) -> Vec<SchemaModule> {
        let metas = self.module_metas.read().unwrap();
        let mut out: HashMap<String, SchemaModule> = HashMap::new();
        let mut stack: Vec<String> = module.config.dependencies.clone();
        while let Some(dep) = stack.pop() {
            if out.contains_key(&dep) {
                continue;
            }
            if let Some(schema) = built.get(&dep) {
                out.insert(dep.clone(), schema.clone());
            } else if let Some(schema) = self.controller_schema.read().unwrap().get(&dep) {
                out.insert(dep.clone(), schema.clone());
            }
            if dep != "builtin"
                && let Some(meta) = metas.get(&dep)
            {
                stack.extend(meta.module.config.dependencies.iter().cloned());
            }
        }
        let mut modules: Vec<SchemaModule> = out.into_values().collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        modules
    }

    /// Local modules that directly depend on `name`.
    fn dependent_module_names(&self, name: &str) -> Vec<String> {
        let metas = self.module_metas.read().unwrap();
        let mut dependents: Vec<String> = metas
            .iter()
            .filter(|(_, meta)| {
                meta.module
                    .config
                    .dependencies
                    .iter()
                    .any(|dep| dep == name)
            })
            .map(|(dependent, _)| dependent.clone())
            .collect();
        dependents.sort();
        dependents
    }

    fn report_failed(&self, error: &EngineError) {
        if let Some(listener) = &self.listener {
            listener.build_failed(error);
        }
    }

    fn report_success(&self) {
        if let Some(listener) = &self.listener {
            listener.build_success();
        }
    }

    /// Build and deploy all local modules, then watch for changes,
    /// redeploying as necessary until [`Engine::close`] is called.
    pub async fn dev(&self, period: Duration) -> Result<(), EngineError> {
        let mut schema_rx = self.schema_changes.subscribe().await;
        let watch_topic = self
            .watcher
            .watch(period, (*self.module_dirs).clone(), self.shutdown.clone())
            .await;
        let mut watch_rx = watch_topic.subscribe().await;

        // Build and deploy all modules first.
        let mut did_error = false;
        match self.build_and_deploy(1, true, &[]).await {
            Ok(()) => {
                info!("all modules deployed, watching for changes...");
                self.report_success();
            }
            Err(e) => {
                error!(error = %e, "initial deploy failed");
                did_error = true;
                self.report_failed(&e);
            }
        }

        let mut module_hashes: HashMap<String, [u8; 32]> = self
            .controller_schema
            .read()
            .unwrap()
            .iter()
            .map(|(name, module)| (name.clone(), module_hash(module)))
            .collect();

        let mut did_update_deployments = false;
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return Ok(()),

                _ = quiescence(did_update_deployments, period) => {
                    info!("all modules deployed, watching for changes...");
                    // This can fire after a failure; report accordingly.
                    if !did_error {
                        self.report_success();
                    }
                    did_update_deployments = false;
                }

                event = watch_rx.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    match self.handle_watch_event(event).await {
                        Some(true) => { did_error = false; did_update_deployments = true; }
                        Some(false) => { did_error = true; }
                        None => {}
                    }
                }

                change = schema_rx.recv() => {
                    let Some(change) = change else { return Ok(()) };
                    match self.handle_schema_change(change, &mut module_hashes).await {
                        Some(true) => { did_error = false; did_update_deployments = true; }
                        Some(false) => { did_error = true; }
                        None => {}
                    }
                }
            }
        }
    }

    /// Returns `Some(true)` when deployments changed, `Some(false)` on
    /// error, `None` when the event was a no-op.
    async fn handle_watch_event(&self, event: WatchEvent) -> Option<bool> {
        match event {
            WatchEvent::ModuleAdded(module) => {
                let name = module.name().to_string();
                if self.module_metas.read().unwrap().contains_key(&name) {
                    return None;
                }
                self.module_metas.write().unwrap().insert(
                    name.clone(),
                    ModuleMeta {
                        module,
                        last_build_start_time: None,
                    },
                );
                match self.build_and_deploy(1, true, &[name.clone()]).await {
                    Ok(()) => Some(true),
                    Err(e) => {
                        error!(module = %name, error = %e, "deploy failed");
                        self.report_failed(&e);
                        Some(false)
                    }
                }
            }
            WatchEvent::ModuleRemoved(module) => {
                let name = module.name().to_string();
                let result = match &self.client {
                    Some(client) => terminate_module_deployment(client, &name).await,
                    None => Ok(()),
                };
                self.module_metas.write().unwrap().remove(&name);
                match result {
                    Ok(()) => Some(true),
                    Err(e) => {
                        error!(module = %name, error = %e, "terminate failed");
                        self.report_failed(&e);
                        Some(false)
                    }
                }
            }
            WatchEvent::ModuleChanged { module, time } => {
                let name = module.name().to_string();
                let last_build = match self.module_metas.read().unwrap().get(&name) {
                    Some(meta) => meta.last_build_start_time,
                    None => {
                        warn!(module = %name, "module not found");
                        return None;
                    }
                };
                if let Some(last_build) = last_build
                    && time < last_build
                {
                    // A build that already started has picked this change up.
                    debug!(module = %name, "skipping stale change event");
                    return None;
                }
                match self.build_and_deploy(1, true, &[name.clone()]).await {
                    Ok(()) => Some(true),
                    Err(e) => {
                        error!(module = %name, error = %e, "build and deploy failed");
                        self.report_failed(&e);
                        Some(false)
                    }
                }
            }
        }
    }

    async fn handle_schema_change(
        &self,
        change: SchemaChange,
        module_hashes: &mut HashMap<String, [u8; 32]>,
    ) -> Option<bool> {
        if change.change != DeploymentChangeType::DeploymentChanged {
            return None;
        }
        let module = change.module.as_ref()?;

        let hash = module_hash(module);
        if module_hashes.get(&change.name) == Some(&hash) {
            // Our own deploy echoing back; nothing changed.
            debug!(module = %change.name, "schema unchanged");
            return None;
        }
        module_hashes.insert(change.name.clone(), hash);

        let dependents = self.dependent_module_names(&change.name);
        if dependents.is_empty() {
            return None;
        }
        info!(
            module = %change.name,
            dependents = %dependents.join(", "),
            "schema changed; rebuilding dependents"
        );
        match self.build_and_deploy(1, true, &dependents).await {
            Ok(()) => Some(true),
            Err(e) => {
                error!(module = %change.name, error = %e, "dependent deploy failed");
                self.report_failed(&e);
                Some(false)
            }
        }
    }
}

/// Fires `2 × period` after the last deployment update; never when idle.
async fn quiescence(armed: bool, period: Duration) {
    if armed {
        tokio::time::sleep(period * 2).await
    } else {
        std::future::pending::<()>().await
    }
}
