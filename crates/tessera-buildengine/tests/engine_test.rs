// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Offline build engine tests with a scripted compiler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tessera_buildengine::moduleconfig::CONFIG_FILE;
use tessera_buildengine::{Engine, EngineError, FileHashes, Module, ModuleCompiler, topological_sort};
use tessera_schema::{Decl, Module as SchemaModule, Schema, Type, Verb};

/// Compiler that emits a minimal schema and records build order.
struct ScriptedCompiler {
    built: Arc<Mutex<Vec<String>>>,
    fail: Vec<String>,
}

impl ScriptedCompiler {
    fn new(fail: &[&str]) -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        let built = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                built: built.clone(),
                fail: fail.iter().map(|s| s.to_string()).collect(),
            }),
            built,
        )
    }
}

#[async_trait::async_trait]
impl ModuleCompiler for ScriptedCompiler {
    async fn build_module(
        &self,
        _schema: &Schema,
        module: &Module,
        _transaction: &FileHashes,
    ) -> Result<(), EngineError> {
        let name = module.name().to_string();
        self.built.lock().unwrap().push(name.clone());
        if self.fail.contains(&name) {
            return Err(EngineError::Build {
                module: name,
                message: "scripted failure".to_string(),
            });
        }
        let schema = SchemaModule {
            name: name.clone(),
            comments: vec![],
            decls: vec![Decl::Verb(Verb {
                name: "ping".to_string(),
                comments: vec![],
                export: true,
                request: Type::Unit,
                response: Type::Unit,
                cron: None,
                ingress: None,
            })],
        };
        std::fs::create_dir_all(module.deploy_dir()).unwrap();
        std::fs::write(
            module.schema_path(),
            serde_json::to_vec(&schema).unwrap(),
        )
        .unwrap();
        Ok(())
    }
}

fn write_module(root: &Path, name: &str, deps: &[&str]) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let deps = deps
        .iter()
        .map(|d| format!("\"{d}\""))
        .collect::<Vec<_>>()
        .join(", ");
    std::fs::write(
        dir.join(CONFIG_FILE),
        format!("module = \"{name}\"\nlanguage = \"test\"\ndependencies = [{deps}]\n"),
    )
    .unwrap();
}

async fn engine_for(
    root: &Path,
    compiler: Arc<ScriptedCompiler>,
) -> Engine {
    Engine::new(None, vec![root.to_path_buf()], compiler)
        .await
        .unwrap()
        .with_parallelism(4)
}

#[tokio::test]
async fn linear_dependency_build() {
    let root = tempfile::tempdir().unwrap();
    write_module(root.path(), "a", &["b"]);
    write_module(root.path(), "b", &["builtin"]);

    let (compiler, order) = ScriptedCompiler::new(&[]);
    let engine = engine_for(root.path(), compiler).await;

    let graph = engine.graph(&["a".to_string()]).unwrap();
    let expected: HashMap<String, Vec<String>> = [
        ("a".to_string(), vec!["b".to_string()]),
        ("b".to_string(), vec!["builtin".to_string()]),
        ("builtin".to_string(), vec![]),
    ]
    .into_iter()
    .collect();
    assert_eq!(graph, expected);

    let groups = topological_sort(&graph).unwrap();
    assert_eq!(
        groups,
        vec![
            vec!["builtin".to_string()],
            vec!["b".to_string()],
            vec!["a".to_string()],
        ]
    );

    let built = engine.build().await.unwrap();
    let mut names: Vec<_> = built.keys().cloned().collect();
    names.sort();
    assert_eq!(names, vec!["a", "b", "builtin"]);

    let order = order.lock().unwrap().clone();
    assert_eq!(order, vec!["b", "a"], "dependency must build first");
}

#[tokio::test]
async fn unknown_module_fails_graph() {
    let root = tempfile::tempdir().unwrap();
    write_module(root.path(), "a", &["ghost"]);

    let (compiler, _) = ScriptedCompiler::new(&[]);
    let engine = engine_for(root.path(), compiler).await;

    match engine.graph(&["a".to_string()]) {
        Err(EngineError::ModuleNotFound(name)) => assert_eq!(name, "ghost"),
        other => panic!("expected ModuleNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_dependency_skips_dependents_without_extra_errors() {
    let root = tempfile::tempdir().unwrap();
    write_module(root.path(), "a", &["b"]);
    write_module(root.path(), "b", &["builtin"]);

    let (compiler, order) = ScriptedCompiler::new(&["b"]);
    let engine = engine_for(root.path(), compiler).await;

    let err = engine.build().await.unwrap_err();
    assert!(err.to_string().contains("b"), "error names the failing module: {err}");
    assert!(
        !err.to_string().contains("a:"),
        "dependents are skipped, not failed: {err}"
    );

    // Only b was attempted; a was skipped with a warning.
    let order = order.lock().unwrap().clone();
    assert_eq!(order, vec!["b"]);
}

#[tokio::test]
async fn imported_schemas_satisfy_dependencies_without_building() {
    let root = tempfile::tempdir().unwrap();
    write_module(root.path(), "a", &["remote"]);

    let (compiler, order) = ScriptedCompiler::new(&[]);
    let engine = engine_for(root.path(), compiler).await;
    engine.import(SchemaModule::new("remote"));

    let built = engine.build().await.unwrap();
    assert!(built.contains_key("a"));
    assert!(built.contains_key("remote"));
    assert!(built.contains_key("builtin"));

    // Only the local module was compiled.
    assert_eq!(order.lock().unwrap().clone(), vec!["a"]);
}

#[tokio::test]
async fn rebuild_picks_up_dependency_declaration_changes() {
    let root = tempfile::tempdir().unwrap();
    write_module(root.path(), "a", &[]);
    write_module(root.path(), "b", &["builtin"]);

    let (compiler, _) = ScriptedCompiler::new(&[]);
    let engine = engine_for(root.path(), compiler).await;
    engine.build().await.unwrap();

    // The config on disk grows a dependency; the next build re-reads it.
    write_module(root.path(), "a", &["b"]);
    engine.build().await.unwrap();
    let refreshed = engine.graph(&["a".to_string()]).unwrap();
    assert_eq!(refreshed.get("a").unwrap(), &vec!["b".to_string()]);
}
