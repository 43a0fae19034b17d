// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Module discovery: finding `tessera.toml` files under the source roots.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::moduleconfig::{CONFIG_FILE, Module};

/// Find all modules under the given roots.
///
/// A directory containing `tessera.toml` is a module; its subdirectories
/// are not searched further (nested modules are not a thing). Hidden
/// directories are skipped. Unreadable configs are logged and skipped so a
/// broken module doesn't hide its siblings.
pub fn discover_modules(dirs: &[PathBuf]) -> std::io::Result<Vec<Module>> {
    let mut modules = Vec::new();
    for dir in dirs {
        walk(dir, &mut modules)?;
    }
    modules.sort_by(|a, b| a.config.module.cmp(&b.config.module));
    Ok(modules)
}

fn walk(dir: &Path, out: &mut Vec<Module>) -> std::io::Result<()> {
    if dir.join(CONFIG_FILE).is_file() {
        match Module::load(dir) {
            Ok(module) => out.push(module),
            Err(e) => warn!(dir = %dir.display(), error = %e, "skipping unreadable module"),
        }
        return Ok(());
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        // A root may vanish between discovery passes; treat as empty.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        walk(&path, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_module(root: &Path, name: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(CONFIG_FILE),
            format!("module = \"{name}\"\nlanguage = \"rust\"\n"),
        )
        .unwrap();
    }

    #[test]
    fn finds_modules_under_roots() {
        let root = tempfile::tempdir().unwrap();
        write_module(root.path(), "alpha");
        write_module(root.path(), "beta");
        std::fs::create_dir_all(root.path().join("not-a-module")).unwrap();

        let modules = discover_modules(&[root.path().to_path_buf()]).unwrap();
        let names: Vec<_> = modules.iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn does_not_recurse_into_modules() {
        let root = tempfile::tempdir().unwrap();
        write_module(root.path(), "outer");
        // A config nested inside a module is part of that module's tree.
        write_module(&root.path().join("outer"), "inner");

        let modules = discover_modules(&[root.path().to_path_buf()]).unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name(), "outer");
    }

    #[test]
    fn missing_root_is_empty() {
        let modules =
            discover_modules(&[PathBuf::from("/nonexistent/tessera/modules")]).unwrap();
        assert!(modules.is_empty());
    }
}
