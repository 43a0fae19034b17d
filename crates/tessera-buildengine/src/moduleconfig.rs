// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-module configuration (`tessera.toml`).

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// File name looked for at a module's root.
pub const CONFIG_FILE: &str = "tessera.toml";

/// Parsed `tessera.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModuleConfig {
    /// Module name; the unit of deployment.
    pub module: String,
    /// Language tag of the toolchain that builds this module.
    pub language: String,
    /// Names of modules this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Shell command invoked to build the module (optional for languages
    /// with a built-in compiler integration).
    #[serde(default)]
    pub build: Option<String>,
    /// Directory (relative to the module root) for intermediate build
    /// output. Never watched.
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    /// Directory (relative to the module root) holding deployable
    /// artefacts. Never watched.
    #[serde(default = "default_deploy_dir")]
    pub deploy_dir: String,
    /// Schema file the compiler emits, relative to `deploy_dir`.
    #[serde(default = "default_schema")]
    pub schema: String,
}

fn default_build_dir() -> String {
    "_build".to_string()
}

fn default_deploy_dir() -> String {
    "_deploy".to_string()
}

fn default_schema() -> String {
    "schema.json".to_string()
}

/// A local module: its config and absolute source directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub config: ModuleConfig,
    pub dir: PathBuf,
}

/// Errors loading a module config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Module {
    /// Load a module from its directory.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: ModuleConfig =
            toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?;
        Ok(Self {
            config,
            dir: dir.to_path_buf(),
        })
    }

    /// Re-read the on-disk dependency declaration, refreshing this module.
    pub fn update_dependencies(self) -> Result<Self, ConfigError> {
        Self::load(&self.dir)
    }

    pub fn name(&self) -> &str {
        &self.config.module
    }

    /// Absolute path of the schema file the compiler emits.
    pub fn schema_path(&self) -> PathBuf {
        self.dir
            .join(&self.config.deploy_dir)
            .join(&self.config.schema)
    }

    /// Absolute path of the deploy directory.
    pub fn deploy_dir(&self) -> PathBuf {
        self.dir.join(&self.config.deploy_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: ModuleConfig = toml::from_str(
            r#"
            module = "echo"
            language = "rust"
            "#,
        )
        .unwrap();
        assert_eq!(config.module, "echo");
        assert_eq!(config.dependencies, Vec::<String>::new());
        assert_eq!(config.build_dir, "_build");
        assert_eq!(config.deploy_dir, "_deploy");
        assert_eq!(config.schema, "schema.json");
        assert!(config.build.is_none());
    }

    #[test]
    fn full_config_round_trip() {
        let config: ModuleConfig = toml::from_str(
            r#"
            module = "shop"
            language = "go"
            dependencies = ["billing", "builtin"]
            build = "make schema"
            build_dir = "out"
            deploy_dir = "dist"
            schema = "module.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.dependencies, vec!["billing", "builtin"]);
        assert_eq!(config.build.as_deref(), Some("make schema"));
        assert_eq!(config.deploy_dir, "dist");
    }

    #[test]
    fn load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "module = \"echo\"\nlanguage = \"rust\"\n",
        )
        .unwrap();
        let module = Module::load(dir.path()).unwrap();
        assert_eq!(module.name(), "echo");
        assert_eq!(
            module.schema_path(),
            dir.path().join("_deploy").join("schema.json")
        );
    }

    #[test]
    fn missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Module::load(dir.path()),
            Err(ConfigError::Read { .. })
        ));
    }
}
