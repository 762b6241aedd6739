// ABOUTME: Locally defined features: descriptors, interactive questions and deploy hooks
// ABOUTME: A feature is a directory with feature.toml plus optional migrations and cartridges

pub mod engine;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::ToolkitError;
use crate::migrations::{MigrationLifecycle, NoopLifecycle, ScriptRegistry};
use crate::remote::Instance;

pub use engine::{
    deploy_feature, list_deployed_features, remove_feature, DeployOptions, DeployReport,
};

pub const FEATURE_DESCRIPTOR: &str = "feature.toml";

/// A variable the feature needs a value for before deploying.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Question {
    pub name: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
    /// Read without echo.
    #[serde(default)]
    pub secret: bool,
}

impl Question {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            message: None,
            default: None,
            secret: false,
        }
    }

    pub fn prompt(&self) -> &str {
        self.message.as_deref().unwrap_or(&self.name)
    }
}

/// Contents of `feature.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeatureDescriptor {
    /// Defaults to the directory name.
    pub feature_name: String,
    /// Features that must already be deployed.
    pub requires: Vec<String>,
    pub default_vars: toml::Table,
    /// Names stored masked in the feature record.
    pub secret_vars: Vec<String>,
    pub exclude_migrations: Vec<String>,
    pub exclude_cartridges: Vec<String>,
    pub questions: Vec<Question>,
}

impl FeatureDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct Feature {
    pub descriptor: FeatureDescriptor,
    pub path: PathBuf,
}

impl Feature {
    pub fn name(&self) -> &str {
        &self.descriptor.feature_name
    }

    pub fn migrations_dir(&self) -> PathBuf {
        self.path.join("migrations")
    }

    pub fn cartridges_dir(&self) -> PathBuf {
        self.path.join("cartridges")
    }

    pub fn default_vars(&self) -> Result<Map<String, Value>> {
        let value = serde_json::to_value(&self.descriptor.default_vars)
            .with_context(|| format!("Failed to convert default vars of {}", self.name()))?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }
}

/// Every feature under `dir`, sorted by name. A missing directory has none.
pub fn collect_features(dir: &Path) -> Result<Vec<Feature>> {
    if !dir.exists() {
        debug!("No features directory at {}", dir.display());
        return Ok(Vec::new());
    }
    let mut features: Vec<Feature> = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to scan {}", dir.display()))?;
        let descriptor_path = entry.path().join(FEATURE_DESCRIPTOR);
        if !entry.file_type().is_dir() || !descriptor_path.is_file() {
            continue;
        }
        let mut descriptor = FeatureDescriptor::load(&descriptor_path)?;
        if descriptor.feature_name.is_empty() {
            descriptor.feature_name = entry.file_name().to_string_lossy().into_owned();
        }
        if let Some(other) = features
            .iter()
            .find(|f| f.name() == descriptor.feature_name)
        {
            return Err(ToolkitError::Validation(format!(
                "feature {} is defined in both {} and {}",
                descriptor.feature_name,
                other.path.display(),
                entry.path().display()
            ))
            .into());
        }
        features.push(Feature {
            descriptor,
            path: entry.path().to_path_buf(),
        });
    }
    features.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(features)
}

pub fn find_feature<'a>(features: &'a [Feature], name: &str) -> Result<&'a Feature> {
    features.iter().find(|f| f.name() == name).ok_or_else(|| {
        ToolkitError::Validation(format!("no local feature named {}", name)).into()
    })
}

/// Answers questions for variables that are still unset.
pub trait Prompter: Send + Sync {
    fn ask(&self, question: &Question) -> Result<Value>;
}

pub struct FeatureContext<'a> {
    pub instance: &'a dyn Instance,
    pub feature: &'a Feature,
}

/// Code-side hooks of a feature. All have no-op defaults.
#[async_trait]
pub trait FeatureHooks: Send + Sync {
    /// Asked in addition to the descriptor's questions.
    async fn questions(
        &self,
        _ctx: &FeatureContext<'_>,
        _vars: &Map<String, Value>,
    ) -> Result<Vec<Question>> {
        Ok(Vec::new())
    }

    async fn before_deploy(
        &self,
        _ctx: &FeatureContext<'_>,
        _vars: &mut Map<String, Value>,
    ) -> Result<()> {
        Ok(())
    }

    async fn finish(&self, _ctx: &FeatureContext<'_>, _vars: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    /// Runs before the remote record is deleted.
    async fn remove(&self, _ctx: &FeatureContext<'_>, _vars: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    /// Hooks around the feature's own migrations.
    fn lifecycle(&self) -> Arc<dyn MigrationLifecycle> {
        Arc::new(NoopLifecycle)
    }

    fn scripts(&self) -> ScriptRegistry {
        ScriptRegistry::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFeatureHooks;

impl FeatureHooks for NoopFeatureHooks {}

/// Hooks by feature name; unregistered features get no-op hooks.
#[derive(Clone, Default)]
pub struct FeatureRegistry {
    hooks: BTreeMap<String, Arc<dyn FeatureHooks>>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, hooks: impl FeatureHooks + 'static) {
        self.hooks.insert(name.to_string(), Arc::new(hooks));
    }

    pub fn hooks_for(&self, name: &str) -> Arc<dyn FeatureHooks> {
        self.hooks
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::new(NoopFeatureHooks) as Arc<dyn FeatureHooks>)
    }
}
