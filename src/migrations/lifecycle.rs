// ABOUTME: Project hooks around a migration run and the script migration interface
// ABOUTME: Every hook has a no-op default so projects implement only what they need

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::remote::Instance;

/// What hooks and scripts see of the current run.
pub struct MigrationContext<'a> {
    pub instance: &'a dyn Instance,
    pub vars: &'a Map<String, Value>,
    /// Whether applied migrations are persisted to the instance.
    pub apply: bool,
    pub dry_run: bool,
}

/// A migration implemented in code rather than as a site archive.
#[async_trait]
pub trait MigrationScript: Send + Sync {
    async fn run(&self, ctx: &MigrationContext<'_>) -> Result<()>;

    /// Shown before the migration runs, and in dry runs.
    fn notes(&self) -> Option<String> {
        None
    }
}

/// Project-level hooks. The engine calls them in run order:
/// `init`, `should_bootstrap`, `on_bootstrap`, `before_all`, then
/// `before_each`/`after_each` (or `on_failure`) per migration, and
/// `after_all`.
#[async_trait]
pub trait MigrationLifecycle: Send + Sync {
    async fn init(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Forces a bootstrap that is not otherwise due. Cannot skip a required one.
    async fn should_bootstrap(&self, _ctx: &MigrationContext<'_>) -> Result<bool> {
        Ok(false)
    }

    async fn on_bootstrap(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
        Ok(())
    }

    /// May reorder or drop pending migration ids.
    async fn before_all(
        &self,
        _pending: &mut Vec<String>,
        _ctx: &MigrationContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    /// Returning `false` skips the migration for this run.
    async fn before_each(&self, _migration: &str, _ctx: &MigrationContext<'_>) -> Result<bool> {
        Ok(true)
    }

    async fn after_each(&self, _migration: &str, _ctx: &MigrationContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn after_all(&self, _applied: &[String], _ctx: &MigrationContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Returning `Ok` marks the failure handled and the run continues.
    async fn on_failure(
        &self,
        _migration: &str,
        error: anyhow::Error,
        _ctx: &MigrationContext<'_>,
    ) -> Result<()> {
        Err(error)
    }
}

/// Lifecycle for projects without hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLifecycle;

impl MigrationLifecycle for NoopLifecycle {}
