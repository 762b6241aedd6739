// ABOUTME: Applies pending migrations to an instance and tracks them in remote state
// ABOUTME: Runs the bootstrap gate, computes the delta and drives project hooks around each migration

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::bootstrap::bootstrap_toolkit;
use super::lifecycle::{MigrationContext, MigrationLifecycle, NoopLifecycle};
use super::{collect_migrations, compile_excludes, Migration, ScriptRegistry, NOTES_FILE};
use crate::archive::{import_archive, Archive, ImportSource, TransferOptions};
use crate::error::ToolkitError;
use crate::permissions::ReconcileOptions;
use crate::remote::webdav::{self, LOGS_DIR};
use crate::remote::{DataApi, Instance};
use crate::state::{RemoteState, ToolkitInstanceState};

pub const RUN_LOG_DIR: &str = "b2c-toolkit";

/// What happens to a migration whose failure `on_failure` handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Record it as applied; it will not run again.
    #[default]
    MarkApplied,
    /// Leave it pending so the next run retries it.
    LeaveUnapplied,
}

#[derive(Debug, Clone)]
pub struct MigrateOptions {
    /// Regular expressions matched against migration ids.
    pub exclude: Vec<String>,
    /// Persist the applied list after each migration.
    pub apply: bool,
    pub dry_run: bool,
    pub force_bootstrap: bool,
    pub allow_bootstrap: bool,
    pub vars: Map<String, Value>,
    pub failure_policy: FailurePolicy,
    pub permissions: ReconcileOptions,
    pub upload_log: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            apply: true,
            dry_run: false,
            force_bootstrap: false,
            allow_bootstrap: true,
            vars: Map::new(),
            failure_policy: FailurePolicy::default(),
            permissions: ReconcileOptions::default(),
            upload_log: true,
        }
    }
}

impl MigrateOptions {
    fn transfer(&self) -> &TransferOptions {
        &self.permissions.transfer
    }
}

/// A migrations directory with its hooks and registered scripts.
#[derive(Clone)]
pub struct MigrationProject {
    pub dir: PathBuf,
    pub lifecycle: Arc<dyn MigrationLifecycle>,
    pub scripts: ScriptRegistry,
}

impl MigrationProject {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lifecycle: Arc::new(NoopLifecycle),
            scripts: ScriptRegistry::new(),
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: impl MigrationLifecycle + 'static) -> Self {
        self.lifecycle = Arc::new(lifecycle);
        self
    }

    pub fn with_scripts(mut self, scripts: ScriptRegistry) -> Self {
        self.scripts = scripts;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    pub bootstrap_required: bool,
    pub bootstrapped: bool,
    /// Ran (or failed and were handled) and were recorded as applied.
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    /// Failed, handled, and left pending.
    pub failed: Vec<String>,
    /// Would have run; only filled in dry runs.
    pub pending: Vec<String>,
}

/// Timestamped lines mirrored to tracing and uploaded after the run.
#[derive(Default)]
struct RunLog {
    lines: Vec<String>,
}

impl RunLog {
    fn info(&mut self, line: String) {
        info!("{}", line);
        self.lines.push(format!("{} INFO {}", Utc::now().to_rfc3339(), line));
    }

    fn warn(&mut self, line: String) {
        warn!("{}", line);
        self.lines.push(format!("{} WARN {}", Utc::now().to_rfc3339(), line));
    }

    async fn upload(&self, instance: &dyn Instance) {
        let dir = webdav::join(&[LOGS_DIR, RUN_LOG_DIR]);
        let path = webdav::join(&[
            &dir,
            &format!("migrations-{}.log", Utc::now().format("%Y%m%d%H%M%S")),
        ]);
        let body = self.lines.join("\n").into_bytes();
        let result = async {
            instance.make_dir(&dir).await?;
            instance.put_file(&path, body).await
        }
        .await;
        match result {
            Ok(()) => info!("Run log written to {}", path),
            Err(e) => warn!("Could not upload run log to {}: {:#}", path, e),
        }
    }
}

async fn apply_migration(
    migration: &Migration,
    ctx: &MigrationContext<'_>,
    transfer: &TransferOptions,
) -> Result<()> {
    match migration {
        Migration::Archive { id, path } => {
            let mut archive = Archive::from_directory(path)?;
            archive.remove(NOTES_FILE);
            if archive.is_empty() {
                warn!("Migration {} has no files to import", id);
                return Ok(());
            }
            import_archive(
                ctx.instance,
                ImportSource::Archive {
                    name: id.clone(),
                    archive,
                },
                transfer,
            )
            .await
        }
        Migration::Script { script, .. } => script.run(ctx).await,
    }
}

/// Brings the instance up to date with the project's migrations.
///
/// Reruns are safe: applied migrations are skipped. Two concurrent runs
/// against the same instance can lose each other's applied-list updates.
pub async fn migrate(
    instance: &dyn Instance,
    project: &MigrationProject,
    options: &MigrateOptions,
) -> Result<MigrationReport> {
    let lifecycle = project.lifecycle.as_ref();
    let ctx = MigrationContext {
        instance,
        vars: &options.vars,
        apply: options.apply,
        dry_run: options.dry_run,
    };
    let mut report = MigrationReport::default();
    let mut log = RunLog::default();

    lifecycle.init(&ctx).await.context("Project init hook failed")?;

    let remote = RemoteState::new(instance);
    let loaded = remote.load_toolkit_state().await?;
    report.bootstrap_required = loaded
        .as_ref()
        .map_or(true, |s| s.needs_bootstrap(instance.client_id()));
    let mut state = loaded.unwrap_or_default();

    let forced = options.force_bootstrap
        || lifecycle
            .should_bootstrap(&ctx)
            .await
            .context("Project should_bootstrap hook failed")?;
    if report.bootstrap_required || forced {
        if options.dry_run {
            log.info("Dry run: a bootstrap would run first".to_string());
        } else if !options.allow_bootstrap {
            if report.bootstrap_required {
                return Err(ToolkitError::Migration(
                    "the instance needs a bootstrap but bootstrapping is disabled".to_string(),
                )
                .into());
            }
            warn!("Bootstrap requested but bootstrapping is disabled; skipping");
        } else {
            state = bootstrap_toolkit(instance, &options.permissions).await?;
            lifecycle
                .on_bootstrap(&ctx)
                .await
                .context("Project on_bootstrap hook failed")?;
            report.bootstrapped = true;
        }
    }

    let excludes = compile_excludes(&options.exclude)?;
    let local = collect_migrations(&project.dir, &project.scripts, &excludes)?;
    let mut pending: Vec<String> = local
        .iter()
        .map(|m| m.id().to_string())
        .filter(|id| !state.is_applied(id))
        .collect();
    lifecycle
        .before_all(&mut pending, &ctx)
        .await
        .context("Project before_all hook failed")?;

    if pending.is_empty() {
        info!("No migrations to apply");
    } else {
        info!("{} migration(s) to apply", pending.len());
    }

    for id in &pending {
        let Some(migration) = local.iter().find(|m| m.id() == id.as_str()) else {
            warn!("Hook scheduled unknown migration {}; skipping", id);
            continue;
        };
        if let Some(notes) = migration.notes() {
            info!("{}:\n{}", id, notes);
        }
        if options.dry_run {
            log.info(format!("Dry run: would apply {}", id));
            report.pending.push(id.clone());
            continue;
        }
        if !lifecycle
            .before_each(id, &ctx)
            .await
            .with_context(|| format!("before_each hook failed for {}", id))?
        {
            log.info(format!("Skipping {}", id));
            report.skipped.push(id.clone());
            continue;
        }

        log.info(format!("Applying {}", id));
        let mark = match apply_migration(migration, &ctx, options.transfer()).await {
            Ok(()) => true,
            Err(e) => {
                let e = e.context(format!("Migration {} failed", id));
                log.warn(format!("{:#}", e));
                lifecycle.on_failure(id, e, &ctx).await?;
                log.warn(format!("Failure of {} was handled by the project", id));
                options.failure_policy == FailurePolicy::MarkApplied
            }
        };

        if mark {
            record_applied(&remote, &mut state, id, options.apply).await?;
            report.applied.push(id.clone());
        } else {
            report.failed.push(id.clone());
        }
        lifecycle
            .after_each(id, &ctx)
            .await
            .with_context(|| format!("after_each hook failed for {}", id))?;
    }

    lifecycle
        .after_all(&report.applied, &ctx)
        .await
        .context("Project after_all hook failed")?;

    if options.upload_log && !options.dry_run && !log.lines.is_empty() {
        log.upload(instance).await;
    }
    Ok(report)
}

async fn record_applied<D: DataApi + ?Sized>(
    remote: &RemoteState<'_, D>,
    state: &mut ToolkitInstanceState,
    id: &str,
    persist: bool,
) -> Result<()> {
    state.applied_migrations.push(id.to_string());
    if persist {
        remote
            .save_applied_migrations(&state.applied_migrations)
            .await
            .with_context(|| format!("Migration {} ran but could not be recorded", id))?;
    }
    Ok(())
}
