// ABOUTME: Command-line surface of the toolkit
// ABOUTME: Parses arguments, builds the connection and project config, and dispatches to the engines

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::{Input, Password};
use serde_json::{Map, Value};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::archive::{export_archive, import_archive, ImportSource, TransferOptions};
use crate::code::{
    activate_code_version, find_cartridges, list_code_versions, reload_code_version,
    resolve_code_version, sync_cartridges, watch_cartridges, Cartridge, SyncOptions, WatchOptions,
};
use crate::config::{parse_vars, InstanceConfig, ProjectConfig};
use crate::features::{
    collect_features, deploy_feature, find_feature, list_deployed_features, remove_feature,
    DeployOptions, FeatureRegistry, Prompter, Question,
};
use crate::migrations::{
    compile_excludes, migrate, FailurePolicy, MigrateOptions, MigrationProject,
};
use crate::remote::{Connection, Instance, JobRunner};

#[derive(Debug, Parser)]
#[command(name = "b2c-toolkit")]
#[command(author, version, about = "Migrations, features and code deployment for B2C commerce instances", long_about = None)]
pub struct Cli {
    /// Instance credentials file (dw.json).
    #[arg(long, global = true, env = "SFCC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Project file (b2c-toolkit.toml).
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,

    #[arg(long, short = 's', global = true)]
    pub server: Option<String>,

    #[arg(long, global = true)]
    pub client_id: Option<String>,

    #[arg(long, global = true)]
    pub client_secret: Option<String>,

    #[arg(long, short = 'u', global = true)]
    pub username: Option<String>,

    #[arg(long, short = 'p', global = true)]
    pub password: Option<String>,

    #[arg(long, global = true)]
    pub code_version: Option<String>,

    /// Variable as key=value; may be repeated.
    #[arg(long = "var", global = true, value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// Increase log verbosity.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Instance settings from the file and environment, overridden by flags.
    pub fn instance_config(&self) -> Result<InstanceConfig> {
        let mut config = InstanceConfig::discover(self.config.as_deref())?;
        let flags = [
            (&mut config.hostname, &self.server),
            (&mut config.client_id, &self.client_id),
            (&mut config.client_secret, &self.client_secret),
            (&mut config.username, &self.username),
            (&mut config.password, &self.password),
            (&mut config.code_version, &self.code_version),
        ];
        for (target, flag) in flags {
            if let Some(value) = flag {
                *target = Some(value.clone());
            }
        }
        Ok(config)
    }

    pub fn project_config(&self) -> Result<ProjectConfig> {
        ProjectConfig::discover(self.project.as_deref())
    }

    pub fn supplied_vars(&self) -> Result<Map<String, Value>> {
        parse_vars(&self.vars)
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Apply pending migrations.
    Migrate(MigrateArgs),
    /// Import a site archive from a directory or zip file.
    Import {
        path: PathBuf,
        /// Leave the staged zip on the instance.
        #[arg(long)]
        keep: bool,
    },
    /// Export data units to a local zip file.
    Export {
        /// Data units document as JSON, e.g. '{"global_data":{"meta_data":true}}'.
        #[arg(long)]
        data_units: String,
        #[arg(long, short = 'o', default_value = "export.zip")]
        output: PathBuf,
    },
    /// Deploy and manage code.
    #[command(subcommand)]
    Code(CodeCommand),
    /// Deploy and manage features.
    #[command(subcommand)]
    Feature(FeatureCommand),
    /// Run remote jobs.
    #[command(subcommand)]
    Job(JobCommand),
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Report what would run without changing the instance.
    #[arg(long)]
    pub dry_run: bool,
    /// Run migrations without recording them as applied.
    #[arg(long)]
    pub no_apply: bool,
    #[arg(long)]
    pub force_bootstrap: bool,
    /// Fail instead of bootstrapping an instance that needs it.
    #[arg(long)]
    pub no_bootstrap: bool,
    /// Regular expression of migration ids to skip; may be repeated.
    #[arg(long)]
    pub exclude: Vec<String>,
    /// Keep handled failures pending so the next run retries them.
    #[arg(long)]
    pub retry_failed: bool,
    /// Migrations directory, overriding the project file.
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum CodeCommand {
    /// Upload every cartridge to the code version.
    Deploy {
        /// Re-activate the code version afterwards.
        #[arg(long)]
        reload: bool,
        /// Upload over the remote cartridges instead of replacing them.
        #[arg(long)]
        keep_existing: bool,
    },
    /// Upload cartridge changes as they happen.
    Watch,
    /// List code versions.
    List,
    /// Activate a code version.
    Activate {
        version: String,
        /// Switch away and back to force a reload.
        #[arg(long)]
        reload: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum FeatureCommand {
    /// Show local and deployed features.
    List,
    Deploy {
        name: String,
        /// Mask secret vars without storing their values.
        #[arg(long)]
        no_save_secrets: bool,
        /// Never prompt; unanswered questions fail.
        #[arg(long)]
        no_prompt: bool,
    },
    /// Run the remove hook and delete the feature record.
    Remove { name: String },
}

#[derive(Debug, Subcommand)]
pub enum JobCommand {
    Run {
        job_id: String,
        /// Wait until the execution finishes.
        #[arg(long)]
        wait: bool,
        /// Job parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        parameters: String,
    },
}

/// Asks questions on the terminal.
pub struct DialoguerPrompter;

impl Prompter for DialoguerPrompter {
    fn ask(&self, question: &Question) -> Result<Value> {
        let default = question.default.as_ref().map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        let text = if question.secret {
            let text = Password::new()
                .with_prompt(question.prompt())
                .allow_empty_password(default.is_some())
                .interact()
                .with_context(|| format!("Failed to read {}", question.name))?;
            match default {
                Some(d) if text.is_empty() => d,
                _ => text,
            }
        } else {
            let mut input = Input::<String>::new().with_prompt(question.prompt());
            if let Some(d) = default {
                input = input.default(d);
            }
            input
                .interact_text()
                .with_context(|| format!("Failed to read {}", question.name))?
        };
        Ok(serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text)))
    }
}

fn cartridges_in(root: &Path, project: &ProjectConfig) -> Result<Vec<Cartridge>> {
    let excludes = compile_excludes(&project.exclude_cartridges)?;
    find_cartridges(root, &excludes)
}

/// Runs one parsed command line. Project hooks for features come from
/// `registry`; the binary passes an empty one.
pub async fn run(cli: Cli, registry: &FeatureRegistry) -> Result<()> {
    let project = cli.project_config()?;
    let supplied = cli.supplied_vars()?;
    let connection = Connection::new(cli.instance_config()?)?;
    let instance: &dyn Instance = &connection;

    match cli.command {
        Commands::Migrate(args) => {
            let mut vars = project.default_vars()?;
            vars.extend(supplied);
            let mut exclude = project.exclude_migrations.clone();
            exclude.extend(args.exclude);
            let options = MigrateOptions {
                exclude,
                apply: !args.no_apply,
                dry_run: args.dry_run,
                force_bootstrap: args.force_bootstrap,
                allow_bootstrap: !args.no_bootstrap,
                vars,
                failure_policy: if args.retry_failed {
                    FailurePolicy::LeaveUnapplied
                } else {
                    FailurePolicy::MarkApplied
                },
                ..MigrateOptions::default()
            };
            let dir = args.dir.unwrap_or_else(|| project.migrations_dir.clone());
            let report = migrate(instance, &MigrationProject::new(dir), &options).await?;
            if options.dry_run {
                info!("{} migration(s) pending", report.pending.len());
            } else {
                info!(
                    "{} applied, {} skipped, {} failed",
                    report.applied.len(),
                    report.skipped.len(),
                    report.failed.len()
                );
            }
        }
        Commands::Import { path, keep } => {
            let source = if path.is_dir() {
                ImportSource::Directory(path)
            } else {
                ImportSource::ZipFile(path)
            };
            let options = TransferOptions {
                keep,
                ..TransferOptions::default()
            };
            import_archive(instance, source, &options).await?;
        }
        Commands::Export { data_units, output } => {
            let data_units: Value =
                serde_json::from_str(&data_units).context("--data-units is not valid JSON")?;
            let archive = export_archive(instance, &data_units, &TransferOptions::default()).await?;
            let root = output
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("export")
                .to_string();
            std::fs::write(&output, archive.to_zip(&root)?)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("Wrote {}", output.display());
        }
        Commands::Code(command) => run_code(command, instance, &project).await?,
        Commands::Feature(command) => {
            run_feature(command, instance, &project, supplied, registry).await?
        }
        Commands::Job(JobCommand::Run {
            job_id,
            wait,
            parameters,
        }) => {
            let parameters: Value =
                serde_json::from_str(&parameters).context("--parameters is not valid JSON")?;
            let runner = JobRunner::new(instance);
            let execution = if wait {
                runner.run_job(&job_id, &parameters).await?
            } else {
                runner.execute_job(&job_id, &parameters).await?
            };
            println!("{} {} {}", execution.job_id, execution.id, execution.status);
        }
    }
    Ok(())
}

async fn run_code(
    command: CodeCommand,
    instance: &dyn Instance,
    project: &ProjectConfig,
) -> Result<()> {
    match command {
        CodeCommand::Deploy {
            reload,
            keep_existing,
        } => {
            let cartridges = cartridges_in(&project.cartridges_dir, project)?;
            let version = resolve_code_version(instance).await?;
            let options = SyncOptions {
                delete_existing: !keep_existing,
                reload,
            };
            sync_cartridges(instance, &version, &cartridges, &options).await?;
        }
        CodeCommand::Watch => {
            let cartridges = cartridges_in(&project.cartridges_dir, project)?;
            let version = resolve_code_version(instance).await?;
            watch_cartridges(instance, &version, &cartridges, WatchOptions::default()).await?;
        }
        CodeCommand::List => {
            for version in list_code_versions(instance).await? {
                println!(
                    "{} {} {}",
                    if version.active { "*" } else { " " },
                    version.id,
                    version.last_modification_time.unwrap_or_default()
                );
            }
        }
        CodeCommand::Activate { version, reload } => {
            if reload {
                reload_code_version(instance, &version).await?;
            } else {
                activate_code_version(instance, &version).await?;
            }
        }
    }
    Ok(())
}

async fn run_feature(
    command: FeatureCommand,
    instance: &dyn Instance,
    project: &ProjectConfig,
    supplied: Map<String, Value>,
    registry: &FeatureRegistry,
) -> Result<()> {
    let features = collect_features(&project.features_dir)?;
    match command {
        FeatureCommand::List => {
            let deployed = list_deployed_features(instance).await?;
            for feature in &features {
                let state = match deployed.iter().find(|r| r.feature_name == feature.name()) {
                    Some(_) => "deployed",
                    None => "not deployed",
                };
                println!("{} ({})", feature.name(), state);
            }
            for record in deployed
                .iter()
                .filter(|r| !features.iter().any(|f| f.name() == r.feature_name))
            {
                println!("{} (deployed, no local definition)", record.feature_name);
            }
            for record in &deployed {
                println!(
                    "  {} vars: {}",
                    record.feature_name,
                    Value::Object(record.vars.clone())
                );
            }
        }
        FeatureCommand::Deploy {
            name,
            no_save_secrets,
            no_prompt,
        } => {
            let feature = find_feature(&features, &name)?;
            let hooks = registry.hooks_for(&name);
            let interactive = !no_prompt && std::io::stdin().is_terminal();
            let prompter: Option<&dyn Prompter> = if interactive {
                Some(&DialoguerPrompter)
            } else {
                None
            };
            let options = DeployOptions {
                vars: supplied,
                save_secrets: !no_save_secrets,
                ..DeployOptions::default()
            };
            let report =
                deploy_feature(instance, feature, hooks.as_ref(), prompter, &options).await?;
            info!(
                "Feature {}: {} migration(s) applied, {} cartridge(s) deployed",
                report.feature_name,
                report.migrations.applied.len(),
                report.cartridges.len()
            );
        }
        FeatureCommand::Remove { name } => {
            let feature = find_feature(&features, &name)?;
            let hooks = registry.hooks_for(&name);
            remove_feature(instance, feature, hooks.as_ref()).await?;
        }
    }
    Ok(())
}
