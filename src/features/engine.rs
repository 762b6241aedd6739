// ABOUTME: Deploys, removes and lists features on an instance
// ABOUTME: Merges variables, runs feature migrations and cartridges, and keeps one record per feature

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::{Feature, FeatureContext, FeatureHooks, Prompter, Question};
use crate::code::{find_cartridges, resolve_code_version, sync_cartridges, SyncOptions};
use crate::error::ToolkitError;
use crate::migrations::bootstrap::bootstrap_features;
use crate::migrations::{
    compile_excludes, migrate, FailurePolicy, MigrateOptions, MigrationProject, MigrationReport,
};
use crate::permissions::ReconcileOptions;
use crate::remote::Instance;
use crate::state::{FeatureRecord, RemoteState, SECRET_MASK};

#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Supplied vars; they win over stored and default ones.
    pub vars: Map<String, Value>,
    /// Store secret values in the record's secret map. When off they are
    /// only masked.
    pub save_secrets: bool,
    pub allow_bootstrap: bool,
    pub failure_policy: FailurePolicy,
    pub permissions: ReconcileOptions,
    pub sync: SyncOptions,
    /// Falls back to the instance's configured or active version.
    pub code_version: Option<String>,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            vars: Map::new(),
            save_secrets: true,
            allow_bootstrap: true,
            failure_policy: FailurePolicy::default(),
            permissions: ReconcileOptions::default(),
            sync: SyncOptions::default(),
            code_version: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeployReport {
    pub feature_name: String,
    pub bootstrapped: bool,
    pub migrations: MigrationReport,
    pub cartridges: Vec<String>,
}

/// Right-most layer wins.
pub fn merge_vars(layers: &[&Map<String, Value>]) -> Map<String, Value> {
    let mut merged = Map::new();
    for layer in layers {
        for (k, v) in layer.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Splits vars into the stored map (secrets masked) and the secret map.
pub fn mask_secrets(
    vars: &Map<String, Value>,
    secret_names: &[String],
    save_secrets: bool,
) -> (Map<String, Value>, Map<String, Value>) {
    let mut stored = vars.clone();
    let mut secrets = Map::new();
    for name in secret_names {
        let Some(value) = vars.get(name).filter(|v| !v.is_null()) else {
            continue;
        };
        stored.insert(name.clone(), Value::String(SECRET_MASK.to_string()));
        if save_secrets {
            secrets.insert(name.clone(), value.clone());
        }
    }
    (stored, secrets)
}

fn is_unset(vars: &Map<String, Value>, name: &str) -> bool {
    vars.get(name).map_or(true, Value::is_null)
}

async fn answer_questions(
    hooks: &dyn FeatureHooks,
    ctx: &FeatureContext<'_>,
    vars: &mut Map<String, Value>,
    prompter: Option<&dyn Prompter>,
) -> Result<()> {
    let mut questions: Vec<Question> = ctx.feature.descriptor.questions.clone();
    questions.extend(
        hooks
            .questions(ctx, vars)
            .await
            .context("Feature questions hook failed")?,
    );
    for question in questions {
        if !is_unset(vars, &question.name) {
            continue;
        }
        let answer = match (prompter, &question.default) {
            (Some(prompter), _) => prompter.ask(&question)?,
            (None, Some(default)) => default.clone(),
            (None, None) => {
                return Err(ToolkitError::Validation(format!(
                    "variable {} of feature {} has no value; pass it with --var",
                    question.name,
                    ctx.feature.name()
                ))
                .into())
            }
        };
        vars.insert(question.name, answer);
    }
    Ok(())
}

/// Deploys one feature: hooks, bootstrap if due, feature migrations,
/// feature cartridges, then the feature record.
pub async fn deploy_feature(
    instance: &dyn Instance,
    feature: &Feature,
    hooks: &dyn FeatureHooks,
    prompter: Option<&dyn Prompter>,
    options: &DeployOptions,
) -> Result<DeployReport> {
    let name = feature.name();
    let remote = RemoteState::new(instance);
    let mut state = remote.load_feature_state().await?;

    let stored = state
        .feature(name)
        .map(FeatureRecord::unmasked_vars)
        .unwrap_or_default();
    let mut vars = merge_vars(&[&feature.default_vars()?, &stored, &options.vars]);

    let ctx = FeatureContext { instance, feature };
    answer_questions(hooks, &ctx, &mut vars, prompter).await?;
    hooks
        .before_deploy(&ctx, &mut vars)
        .await
        .context("Feature before_deploy hook failed")?;

    let mut report = DeployReport {
        feature_name: name.to_string(),
        ..Default::default()
    };
    if state.needs_bootstrap(instance.client_id()) {
        if !options.allow_bootstrap {
            return Err(ToolkitError::Migration(
                "the instance needs a feature bootstrap but bootstrapping is disabled".to_string(),
            )
            .into());
        }
        state = bootstrap_features(instance, &options.permissions).await?;
        report.bootstrapped = true;
    }

    // Records may only have become readable through the bootstrap.
    let missing: Vec<&str> = feature
        .descriptor
        .requires
        .iter()
        .map(String::as_str)
        .filter(|r| state.feature(r).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(ToolkitError::Validation(format!(
            "feature {} requires {} to be deployed first",
            name,
            missing.join(", ")
        ))
        .into());
    }

    info!("Deploying feature {}", name);
    let project = MigrationProject {
        dir: feature.migrations_dir(),
        lifecycle: hooks.lifecycle(),
        scripts: hooks.scripts(),
    };
    let migrate_options = MigrateOptions {
        exclude: feature.descriptor.exclude_migrations.clone(),
        allow_bootstrap: options.allow_bootstrap,
        vars: vars.clone(),
        failure_policy: options.failure_policy,
        permissions: options.permissions.clone(),
        ..MigrateOptions::default()
    };
    report.migrations = migrate(instance, &project, &migrate_options)
        .await
        .with_context(|| format!("Migrations of feature {} failed", name))?;

    let cartridges_dir = feature.cartridges_dir();
    if cartridges_dir.is_dir() {
        let excludes = compile_excludes(&feature.descriptor.exclude_cartridges)?;
        let cartridges = find_cartridges(&cartridges_dir, &excludes)?;
        if !cartridges.is_empty() {
            let code_version = match &options.code_version {
                Some(version) => version.clone(),
                None => resolve_code_version(instance).await?,
            };
            sync_cartridges(instance, &code_version, &cartridges, &options.sync).await?;
            report.cartridges = cartridges.into_iter().map(|c| c.name).collect();
        }
    }

    hooks
        .finish(&ctx, &vars)
        .await
        .context("Feature finish hook failed")?;

    let (stored_vars, secret_vars) =
        mask_secrets(&vars, &feature.descriptor.secret_vars, options.save_secrets);
    let record = FeatureRecord {
        feature_name: name.to_string(),
        vars: stored_vars,
        secret_vars,
        ..Default::default()
    };
    remote
        .put_feature(&record)
        .await
        .with_context(|| format!("Feature {} deployed but could not be recorded", name))?;
    info!("Feature {} deployed", name);
    Ok(report)
}

/// Runs the remove hook and deletes the feature record. Migrations and
/// cartridges stay on the instance.
pub async fn remove_feature(
    instance: &dyn Instance,
    feature: &Feature,
    hooks: &dyn FeatureHooks,
) -> Result<()> {
    let name = feature.name();
    let remote = RemoteState::new(instance);
    let Some(record) = remote.get_feature(name).await? else {
        warn!("Feature {} is not deployed", name);
        return Ok(());
    };

    let ctx = FeatureContext { instance, feature };
    hooks
        .remove(&ctx, &record.unmasked_vars())
        .await
        .context("Feature remove hook failed")?;
    remote.delete_feature(name).await?;
    info!("Feature {} removed", name);
    Ok(())
}

/// Deployed feature records without their secret values.
pub async fn list_deployed_features(instance: &dyn Instance) -> Result<Vec<FeatureRecord>> {
    let mut records = RemoteState::new(instance).list_features().await?;
    for record in &mut records {
        record.secret_vars.clear();
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::tests::feature_tree;
    use crate::features::{collect_features, find_feature, NoopFeatureHooks};
    use crate::migrations::bootstrap::BOOTSTRAP_ARCHIVE;
    use crate::permissions::SETTINGS_FILE;
    use crate::state::{FEATURES_SCHEMA_VERSION, PREFERENCES_PATH};
    use crate::testing::FakeInstance;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct Answer(Value);

    impl Prompter for Answer {
        fn ask(&self, question: &Question) -> Result<Value> {
            Ok(question.default.clone().unwrap_or_else(|| self.0.clone()))
        }
    }

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
    }

    impl Recording {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FeatureHooks for Recording {
        async fn questions(
            &self,
            _ctx: &FeatureContext<'_>,
            _vars: &Map<String, Value>,
        ) -> Result<Vec<Question>> {
            let mut question = Question::new("region");
            question.default = Some(json!("eu"));
            Ok(vec![question])
        }

        async fn before_deploy(
            &self,
            ctx: &FeatureContext<'_>,
            vars: &mut Map<String, Value>,
        ) -> Result<()> {
            self.calls.lock().unwrap().push("before_deploy".to_string());
            let record = RemoteState::new(ctx.instance)
                .get_feature(ctx.feature.name())
                .await?;
            assert!(record.is_none());
            vars.insert("hooked".to_string(), json!(true));
            Ok(())
        }

        async fn finish(&self, ctx: &FeatureContext<'_>, vars: &Map<String, Value>) -> Result<()> {
            assert_eq!(vars["hooked"], json!(true));
            let state = RemoteState::new(ctx.instance)
                .load_toolkit_state()
                .await?
                .unwrap_or_default();
            assert!(state.is_applied("20240101_setup"));
            self.calls.lock().unwrap().push("finish".to_string());
            Ok(())
        }

        async fn remove(&self, _ctx: &FeatureContext<'_>, vars: &Map<String, Value>) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("remove {}", vars["apiKey"]));
            Ok(())
        }
    }

    fn payments(root: &std::path::Path) -> Feature {
        feature_tree(root);
        let features = collect_features(root).unwrap();
        find_feature(&features, "Payments").unwrap().clone()
    }

    #[test]
    fn test_merge_precedence() {
        let defaults = json!({"a": 1, "b": 1, "c": 1});
        let stored = json!({"b": 2, "c": 2});
        let supplied = json!({"c": 3});
        let merged = merge_vars(&[
            defaults.as_object().unwrap(),
            stored.as_object().unwrap(),
            supplied.as_object().unwrap(),
        ]);
        assert_eq!(Value::Object(merged), json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn test_mask_secrets() {
        let vars = json!({"apiKey": "s3cret", "siteID": "RefArch"});
        let names = vec!["apiKey".to_string(), "unused".to_string()];

        let (stored, secrets) = mask_secrets(vars.as_object().unwrap(), &names, true);
        assert_eq!(stored["apiKey"], json!(SECRET_MASK));
        assert_eq!(stored["siteID"], json!("RefArch"));
        assert!(!stored.contains_key("unused"));
        assert_eq!(Value::Object(secrets), json!({"apiKey": "s3cret"}));

        let (_, secrets) = mask_secrets(vars.as_object().unwrap(), &names, false);
        assert!(secrets.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_runs_in_order_and_persists_masked_record() {
        let dir = tempfile::tempdir().unwrap();
        let feature = payments(dir.path());
        let fake = FakeInstance::new();
        let hooks = Recording::default();

        let report = deploy_feature(
            &fake,
            &feature,
            &hooks,
            Some(&Answer(json!("s3cret"))),
            &DeployOptions::default(),
        )
        .await
        .unwrap();

        assert!(report.bootstrapped);
        assert_eq!(report.migrations.applied, vec!["20240101_setup"]);
        assert_eq!(hooks.calls(), vec!["before_deploy", "finish"]);
        assert_eq!(fake.imports()[0].0, format!("{}.zip", BOOTSTRAP_ARCHIVE));

        let record = RemoteState::new(&fake)
            .get_feature("Payments")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.vars["apiKey"], json!(SECRET_MASK));
        assert_eq!(record.vars["siteID"], json!("RefArch"));
        assert_eq!(record.vars["region"], json!("eu"));
        assert_eq!(record.secret_vars["apiKey"], json!("s3cret"));

        let listed = list_deployed_features(&fake).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].secret_vars.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redeploy_reuses_stored_vars_without_prompting() {
        let dir = tempfile::tempdir().unwrap();
        let feature = payments(dir.path());
        let fake = FakeInstance::new();
        let mut options = DeployOptions::default();
        options.vars.insert("apiKey".to_string(), json!("first"));
        deploy_feature(&fake, &feature, &NoopFeatureHooks, None, &options)
            .await
            .unwrap();
        let imports = fake.imports().len();

        options.vars.clear();
        options.vars.insert("retries".to_string(), json!(5));
        let report = deploy_feature(&fake, &feature, &NoopFeatureHooks, None, &options)
            .await
            .unwrap();

        assert!(!report.bootstrapped);
        assert!(report.migrations.applied.is_empty());
        assert_eq!(fake.imports().len(), imports);
        let record = RemoteState::new(&fake)
            .get_feature("Payments")
            .await
            .unwrap()
            .unwrap();
        let vars = record.unmasked_vars();
        assert_eq!(vars["apiKey"], json!("first"));
        assert_eq!(vars["retries"], json!(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_question_without_prompter_fails() {
        let dir = tempfile::tempdir().unwrap();
        let feature = payments(dir.path());
        let fake = FakeInstance::new();

        let err = deploy_feature(&fake, &feature, &NoopFeatureHooks, None, &DeployOptions::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("apiKey"));
        assert!(fake.imports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_requirement_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        feature_tree(dir.path());
        let features = collect_features(dir.path()).unwrap();
        let loyalty = find_feature(&features, "loyalty").unwrap();
        let fake = FakeInstance::new();

        let err = deploy_feature(&fake, loyalty, &NoopFeatureHooks, None, &DeployOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires Payments"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_client_sees_requirements_after_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        feature_tree(dir.path());
        let features = collect_features(dir.path()).unwrap();
        let loyalty = find_feature(&features, "loyalty").unwrap();
        let fake = FakeInstance::new();
        fake.set_doc(
            PREFERENCES_PATH,
            json!({
                "c_b2cToolkitFeaturesVersion": FEATURES_SCHEMA_VERSION,
                "c_b2cToolkitFeaturesBootstrappedClientIDs": "{\"other\":{\"version\":2}}"
            }),
        );
        fake.set_doc(
            "custom_objects/B2CToolsFeature/Payments",
            json!({"key_value_string": "Payments", "c_vars": "{}", "c_secretVars": "{}"}),
        );
        fake.forbid("global_preferences");
        fake.forbid("custom_objects");
        fake.allow_all_after_import_of(SETTINGS_FILE);

        let report = deploy_feature(&fake, loyalty, &NoopFeatureHooks, None, &DeployOptions::default())
            .await
            .unwrap();

        assert!(report.bootstrapped);
        let state = RemoteState::new(&fake).load_feature_state().await.unwrap();
        assert_eq!(
            state.bootstrapped_clients.keys().collect::<Vec<_>>(),
            vec!["other", "test-client"]
        );
        assert!(state.feature("loyalty").is_some());
        assert!(state.feature("Payments").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_runs_hook_then_deletes_record() {
        let dir = tempfile::tempdir().unwrap();
        let feature = payments(dir.path());
        let fake = FakeInstance::new();
        let mut options = DeployOptions::default();
        options.vars.insert("apiKey".to_string(), json!("k"));
        deploy_feature(&fake, &feature, &NoopFeatureHooks, None, &options)
            .await
            .unwrap();

        let hooks = Recording::default();
        remove_feature(&fake, &feature, &hooks).await.unwrap();

        assert_eq!(hooks.calls(), vec!["remove \"k\""]);
        let remote = RemoteState::new(&fake);
        assert!(remote.get_feature("Payments").await.unwrap().is_none());
        let state = remote.load_toolkit_state().await.unwrap().unwrap();
        assert!(state.is_applied("20240101_setup"));

        remove_feature(&fake, &feature, &hooks).await.unwrap();
        assert_eq!(hooks.calls().len(), 1);
    }
}
