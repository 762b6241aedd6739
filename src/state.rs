// ABOUTME: Versioned remote records of applied migrations and deployed features
// ABOUTME: Reads and writes the toolkit preference group and per-feature custom objects

use anyhow::{Context, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::remote::models::SearchResult;
use crate::remote::{ApiResponse, DataApi};

/// Bumped whenever the bootstrap metadata changes.
pub const TOOLKIT_SCHEMA_VERSION: u32 = 7;
pub const FEATURES_SCHEMA_VERSION: u32 = 2;

pub const PREFERENCE_GROUP: &str = "b2cToolkit";
pub const PREFERENCES_PATH: &str = "global_preferences/preference_groups/b2cToolkit/development";
pub const FEATURE_OBJECT_TYPE: &str = "B2CToolsFeature";
pub const SECRET_MASK: &str = "********";

const ATTR_DATA_VERSION: &str = "c_b2cToolkitDataVersion";
const ATTR_MIGRATIONS: &str = "c_b2cToolkitMigrations";
const ATTR_BOOTSTRAPPED: &str = "c_b2cToolkitBootstrappedClientIDs";
const ATTR_VARS: &str = "c_b2cToolkitVars";
const ATTR_FEATURES_VERSION: &str = "c_b2cToolkitFeaturesVersion";
const ATTR_FEATURES_BOOTSTRAPPED: &str = "c_b2cToolkitFeaturesBootstrappedClientIDs";

const SEARCH_PAGE_SIZE: u64 = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientBootstrap {
    pub version: u32,
}

/// Which client identities have bootstrapped, and at which schema version.
pub type BootstrappedClients = BTreeMap<String, ClientBootstrap>;

fn client_needs_bootstrap(
    schema_version: u32,
    clients: &BootstrappedClients,
    client_id: Option<&str>,
    engine_version: u32,
) -> bool {
    if schema_version < engine_version {
        return true;
    }
    match client_id {
        Some(id) => clients.get(id).map_or(true, |c| c.version < engine_version),
        None => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolkitInstanceState {
    pub schema_version: u32,
    /// Application order.
    pub applied_migrations: Vec<String>,
    pub bootstrapped_clients: BootstrappedClients,
    pub vars: Map<String, Value>,
}

impl ToolkitInstanceState {
    pub fn needs_bootstrap(&self, client_id: Option<&str>) -> bool {
        client_needs_bootstrap(
            self.schema_version,
            &self.bootstrapped_clients,
            client_id,
            TOOLKIT_SCHEMA_VERSION,
        )
    }

    pub fn is_applied(&self, id: &str) -> bool {
        self.applied_migrations.iter().any(|m| m == id)
    }

    pub fn record_bootstrap(&mut self, client_id: Option<&str>) {
        self.schema_version = TOOLKIT_SCHEMA_VERSION;
        if let Some(id) = client_id {
            self.bootstrapped_clients.insert(
                id.to_string(),
                ClientBootstrap {
                    version: TOOLKIT_SCHEMA_VERSION,
                },
            );
        }
    }

    pub fn from_preferences(doc: &Value) -> Result<Self> {
        Ok(Self {
            schema_version: number_attr(doc, ATTR_DATA_VERSION),
            applied_migrations: doc
                .get(ATTR_MIGRATIONS)
                .and_then(Value::as_str)
                .map(split_migrations)
                .unwrap_or_default(),
            bootstrapped_clients: json_attr(doc, ATTR_BOOTSTRAPPED)?,
            vars: json_attr(doc, ATTR_VARS)?,
        })
    }

    pub fn to_preferences(&self) -> Result<Value> {
        Ok(json!({
            ATTR_DATA_VERSION: self.schema_version,
            ATTR_MIGRATIONS: self.applied_migrations.join(","),
            ATTR_BOOTSTRAPPED: serde_json::to_string(&self.bootstrapped_clients)?,
            ATTR_VARS: serde_json::to_string(&self.vars)?,
        }))
    }
}

fn split_migrations(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn number_attr(doc: &Value, name: &str) -> u32 {
    doc.get(name)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

/// Attributes stored as JSON text; absent or empty means default.
fn json_attr<T: serde::de::DeserializeOwned + Default>(doc: &Value, name: &str) -> Result<T> {
    match doc.get(name).and_then(Value::as_str).map(str::trim) {
        None | Some("") => Ok(T::default()),
        Some(text) => {
            serde_json::from_str(text).with_context(|| format!("Malformed {} in instance state", name))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureRecord {
    pub feature_name: String,
    /// Secret names hold `SECRET_MASK` here.
    pub vars: Map<String, Value>,
    pub secret_vars: Map<String, Value>,
    pub creation_date: Option<String>,
    pub last_modified: Option<String>,
}

impl FeatureRecord {
    pub fn from_custom_object(doc: &Value) -> Result<Self> {
        let feature_name = doc
            .get("key_value_string")
            .and_then(Value::as_str)
            .context("Feature record has no key")?
            .to_string();
        Ok(Self {
            vars: json_attr(doc, "c_vars")
                .with_context(|| format!("Feature {}", feature_name))?,
            secret_vars: json_attr(doc, "c_secretVars")
                .with_context(|| format!("Feature {}", feature_name))?,
            creation_date: doc.get("creation_date").and_then(Value::as_str).map(str::to_string),
            last_modified: doc.get("last_modified").and_then(Value::as_str).map(str::to_string),
            feature_name,
        })
    }

    pub fn to_custom_object(&self) -> Result<Value> {
        Ok(json!({
            "c_vars": serde_json::to_string(&self.vars)?,
            "c_secretVars": serde_json::to_string(&self.secret_vars)?,
        }))
    }

    /// Stored vars with secrets filled back in. Secrets that were masked but
    /// never stored are left out.
    pub fn unmasked_vars(&self) -> Map<String, Value> {
        let mut vars = self.vars.clone();
        for (k, v) in &self.secret_vars {
            vars.insert(k.clone(), v.clone());
        }
        vars.retain(|k, v| *v != SECRET_MASK || self.secret_vars.contains_key(k));
        vars
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureInstanceState {
    pub schema_version: u32,
    pub bootstrapped_clients: BootstrappedClients,
    pub features: Vec<FeatureRecord>,
}

impl FeatureInstanceState {
    pub fn needs_bootstrap(&self, client_id: Option<&str>) -> bool {
        client_needs_bootstrap(
            self.schema_version,
            &self.bootstrapped_clients,
            client_id,
            FEATURES_SCHEMA_VERSION,
        )
    }

    pub fn record_bootstrap(&mut self, client_id: Option<&str>) {
        self.schema_version = FEATURES_SCHEMA_VERSION;
        if let Some(id) = client_id {
            self.bootstrapped_clients.insert(
                id.to_string(),
                ClientBootstrap {
                    version: FEATURES_SCHEMA_VERSION,
                },
            );
        }
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureRecord> {
        self.features.iter().find(|f| f.feature_name == name)
    }
}

/// Access to the toolkit's remote records through the data API.
pub struct RemoteState<'a, D: ?Sized> {
    api: &'a D,
}

impl<'a, D: DataApi + ?Sized> RemoteState<'a, D> {
    pub fn new(api: &'a D) -> Self {
        Self { api }
    }

    /// `None` when the preference group is missing or not readable yet; both
    /// mean a bootstrap is due.
    async fn read_preferences(&self) -> Result<Option<Value>> {
        let response = self.api.data_get(PREFERENCES_PATH).await?;
        if response.is_not_found() || response.is_forbidden() {
            warn!(
                "Toolkit state is not readable ({}); the instance needs a bootstrap. If it was bootstrapped with another API client, grant this client access to {}",
                response.status, PREFERENCES_PATH
            );
            return Ok(None);
        }
        let response = response.into_success("Reading toolkit state")?;
        Ok(Some(response.body))
    }

    async fn patch_preferences(&self, patch: &Value) -> Result<()> {
        self.api
            .data_request(Method::PATCH, PREFERENCES_PATH, Some(patch))
            .await?
            .into_success("Updating toolkit state")?;
        Ok(())
    }

    pub async fn load_toolkit_state(&self) -> Result<Option<ToolkitInstanceState>> {
        match self.read_preferences().await? {
            Some(doc) => Ok(Some(ToolkitInstanceState::from_preferences(&doc)?)),
            None => Ok(None),
        }
    }

    /// Writes the schema version and, when a client is known, the
    /// bootstrapped-clients map. The applied list and vars stay untouched.
    pub async fn save_toolkit_bootstrap(
        &self,
        state: &ToolkitInstanceState,
        client_id: Option<&str>,
    ) -> Result<()> {
        let mut patch = json!({ ATTR_DATA_VERSION: state.schema_version });
        if client_id.is_some() {
            patch[ATTR_BOOTSTRAPPED] = json!(serde_json::to_string(&state.bootstrapped_clients)?);
        }
        self.patch_preferences(&patch).await
    }

    /// Persists only the applied list, leaving the other attributes alone.
    pub async fn save_applied_migrations(&self, applied: &[String]) -> Result<()> {
        debug!("Persisting {} applied migrations", applied.len());
        self.patch_preferences(&json!({ ATTR_MIGRATIONS: applied.join(",") }))
            .await
    }

    /// Feature records are listed even when the preference group is not
    /// readable; the version then reads as 0, so a bootstrap is due.
    pub async fn load_feature_state(&self) -> Result<FeatureInstanceState> {
        let mut state = FeatureInstanceState::default();
        if let Some(doc) = self.read_preferences().await? {
            state.schema_version = number_attr(&doc, ATTR_FEATURES_VERSION);
            state.bootstrapped_clients = json_attr(&doc, ATTR_FEATURES_BOOTSTRAPPED)?;
        }
        state.features = self.list_features().await?;
        Ok(state)
    }

    pub async fn save_feature_bootstrap(
        &self,
        state: &FeatureInstanceState,
        client_id: Option<&str>,
    ) -> Result<()> {
        let mut patch = json!({ ATTR_FEATURES_VERSION: state.schema_version });
        if client_id.is_some() {
            patch[ATTR_FEATURES_BOOTSTRAPPED] =
                json!(serde_json::to_string(&state.bootstrapped_clients)?);
        }
        self.patch_preferences(&patch).await
    }

    fn feature_path(name: &str) -> String {
        format!("custom_objects/{}/{}", FEATURE_OBJECT_TYPE, name)
    }

    /// Every deployed feature record. Missing or unreadable object types
    /// read as no features.
    pub async fn list_features(&self) -> Result<Vec<FeatureRecord>> {
        let path = format!("custom_objects_search/{}", FEATURE_OBJECT_TYPE);
        let mut records = Vec::new();
        let mut start: u64 = 0;
        loop {
            let query = json!({
                "query": {"match_all_query": {}},
                "select": "(**)",
                "start": start,
                "count": SEARCH_PAGE_SIZE,
            });
            let response = self.api.data_request(Method::POST, &path, Some(&query)).await?;
            if response.is_not_found() || response.is_forbidden() {
                warn!(
                    "Feature records are not readable ({}); run a feature bootstrap",
                    response.status
                );
                return Ok(Vec::new());
            }
            let response = response.into_success("Searching feature records")?;
            let page: SearchResult<Value> =
                serde_json::from_value(response.body).context("Failed to parse feature search")?;
            let fetched = page.hits.len() as u64;
            for hit in &page.hits {
                records.push(FeatureRecord::from_custom_object(hit)?);
            }
            start += fetched;
            if fetched == 0 || start >= u64::from(page.total) {
                break;
            }
        }
        records.sort_by(|a, b| a.feature_name.cmp(&b.feature_name));
        Ok(records)
    }

    pub async fn get_feature(&self, name: &str) -> Result<Option<FeatureRecord>> {
        let response = self.api.data_get(&Self::feature_path(name)).await?;
        if response.is_not_found() {
            return Ok(None);
        }
        let response = response.into_success(&format!("Reading feature {}", name))?;
        Ok(Some(FeatureRecord::from_custom_object(&response.body)?))
    }

    pub async fn put_feature(&self, record: &FeatureRecord) -> Result<()> {
        self.api
            .data_request(
                Method::PUT,
                &Self::feature_path(&record.feature_name),
                Some(&record.to_custom_object()?),
            )
            .await?
            .into_success(&format!("Saving feature {}", record.feature_name))?;
        Ok(())
    }

    /// Deleting a feature that has no record succeeds.
    pub async fn delete_feature(&self, name: &str) -> Result<()> {
        let response: ApiResponse = self
            .api
            .data_request(Method::DELETE, &Self::feature_path(name), None)
            .await?;
        if response.is_not_found() {
            return Ok(());
        }
        response.into_success(&format!("Deleting feature {}", name))?;
        Ok(())
    }
}
