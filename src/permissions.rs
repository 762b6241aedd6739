// ABOUTME: Reconciles data API client permissions in the instance access-control settings
// ABOUTME: Exports the settings, merges the desired resources and re-imports only on change

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::archive::{
    export_archive, import_archive, Archive, ArchiveEntry, ImportSource, TransferOptions,
    XmlDocument, XmlElement, XmlNode,
};
use crate::error::ToolkitError;
use crate::remote::Instance;
use crate::state::{FEATURE_OBJECT_TYPE, PREFERENCES_PATH};

pub const SETTINGS_FILE: &str = "ocapi-settings.xml";
const SETTINGS_NAMESPACE: &str = "http://www.demandware.com/xml/impex/ocapi/2013-07-01";
const SETTINGS_API_VERSION: &str = "23.2";
const ALL_ATTRIBUTES: &str = "(**)";

/// One resource grant for a data API client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePermission {
    pub resource_id: String,
    pub methods: Vec<String>,
    pub read_attributes: String,
    pub write_attributes: String,
}

impl ResourcePermission {
    pub fn new(resource_id: &str, methods: &[&str]) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            read_attributes: ALL_ATTRIBUTES.to_string(),
            write_attributes: ALL_ATTRIBUTES.to_string(),
        }
    }
}

/// Resources the toolkit itself calls after a bootstrap.
pub fn toolkit_resources() -> Vec<ResourcePermission> {
    let preferences = format!("/{}", PREFERENCES_PATH);
    let features = format!("/custom_objects/{}/*", FEATURE_OBJECT_TYPE);
    let feature_search = format!("/custom_objects_search/{}", FEATURE_OBJECT_TYPE);
    vec![
        ResourcePermission::new("/code_versions", &["get"]),
        ResourcePermission::new("/code_versions/*", &["patch", "delete"]),
        ResourcePermission::new("/jobs/*/executions", &["post"]),
        ResourcePermission::new("/jobs/*/executions/*", &["get"]),
        ResourcePermission::new("/job_execution_search", &["post"]),
        ResourcePermission::new(&preferences, &["get", "patch"]),
        ResourcePermission::new(&features, &["get", "put", "patch", "delete"]),
        ResourcePermission::new(&feature_search, &["post"]),
    ]
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub interval: Duration,
    pub max_tries: u32,
    pub transfer: TransferOptions,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_tries: 10,
            transfer: TransferOptions::default(),
        }
    }
}

/// `"(a,b)"` → `{a, b}`; `None` stands for every attribute.
fn attribute_set(selector: &str) -> Option<BTreeSet<String>> {
    let inner = selector.trim().trim_start_matches('(').trim_end_matches(')');
    if inner == "**" {
        return None;
    }
    Some(
        inner
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// The union of two selectors, or `None` when `existing` already covers `desired`.
fn merge_selector(existing: &str, desired: &str) -> Option<String> {
    match (attribute_set(existing), attribute_set(desired)) {
        (None, _) => None,
        (Some(_), None) => Some(ALL_ATTRIBUTES.to_string()),
        (Some(have), Some(want)) if want.is_subset(&have) => None,
        (Some(have), Some(want)) => {
            let all: Vec<String> = have.union(&want).cloned().collect();
            Some(format!("({})", all.join(",")))
        }
    }
}

/// Merges `desired` into the client's entry of a data API settings document.
/// Returns whether anything changed; existing grants that already cover a
/// desired one are left untouched.
pub fn merge_permissions(
    settings: &mut Value,
    client_id: &str,
    desired: &[ResourcePermission],
) -> Result<bool> {
    let root = settings
        .as_object_mut()
        .context("Access-control settings are not a JSON object")?;
    if !root.contains_key("_v") {
        root.insert("_v".to_string(), json!(SETTINGS_API_VERSION));
    }
    let clients = root
        .entry("clients")
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .context("Access-control settings have a malformed clients list")?;

    let index = match clients
        .iter()
        .position(|c| c.get("client_id").and_then(Value::as_str) == Some(client_id))
    {
        Some(i) => i,
        None => {
            clients.push(json!({"client_id": client_id, "resources": []}));
            clients.len() - 1
        }
    };
    let resources = clients[index]
        .as_object_mut()
        .context("Malformed client entry")?
        .entry("resources")
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .context("Malformed client resources")?;

    let mut changed = false;
    for want in desired {
        let existing = resources
            .iter_mut()
            .find(|r| r.get("resource_id").and_then(Value::as_str) == Some(want.resource_id.as_str()));
        let Some(existing) = existing else {
            debug!("Granting {} {:?}", want.resource_id, want.methods);
            resources.push(serde_json::to_value(want)?);
            changed = true;
            continue;
        };
        let entry = existing
            .as_object_mut()
            .context("Malformed resource entry")?;
        changed |= merge_resource(entry, want);
    }
    Ok(changed)
}

fn merge_resource(entry: &mut Map<String, Value>, want: &ResourcePermission) -> bool {
    let mut changed = false;
    let mut methods: Vec<String> = entry
        .get("methods")
        .and_then(Value::as_array)
        .map(|m| m.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    for method in &want.methods {
        if !methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            methods.push(method.clone());
            changed = true;
        }
    }
    if changed {
        entry.insert("methods".to_string(), json!(methods));
    }

    for (key, desired) in [
        ("read_attributes", &want.read_attributes),
        ("write_attributes", &want.write_attributes),
    ] {
        let current = entry.get(key).and_then(Value::as_str).unwrap_or("()");
        if let Some(merged) = merge_selector(current, desired) {
            entry.insert(key.to_string(), json!(merged));
            changed = true;
        }
    }
    if changed {
        debug!("Extending grant on {}", want.resource_id);
    }
    changed
}

fn is_data_setting(element: &XmlElement) -> bool {
    element.name == "ocapi-setting" && element.attribute("type").as_deref() == Some("data")
}

/// The `<ocapi-setting type="data">` element, created if absent.
fn data_setting(doc: &mut XmlDocument) -> Option<&mut XmlElement> {
    if !doc.root.elements().any(is_data_setting) {
        let mut setting = XmlElement::new("ocapi-setting")
            .with_attribute("type", "data")
            .with_attribute("context", "global");
        setting.self_closing = false;
        setting
            .children
            .push(XmlNode::CData(json!({"_v": SETTINGS_API_VERSION, "clients": []}).to_string()));
        doc.root.push(setting);
    }
    doc.root
        .children_named_mut("ocapi-setting")
        .find(|e| is_data_setting(e))
}

fn empty_settings_document() -> XmlDocument {
    XmlDocument::new(XmlElement::new("ocapi-settings").with_attribute("xmlns", SETTINGS_NAMESPACE))
}

/// Applies `desired` to an exported settings archive in place.
pub fn update_settings_archive(
    archive: &mut Archive,
    client_id: &str,
    desired: &[ResourcePermission],
) -> Result<bool> {
    let path = archive
        .find(SETTINGS_FILE)
        .unwrap_or(SETTINGS_FILE)
        .to_string();
    if !archive.contains(&path) {
        archive.insert(&path, ArchiveEntry::Xml(empty_settings_document()));
    }
    let doc = archive
        .get_mut(&path)
        .and_then(ArchiveEntry::as_xml_mut)
        .context("Exported access-control settings are not valid XML")?;

    let setting = data_setting(doc).context("Access-control settings have no data API section")?;
    let text = setting.text();
    let mut settings: Value = if text.trim().is_empty() {
        json!({"_v": SETTINGS_API_VERSION, "clients": []})
    } else {
        serde_json::from_str(&text).context("Data API settings are not valid JSON")?
    };
    let changed = merge_permissions(&mut settings, client_id, desired)?;
    if changed {
        setting.set_text(&serde_json::to_string_pretty(&settings)?);
    }
    Ok(changed)
}

/// Makes sure `client_id` holds at least `desired` on the data API. When the
/// settings had to change, waits for `validator` to confirm they took effect.
pub async fn ensure_data_api_permissions<I, F, Fut>(
    instance: &I,
    client_id: &str,
    desired: &[ResourcePermission],
    mut validator: F,
    options: &ReconcileOptions,
) -> Result<()>
where
    I: Instance + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut archive = export_archive(
        instance,
        &json!({"global_data": {"ocapi_settings": true}}),
        &options.transfer,
    )
    .await
    .context("Failed to export access-control settings")?;

    if !update_settings_archive(&mut archive, client_id, desired)? {
        info!("Data API permissions for {} are already in place", client_id);
        return Ok(());
    }

    info!("Updating data API permissions for {}", client_id);
    let mut update = Archive::new();
    for path in archive
        .paths()
        .filter(|p| p.ends_with(SETTINGS_FILE))
        .map(str::to_string)
        .collect::<Vec<_>>()
    {
        if let Some(entry) = archive.remove(&path) {
            update.insert(&path, entry);
        }
    }
    import_archive(
        instance,
        ImportSource::Archive {
            name: "b2c_toolkit_permissions".to_string(),
            archive: update,
        },
        &options.transfer,
    )
    .await
    .context("Failed to import access-control settings")?;

    for attempt in 1..=options.max_tries {
        match validator().await {
            Ok(true) => {
                info!("Permissions confirmed after {} check(s)", attempt);
                return Ok(());
            }
            Ok(false) => debug!("Permissions not effective yet (check {})", attempt),
            Err(e) => debug!("Permission check {} failed: {:#}", attempt, e),
        }
        if attempt < options.max_tries {
            tokio::time::sleep(options.interval).await;
        }
    }
    warn!(
        "Permissions for {} did not take effect after {} checks",
        client_id, options.max_tries
    );
    Err(ToolkitError::Permission(format!(
        "updated access-control settings for {} were not effective after {} checks; verify the client id and the instance's OCAPI settings",
        client_id, options.max_tries
    ))
    .into())
}
