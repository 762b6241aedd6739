// ABOUTME: One-time per-client upgrade that installs the metadata the toolkit depends on
// ABOUTME: Imports state attribute definitions, grants the toolkit's own permissions and records the client

use anyhow::{Context, Result};
use tracing::info;

use crate::archive::{import_archive, Archive, ArchiveEntry, ImportSource, XmlDocument, XmlElement};
use crate::permissions::{ensure_data_api_permissions, toolkit_resources, ReconcileOptions};
use crate::remote::Instance;
use crate::state::{
    FeatureInstanceState, RemoteState, ToolkitInstanceState, FEATURE_OBJECT_TYPE, PREFERENCES_PATH,
    PREFERENCE_GROUP,
};

pub const BOOTSTRAP_ARCHIVE: &str = "b2c_toolkit_bootstrap";
const METADATA_NAMESPACE: &str = "http://www.demandware.com/xml/impex/metadata/2006-10-31";

/// (attribute id, value type)
const PREFERENCE_ATTRIBUTES: &[(&str, &str)] = &[
    ("b2cToolkitDataVersion", "int"),
    ("b2cToolkitMigrations", "text"),
    ("b2cToolkitBootstrappedClientIDs", "text"),
    ("b2cToolkitVars", "text"),
    ("b2cToolkitFeaturesVersion", "int"),
    ("b2cToolkitFeaturesBootstrappedClientIDs", "text"),
];

fn text_element(name: &str, text: &str) -> XmlElement {
    let mut element = XmlElement::new(name);
    element.set_text(text);
    element
}

fn display_name(text: &str) -> XmlElement {
    text_element("display-name", text).with_attribute("xml:lang", "x-default")
}

fn attribute_definition(id: &str, value_type: &str) -> XmlElement {
    let mut def = XmlElement::new("attribute-definition").with_attribute("attribute-id", id);
    def.push(display_name(id));
    def.push(text_element("type", value_type));
    def.push(text_element("mandatory-flag", "false"));
    def.push(text_element("externally-managed-flag", "false"));
    def
}

fn metadata_root() -> XmlElement {
    XmlElement::new("metadata").with_attribute("xmlns", METADATA_NAMESPACE)
}

fn preference_extensions() -> XmlDocument {
    let mut definitions = XmlElement::new("custom-attribute-definitions");
    let mut group = XmlElement::new("attribute-group").with_attribute("group-id", PREFERENCE_GROUP);
    group.push(display_name("B2C Toolkit"));
    for (id, value_type) in PREFERENCE_ATTRIBUTES {
        definitions.push(attribute_definition(id, value_type));
        group.push(XmlElement::new("attribute").with_attribute("attribute-id", id));
    }
    let mut groups = XmlElement::new("group-definitions");
    groups.push(group);

    let mut extension =
        XmlElement::new("type-extension").with_attribute("type-id", "SitePreferences");
    extension.push(definitions);
    extension.push(groups);
    let mut root = metadata_root();
    root.push(extension);
    XmlDocument::new(root)
}

fn feature_object_type() -> XmlDocument {
    let mut key = XmlElement::new("key-definition").with_attribute("attribute-id", "name");
    key.push(text_element("type", "string"));
    key.push(text_element("min-length", "0"));

    let mut attributes = XmlElement::new("attribute-definitions");
    attributes.push(attribute_definition("vars", "text"));
    attributes.push(attribute_definition("secretVars", "text"));

    let mut custom_type = XmlElement::new("custom-type").with_attribute("type-id", FEATURE_OBJECT_TYPE);
    custom_type.push(display_name("B2C Toolkit Feature"));
    custom_type.push(text_element("staging-mode", "no-staging"));
    custom_type.push(text_element("storage-scope", "organization"));
    custom_type.push(key);
    custom_type.push(attributes);
    let mut root = metadata_root();
    root.push(custom_type);
    XmlDocument::new(root)
}

/// Metadata for the toolkit's remote records.
pub fn bootstrap_archive() -> Archive {
    let mut archive = Archive::new();
    archive.insert(
        "meta/system-objecttype-extensions.xml",
        ArchiveEntry::Xml(preference_extensions()),
    );
    archive.insert(
        "meta/custom-objecttype-definitions.xml",
        ArchiveEntry::Xml(feature_object_type()),
    );
    archive
}

async fn install_metadata(instance: &dyn Instance, options: &ReconcileOptions) -> Result<()> {
    import_archive(
        instance,
        ImportSource::Archive {
            name: BOOTSTRAP_ARCHIVE.to_string(),
            archive: bootstrap_archive(),
        },
        &options.transfer,
    )
    .await
    .context("Failed to import bootstrap metadata")?;

    let Some(client_id) = instance.client_id() else {
        return Ok(());
    };
    ensure_data_api_permissions(
        instance,
        client_id,
        &toolkit_resources(),
        move || async move {
            let response = instance.data_get(PREFERENCES_PATH).await?;
            Ok::<_, anyhow::Error>(!response.is_forbidden())
        },
        options,
    )
    .await
}

/// Installs metadata and permissions, then records this client's bootstrap.
///
/// The state is read again once permissions are in place: before that it may
/// have been unreadable, and writing a default over it would lose the
/// applied list and the other clients.
pub async fn bootstrap_toolkit(
    instance: &dyn Instance,
    options: &ReconcileOptions,
) -> Result<ToolkitInstanceState> {
    info!("Bootstrapping instance for toolkit schema");
    install_metadata(instance, options).await?;
    let remote = RemoteState::new(instance);
    let mut state = remote
        .load_toolkit_state()
        .await
        .context("Failed to read toolkit state after bootstrap")?
        .unwrap_or_default();
    state.record_bootstrap(instance.client_id());
    remote
        .save_toolkit_bootstrap(&state, instance.client_id())
        .await
        .context("Failed to record bootstrap")?;
    info!("Bootstrap complete (schema version {})", state.schema_version);
    Ok(state)
}

pub async fn bootstrap_features(
    instance: &dyn Instance,
    options: &ReconcileOptions,
) -> Result<FeatureInstanceState> {
    info!("Bootstrapping instance for feature records");
    install_metadata(instance, options).await?;
    let remote = RemoteState::new(instance);
    let mut state = remote
        .load_feature_state()
        .await
        .context("Failed to read feature state after bootstrap")?;
    state.record_bootstrap(instance.client_id());
    remote
        .save_feature_bootstrap(&state, instance.client_id())
        .await
        .context("Failed to record feature bootstrap")?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::SETTINGS_FILE;
    use crate::state::TOOLKIT_SCHEMA_VERSION;
    use crate::testing::FakeInstance;

    #[test]
    fn test_bootstrap_archive_contents() {
        let archive = bootstrap_archive();
        let prefs = archive
            .get("meta/system-objecttype-extensions.xml")
            .and_then(ArchiveEntry::as_xml)
            .unwrap()
            .to_xml_string();
        assert!(prefs.contains(r#"<attribute-group group-id="b2cToolkit">"#));
        assert!(prefs.contains(r#"<attribute-definition attribute-id="b2cToolkitMigrations">"#));
        let types = archive
            .get("meta/custom-objecttype-definitions.xml")
            .and_then(ArchiveEntry::as_xml)
            .unwrap()
            .to_xml_string();
        assert!(types.contains(r#"<custom-type type-id="B2CToolsFeature">"#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_records_client() {
        let fake = FakeInstance::new();

        bootstrap_toolkit(&fake, &ReconcileOptions::default())
            .await
            .unwrap();

        let imports = fake.imports();
        assert_eq!(imports[0].0, "b2c_toolkit_bootstrap.zip");
        assert!(imports[1].1.contains(SETTINGS_FILE));
        let saved = RemoteState::new(&fake).load_toolkit_state().await.unwrap().unwrap();
        assert_eq!(saved.schema_version, TOOLKIT_SCHEMA_VERSION);
        assert!(!saved.needs_bootstrap(Some("test-client")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_keeps_state_hidden_behind_permissions() {
        let fake = FakeInstance::new();
        fake.set_doc(
            PREFERENCES_PATH,
            serde_json::json!({
                "c_b2cToolkitDataVersion": 7,
                "c_b2cToolkitMigrations": "20230101_a",
                "c_b2cToolkitBootstrappedClientIDs": "{\"other\":{\"version\":7}}",
                "c_b2cToolkitVars": "{\"siteID\":\"RefArch\"}",
                "c_b2cToolkitFeaturesVersion": 2,
                "c_b2cToolkitFeaturesBootstrappedClientIDs": "{\"other\":{\"version\":2}}"
            }),
        );
        fake.forbid("global_preferences");
        fake.allow_all_after_import_of(SETTINGS_FILE);

        let state = bootstrap_toolkit(&fake, &ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(state.applied_migrations, vec!["20230101_a"]);

        let saved = RemoteState::new(&fake).load_toolkit_state().await.unwrap().unwrap();
        assert_eq!(saved.applied_migrations, vec!["20230101_a"]);
        assert_eq!(saved.vars["siteID"], "RefArch");
        assert!(saved.bootstrapped_clients.contains_key("other"));
        assert!(saved.bootstrapped_clients.contains_key("test-client"));

        let features = bootstrap_features(&fake, &ReconcileOptions::default())
            .await
            .unwrap();
        assert!(features.bootstrapped_clients.contains_key("other"));
        let saved = RemoteState::new(&fake).load_feature_state().await.unwrap();
        assert!(saved.bootstrapped_clients.contains_key("other"));
        assert!(!saved.needs_bootstrap(Some("test-client")));
    }
}
