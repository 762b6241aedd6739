// ABOUTME: Instance and project configuration loading
// ABOUTME: Reads dw.json and b2c-toolkit.toml, applies SFCC_* environment overrides

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::ToolkitError;

pub const DEFAULT_INSTANCE_CONFIG: &str = "dw.json";
pub const DEFAULT_PROJECT_CONFIG: &str = "b2c-toolkit.toml";

/// Connection settings for one remote instance.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct InstanceConfig {
    pub hostname: Option<String>,
    pub webdav_hostname: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code_version: Option<String>,
    pub scopes: Vec<String>,
    /// Accept self-signed certificates on sandbox hosts.
    pub self_signed: bool,
    /// PKCS#12 client certificate for two-factor WebDAV hosts.
    pub certificate: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub short_code: Option<String>,
    pub mrt_api_key: Option<String>,
    /// Force bearer authentication for WebDAV even when basic credentials exist.
    pub webdav_bearer: bool,
}

impl InstanceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read instance config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse instance config {}", path.display()))
    }

    /// Loads `path` if it exists, then layers `SFCC_*` environment variables on top.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_INSTANCE_CONFIG));
        let mut config = if path.exists() {
            Self::load(path)?
        } else if explicit {
            return Err(ToolkitError::Config(format!(
                "instance config {} does not exist",
                path.display()
            ))
            .into());
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut Option<String>, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *target = Some(value);
            }
        };
        set(&mut self.hostname, "SFCC_SERVER");
        set(&mut self.webdav_hostname, "SFCC_WEBDAV_SERVER");
        set(&mut self.username, "SFCC_USERNAME");
        set(&mut self.password, "SFCC_PASSWORD");
        set(&mut self.client_id, "SFCC_CLIENT_ID");
        set(&mut self.client_secret, "SFCC_CLIENT_SECRET");
        set(&mut self.code_version, "SFCC_CODE_VERSION");
        set(&mut self.short_code, "SFCC_SHORT_CODE");
        set(&mut self.mrt_api_key, "SFCC_MRT_API_KEY");
        if let Some(scopes) = lookup("SFCC_OAUTH_SCOPES") {
            self.scopes = scopes
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    pub fn webdav_host(&self) -> Option<&str> {
        self.webdav_hostname.as_deref().or(self.hostname.as_deref())
    }

    pub fn has_basic_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// Local project layout and defaults, read from `b2c-toolkit.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub migrations_dir: PathBuf,
    pub features_dir: PathBuf,
    pub cartridges_dir: PathBuf,
    pub exclude_migrations: Vec<String>,
    pub exclude_cartridges: Vec<String>,
    pub vars: toml::Table,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            features_dir: PathBuf::from("features"),
            cartridges_dir: PathBuf::from("."),
            exclude_migrations: Vec::new(),
            exclude_cartridges: Vec::new(),
            vars: toml::Table::new(),
        }
    }
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read project config {}", path.display()))?;
        let mut config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse project config {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.migrations_dir = base.join(&config.migrations_dir);
            config.features_dir = base.join(&config.features_dir);
            config.cartridges_dir = base.join(&config.cartridges_dir);
        }
        Ok(config)
    }

    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_PROJECT_CONFIG).exists() => {
                Self::load(Path::new(DEFAULT_PROJECT_CONFIG))
            }
            None => Ok(Self::default()),
        }
    }

    /// Default vars from the `[vars]` table as JSON values.
    pub fn default_vars(&self) -> Result<Map<String, Value>> {
        let value = serde_json::to_value(&self.vars).context("Failed to convert project vars")?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }
}

/// Parses `key=value` pairs; values that are valid JSON keep their type.
pub fn parse_vars<S: AsRef<str>>(pairs: &[S]) -> Result<Map<String, Value>> {
    let mut vars = Map::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, raw) = pair.split_once('=').ok_or_else(|| {
            ToolkitError::Validation(format!("variable '{}' must look like key=value", pair))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ToolkitError::Validation(format!("variable '{}' has no key", pair)).into());
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        vars.insert(key.to_string(), value);
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_instance_config_from_dw_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dw.json");
        std::fs::write(
            &path,
            r#"{"hostname":"dev01.example.com","client-id":"abc","code-version":"v1","scopes":["sfcc.x"]}"#,
        )
        .unwrap();

        let config = InstanceConfig::load(&path).unwrap();
        assert_eq!(config.hostname.as_deref(), Some("dev01.example.com"));
        assert_eq!(config.client_id.as_deref(), Some("abc"));
        assert_eq!(config.code_version.as_deref(), Some("v1"));
        assert_eq!(config.webdav_host(), Some("dev01.example.com"));
        assert_eq!(config.scopes, vec!["sfcc.x"]);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = InstanceConfig {
            hostname: Some("file.example.com".to_string()),
            ..Default::default()
        };
        let env: HashMap<&str, &str> = [
            ("SFCC_SERVER", "env.example.com"),
            ("SFCC_CLIENT_SECRET", "secret"),
            ("SFCC_OAUTH_SCOPES", "a, b"),
            ("SFCC_USERNAME", ""),
        ]
        .into_iter()
        .collect();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.hostname.as_deref(), Some("env.example.com"));
        assert_eq!(config.client_secret.as_deref(), Some("secret"));
        assert_eq!(config.scopes, vec!["a", "b"]);
        assert!(config.username.is_none());
    }

    #[test]
    fn test_project_config_paths_are_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_PROJECT_CONFIG);
        std::fs::write(
            &path,
            "migrations_dir = \"data/migrations\"\n[vars]\nsite = \"RefArch\"\nretries = 3\n",
        )
        .unwrap();

        let config = ProjectConfig::load(&path).unwrap();
        assert_eq!(config.migrations_dir, dir.path().join("data/migrations"));
        assert_eq!(config.features_dir, dir.path().join("features"));
        let vars = config.default_vars().unwrap();
        assert_eq!(vars["site"], "RefArch");
        assert_eq!(vars["retries"], 3);
    }

    #[test]
    fn test_parse_vars_keeps_json_types() {
        let vars = parse_vars(&["a=1", "b=true", "c=hello", "d={\"x\":1}", "e=a=b"]).unwrap();
        assert_eq!(vars["a"], 1);
        assert_eq!(vars["b"], true);
        assert_eq!(vars["c"], "hello");
        assert_eq!(vars["d"]["x"], 1);
        assert_eq!(vars["e"], "a=b");
    }

    #[test]
    fn test_parse_vars_rejects_missing_separator() {
        assert!(parse_vars(&["novalue"]).is_err());
    }
}
