// ABOUTME: Cartridge discovery and bulk code deployment over WebDAV
// ABOUTME: Also lists, activates and reloads remote code versions through the data API

pub mod watch;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::write_zip;
use crate::error::ToolkitError;
use crate::remote::models::CodeVersion;
use crate::remote::webdav::{self, CARTRIDGES_DIR};
use crate::remote::{DataApi, Instance};

pub use watch::{watch_cartridges, WatchOptions};

/// File whose presence marks a cartridge directory.
pub const PROJECT_MARKER: &str = ".project";
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cartridge {
    pub name: String,
    pub src: PathBuf,
    /// Directory name under the code version.
    pub dest: String,
}

impl Cartridge {
    /// `dest/relative/path` for a file inside this cartridge.
    pub fn remote_path(&self, file: &Path) -> Option<String> {
        let rel = file.strip_prefix(&self.src).ok()?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        if rel.is_empty() {
            return None;
        }
        Some(format!("{}/{}", self.dest, rel))
    }
}

fn skipped(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map_or(false, |n| SKIPPED_DIRS.contains(&n))
}

/// Directories below `root` holding a project marker, sorted by name.
pub fn find_cartridges(root: &Path, exclude: &[Regex]) -> Result<Vec<Cartridge>> {
    let mut cartridges = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|e| !skipped(e));
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to scan {}", root.display()))?;
        if !entry.file_type().is_file() || entry.file_name() != PROJECT_MARKER {
            continue;
        }
        let Some(dir) = entry.path().parent() else {
            continue;
        };
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if exclude.iter().any(|re| re.is_match(name)) {
            debug!("Excluding cartridge {}", name);
            continue;
        }
        cartridges.push(Cartridge {
            name: name.to_string(),
            src: dir.to_path_buf(),
            dest: name.to_string(),
        });
    }
    cartridges.sort_by(|a, b| a.name.cmp(&b.name));
    if let Some(dup) = cartridges.windows(2).find(|w| w[0].name == w[1].name) {
        return Err(ToolkitError::Validation(format!(
            "cartridge {} found at both {} and {}",
            dup[0].name,
            dup[0].src.display(),
            dup[1].src.display()
        ))
        .into());
    }
    Ok(cartridges)
}

/// One zip with every cartridge under its destination name.
pub fn zip_cartridges(cartridges: &[Cartridge]) -> Result<Vec<u8>> {
    let mut files = Vec::new();
    for cartridge in cartridges {
        let walker = WalkDir::new(&cartridge.src)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !skipped(e));
        for entry in walker {
            let entry =
                entry.with_context(|| format!("Failed to scan {}", cartridge.src.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = cartridge.remote_path(entry.path()) else {
                continue;
            };
            let data = std::fs::read(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            files.push((name, data));
        }
    }
    write_zip(files)
}

/// Uploads `bytes` as a zip into `dir`, extracts it there and removes it.
pub(crate) async fn upload_and_unzip<I: Instance + ?Sized>(
    instance: &I,
    dir: &str,
    prefix: &str,
    bytes: Vec<u8>,
) -> Result<()> {
    let zip_path = webdav::join(&[
        dir,
        &format!("{}_{}.zip", prefix, Utc::now().format("%Y%m%d%H%M%S%3f")),
    ]);
    instance.make_dir(dir).await?;
    instance.put_file(&zip_path, bytes).await?;
    instance
        .unzip_file(&zip_path)
        .await
        .with_context(|| format!("Failed to extract {}", zip_path))?;
    instance.delete_file(&zip_path).await?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Remove each cartridge's remote directory before uploading.
    pub delete_existing: bool,
    /// Re-activate the code version afterwards so the server picks up changes.
    pub reload: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            delete_existing: true,
            reload: false,
        }
    }
}

pub fn code_version_dir(code_version: &str) -> String {
    webdav::join(&[CARTRIDGES_DIR, code_version])
}

/// Deploys cartridges to a code version in a single upload.
pub async fn sync_cartridges(
    instance: &dyn Instance,
    code_version: &str,
    cartridges: &[Cartridge],
    options: &SyncOptions,
) -> Result<()> {
    if cartridges.is_empty() {
        warn!("No cartridges to deploy");
        return Ok(());
    }
    let dir = code_version_dir(code_version);
    if options.delete_existing {
        for cartridge in cartridges {
            debug!("Removing remote {}", cartridge.dest);
            instance
                .delete_file(&webdav::join(&[&dir, &cartridge.dest]))
                .await?;
        }
    }

    let bytes = zip_cartridges(cartridges)?;
    info!(
        "Deploying {} cartridge(s) to {} ({} bytes)",
        cartridges.len(),
        code_version,
        bytes.len()
    );
    upload_and_unzip(instance, &dir, "_sync", bytes).await?;

    if options.reload {
        reload_code_version(instance, code_version).await?;
    }
    for cartridge in cartridges {
        info!("Deployed {}", cartridge.name);
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CodeVersionList {
    data: Vec<CodeVersion>,
}

pub async fn list_code_versions<D: DataApi + ?Sized>(api: &D) -> Result<Vec<CodeVersion>> {
    let response = api
        .data_get("code_versions")
        .await?
        .into_success("Listing code versions")?;
    let list: CodeVersionList =
        serde_json::from_value(response.body).context("Failed to parse code versions")?;
    Ok(list.data)
}

pub async fn activate_code_version<D: DataApi + ?Sized>(api: &D, code_version: &str) -> Result<()> {
    api.data_request(
        Method::PATCH,
        &format!("code_versions/{}", code_version),
        Some(&json!({"active": true})),
    )
    .await?
    .into_success(&format!("Activating code version {}", code_version))?;
    info!("Activated code version {}", code_version);
    Ok(())
}

/// Activates another code version and then `code_version` again.
pub async fn reload_code_version<D: DataApi + ?Sized>(api: &D, code_version: &str) -> Result<()> {
    let versions = list_code_versions(api).await?;
    match versions.iter().find(|v| v.id != code_version) {
        Some(other) => {
            debug!("Reloading {} via {}", code_version, other.id);
            activate_code_version(api, &other.id).await?;
        }
        None => warn!(
            "No other code version to reload {} with; activating it directly",
            code_version
        ),
    }
    activate_code_version(api, code_version).await
}

/// The configured code version, or else the active one.
pub async fn resolve_code_version(instance: &dyn Instance) -> Result<String> {
    if let Some(version) = instance.code_version() {
        return Ok(version.to_string());
    }
    list_code_versions(instance)
        .await?
        .into_iter()
        .find(|v| v.active)
        .map(|v| v.id)
        .ok_or_else(|| {
            ToolkitError::Config("no code version configured and none is active".to_string())
                .into()
        })
}
