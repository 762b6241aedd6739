// ABOUTME: Site archive import and export through remote jobs
// ABOUTME: Stages zips over WebDAV, runs the archive jobs and cleans up staged files

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::{write_zip, Archive};
use crate::error::ToolkitError;
use crate::remote::jobs::{JobRunner, JOB_POLL_INTERVAL};
use crate::remote::webdav::{self, IMPEX_DIR};
use crate::remote::Instance;

pub const IMPORT_JOB: &str = "sfcc-site-archive-import";
pub const EXPORT_JOB: &str = "sfcc-site-archive-export";

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Leave the staged zip on the instance.
    pub keep: bool,
    pub poll_interval: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            keep: false,
            poll_interval: JOB_POLL_INTERVAL,
        }
    }
}

/// Something that can be imported as a site archive.
#[derive(Debug, Clone)]
pub enum ImportSource {
    /// In-memory archive; `name` becomes the zip root and file name.
    Archive { name: String, archive: Archive },
    Directory(PathBuf),
    ZipFile(PathBuf),
    Buffer { name: String, bytes: Vec<u8> },
}

impl ImportSource {
    /// Staged file name and zip bytes.
    fn into_upload(self) -> Result<(String, Vec<u8>)> {
        match self {
            ImportSource::Archive { name, archive } => {
                let bytes = archive.to_zip(&name)?;
                Ok((format!("{}.zip", name), bytes))
            }
            ImportSource::Directory(dir) => {
                let name = file_name(&dir)?;
                let bytes = zip_directory(&dir, &name)?;
                Ok((format!("{}.zip", name), bytes))
            }
            ImportSource::ZipFile(path) => {
                let name = file_name(&path)?;
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Ok((name, bytes))
            }
            ImportSource::Buffer { name, bytes } => {
                let name = if name.ends_with(".zip") {
                    name
                } else {
                    format!("{}.zip", name)
                };
                Ok((name, bytes))
            }
        }
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ToolkitError::Validation(format!("{} has no usable file name", path.display())).into()
        })
}

/// Zips a directory's files under `root/` without interpreting them.
pub fn zip_directory(dir: &Path, root: &str) -> Result<Vec<u8>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir)?;
        let name = format!("{}/{}", root, rel.to_string_lossy().replace('\\', "/"));
        let data = std::fs::read(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;
        files.push((name, data));
    }
    write_zip(files)
}

/// Uploads and imports a site archive, then removes the staged zip unless
/// asked to keep it. A failed import leaves the zip in place for inspection.
pub async fn import_archive<I: Instance + ?Sized>(
    instance: &I,
    source: ImportSource,
    options: &TransferOptions,
) -> Result<()> {
    let (zip_name, bytes) = source.into_upload()?;
    let staged = webdav::join(&[IMPEX_DIR, &zip_name]);
    info!("Uploading site archive {} ({} bytes)", zip_name, bytes.len());
    instance
        .put_file(&staged, bytes)
        .await
        .with_context(|| format!("Failed to stage {}", zip_name))?;

    JobRunner::new(instance)
        .with_poll_interval(options.poll_interval)
        .run_job(IMPORT_JOB, &json!({ "file_name": zip_name, "mode": "merge" }))
        .await
        .with_context(|| format!("Import of {} failed; staged archive left at {}", zip_name, staged))?;

    if !options.keep {
        if let Err(e) = instance.delete_file(&staged).await {
            warn!("Failed to remove staged archive {}: {:#}", staged, e);
        }
    }
    info!("Imported site archive {}", zip_name);
    Ok(())
}

/// Exports the given data units and returns the decoded archive.
pub async fn export_archive<I: Instance + ?Sized>(
    instance: &I,
    data_units: &Value,
    options: &TransferOptions,
) -> Result<Archive> {
    let zip_name = format!("{}_export.zip", Utc::now().format("%Y%m%d%H%M%S%3f"));
    JobRunner::new(instance)
        .with_poll_interval(options.poll_interval)
        .run_job(
            EXPORT_JOB,
            &json!({
                "data_units": data_units,
                "export_file": zip_name,
                "overwrite_export_file": true
            }),
        )
        .await
        .context("Site archive export failed")?;

    let staged = webdav::join(&[IMPEX_DIR, &zip_name]);
    let bytes = instance.get_file(&staged).await?.ok_or_else(|| {
        ToolkitError::Connection(format!("exported archive {} was not found", staged))
    })?;
    if !options.keep {
        if let Err(e) = instance.delete_file(&staged).await {
            warn!("Failed to remove exported archive {}: {:#}", staged, e);
        }
    }

    let (_, archive) = Archive::from_zip(&bytes)?;
    info!("Exported {} archive entries", archive.len());
    Ok(archive)
}
