// ABOUTME: In-memory site archives and their zip encoding
// ABOUTME: Maps relative paths to text, XML, JSON or binary content under one synthetic root

pub mod pipeline;
pub mod xml;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde_json::Value;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub use pipeline::{export_archive, import_archive, ImportSource, TransferOptions};
pub use xml::{XmlDocument, XmlElement, XmlNode};

const TEXT_EXTENSIONS: &[&str] = &["txt", "properties", "csv", "md", "isml", "js", "css", "html"];

#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveEntry {
    Text(String),
    Xml(XmlDocument),
    Json(Value),
    Binary(Vec<u8>),
}

impl ArchiveEntry {
    /// Interprets raw bytes by the path's extension. Structured content that
    /// fails to parse is kept as text so nothing is lost.
    pub fn from_bytes(path: &str, bytes: Vec<u8>) -> Self {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let text = match ext.as_str() {
            "xml" | "json" => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => return ArchiveEntry::Binary(e.into_bytes()),
            },
            e if TEXT_EXTENSIONS.contains(&e) => {
                return match String::from_utf8(bytes) {
                    Ok(text) => ArchiveEntry::Text(text),
                    Err(e) => ArchiveEntry::Binary(e.into_bytes()),
                };
            }
            _ => return ArchiveEntry::Binary(bytes),
        };

        let parsed = if ext == "xml" {
            XmlDocument::parse(&text).map(ArchiveEntry::Xml)
        } else {
            serde_json::from_str(&text)
                .map(ArchiveEntry::Json)
                .map_err(anyhow::Error::from)
        };
        parsed.unwrap_or_else(|e| {
            tracing::debug!("Keeping {} as text: {:#}", path, e);
            ArchiveEntry::Text(text)
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(match self {
            ArchiveEntry::Text(text) => text.as_bytes().to_vec(),
            ArchiveEntry::Xml(doc) => doc.to_xml_string().into_bytes(),
            ArchiveEntry::Json(value) => {
                serde_json::to_vec_pretty(value).context("Failed to serialize JSON entry")?
            }
            ArchiveEntry::Binary(bytes) => bytes.clone(),
        })
    }

    pub fn as_xml(&self) -> Option<&XmlDocument> {
        match self {
            ArchiveEntry::Xml(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_xml_mut(&mut self) -> Option<&mut XmlDocument> {
        match self {
            ArchiveEntry::Xml(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ArchiveEntry::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ArchiveEntry::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Ordered mapping of archive-relative paths to content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Archive {
    entries: IndexMap<String, ArchiveEntry>,
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, entry: ArchiveEntry) {
        self.entries.insert(normalize_path(path), entry);
    }

    pub fn insert_bytes(&mut self, path: &str, bytes: Vec<u8>) {
        let path = normalize_path(path);
        let entry = ArchiveEntry::from_bytes(&path, bytes);
        self.entries.insert(path, entry);
    }

    pub fn get(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.get(&normalize_path(path))
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut ArchiveEntry> {
        self.entries.get_mut(&normalize_path(path))
    }

    pub fn remove(&mut self, path: &str) -> Option<ArchiveEntry> {
        self.entries.shift_remove(&normalize_path(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(&normalize_path(path))
    }

    /// First path ending with `suffix`, e.g. `ocapi-settings.xml`.
    pub fn find(&self, suffix: &str) -> Option<&str> {
        self.entries
            .keys()
            .find(|p| p.ends_with(suffix))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArchiveEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Decodes a zip. When every entry lives under one top-level directory,
    /// that directory is stripped and returned as the root name.
    pub fn from_zip(bytes: &[u8]) -> Result<(Option<String>, Self)> {
        let files = zip_entries(bytes)?;
        let root = common_root(files.iter().map(|(name, _)| name.as_str()));

        let mut archive = Archive::new();
        for (name, data) in files {
            let path = match &root {
                Some(root) => name[root.len() + 1..].to_string(),
                None => name,
            };
            archive.insert_bytes(&path, data);
        }
        Ok((root, archive))
    }

    /// Encodes every entry beneath `root/`.
    pub fn to_zip(&self, root: &str) -> Result<Vec<u8>> {
        let root = root.trim_matches('/');
        let mut files = Vec::with_capacity(self.entries.len());
        for (path, entry) in &self.entries {
            files.push((format!("{}/{}", root, path), entry.to_bytes()?));
        }
        write_zip(files)
    }

    /// Reads every file below `dir`, in file-name order.
    pub fn from_directory(dir: &Path) -> Result<Self> {
        let mut archive = Archive::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .with_context(|| format!("{} is outside {}", entry.path().display(), dir.display()))?;
            let bytes = std::fs::read(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            archive.insert_bytes(&rel.to_string_lossy(), bytes);
        }
        Ok(archive)
    }
}

pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

fn common_root<'a>(mut names: impl Iterator<Item = &'a str>) -> Option<String> {
    let first = names.next()?;
    let (root, _) = first.split_once('/')?;
    let prefix = format!("{}/", root);
    if names.all(|n| n.starts_with(&prefix)) {
        Some(root.to_string())
    } else {
        None
    }
}

/// File entries of a zip by their full names; directory entries are skipped.
pub fn zip_entries(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut zip = ZipArchive::new(Cursor::new(bytes)).context("Failed to open zip")?;
    let mut files = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let mut file = zip.by_index(i).context("Failed to read zip entry")?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().replace('\\', "/");
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)
            .with_context(|| format!("Failed to extract {}", name))?;
        files.push((name, data));
    }
    Ok(files)
}

/// Writes a deflated zip from full entry names.
pub fn write_zip<I>(files: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (String, Vec<u8>)>,
{
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, data) in files {
        writer
            .start_file(name.as_str(), options)
            .with_context(|| format!("Failed to add {} to zip", name))?;
        writer.write_all(&data)?;
    }
    let cursor = writer.finish().context("Failed to finish zip")?;
    Ok(cursor.into_inner())
}
