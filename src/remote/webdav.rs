// ABOUTME: WebDAV file transfer against the instance Sites tree
// ABOUTME: Implements put, get, delete, unzip and collection creation for a Connection

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use tracing::debug;

use super::client::{Connection, Protocol, RequestBody};
use super::FileTransfer;
use crate::error::ToolkitError;

pub const IMPEX_DIR: &str = "Impex/src/instance";
pub const CARTRIDGES_DIR: &str = "Cartridges";
pub const LOGS_DIR: &str = "Logs";

/// Joins WebDAV path segments with single slashes.
pub fn join(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn status_error(action: &str, path: &str, status: StatusCode) -> anyhow::Error {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ToolkitError::Permission(format!(
            "WebDAV {} of {} was denied ({}). Check the WebDAV client permissions for this client id or user",
            action, path, status
        ))
        .into()
    } else {
        ToolkitError::Connection(format!("WebDAV {} of {} failed with status {}", action, path, status))
            .into()
    }
}

#[async_trait]
impl FileTransfer for Connection {
    async fn put_file(&self, path: &str, body: Vec<u8>) -> Result<()> {
        let size = body.len();
        let response = self
            .client(Protocol::WebDav)?
            .send(Method::PUT, path, &RequestBody::Bytes(body))
            .await?;
        if !response.status().is_success() {
            return Err(status_error("upload", path, response.status()));
        }
        debug!("Uploaded {} ({} bytes)", path, size);
        Ok(())
    }

    async fn get_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .client(Protocol::WebDav)?
            .send(Method::GET, path, &RequestBody::Empty)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error("download", path, response.status()));
        }
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read {}", path))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let response = self
            .client(Protocol::WebDav)?
            .send(Method::DELETE, path, &RequestBody::Empty)
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!("Deleted {}", path);
            return Ok(());
        }
        Err(status_error("delete", path, status))
    }

    async fn unzip_file(&self, path: &str) -> Result<()> {
        let form = RequestBody::Form(vec![("method".to_string(), "UNZIP".to_string())]);
        let response = self
            .client(Protocol::WebDav)?
            .send(Method::POST, path, &form)
            .await?;
        if !response.status().is_success() {
            return Err(status_error("unzip", path, response.status()));
        }
        Ok(())
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        let mkcol = Method::from_bytes(b"MKCOL").context("Invalid WebDAV method")?;
        let response = self
            .client(Protocol::WebDav)?
            .send(mkcol, path, &RequestBody::Empty)
            .await?;
        let status = response.status();
        // 405: the collection already exists
        if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        Err(status_error("mkcol", path, status))
    }
}
