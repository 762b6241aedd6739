// ABOUTME: Remote instance access layer
// ABOUTME: Defines the data API, file transfer and job seams that the engines talk to

pub mod auth;
pub mod client;
pub mod jobs;
pub mod models;
pub mod webdav;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

pub use auth::{AccessToken, TokenCache};
pub use client::{Connection, Protocol, ProtocolClient};
pub use jobs::JobRunner;
pub use models::{ApiResponse, ExecutionStatus, JobExecution, JobSubmission};

/// JSON document API of the instance (OCAPI data API).
#[async_trait]
pub trait DataApi: Send + Sync {
    /// Issues a request relative to the data API base. Non-2xx statuses are
    /// returned, not raised; transport failures are errors.
    async fn data_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse>;

    async fn data_get(&self, path: &str) -> Result<ApiResponse> {
        self.data_request(Method::GET, path, None).await
    }
}

/// WebDAV file namespace rooted at the instance `Sites` tree.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn put_file(&self, path: &str, body: Vec<u8>) -> Result<()>;

    /// Returns `None` when the file does not exist.
    async fn get_file(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Deleting a missing file succeeds.
    async fn delete_file(&self, path: &str) -> Result<()>;

    /// Extracts a zip in place, into the directory that contains it.
    async fn unzip_file(&self, path: &str) -> Result<()>;

    /// Creating an existing collection succeeds.
    async fn make_dir(&self, path: &str) -> Result<()>;
}

/// Remote asynchronous job service.
#[async_trait]
pub trait JobApi: Send + Sync {
    async fn start_job(&self, job_id: &str, parameters: &Value) -> Result<JobSubmission>;

    async fn get_job_execution(&self, job_id: &str, execution_id: &str) -> Result<JobExecution>;

    /// Running and pending executions of a job, oldest start time first.
    async fn running_executions(&self, job_id: &str) -> Result<Vec<JobExecution>>;

    /// Downloads a job log by the path reported on its execution.
    async fn fetch_job_log(&self, log_path: &str) -> Result<Option<String>>;
}

/// Everything the engines need from one remote instance.
pub trait Instance: DataApi + FileTransfer + JobApi {
    /// Identity recorded in bootstrap state and used for permissions.
    fn client_id(&self) -> Option<&str>;

    fn code_version(&self) -> Option<&str>;
}
