// ABOUTME: Data structures for remote job executions and data API responses
// ABOUTME: These are deserialized from the instance's JSON API

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ToolkitError;

/// Status code and JSON body of a data API call. Empty or non-JSON bodies
/// become `Value::Null`.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    pub fn is_forbidden(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    /// The `fault.type` of an error body, e.g. `JobAlreadyRunningException`.
    pub fn fault_type(&self) -> Option<&str> {
        self.body.pointer("/fault/type").and_then(Value::as_str)
    }

    pub fn fault_message(&self) -> Option<&str> {
        self.body.pointer("/fault/message").and_then(Value::as_str)
    }

    /// Turns a non-2xx response into a typed error describing `action`.
    pub fn into_success(self, action: &str) -> anyhow::Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let detail = self
            .fault_message()
            .map(str::to_string)
            .unwrap_or_else(|| self.body.to_string());
        let err = if self.is_forbidden() {
            ToolkitError::Permission(format!(
                "{} was denied ({}): {}. Grant the API client access to this resource in the OCAPI settings or run a bootstrap",
                action, self.status, detail
            ))
        } else {
            ToolkitError::Connection(format!(
                "{} failed with status {}: {}",
                action, self.status, detail
            ))
        };
        Err(err.into())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Finished,
    Aborted,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobExecution {
    pub id: String,
    pub job_id: String,
    pub status: String, // "PENDING", "RUNNING", "OK", "ERROR"
    pub execution_status: ExecutionStatus,
    pub log_file_path: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub is_log_file_existing: bool,
}

impl JobExecution {
    pub fn is_failed(&self) -> bool {
        self.execution_status == ExecutionStatus::Aborted || self.status == "ERROR"
    }

    pub fn is_finished(&self) -> bool {
        self.execution_status == ExecutionStatus::Finished && !self.is_failed()
    }
}

/// Outcome of submitting a job.
#[derive(Debug, Clone)]
pub enum JobSubmission {
    Started(JobExecution),
    /// The server only allows one execution of this job at a time.
    AlreadyRunning,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchResult<T> {
    pub count: u32,
    pub total: u32,
    pub hits: Vec<T>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeVersion {
    pub id: String,
    pub active: bool,
    pub last_modification_time: Option<String>,
}

/// Search body selecting running or pending executions of `job_id`.
pub fn running_execution_query(job_id: &str) -> Value {
    json!({
        "query": {
            "bool_query": {
                "must": [
                    {"term_query": {"fields": ["job_id"], "operator": "is", "values": [job_id]}},
                    {"term_query": {"fields": ["status"], "operator": "one_of", "values": ["RUNNING", "PENDING"]}}
                ]
            }
        },
        "select": "(**)",
        "sorts": [{"field": "start_time", "sort_order": "asc"}]
    })
}
