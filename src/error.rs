// ABOUTME: Custom error types for the toolkit
// ABOUTME: Provides context-specific error variants with actionable messages

use std::fmt;

#[derive(Debug)]
pub enum ToolkitError {
    Config(String),
    Connection(String),
    Permission(String),
    Job {
        job_id: String,
        execution_id: String,
        status: String,
    },
    Migration(String),
    Validation(String),
}

impl fmt::Display for ToolkitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ToolkitError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ToolkitError::Connection(msg) => write!(f, "Connection error: {}", msg),
            ToolkitError::Permission(msg) => write!(f, "Permission error: {}", msg),
            ToolkitError::Job {
                job_id,
                execution_id,
                status,
            } => write!(
                f,
                "Job execution error: {} ({}) ended with status {}",
                job_id, execution_id, status
            ),
            ToolkitError::Migration(msg) => write!(f, "Migration error: {}", msg),
            ToolkitError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ToolkitError {}

/// Returns the typed toolkit error at the root of an `anyhow` chain, if any.
pub fn toolkit_error(err: &anyhow::Error) -> Option<&ToolkitError> {
    err.chain().find_map(|e| e.downcast_ref::<ToolkitError>())
}
