// ABOUTME: Remote job submission and status polling
// ABOUTME: Waits out "already running" conflicts and reports failed executions with their logs

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::client::Connection;
use super::models::{
    running_execution_query, JobExecution, JobSubmission, SearchResult,
};
use super::{DataApi, FileTransfer, JobApi};
use crate::error::ToolkitError;

pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Progress is logged once every this many polls.
const PROGRESS_EVERY: u32 = 10;
const JOB_ALREADY_RUNNING: &str = "JobAlreadyRunningException";

#[async_trait]
impl JobApi for Connection {
    async fn start_job(&self, job_id: &str, parameters: &Value) -> Result<JobSubmission> {
        let path = format!("jobs/{}/executions", job_id);
        let response = self.data_request(Method::POST, &path, Some(parameters)).await?;
        if response.status == 400 && response.fault_type() == Some(JOB_ALREADY_RUNNING) {
            return Ok(JobSubmission::AlreadyRunning);
        }
        let response = response.into_success(&format!("Starting job {}", job_id))?;
        let execution = serde_json::from_value(response.body)
            .with_context(|| format!("Failed to parse execution of job {}", job_id))?;
        Ok(JobSubmission::Started(execution))
    }

    async fn get_job_execution(&self, job_id: &str, execution_id: &str) -> Result<JobExecution> {
        let path = format!("jobs/{}/executions/{}", job_id, execution_id);
        let response = self
            .data_get(&path)
            .await?
            .into_success(&format!("Reading execution {} of job {}", execution_id, job_id))?;
        serde_json::from_value(response.body).context("Failed to parse job execution")
    }

    async fn running_executions(&self, job_id: &str) -> Result<Vec<JobExecution>> {
        let query = running_execution_query(job_id);
        let response = self
            .data_request(Method::POST, "job_execution_search", Some(&query))
            .await?
            .into_success("Searching job executions")?;
        let result: SearchResult<JobExecution> =
            serde_json::from_value(response.body).context("Failed to parse job execution search")?;
        let mut hits = result.hits;
        hits.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(hits)
    }

    async fn fetch_job_log(&self, log_path: &str) -> Result<Option<String>> {
        let path = log_path.trim_start_matches('/');
        let path = path.strip_prefix("Sites/").unwrap_or(path);
        Ok(self
            .get_file(path)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// Drives named remote jobs to completion.
pub struct JobRunner<'a, J: ?Sized> {
    api: &'a J,
    poll_interval: Duration,
}

impl<'a, J: JobApi + ?Sized> JobRunner<'a, J> {
    pub fn new(api: &'a J) -> Self {
        Self {
            api,
            poll_interval: JOB_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Submits a job. When the server reports the job as already running, waits
    /// for the oldest running execution to end and submits again.
    pub async fn execute_job(&self, job_id: &str, parameters: &Value) -> Result<JobExecution> {
        loop {
            match self.api.start_job(job_id, parameters).await? {
                JobSubmission::Started(execution) => {
                    info!("Started job {} (execution {})", job_id, execution.id);
                    return Ok(execution);
                }
                JobSubmission::AlreadyRunning => {
                    let running = self.api.running_executions(job_id).await?;
                    match running.first() {
                        Some(blocking) => {
                            warn!(
                                "Job {} is already running (execution {}), waiting for it to finish",
                                job_id, blocking.id
                            );
                            if let Err(e) = self.wait_for_job(job_id, &blocking.id).await {
                                warn!("Blocking execution {} did not succeed: {:#}", blocking.id, e);
                            }
                        }
                        None => {
                            debug!("No running execution of {} found, retrying", job_id);
                            tokio::time::sleep(self.poll_interval).await;
                        }
                    }
                }
            }
        }
    }

    /// Polls an execution until it finishes. Aborted or errored executions
    /// have their remote log written to the error log before failing.
    pub async fn wait_for_job(&self, job_id: &str, execution_id: &str) -> Result<JobExecution> {
        let started = tokio::time::Instant::now();
        let mut polls: u32 = 0;
        loop {
            let execution = self.api.get_job_execution(job_id, execution_id).await?;
            if execution.is_failed() {
                self.log_failure(&execution).await;
                return Err(ToolkitError::Job {
                    job_id: job_id.to_string(),
                    execution_id: execution_id.to_string(),
                    status: execution.status.clone(),
                }
                .into());
            }
            if execution.is_finished() {
                info!(
                    "Job {} (execution {}) finished in {}s",
                    job_id,
                    execution_id,
                    started.elapsed().as_secs()
                );
                return Ok(execution);
            }

            polls += 1;
            if polls % PROGRESS_EVERY == 0 {
                info!(
                    "Job {} (execution {}) still {:?} after {}s",
                    job_id,
                    execution_id,
                    execution.execution_status,
                    started.elapsed().as_secs()
                );
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Submits and waits.
    pub async fn run_job(&self, job_id: &str, parameters: &Value) -> Result<JobExecution> {
        let execution = self.execute_job(job_id, parameters).await?;
        self.wait_for_job(job_id, &execution.id).await
    }

    async fn log_failure(&self, execution: &JobExecution) {
        error!(
            "Job {} (execution {}) failed with status {}",
            execution.job_id, execution.id, execution.status
        );
        let Some(log_path) = execution.log_file_path.as_deref() else {
            return;
        };
        match self.api.fetch_job_log(log_path).await {
            Ok(Some(log)) => error!("Job log {}:\n{}", log_path, log),
            Ok(None) => warn!("Job log {} not found", log_path),
            Err(e) => warn!("Failed to fetch job log {}: {:#}", log_path, e),
        }
    }
}
