// ABOUTME: In-memory remote instance used by unit tests
// ABOUTME: Emulates the data API document store, WebDAV files and the archive jobs

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::archive::pipeline::{EXPORT_JOB, IMPORT_JOB};
use crate::archive::{zip_entries, Archive};
use crate::remote::webdav::IMPEX_DIR;
use crate::remote::{
    ApiResponse, DataApi, ExecutionStatus, FileTransfer, Instance, JobApi, JobExecution,
    JobSubmission,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    StartJob(String),
    GetExecution(String),
    SearchRunning(String),
    Put(String),
    Get(String),
    Delete(String),
    Unzip(String),
    MakeDir(String),
    Data(String, String),
}

struct FakeExecution {
    job_id: String,
    statuses: VecDeque<ExecutionStatus>,
}

/// Records every operation; jobs finish on their first poll unless scripted.
pub struct FakeInstance {
    client_id: String,
    code_version: Option<String>,
    ops: Mutex<Vec<Op>>,
    docs: Mutex<BTreeMap<String, Value>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    forbidden: Mutex<Vec<String>>,
    unforbidding_import: Mutex<Option<String>>,
    failing_puts: Mutex<u32>,
    imports: Mutex<Vec<(String, Archive)>>,
    failing_imports: Mutex<HashSet<String>>,
    export_payload: Mutex<Archive>,
    export_requests: Mutex<Vec<Value>>,
    scripted: Mutex<HashMap<String, VecDeque<ExecutionStatus>>>,
    already_running: Mutex<HashMap<String, u32>>,
    executions: Mutex<HashMap<String, FakeExecution>>,
    next_id: Mutex<u32>,
}

impl FakeInstance {
    pub fn new() -> Self {
        Self {
            client_id: "test-client".to_string(),
            code_version: Some("version1".to_string()),
            ops: Mutex::new(Vec::new()),
            docs: Mutex::new(BTreeMap::new()),
            files: Mutex::new(BTreeMap::new()),
            forbidden: Mutex::new(Vec::new()),
            unforbidding_import: Mutex::new(None),
            failing_puts: Mutex::new(0),
            imports: Mutex::new(Vec::new()),
            failing_imports: Mutex::new(HashSet::new()),
            export_payload: Mutex::new(Archive::new()),
            export_requests: Mutex::new(Vec::new()),
            scripted: Mutex::new(HashMap::new()),
            already_running: Mutex::new(HashMap::new()),
            executions: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }

    pub fn set_doc(&self, path: &str, value: Value) {
        self.docs.lock().unwrap().insert(path.to_string(), value);
    }

    pub fn doc(&self, path: &str) -> Option<Value> {
        self.docs.lock().unwrap().get(path).cloned()
    }

    /// Data API paths starting with `prefix` answer 403.
    pub fn forbid(&self, prefix: &str) {
        self.forbidden.lock().unwrap().push(prefix.to_string());
    }

    /// Forbidden paths become readable once an imported archive carries a
    /// file ending in `file_name`, the way granted permissions take effect.
    pub fn allow_all_after_import_of(&self, file_name: &str) {
        *self.unforbidding_import.lock().unwrap() = Some(file_name.to_string());
    }

    /// The next `times` WebDAV uploads fail.
    pub fn fail_next_puts(&self, times: u32) {
        *self.failing_puts.lock().unwrap() = times;
    }

    pub fn put_file_sync(&self, path: &str, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(path.to_string(), bytes);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn files_under(&self, prefix: &str) -> Vec<String> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        self.files
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Imported zip names with their decoded archives, in import order.
    pub fn imports(&self) -> Vec<(String, Archive)> {
        self.imports.lock().unwrap().clone()
    }

    /// Imports of archives containing `path` end in an ERROR execution.
    pub fn fail_imports_containing(&self, path: &str) {
        self.failing_imports.lock().unwrap().insert(path.to_string());
    }

    pub fn set_export_payload(&self, archive: Archive) {
        *self.export_payload.lock().unwrap() = archive;
    }

    /// `data_units` of every export request.
    pub fn export_requests(&self) -> Vec<Value> {
        self.export_requests.lock().unwrap().clone()
    }

    /// Statuses the next execution of `job_id` reports, one per poll; the
    /// last one repeats.
    pub fn script_statuses(&self, job_id: &str, statuses: &[ExecutionStatus]) {
        self.scripted
            .lock()
            .unwrap()
            .insert(job_id.to_string(), statuses.iter().copied().collect());
    }

    /// The next `times` submissions of `job_id` answer "already running".
    pub fn set_already_running(&self, job_id: &str, times: u32) {
        self.already_running
            .lock()
            .unwrap()
            .insert(job_id.to_string(), times);
    }

    fn next_execution_id(&self) -> String {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        format!("exec-{}", next)
    }

    fn run_import(&self, parameters: &Value) -> ExecutionStatus {
        let file_name = parameters["file_name"].as_str().unwrap_or_default();
        let Some(bytes) = self.file(&format!("{}/{}", IMPEX_DIR, file_name)) else {
            return ExecutionStatus::Aborted;
        };
        let Ok((_, archive)) = Archive::from_zip(&bytes) else {
            return ExecutionStatus::Aborted;
        };
        let failing = self
            .failing_imports
            .lock()
            .unwrap()
            .iter()
            .any(|p| archive.contains(p));
        let unforbids = self
            .unforbidding_import
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|f| archive.paths().any(|p| p.ends_with(f)));
        if unforbids && !failing {
            self.forbidden.lock().unwrap().clear();
        }
        self.imports
            .lock()
            .unwrap()
            .push((file_name.to_string(), archive));
        if failing {
            ExecutionStatus::Aborted
        } else {
            ExecutionStatus::Finished
        }
    }

    fn run_export(&self, parameters: &Value) {
        self.export_requests
            .lock()
            .unwrap()
            .push(parameters["data_units"].clone());
        let file_name = parameters["export_file"].as_str().unwrap_or("export.zip");
        let root = file_name.trim_end_matches(".zip");
        let bytes = self.export_payload.lock().unwrap().to_zip(root).unwrap();
        self.put_file_sync(&format!("{}/{}", IMPEX_DIR, file_name), bytes);
    }

    fn merge_patch(existing: Option<Value>, patch: &Value) -> Value {
        let mut merged = match existing {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Value::Object(patch) = patch {
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
        }
        Value::Object(merged)
    }
}

impl Default for FakeInstance {
    fn default() -> Self {
        Self::new()
    }
}

fn status_name(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "PENDING",
        ExecutionStatus::Running => "RUNNING",
        ExecutionStatus::Finished => "OK",
        ExecutionStatus::Aborted => "ERROR",
        ExecutionStatus::Unknown => "UNKNOWN",
    }
}

#[async_trait]
impl DataApi for FakeInstance {
    async fn data_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse> {
        self.record(Op::Data(method.to_string(), path.to_string()));
        if self
            .forbidden
            .lock()
            .unwrap()
            .iter()
            .any(|p| path.starts_with(p))
        {
            return Ok(ApiResponse::new(
                403,
                json!({"fault": {"type": "ClientAccessForbiddenException", "message": "forbidden"}}),
            ));
        }

        let not_found = || {
            ApiResponse::new(
                404,
                json!({"fault": {"type": "NotFoundException", "message": path}}),
            )
        };
        let mut docs = self.docs.lock().unwrap();
        let response = match method {
            Method::GET => match docs.get(path) {
                Some(doc) => ApiResponse::new(200, doc.clone()),
                None => not_found(),
            },
            Method::PUT => {
                let mut doc = body.cloned().unwrap_or(Value::Null);
                if path.starts_with("custom_objects/") {
                    if let (Value::Object(map), Some(key)) = (&mut doc, path.rsplit('/').next()) {
                        map.insert("key_value_string".to_string(), json!(key));
                    }
                }
                docs.insert(path.to_string(), doc.clone());
                ApiResponse::new(200, doc)
            }
            Method::PATCH => {
                let merged = Self::merge_patch(docs.get(path).cloned(), body.unwrap_or(&Value::Null));
                docs.insert(path.to_string(), merged.clone());
                ApiResponse::new(200, merged)
            }
            Method::DELETE => match docs.remove(path) {
                Some(_) => ApiResponse::new(204, Value::Null),
                None => not_found(),
            },
            Method::POST if path.starts_with("custom_objects_search/") => {
                let object_type = path.trim_start_matches("custom_objects_search/");
                let prefix = format!("custom_objects/{}/", object_type);
                let hits: Vec<Value> = docs
                    .iter()
                    .filter(|(k, _)| k.starts_with(&prefix))
                    .map(|(_, v)| v.clone())
                    .collect();
                ApiResponse::new(200, json!({"count": hits.len(), "total": hits.len(), "hits": hits}))
            }
            _ => ApiResponse::new(200, body.cloned().unwrap_or(Value::Null)),
        };
        Ok(response)
    }
}

#[async_trait]
impl FileTransfer for FakeInstance {
    async fn put_file(&self, path: &str, body: Vec<u8>) -> Result<()> {
        self.record(Op::Put(path.to_string()));
        {
            let mut failing = self.failing_puts.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                anyhow::bail!("upload of {} rejected", path);
            }
        }
        self.put_file_sync(path, body);
        Ok(())
    }

    async fn get_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.record(Op::Get(path.to_string()));
        Ok(self.file(path))
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.record(Op::Delete(path.to_string()));
        let nested = format!("{}/", path.trim_end_matches('/'));
        self.files
            .lock()
            .unwrap()
            .retain(|k, _| k != path && !k.starts_with(&nested));
        Ok(())
    }

    async fn unzip_file(&self, path: &str) -> Result<()> {
        self.record(Op::Unzip(path.to_string()));
        let bytes = self
            .file(path)
            .ok_or_else(|| anyhow::anyhow!("{} does not exist", path))?;
        let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
        for (name, data) in zip_entries(&bytes)? {
            self.put_file_sync(&format!("{}/{}", parent, name), data);
        }
        Ok(())
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        self.record(Op::MakeDir(path.to_string()));
        Ok(())
    }
}

#[async_trait]
impl JobApi for FakeInstance {
    async fn start_job(&self, job_id: &str, parameters: &Value) -> Result<JobSubmission> {
        self.record(Op::StartJob(job_id.to_string()));
        {
            let mut running = self.already_running.lock().unwrap();
            if let Some(times) = running.get_mut(job_id).filter(|t| **t > 0) {
                *times -= 1;
                self.executions.lock().unwrap().insert(
                    format!("blocking-{}", job_id),
                    FakeExecution {
                        job_id: job_id.to_string(),
                        statuses: VecDeque::from([ExecutionStatus::Finished]),
                    },
                );
                return Ok(JobSubmission::AlreadyRunning);
            }
        }

        let scripted = self.scripted.lock().unwrap().remove(job_id);
        let statuses = match job_id {
            IMPORT_JOB => VecDeque::from([self.run_import(parameters)]),
            EXPORT_JOB => {
                self.run_export(parameters);
                VecDeque::from([ExecutionStatus::Finished])
            }
            _ => scripted.unwrap_or_else(|| VecDeque::from([ExecutionStatus::Finished])),
        };

        let id = self.next_execution_id();
        self.executions.lock().unwrap().insert(
            id.clone(),
            FakeExecution {
                job_id: job_id.to_string(),
                statuses,
            },
        );
        Ok(JobSubmission::Started(JobExecution {
            id,
            job_id: job_id.to_string(),
            status: "PENDING".to_string(),
            execution_status: ExecutionStatus::Pending,
            ..Default::default()
        }))
    }

    async fn get_job_execution(&self, job_id: &str, execution_id: &str) -> Result<JobExecution> {
        self.record(Op::GetExecution(execution_id.to_string()));
        let mut executions = self.executions.lock().unwrap();
        let execution = executions
            .get_mut(execution_id)
            .ok_or_else(|| anyhow::anyhow!("unknown execution {}", execution_id))?;
        let status = if execution.statuses.len() > 1 {
            execution.statuses.pop_front().unwrap_or_default()
        } else {
            execution.statuses.front().copied().unwrap_or_default()
        };
        Ok(JobExecution {
            id: execution_id.to_string(),
            job_id: execution.job_id.clone(),
            status: status_name(status).to_string(),
            execution_status: status,
            log_file_path: Some(format!("/Sites/LOGS/jobs/{}.log", job_id)),
            ..Default::default()
        })
    }

    async fn running_executions(&self, job_id: &str) -> Result<Vec<JobExecution>> {
        self.record(Op::SearchRunning(job_id.to_string()));
        let blocking = format!("blocking-{}", job_id);
        let executions = self.executions.lock().unwrap();
        Ok(executions
            .get(&blocking)
            .map(|e| JobExecution {
                id: blocking.clone(),
                job_id: e.job_id.clone(),
                status: "RUNNING".to_string(),
                execution_status: ExecutionStatus::Running,
                ..Default::default()
            })
            .into_iter()
            .collect())
    }

    async fn fetch_job_log(&self, log_path: &str) -> Result<Option<String>> {
        let path = log_path.trim_start_matches('/');
        let path = path.strip_prefix("Sites/").unwrap_or(path);
        Ok(self
            .get_file(path)
            .await?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }
}

impl Instance for FakeInstance {
    fn client_id(&self) -> Option<&str> {
        Some(&self.client_id)
    }

    fn code_version(&self) -> Option<&str> {
        self.code_version.as_deref()
    }
}
