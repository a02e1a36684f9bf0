use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::keys::short_hash;
use crate::languages;
use crate::metrics::{ExecutionMetric, MetricsSink};
use crate::output::{ProducedFile, guess_mime_type, sanitize_output, validate_produced_file};
use crate::pool::{ContainerSource, PodHandle};
use crate::pool_manager::PoolManager;
use crate::sidecar::{SidecarExecuteRequest, SidecarOutcome};

/* ============================= REQUEST / RESULT ============================= */

pub const DEFAULT_TIMEOUT_S: u64 = 30;
const WORKSPACE_DIR: &str = "/mnt/data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

/// Status from the exit code alone. Stderr phrasing never changes the
/// status, only the user-visible message.
pub fn derive_status(exit_code: i32) -> ExecutionStatus {
    match exit_code {
        124 => ExecutionStatus::Timeout,
        0 => ExecutionStatus::Completed,
        _ => ExecutionStatus::Failed,
    }
}

/// A file the caller wants present in the workspace before the code runs.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    pub timeout_s: Option<u64>,
    pub capture_state: bool,
    pub initial_state: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    pub memory_peak_mb: Option<f64>,
    pub state: Option<String>,
    pub state_errors: Vec<String>,
    pub files_produced: Vec<ProducedFile>,
    pub container_source: ContainerSource,
}

impl ExecutionResult {
    fn failed(execution_id: &str, stderr: String) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Failed,
            exit_code: 1,
            stdout: String::new(),
            stderr,
            execution_time_ms: 0,
            memory_peak_mb: None,
            state: None,
            state_errors: Vec::new(),
            files_produced: Vec::new(),
            container_source: ContainerSource::PoolMiss,
        }
    }
}

/* ============================= ACTIVE EXECUTIONS ============================= */

const ACTIVE_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Serialize)]
pub struct ActiveExecution {
    pub execution_id: String,
    pub language: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/* ============================= DISPATCHER ============================= */

/// Translates execution requests into sidecar RPCs against a pod from
/// the pool. Never surfaces an error to the caller: every path produces
/// an `ExecutionResult`.
pub struct Dispatcher {
    pools: Arc<PoolManager>,
    metrics: Arc<MetricsSink>,
    settings: Arc<Settings>,
    active: Mutex<HashMap<String, ActiveExecution>>,
}

impl Dispatcher {
    pub fn new(pools: Arc<PoolManager>, metrics: Arc<MetricsSink>, settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Self {
            pools,
            metrics,
            settings,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub async fn execute(
        &self,
        session_id: &str,
        request: ExecutionRequest,
        files: Vec<InputFile>,
        api_key_hash: Option<&str>,
    ) -> ExecutionResult {
        let execution_id = Uuid::new_v4().to_string();
        let language = request.language.to_lowercase();
        self.record_pending(&execution_id, &language);

        let Some(lang) = languages::get_language(&language) else {
            let result = ExecutionResult::failed(
                &execution_id,
                format!("Unsupported language: {language}"),
            );
            self.finish(&result, files.len(), api_key_hash).await;
            return result;
        };

        let Some((handle, source)) = self.pools.acquire(&language, Some(session_id)).await
        else {
            let result = ExecutionResult::failed(&execution_id, "No pod available".to_string());
            self.finish(&result, files.len(), api_key_hash).await;
            return result;
        };

        info!(
            execution_id = %execution_id,
            language = %language,
            pod = %handle.name,
            source = source.as_str(),
            "execution_started"
        );

        // Upload failures are logged but never abort the run; the code
        // may not need the file at all.
        for file in &files {
            if let Err(e) = self
                .pools
                .upload_file(&handle, &file.filename, file.bytes.clone())
                .await
            {
                warn!(
                    execution_id = %execution_id,
                    filename = %file.filename,
                    error = %e,
                    "file_upload_failed"
                );
            }
        }

        let timeout_s = self.effective_timeout(&request, lang);
        let payload = SidecarExecuteRequest {
            code: request.code.clone(),
            timeout_s,
            working_dir: WORKSPACE_DIR.to_string(),
            initial_state: request.initial_state.clone(),
            capture_state: request.capture_state.then_some(true),
        };

        let started = Instant::now();
        let outcome = self.pools.execute(&handle, &payload).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut result = self.shape_result(&execution_id, outcome, timeout_s, elapsed_ms, source);
        let produced = std::mem::take(&mut result.files_produced);
        result.files_produced = self.filter_produced(produced, &files);

        // Destroy-on-release: the pod served exactly one execution
        self.pools.release(handle, true).await;

        self.finish(&result, files.len(), api_key_hash).await;
        result
    }

    /// Requested timeout capped at the configured ceiling, then scaled by
    /// the language's multiplier.
    fn effective_timeout(&self, request: &ExecutionRequest, lang: &languages::LanguageConfig) -> u64 {
        let base = request
            .timeout_s
            .unwrap_or(DEFAULT_TIMEOUT_S)
            .min(self.settings.max_execution_time_s);
        (base as f64 * lang.timeout_multiplier).ceil() as u64
    }

    fn shape_result(
        &self,
        execution_id: &str,
        outcome: SidecarOutcome,
        timeout_s: u64,
        elapsed_ms: u64,
        source: ContainerSource,
    ) -> ExecutionResult {
        match outcome {
            SidecarOutcome::Ok(resp) => ExecutionResult {
                execution_id: execution_id.to_string(),
                status: derive_status(resp.exit_code),
                exit_code: resp.exit_code,
                stdout: sanitize_output(&resp.stdout),
                stderr: sanitize_output(&resp.stderr),
                execution_time_ms: if resp.execution_time_ms > 0 {
                    resp.execution_time_ms
                } else {
                    elapsed_ms
                },
                memory_peak_mb: resp.memory_peak_mb,
                state: resp.state,
                state_errors: resp.state_errors,
                files_produced: resp.files_produced,
                container_source: source,
            },
            SidecarOutcome::Timeout => ExecutionResult {
                execution_id: execution_id.to_string(),
                status: ExecutionStatus::Timeout,
                exit_code: 124,
                stdout: String::new(),
                stderr: format!("Execution timed out after {timeout_s} seconds"),
                execution_time_ms: elapsed_ms,
                memory_peak_mb: None,
                state: None,
                state_errors: Vec::new(),
                files_produced: Vec::new(),
                container_source: source,
            },
            SidecarOutcome::ServerError(body) => ExecutionResult {
                execution_id: execution_id.to_string(),
                status: ExecutionStatus::Failed,
                exit_code: 1,
                stdout: String::new(),
                stderr: sanitize_output(&format!("Sidecar error: {body}")),
                execution_time_ms: elapsed_ms,
                memory_peak_mb: None,
                state: None,
                state_errors: Vec::new(),
                files_produced: Vec::new(),
                container_source: source,
            },
            SidecarOutcome::Transport(message) => ExecutionResult {
                execution_id: execution_id.to_string(),
                status: ExecutionStatus::Failed,
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("Execution error: {message}"),
                execution_time_ms: elapsed_ms,
                memory_peak_mb: None,
                state: None,
                state_errors: Vec::new(),
                files_produced: Vec::new(),
                container_source: source,
            },
        }
    }

    /// Drop produced files that echo an upload, fail validation, or carry
    /// no MIME type the sidecar could determine.
    fn filter_produced(
        &self,
        produced: Vec<ProducedFile>,
        inputs: &[InputFile],
    ) -> Vec<ProducedFile> {
        produced
            .into_iter()
            .filter(|f| !inputs.iter().any(|input| input.filename == f.filename))
            .filter(|f| {
                validate_produced_file(&f.filename, f.size, self.settings.max_file_size_mb)
            })
            .map(|mut f| {
                if f.mime_type.is_empty() {
                    f.mime_type = guess_mime_type(&f.filename).to_string();
                }
                f
            })
            .collect()
    }

    /* ── ACTIVE-EXECUTION TRACKING ── */

    fn record_pending(&self, execution_id: &str, language: &str) {
        let mut active = self.active.lock().expect("active executions lock poisoned");
        active.insert(
            execution_id.to_string(),
            ActiveExecution {
                execution_id: execution_id.to_string(),
                language: language.to_string(),
                status: ExecutionStatus::Pending,
                started_at: Utc::now(),
                finished_at: None,
            },
        );
    }

    async fn finish(&self, result: &ExecutionResult, files_uploaded: usize, api_key_hash: Option<&str>) {
        let language = {
            let mut active = self.active.lock().expect("active executions lock poisoned");
            match active.get_mut(&result.execution_id) {
                Some(entry) => {
                    entry.status = result.status;
                    entry.finished_at = Some(Utc::now());
                    entry.language.clone()
                }
                None => String::new(),
            }
        };

        debug!(
            execution_id = %result.execution_id,
            status = result.status.as_str(),
            exit_code = result.exit_code,
            "execution_finished"
        );

        self.metrics
            .record_execution(ExecutionMetric {
                execution_id: result.execution_id.clone(),
                timestamp: Utc::now(),
                api_key_hash: api_key_hash.map(|h| short_hash(h).to_string()),
                language,
                status: result.status,
                execution_time_ms: result.execution_time_ms,
                memory_peak_mb: result.memory_peak_mb,
                exit_code: result.exit_code,
                files_uploaded,
                files_generated: result.files_produced.len(),
                container_source: result.container_source,
            })
            .await;
    }

    pub fn active_snapshot(&self) -> Vec<ActiveExecution> {
        let active = self.active.lock().expect("active executions lock poisoned");
        active.values().cloned().collect()
    }

    /// Drop finished records older than the retention window.
    pub fn sweep_expired(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ACTIVE_TTL).unwrap_or(chrono::Duration::hours(24));
        let mut active = self.active.lock().expect("active executions lock poisoned");
        active.retain(|_, entry| match entry.finished_at {
            Some(finished) => finished > cutoff,
            None => true,
        });
    }

    pub async fn run_sweep_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(interval) => self.sweep_expired(),
            }
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    // ── status derivation ──

    #[test]
    fn test_status_from_exit_code() {
        assert_eq!(derive_status(0), ExecutionStatus::Completed);
        assert_eq!(derive_status(124), ExecutionStatus::Timeout);
        assert_eq!(derive_status(1), ExecutionStatus::Failed);
        assert_eq!(derive_status(137), ExecutionStatus::Failed);
        assert_eq!(derive_status(-1), ExecutionStatus::Failed);
    }

    #[test]
    fn test_oom_phrasing_does_not_change_status() {
        // An OOM kill shows as 137 with a message; still just "failed"
        assert_eq!(derive_status(137), ExecutionStatus::Failed);
    }

    // ── serde shapes ──

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Timeout).unwrap(),
            "\"timeout\""
        );
    }

    #[test]
    fn test_result_serializes_container_source() {
        let result = ExecutionResult::failed("e-1", "No pod available".to_string());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["container_source"], "pool_miss");
        assert_eq!(json["exit_code"], 1);
        assert_eq!(json["status"], "failed");
    }
}
