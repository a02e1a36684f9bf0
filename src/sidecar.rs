use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::output::ProducedFile;

/* ============================= WIRE TYPES ============================= */

/// Body of `POST /execute` on the sidecar.
#[derive(Debug, Clone, Serialize)]
pub struct SidecarExecuteRequest {
    pub code: String,
    pub timeout_s: u64,
    pub working_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_state: Option<bool>,
}

/// Reply from `POST /execute`. All sidecar responses are JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct SidecarExecuteResponse {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub memory_peak_mb: Option<f64>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub state_errors: Vec<String>,
    #[serde(default)]
    pub files_produced: Vec<ProducedFile>,
}

/// How the sidecar call went, before shaping into an `ExecutionResult`.
#[derive(Debug)]
pub enum SidecarOutcome {
    Ok(SidecarExecuteResponse),
    /// No reply within `timeout_s` plus the grace window.
    Timeout,
    /// HTTP ≥ 500 from the sidecar; body carried verbatim.
    ServerError(String),
    /// Connection refused, reset, bad JSON, or any other transport fault.
    Transport(String),
}

/* ============================= CLIENT ============================= */

/// Extra seconds the dispatcher waits past the execution timeout before
/// declaring the sidecar unresponsive.
pub const EXECUTE_GRACE_SECS: u64 = 5;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed client for the sidecar HTTP contract. One instance serves every
/// pod; per-call URLs are derived from the pod IP.
#[derive(Clone)]
pub struct SidecarClient {
    client: reqwest::Client,
    port: u16,
}

impl SidecarClient {
    pub fn new(port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            port,
        }
    }

    fn url(&self, pod_ip: &str, path: &str) -> String {
        format!("http://{}:{}{}", pod_ip, self.port, path)
    }

    /// `GET /health`: true iff the sidecar answers 200 promptly.
    pub async fn health(&self, pod_ip: &str) -> bool {
        if pod_ip.is_empty() {
            return false;
        }
        match self
            .client
            .get(self.url(pod_ip, "/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// `POST /files`: one multipart upload per file.
    pub async fn upload_file(
        &self,
        pod_ip: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> anyhow::Result<()> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(self.url(pod_ip, "/files"))
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("file upload rejected with {}", resp.status());
        }
        debug!(pod_ip = %pod_ip, filename = %filename, "file_uploaded");
        Ok(())
    }

    /// `POST /execute`, bounded by the request timeout plus grace.
    pub async fn execute(
        &self,
        pod_ip: &str,
        request: &SidecarExecuteRequest,
    ) -> SidecarOutcome {
        let ceiling = Duration::from_secs(request.timeout_s + EXECUTE_GRACE_SECS);

        let response = self
            .client
            .post(self.url(pod_ip, "/execute"))
            .json(request)
            .timeout(ceiling)
            .send()
            .await;

        let response = match response {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return SidecarOutcome::Timeout,
            Err(e) => return SidecarOutcome::Transport(e.to_string()),
        };

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return SidecarOutcome::ServerError(body);
        }
        if !status.is_success() {
            return SidecarOutcome::Transport(format!("sidecar replied {status}"));
        }

        match response.json::<SidecarExecuteResponse>().await {
            Ok(parsed) => SidecarOutcome::Ok(parsed),
            Err(e) => SidecarOutcome::Transport(format!("invalid sidecar response: {e}")),
        }
    }
}

/* ============================= TESTS ============================= */
