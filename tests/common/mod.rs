#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde_json::{Value, json};

use codepod::config::Settings;
use codepod::pool::{PodHandle, PodProvider, PodStatus};

/* ============================= SETTINGS ============================= */

/// Settings tuned for fast tests: short intervals, pool for Python only.
pub fn test_settings(sidecar_port: u16) -> Settings {
    let mut s = Settings::default();
    s.sidecar_port = sidecar_port;
    s.pool_sizes.insert("py".to_string(), 2);
    s.pool_replenish_interval = Duration::from_millis(20);
    s.pool_health_check_interval = Duration::from_millis(200);
    s.pool_acquire_timeout = Duration::from_millis(200);
    s
}

/* ============================= MOCK PROVIDER ============================= */

/// Manufactures handles pointing at the fake sidecar on loopback and
/// counts lifecycle calls so tests can assert no pod leaks.
pub struct MockPodProvider {
    pub pod_ip: String,
    pub created: AtomicUsize,
    pub deleted: AtomicUsize,
    pub fail_creates: AtomicBool,
}

impl MockPodProvider {
    pub fn new(pod_ip: &str) -> Arc<Self> {
        Arc::new(Self {
            pod_ip: pod_ip.to_string(),
            created: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
            fail_creates: AtomicBool::new(false),
        })
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PodProvider for MockPodProvider {
    async fn create(
        &self,
        language: &str,
        session_id: Option<&str>,
    ) -> anyhow::Result<PodHandle> {
        if self.fail_creates.load(Ordering::SeqCst) {
            anyhow::bail!("no capacity");
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(PodHandle {
            uid: format!("uid-{language}-{n}"),
            name: format!("codepod-{language}-{n}"),
            namespace: "default".to_string(),
            language: language.to_string(),
            pod_ip: self.pod_ip.clone(),
            status: PodStatus::Starting,
            created_at: Utc::now(),
            session_id: session_id.map(str::to_string),
            health_check_failures: 0,
        })
    }

    async fn delete(&self, _handle: &PodHandle) -> anyhow::Result<()> {
        self.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self, _handle: &PodHandle) -> bool {
        true
    }
}

/* ============================= FAKE SIDECAR ============================= */

/// In-process stand-in for the pod sidecar. Behaviour is driven by the
/// submitted code string:
///
///   "print('hi')"        → stdout "hi\n", exit 0
///   "sleep:<secs>"       → wait that long, then exit 0
///   "exit:<code>"        → that exit code, stderr "boom"
///   "crash"              → HTTP 500 with a plain-text body
///   "capture:<n>"        → exit 0, state = base64("n=<n>")
///   "add-one"            → stdout = (n+1) from initial_state, exit 0
///   "make-files"         → files_produced incl. one valid and two bad
///   anything else        → stdout echoes the code, exit 0
pub async fn spawn_fake_sidecar() -> SocketAddr {
    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/files", post(|| async { StatusCode::OK }))
        .route("/execute", post(fake_execute));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake sidecar");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fake sidecar serve");
    });
    addr
}

async fn fake_execute(Json(body): Json<Value>) -> axum::response::Response {
    use axum::response::IntoResponse;

    let code = body.get("code").and_then(Value::as_str).unwrap_or("");
    let initial_state = body.get("initial_state").and_then(Value::as_str);
    let capture_state = body
        .get("capture_state")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if let Some(secs) = code.strip_prefix("sleep:") {
        let secs: u64 = secs.parse().unwrap_or(1);
        tokio::time::sleep(Duration::from_secs(secs)).await;
        return Json(reply(0, "", "", None)).into_response();
    }

    if let Some(exit) = code.strip_prefix("exit:") {
        let exit: i32 = exit.parse().unwrap_or(1);
        return Json(reply(exit, "", "boom", None)).into_response();
    }

    if code == "crash" {
        return (StatusCode::INTERNAL_SERVER_ERROR, "sidecar fell over").into_response();
    }

    if let Some(n) = code.strip_prefix("capture:") {
        let state = BASE64.encode(format!("n={n}"));
        let mut body = reply(0, "", "", Some(&state));
        if !capture_state {
            body["state"] = Value::Null;
        }
        return Json(body).into_response();
    }

    if code == "add-one" {
        let n: i64 = initial_state
            .and_then(|s| BASE64.decode(s).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| s.strip_prefix("n=").and_then(|n| n.parse().ok()))
            .unwrap_or(0);
        return Json(reply(0, &format!("{}\n", n + 1), "", None)).into_response();
    }

    if code == "make-files" {
        let mut body = reply(0, "", "", None);
        body["files_produced"] = json!([
            { "filename": "result.csv", "size": 1024, "mime_type": "" },
            { "filename": "payload.exe", "size": 10, "mime_type": "" },
            { "filename": "../escape.txt", "size": 10, "mime_type": "" },
        ]);
        return Json(body).into_response();
    }

    if code == "print('hi')" {
        return Json(reply(0, "hi\n", "", None)).into_response();
    }

    Json(reply(0, &format!("{code}\n"), "", None)).into_response()
}

fn reply(exit_code: i32, stdout: &str, stderr: &str, state: Option<&str>) -> Value {
    json!({
        "exit_code": exit_code,
        "stdout": stdout,
        "stderr": stderr,
        "execution_time_ms": 5,
        "memory_peak_mb": 8.5,
        "state": state,
        "state_errors": [],
        "files_produced": [],
    })
}
