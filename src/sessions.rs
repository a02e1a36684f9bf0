use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::kv::KvStore;
use crate::output::guess_mime_type;

/* ============================= TYPES ============================= */

#[derive(Debug, Clone, Serialize)]
pub struct StoredFile {
    #[serde(rename = "fileId")]
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct SessionEntry {
    files: Vec<StoredFile>,
    last_touched: Option<DateTime<Utc>>,
}

/* ============================= STORE ============================= */

const STATE_PREFIX: &str = "sessions:state:";
const STATE_TTL: u64 = 24 * 3600;
const SESSION_RETENTION_HOURS: i64 = 24;

/// Per-session uploaded and generated files, plus KV-backed REPL state
/// blobs. File bytes stay in-process; durable object storage is an
/// external collaborator.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    kv: Arc<dyn KvStore>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new(Self { sessions: Mutex::new(HashMap::new()), kv })
    }

    pub fn new_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    /* ── FILES ── */

    pub async fn add_file(&self, session_id: &str, filename: &str, bytes: Vec<u8>) -> StoredFile {
        let file = StoredFile {
            file_id: Uuid::new_v4().simple().to_string(),
            filename: filename.to_string(),
            size: bytes.len() as u64,
            mime_type: guess_mime_type(filename).to_string(),
            uploaded_at: Utc::now(),
            bytes,
        };

        let mut sessions = self.sessions.lock().await;
        let entry = sessions.entry(session_id.to_string()).or_default();
        entry.files.push(file.clone());
        entry.last_touched = Some(Utc::now());
        debug!(session_id = %session_id, filename = %filename, "session_file_stored");
        file
    }

    pub async fn list_files(&self, session_id: &str) -> Vec<StoredFile> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(entry) => {
                entry.last_touched = Some(Utc::now());
                entry.files.clone()
            }
            None => Vec::new(),
        }
    }

    pub async fn get_file(&self, session_id: &str, file_id: &str) -> Option<StoredFile> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)?
            .files
            .iter()
            .find(|f| f.file_id == file_id)
            .cloned()
    }

    pub async fn delete_file(&self, session_id: &str, file_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get_mut(session_id) else {
            return false;
        };
        let before = entry.files.len();
        entry.files.retain(|f| f.file_id != file_id);
        entry.files.len() != before
    }

    /* ── REPL STATE ── */

    /// Store a base64 state blob for a session. Rejects blobs that do not
    /// decode; a corrupt blob would poison every later execution.
    pub async fn save_state(&self, session_id: &str, state_b64: &str) -> Result<(), String> {
        if BASE64.decode(state_b64).is_err() {
            return Err("state is not valid base64".to_string());
        }
        self.kv
            .set_ex(&format!("{STATE_PREFIX}{session_id}"), state_b64, STATE_TTL)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn load_state(&self, session_id: &str) -> Option<String> {
        self.kv
            .get(&format!("{STATE_PREFIX}{session_id}"))
            .await
            .ok()
            .flatten()
    }

    /* ── SWEEP ── */

    /// Drop sessions untouched for the retention window.
    pub async fn sweep_expired(&self) {
        let cutoff = Utc::now() - Duration::hours(SESSION_RETENTION_HOURS);
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, entry| entry.last_touched.is_some_and(|t| t > cutoff));
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/* ============================= TESTS ============================= */
