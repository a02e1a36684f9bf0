use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Extension, Multipart, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::Json;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::auth::{AuthContext, AuthState, require_api_key, require_master_key};
use crate::config::Settings;
use crate::dispatcher::{Dispatcher, ExecutionRequest, InputFile};
use crate::error::ApiError;
use crate::key_manager::{ApiKeyManager, KeyManagerError, KeyUpdate};
use crate::keys::RateLimits;
use crate::kv::KvStore;
use crate::metrics::{self, MetricsSink};
use crate::pool_manager::PoolManager;
use crate::sessions::SessionStore;

/* ============================= STATE ============================= */

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub kv: Arc<dyn KvStore>,
    pub keys: Arc<ApiKeyManager>,
    pub pools: Arc<PoolManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<MetricsSink>,
    pub sessions: Arc<SessionStore>,
    pub kube: Option<kube::Client>,
}

impl AppState {
    fn auth_state(&self) -> AuthState {
        AuthState {
            keys: self.keys.clone(),
            kv: self.kv.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Internal-error response: detail stays masked unless DEBUG is on.
    fn internal(&self, e: impl std::fmt::Display) -> ApiError {
        ApiError::internal(e, self.settings.debug)
    }
}

/* ============================= ROUTER ============================= */

pub fn build_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let admin = Router::new()
        .route("/admin/keys", get(admin_list_keys).post(admin_create_key))
        .route(
            "/admin/keys/:hash",
            patch(admin_update_key).delete(admin_revoke_key),
        )
        .route("/admin/keys/:hash/usage", get(admin_key_usage))
        .route("/admin/stats", get(admin_stats))
        .layer(axum::middleware::from_fn_with_state(
            auth_state.clone(),
            require_master_key,
        ));

    Router::new()
        .route("/exec", post(exec))
        .route("/upload", post(upload))
        .route("/files/:session", get(list_files))
        .route("/files/:session/:file_id", delete(delete_file))
        .route("/download/:session/:file_id", get(download_file))
        .route("/state/:session", get(get_state).post(put_state))
        .merge(admin)
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/health/redis", get(health_redis))
        .route("/health/kubernetes", get(health_kubernetes))
        .route("/metrics", get(prometheus_metrics))
        .layer(axum::middleware::from_fn_with_state(auth_state, require_api_key))
        .with_state(state)
}

/* ============================= EXECUTION API ============================= */

#[derive(Debug, Deserialize)]
struct ExecBodyFile {
    filename: String,
    /// Base64-encoded file content.
    content: String,
}

#[derive(Debug, Deserialize)]
struct ExecBody {
    code: String,
    language: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    capture_state: Option<bool>,
    #[serde(default)]
    initial_state: Option<String>,
    #[serde(default)]
    files: Vec<ExecBodyFile>,
    #[serde(default)]
    session_id: Option<String>,
}

async fn exec(
    State(state): State<AppState>,
    auth: Option<Extension<AuthContext>>,
    Json(body): Json<ExecBody>,
) -> Result<Response, ApiError> {
    if body.code.trim().is_empty() {
        return Err(ApiError::Validation("code is required".to_string()));
    }
    if body.language.trim().is_empty() {
        return Err(ApiError::Validation("language is required".to_string()));
    }

    let session_id = body
        .session_id
        .clone()
        .unwrap_or_else(SessionStore::new_session_id);

    // Inline files first, then anything already uploaded to the session
    let mut files = Vec::with_capacity(body.files.len());
    for file in &body.files {
        let bytes = BASE64
            .decode(&file.content)
            .map_err(|_| ApiError::Validation(format!("file '{}' is not valid base64", file.filename)))?;
        files.push(InputFile { filename: file.filename.clone(), bytes });
    }
    for stored in state.sessions.list_files(&session_id).await {
        if !files.iter().any(|f| f.filename == stored.filename) {
            files.push(InputFile { filename: stored.filename.clone(), bytes: stored.bytes });
        }
    }

    // State precedence: explicit blob in the request, then the session's
    // saved state from an earlier capture.
    let initial_state = match &body.initial_state {
        Some(blob) => Some(blob.clone()),
        None => state.sessions.load_state(&session_id).await,
    };

    let request = ExecutionRequest {
        code: body.code,
        language: body.language,
        timeout_s: body.timeout,
        capture_state: body.capture_state.unwrap_or(false),
        initial_state,
    };

    let api_key_hash = auth.as_ref().map(|a| a.api_key_hash.as_str());
    let result = state
        .dispatcher
        .execute(&session_id, request, files, api_key_hash)
        .await;

    if let Some(captured) = &result.state {
        // Best-effort: state persistence failures only cost continuity
        let _ = state.sessions.save_state(&session_id, captured).await;
    }

    let response = json!({
        "execution_id": result.execution_id,
        "session_id": session_id,
        "status": result.status,
        "stdout": result.stdout,
        "stderr": result.stderr,
        "exit_code": result.exit_code,
        "execution_time_ms": result.execution_time_ms,
        "memory_peak_mb": result.memory_peak_mb,
        "outputs": result.files_produced,
        "state": result.state,
        "state_errors": result.state_errors,
        "container_source": result.container_source,
    });
    Ok(Json(response).into_response())
}

/* ============================= FILE API ============================= */

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session_id = SessionStore::new_session_id();
    let mut uploaded = Vec::new();
    let max_bytes = state.settings.max_file_size_mb * 1024 * 1024;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("invalid multipart body: {e}")))?
    {
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::Validation("multipart field missing filename".to_string()))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::Validation(format!("failed to read upload: {e}")))?;
        if bytes.len() as u64 > max_bytes {
            return Err(ApiError::Validation(format!(
                "file '{}' exceeds {} MB limit",
                filename, state.settings.max_file_size_mb
            )));
        }
        let stored = state.sessions.add_file(&session_id, &filename, bytes.to_vec()).await;
        uploaded.push(json!({ "filename": stored.filename, "fileId": stored.file_id }));
    }

    if uploaded.is_empty() {
        return Err(ApiError::Validation("no files in upload".to_string()));
    }

    Ok(Json(json!({ "session_id": session_id, "files": uploaded })))
}

async fn list_files(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Json<serde_json::Value> {
    let files = state.sessions.list_files(&session).await;
    Json(json!({ "session_id": session, "files": files }))
}

async fn download_file(
    State(state): State<AppState>,
    Path((session, file_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let file = state
        .sessions
        .get_file(&session, &file_id)
        .await
        .ok_or(ApiError::NotFound)?;

    let headers = [
        (header::CONTENT_TYPE, file.mime_type.clone()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file.filename),
        ),
    ];
    Ok((headers, file.bytes).into_response())
}

async fn delete_file(
    State(state): State<AppState>,
    Path((session, file_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.sessions.delete_file(&session, &file_id).await {
        Ok(Json(json!({ "deleted": true })))
    } else {
        Err(ApiError::NotFound)
    }
}

/* ============================= STATE API ============================= */

#[derive(Debug, Deserialize)]
struct StateBody {
    state: String,
}

async fn put_state(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(body): Json<StateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .sessions
        .save_state(&session, &body.state)
        .await
        .map_err(ApiError::Validation)?;
    Ok(Json(json!({ "session_id": session, "saved": true })))
}

async fn get_state(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let blob = state
        .sessions
        .load_state(&session)
        .await
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!({ "session_id": session, "state": blob })))
}

/* ============================= ADMIN API ============================= */

fn key_response(record: &crate::keys::ApiKeyRecord) -> serde_json::Value {
    json!({
        "key_hash": record.key_hash,
        "key_prefix": record.key_prefix,
        "name": record.name,
        "enabled": record.enabled,
        "created_at": record.created_at,
        "last_used_at": record.last_used_at,
        "usage_count": record.usage_count,
        "rate_limits": record.rate_limits,
        "metadata": record.metadata,
        "source": record.source,
    })
}

async fn admin_list_keys(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state
        .keys
        .list(true)
        .await
        .map_err(|e| state.internal(e))?;
    Ok(Json(json!(records.iter().map(key_response).collect::<Vec<_>>())))
}

#[derive(Debug, Deserialize)]
struct CreateKeyBody {
    name: String,
    #[serde(default)]
    rate_limits: Option<RateLimits>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

async fn admin_create_key(
    State(state): State<AppState>,
    Json(body): Json<CreateKeyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("name is required".to_string()));
    }
    let (full_key, record) = state
        .keys
        .create(&body.name, body.rate_limits, body.metadata)
        .await
        .map_err(|e| state.internal(e))?;

    // The only moment the full key is ever returned
    Ok(Json(json!({ "api_key": full_key, "record": key_response(&record) })))
}

#[derive(Debug, Deserialize)]
struct UpdateKeyBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    rate_limits: Option<RateLimits>,
}

fn map_key_error(e: KeyManagerError, state: &AppState) -> ApiError {
    match e {
        KeyManagerError::ImmutableKey => ApiError::Forbidden,
        KeyManagerError::Kv(e) => state.internal(e),
    }
}

async fn admin_update_key(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Json(body): Json<UpdateKeyBody>,
) -> Result<Json<bool>, ApiError> {
    let update = KeyUpdate {
        name: body.name,
        enabled: body.enabled,
        rate_limits: body.rate_limits,
    };
    match state
        .keys
        .update(&hash, update)
        .await
        .map_err(|e| map_key_error(e, &state))?
    {
        true => Ok(Json(true)),
        false => Err(ApiError::NotFound),
    }
}

async fn admin_revoke_key(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<bool>, ApiError> {
    match state
        .keys
        .revoke(&hash)
        .await
        .map_err(|e| map_key_error(e, &state))?
    {
        true => Ok(Json(true)),
        false => Err(ApiError::NotFound),
    }
}

async fn admin_key_usage(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .keys
        .get(&hash)
        .await
        .map_err(|e| state.internal(e))?
        .ok_or(ApiError::NotFound)?;
    let windows = state
        .keys
        .rate_limit_status(&hash)
        .await
        .map_err(|e| state.internal(e))?;
    Ok(Json(json!({
        "key_prefix": record.key_prefix,
        "usage_count": record.usage_count,
        "last_used_at": record.last_used_at,
        "windows": windows,
    })))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    #[serde(default = "default_stats_hours")]
    hours: u32,
}

fn default_stats_hours() -> u32 {
    24
}

async fn admin_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !(1..=168).contains(&query.hours) {
        return Err(ApiError::Validation("hours must be between 1 and 168".to_string()));
    }

    let pool_stats = state.pools.stats().await;
    state.metrics.update_pool_gauges(&pool_stats);

    // Durable hour buckets for the requested range
    let mut hourly = serde_json::Map::new();
    let now = Utc::now();
    for offset in 0..query.hours {
        let bucket = (now - chrono::Duration::hours(offset as i64)).format("%Y-%m-%d-%H");
        let key = format!("metrics:detailed:hourly:{bucket}");
        if let Ok(hash) = state.kv.hgetall(&key).await
            && !hash.is_empty()
        {
            hourly.insert(bucket.to_string(), json!(hash));
        }
    }

    Ok(Json(json!({
        "summary": state.metrics.summary(),
        "hours": query.hours,
        "hourly": hourly,
        "pools": pool_stats,
        "active_executions": state.dispatcher.active_snapshot().len(),
    })))
}

/* ============================= HEALTH API ============================= */

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn health_redis(State(state): State<AppState>) -> Response {
    match state.kv.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "redis": "healthy" }))).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "redis": "unhealthy", "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn health_kubernetes(State(state): State<AppState>) -> Response {
    match &state.kube {
        Some(client) => match client.apiserver_version().await {
            Ok(version) => (
                StatusCode::OK,
                Json(json!({
                    "kubernetes": "healthy",
                    "version": format!("{}.{}", version.major, version.minor),
                })),
            )
                .into_response(),
            Err(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "kubernetes": "unhealthy", "error": e.to_string() })),
            )
                .into_response(),
        },
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "kubernetes": "unavailable" })),
        )
            .into_response(),
    }
}

async fn health_detailed(State(state): State<AppState>) -> Response {
    let kv_ok = state.kv.ping().await.is_ok();
    let kube_ok = match &state.kube {
        Some(client) => client.apiserver_version().await.is_ok(),
        None => false,
    };
    let pool_stats = state.pools.stats().await;
    let warm: usize = pool_stats.iter().map(|s| s.available).sum();

    let body = json!({
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "checks": {
            "redis": if kv_ok { "healthy" } else { "unhealthy" },
            "kubernetes": if kube_ok { "healthy" } else { "unhealthy" },
            "warm_pods": warm,
        },
    });

    // The cluster is load-bearing; the KV store degrades open
    if !kube_ok {
        let mut response =
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
        response
            .headers_mut()
            .insert("x-health-status", "unhealthy".parse().expect("static header"));
        return response;
    }
    if !kv_ok {
        let mut response = (StatusCode::OK, Json(body)).into_response();
        response
            .headers_mut()
            .insert("x-health-status", "degraded".parse().expect("static header"));
        return response;
    }
    (StatusCode::OK, Json(body)).into_response()
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    let pool_stats = state.pools.stats().await;
    state.metrics.update_pool_gauges(&pool_stats);

    let encoder = TextEncoder::new();
    let metric_families = metrics::REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body).into_response(),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            )
                .into_response(),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        )
            .into_response(),
    }
}

/* ============================= SERVE ============================= */

/// Bind and serve until the shutdown channel fires.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "http_server_started");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
    })
    .await?;

    Ok(())
}
