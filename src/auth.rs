use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, Method};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::ApiError;
use crate::key_manager::ApiKeyManager;
use crate::keys::constant_time_eq;
use crate::kv::KvStore;

/* ============================= STATE ============================= */

#[derive(Clone)]
pub struct AuthState {
    pub keys: Arc<ApiKeyManager>,
    pub kv: Arc<dyn KvStore>,
    pub settings: Arc<Settings>,
}

/// Identity attached to the request once the gate admits it.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub authenticated: bool,
    pub api_key: String,
    pub api_key_hash: String,
    pub is_env_key: bool,
}

/* ============================= THROTTLE ============================= */

const AUTH_FAILURE_LIMIT: u64 = 10;
const AUTH_FAILURE_TTL: u64 = 3600;

fn failure_key(ip: &str) -> String {
    format!("auth_failures:{ip}")
}

/* ============================= EXTRACTION ============================= */

/// Paths the API-key gate never sees. Admin routes carry their own
/// master-key check.
pub fn is_exempt_path(path: &str) -> bool {
    matches!(path, "/health" | "/ready" | "/docs" | "/redoc" | "/openapi.json")
        || path.starts_with("/health/")
        || path.starts_with("/admin")
}

/// Key extraction precedence: `x-api-key`, then `Authorization: Bearer`,
/// then `Authorization: ApiKey`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok())
        && !key.is_empty()
    {
        return Some(key.to_string());
    }
    let auth = headers.get("authorization")?.to_str().ok()?;
    if let Some(key) = auth.strip_prefix("Bearer ") {
        return Some(key.to_string());
    }
    if let Some(key) = auth.strip_prefix("ApiKey ") {
        return Some(key.to_string());
    }
    None
}

/// Client IP: first `X-Forwarded-For` entry, then `X-Real-IP`, then the
/// socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
        && !first.trim().is_empty()
    {
        return first.trim().to_string();
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok())
        && !real_ip.is_empty()
    {
        return real_ip.to_string();
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/* ============================= API-KEY GATE ============================= */

/// Middleware ahead of all non-exempt routes: extract the key, throttle
/// abusive IPs, validate, check rate limits, then attach identity and
/// record usage.
pub async fn require_api_key(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if request.method() == Method::OPTIONS || is_exempt_path(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let ip = client_ip(request.headers(), peer);

    if throttled(&state, &ip).await {
        return Err(ApiError::IpThrottled { retry_after_s: AUTH_FAILURE_TTL });
    }

    let Some(api_key) = extract_api_key(request.headers()) else {
        return Err(ApiError::AuthMissing);
    };

    let validation = state.keys.validate(&api_key).await;
    if !validation.is_valid() {
        record_failure(&state, &ip).await;
        return Err(ApiError::AuthInvalid);
    }
    let key_hash = validation
        .key_hash()
        .map(str::to_string)
        .unwrap_or_default();
    let is_env_key = validation.is_env_key();
    if !is_env_key && state.settings.rate_limit_enabled {
        match state.keys.check_rate_limits(&key_hash).await {
            Ok((true, _)) => {}
            Ok((false, exceeded)) => {
                if let Some(status) = exceeded {
                    return Err(ApiError::RateLimited { status });
                }
                return Err(ApiError::AuthInvalid);
            }
            Err(e) => {
                // Limiter degrades open on KV trouble
                warn!(error = %e, "rate_limit_check_failed");
            }
        }
    }

    // Usage accounting is fire-and-forget; a KV hiccup must not reject
    // an already-admitted request.
    if !is_env_key {
        let keys = state.keys.clone();
        let hash = key_hash.clone();
        tokio::spawn(async move {
            if let Err(e) = keys.increment_usage(&hash).await {
                warn!(error = %e, "usage_increment_failed");
            }
        });
    }

    debug!(is_env_key, "request_authenticated");
    request.extensions_mut().insert(AuthContext {
        authenticated: true,
        api_key,
        api_key_hash: key_hash,
        is_env_key,
    });

    Ok(next.run(request).await)
}

async fn throttled(state: &AuthState, ip: &str) -> bool {
    match state.kv.get(&failure_key(ip)).await {
        Ok(Some(count)) => count.parse::<u64>().unwrap_or(0) >= AUTH_FAILURE_LIMIT,
        Ok(None) => false,
        Err(e) => {
            warn!(error = %e, "auth_throttle_read_failed");
            false
        }
    }
}

async fn record_failure(state: &AuthState, ip: &str) {
    if let Err(e) = state.kv.incr_expire(&failure_key(ip), AUTH_FAILURE_TTL).await {
        warn!(error = %e, "auth_failure_record_failed");
    }
}

/* ============================= MASTER-KEY GATE ============================= */

/// Admin surface gate: a single constant-time compare against the
/// configured master key. Never touches the per-key store.
pub async fn require_master_key(
    State(state): State<AuthState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(master) = &state.settings.master_api_key else {
        // No master key configured means no admin surface
        return Err(ApiError::Forbidden);
    };
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !constant_time_eq(provided, master) {
        return Err(ApiError::Forbidden);
    }
    Ok(next.run(request).await)
}

/* ============================= TESTS ============================= */
