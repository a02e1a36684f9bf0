use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::languages;

/* ============================= SECCOMP ============================= */

/// Seccomp profile applied to every execution pod.
///
/// Only the two cluster-provided profiles are accepted; `Localhost`
/// profiles would require node-level file distribution and are rejected
/// at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeccompProfile {
    #[default]
    RuntimeDefault,
    Unconfined,
}

impl SeccompProfile {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "RuntimeDefault" => Ok(Self::RuntimeDefault),
            "Unconfined" => Ok(Self::Unconfined),
            other => bail!(
                "Invalid K8S_SECCOMP_PROFILE_TYPE '{}': must be RuntimeDefault or Unconfined",
                other
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuntimeDefault => "RuntimeDefault",
            Self::Unconfined => "Unconfined",
        }
    }
}

/* ============================= SETTINGS ============================= */

/// Process configuration, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    // HTTP
    pub bind_addr: String,
    pub debug: bool,

    // Trust plane
    pub api_key: Option<String>,
    pub additional_api_keys: Vec<String>,
    pub master_api_key: Option<String>,
    pub rate_limit_enabled: bool,

    // KV store
    pub redis_url: String,

    // Pool
    pub pod_pool_enabled: bool,
    pub pod_pool_warmup_on_startup: bool,
    pub pool_sizes: HashMap<String, usize>,
    pub pool_parallel_batch: usize,
    pub pool_replenish_interval: Duration,
    pub pool_exhaustion_trigger: bool,
    pub pool_acquire_timeout: Duration,
    pub pool_health_check_interval: Duration,

    // Pod factory
    pub namespace: String,
    pub image_registry: String,
    pub image_tag: String,
    pub image_pull_policy: String,
    pub sidecar_image: String,
    pub sidecar_port: u16,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub cpu_request: String,
    pub memory_request: String,
    pub sidecar_cpu_limit: String,
    pub sidecar_memory_limit: String,
    pub seccomp_profile: SeccompProfile,
    pub network_isolated: bool,
    pub pod_ready_timeout: Duration,

    // Per-request caps
    pub max_execution_time_s: u64,
    pub max_memory_mb: u64,
    pub max_file_size_mb: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            debug: false,
            api_key: None,
            additional_api_keys: Vec::new(),
            master_api_key: None,
            rate_limit_enabled: true,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            pod_pool_enabled: true,
            pod_pool_warmup_on_startup: true,
            pool_sizes: HashMap::new(),
            pool_parallel_batch: 5,
            pool_replenish_interval: Duration::from_secs(2),
            pool_exhaustion_trigger: true,
            pool_acquire_timeout: Duration::from_secs(5),
            pool_health_check_interval: Duration::from_secs(30),
            namespace: "default".to_string(),
            image_registry: "codepod".to_string(),
            image_tag: "latest".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            sidecar_image: "codepod-sidecar:latest".to_string(),
            sidecar_port: 8080,
            cpu_limit: "1".to_string(),
            memory_limit: "512Mi".to_string(),
            cpu_request: "100m".to_string(),
            memory_request: "128Mi".to_string(),
            sidecar_cpu_limit: "500m".to_string(),
            sidecar_memory_limit: "512Mi".to_string(),
            seccomp_profile: SeccompProfile::RuntimeDefault,
            network_isolated: true,
            pod_ready_timeout: Duration::from_secs(60),
            max_execution_time_s: 300,
            max_memory_mb: 512,
            max_file_size_mb: 100,
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary lookup function.
    ///
    /// Tests provide a map-backed lookup instead of mutating the process
    /// environment.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Settings::default();

        if let Some(v) = get("BIND_ADDR") {
            s.bind_addr = v;
        }
        s.debug = get_bool(&get, "DEBUG", s.debug);

        s.api_key = get("API_KEY").filter(|v| !v.is_empty());
        s.additional_api_keys = get("API_KEYS")
            .map(|v| {
                v.split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        s.master_api_key = get("MASTER_API_KEY").filter(|v| !v.is_empty());
        s.rate_limit_enabled = get_bool(&get, "RATE_LIMIT_ENABLED", s.rate_limit_enabled);

        if let Some(v) = get("REDIS_URL") {
            s.redis_url = v;
        }

        s.pod_pool_enabled = get_bool(&get, "POD_POOL_ENABLED", s.pod_pool_enabled);
        s.pod_pool_warmup_on_startup =
            get_bool(&get, "POD_POOL_WARMUP_ON_STARTUP", s.pod_pool_warmup_on_startup);
        for code in languages::supported_codes() {
            let var = format!("POD_POOL_{}", code.to_uppercase());
            if let Some(n) = get(&var) {
                s.pool_sizes.insert(code.to_string(), parse_num(&var, &n)?);
            }
        }
        if let Some(n) = get("POD_POOL_PARALLEL_BATCH") {
            s.pool_parallel_batch = parse_num("POD_POOL_PARALLEL_BATCH", &n)?;
        }
        if let Some(n) = get("POD_POOL_REPLENISH_INTERVAL") {
            s.pool_replenish_interval =
                Duration::from_secs(parse_num("POD_POOL_REPLENISH_INTERVAL", &n)? as u64);
        }
        s.pool_exhaustion_trigger =
            get_bool(&get, "POD_POOL_EXHAUSTION_TRIGGER", s.pool_exhaustion_trigger);
        if let Some(n) = get("POD_POOL_ACQUIRE_TIMEOUT") {
            s.pool_acquire_timeout =
                Duration::from_secs(parse_num("POD_POOL_ACQUIRE_TIMEOUT", &n)? as u64);
        }
        if let Some(n) = get("POD_POOL_HEALTH_CHECK_INTERVAL") {
            s.pool_health_check_interval =
                Duration::from_secs(parse_num("POD_POOL_HEALTH_CHECK_INTERVAL", &n)? as u64);
        }

        if let Some(v) = get("K8S_NAMESPACE") {
            s.namespace = v;
        }
        if let Some(v) = get("K8S_IMAGE_REGISTRY") {
            s.image_registry = v;
        }
        if let Some(v) = get("K8S_IMAGE_TAG") {
            s.image_tag = v;
        }
        if let Some(v) = get("K8S_IMAGE_PULL_POLICY") {
            s.image_pull_policy = v;
        }
        if let Some(v) = get("K8S_SIDECAR_IMAGE") {
            s.sidecar_image = v;
        }
        if let Some(n) = get("K8S_SIDECAR_PORT") {
            s.sidecar_port = n
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid K8S_SIDECAR_PORT '{}'", n))?;
        }
        if let Some(v) = get("K8S_CPU_LIMIT") {
            s.cpu_limit = v;
        }
        if let Some(v) = get("K8S_MEMORY_LIMIT") {
            s.memory_limit = v;
        }
        if let Some(v) = get("K8S_CPU_REQUEST") {
            s.cpu_request = v;
        }
        if let Some(v) = get("K8S_MEMORY_REQUEST") {
            s.memory_request = v;
        }
        if let Some(v) = get("K8S_SECCOMP_PROFILE_TYPE") {
            s.seccomp_profile = SeccompProfile::parse(&v)?;
        }
        s.network_isolated = get_bool(&get, "K8S_NETWORK_ISOLATED", s.network_isolated);
        if let Some(n) = get("K8S_POD_READY_TIMEOUT") {
            s.pod_ready_timeout =
                Duration::from_secs(parse_num("K8S_POD_READY_TIMEOUT", &n)? as u64);
        }

        if let Some(n) = get("MAX_EXECUTION_TIME") {
            s.max_execution_time_s = parse_num("MAX_EXECUTION_TIME", &n)? as u64;
        }
        if let Some(n) = get("MAX_MEMORY_MB") {
            s.max_memory_mb = parse_num("MAX_MEMORY_MB", &n)? as u64;
        }
        if let Some(n) = get("MAX_FILE_SIZE_MB") {
            s.max_file_size_mb = parse_num("MAX_FILE_SIZE_MB", &n)? as u64;
        }

        s.validate()?;
        Ok(s)
    }

    /// Startup validation. Collects every problem before failing so a
    /// misconfigured deployment reports all issues at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.max_execution_time_s == 0 {
            problems.push("MAX_EXECUTION_TIME must be positive".to_string());
        }
        if self.max_memory_mb == 0 {
            problems.push("MAX_MEMORY_MB must be positive".to_string());
        }
        if self.max_file_size_mb == 0 {
            problems.push("MAX_FILE_SIZE_MB must be positive".to_string());
        }
        if self.pool_parallel_batch == 0 {
            problems.push("POD_POOL_PARALLEL_BATCH must be positive".to_string());
        }
        if !matches!(self.image_pull_policy.as_str(), "Always" | "IfNotPresent" | "Never") {
            problems.push(format!(
                "K8S_IMAGE_PULL_POLICY '{}' is not a valid pull policy",
                self.image_pull_policy
            ));
        }
        for code in self.pool_sizes.keys() {
            if !languages::is_supported(code) {
                problems.push(format!("Pool size configured for unknown language '{code}'"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            bail!("Invalid configuration:\n  - {}", problems.join("\n  - "))
        }
    }

    /// Target warm-pool size for a language. Unconfigured languages are
    /// on-demand only.
    pub fn pool_size_for(&self, language: &str) -> usize {
        self.pool_sizes.get(language).copied().unwrap_or(0)
    }

    /// Languages with a non-zero warm pool.
    pub fn pooled_languages(&self) -> Vec<String> {
        let mut langs: Vec<String> = self
            .pool_sizes
            .iter()
            .filter(|(_, size)| **size > 0)
            .map(|(code, _)| code.clone())
            .collect();
        langs.sort();
        langs
    }
}

/* ============================= PARSE HELPERS ============================= */

fn get_bool<F>(get: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn parse_num(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid {} '{}': expected a non-negative integer", key, value))
}

/* ============================= TESTS ============================= */
