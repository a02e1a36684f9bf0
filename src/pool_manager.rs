use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::config::Settings;
use crate::languages;
use crate::pool::{
    ContainerSource, LanguagePool, PodHandle, PodProvider, PoolEvent, PoolStats, PoolTuning,
};
use crate::sidecar::{SidecarClient, SidecarExecuteRequest, SidecarOutcome};

/* ============================= MANAGER ============================= */

/// Owns one pool per supported language plus the sidecar client used to
/// talk to whichever pod a request holds.
pub struct PoolManager {
    pools: HashMap<String, Arc<LanguagePool>>,
    sidecar: SidecarClient,
    shutdown: broadcast::Sender<()>,
    warmup_on_startup: bool,
    pool_enabled: bool,
}

impl PoolManager {
    /// Builds pools for every supported language. When pooling is
    /// disabled globally, every pool is sized zero and emits no events,
    /// so each acquire falls straight through to pod creation.
    pub fn new(
        settings: &Settings,
        provider: Arc<dyn PodProvider>,
        events: Option<mpsc::UnboundedSender<PoolEvent>>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let mut pools = HashMap::new();

        for code in languages::supported_codes() {
            let target_size = if settings.pod_pool_enabled {
                settings.pool_size_for(code)
            } else {
                0
            };
            let tuning = PoolTuning {
                target_size,
                parallel_batch: settings.pool_parallel_batch,
                replenish_interval: settings.pool_replenish_interval,
                health_check_interval: settings.pool_health_check_interval,
                exhaustion_trigger: settings.pool_exhaustion_trigger,
                acquire_timeout: settings.pool_acquire_timeout,
            };
            let pool_events = if settings.pod_pool_enabled { events.clone() } else { None };
            pools.insert(
                code.to_string(),
                LanguagePool::new(code, tuning, provider.clone(), pool_events),
            );
        }

        Self {
            pools,
            sidecar: SidecarClient::new(settings.sidecar_port),
            shutdown,
            warmup_on_startup: settings.pod_pool_warmup_on_startup,
            pool_enabled: settings.pod_pool_enabled,
        }
    }

    /// Start warmup for every pooled language concurrently.
    pub fn start(&self) {
        if !self.pool_enabled || !self.warmup_on_startup {
            info!("pod_pool_warmup_skipped");
            return;
        }
        let warming: Vec<&str> = self
            .pools
            .values()
            .filter(|p| p.target_size() > 0)
            .map(|p| p.language())
            .collect();
        info!(languages = ?warming, "pool_warmup_starting");
        for pool in self.pools.values() {
            pool.start(&self.shutdown);
        }
    }

    /// Stop all pools: cancel loops, then drain and destroy, each pool
    /// bounded so shutdown cannot hang on a wedged delete.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        let stops = self.pools.values().map(|pool| {
            let pool = pool.clone();
            async move {
                if tokio::time::timeout(Duration::from_secs(10), pool.stop())
                    .await
                    .is_err()
                {
                    warn!(language = %pool.language(), "pool_stop_timed_out");
                }
            }
        });
        join_all(stops).await;
        info!("pools_stopped");
    }

    /* ── DELEGATION ── */

    /// Acquire a pod for a language. `None` for unsupported languages or
    /// when no pod could be produced.
    pub async fn acquire(
        &self,
        language: &str,
        session_id: Option<&str>,
    ) -> Option<(PodHandle, ContainerSource)> {
        self.pools.get(language)?.acquire(session_id).await
    }

    pub async fn release(&self, handle: PodHandle, destroy: bool) {
        match self.pools.get(&handle.language) {
            Some(pool) => pool.release(handle, destroy).await,
            None => warn!(language = %handle.language, "release_for_unknown_language"),
        }
    }

    /// Run an execute call against the pod a request holds.
    pub async fn execute(
        &self,
        handle: &PodHandle,
        request: &SidecarExecuteRequest,
    ) -> SidecarOutcome {
        self.sidecar.execute(&handle.pod_ip, request).await
    }

    pub async fn upload_file(
        &self,
        handle: &PodHandle,
        filename: &str,
        bytes: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.sidecar.upload_file(&handle.pod_ip, filename, bytes).await
    }

    pub fn uses_pool(&self, language: &str) -> bool {
        self.pool_enabled
            && self
                .pools
                .get(language)
                .is_some_and(|p| p.target_size() > 0)
    }

    pub fn supports(&self, language: &str) -> bool {
        self.pools.contains_key(language)
    }

    /// Per-language stats for health and metrics surfaces.
    pub async fn stats(&self) -> Vec<PoolStats> {
        let mut stats = Vec::with_capacity(self.pools.len());
        for pool in self.pools.values() {
            stats.push(pool.stats().await);
        }
        stats.sort_by(|a, b| a.language.cmp(&b.language));
        stats
    }
}

/* ============================= TESTS ============================= */
