use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, broadcast, mpsc};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

/* ============================= HANDLE ============================= */

/// Lifecycle state of one sandbox pod.
///
/// starting → warm → executing → deleting; unhealthy is a sink reached
/// after repeated probe failures and transitions straight to deleting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PodStatus {
    Starting,
    Warm,
    Executing,
    Unhealthy,
    Deleting,
}

/// One sandbox pod. Exclusively owned: either in a pool's available
/// queue, held by a single in-flight request, or with the destroyer.
#[derive(Debug, Clone)]
pub struct PodHandle {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub language: String,
    pub pod_ip: String,
    pub status: PodStatus,
    pub created_at: DateTime<Utc>,
    pub session_id: Option<String>,
    pub health_check_failures: u32,
}

/// Whether a request was served by a pre-warmed pod or a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerSource {
    PoolHit,
    PoolMiss,
}

impl ContainerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerSource::PoolHit => "pool_hit",
            ContainerSource::PoolMiss => "pool_miss",
        }
    }
}

/* ============================= PROVIDER SEAM ============================= */

/// Pod lifecycle operations the pool depends on. The Kubernetes factory
/// implements this; tests substitute an in-memory provider.
#[async_trait]
pub trait PodProvider: Send + Sync {
    /// Create a pod and wait until its sidecar is ready.
    async fn create(&self, language: &str, session_id: Option<&str>)
    -> anyhow::Result<PodHandle>;

    /// Best-effort delete; succeeding on an already-gone pod.
    async fn delete(&self, handle: &PodHandle) -> anyhow::Result<()>;

    /// One health probe against the pod's sidecar.
    async fn probe(&self, handle: &PodHandle) -> bool;
}

/* ============================= EVENTS ============================= */

/// Pool happenings forwarded to the metrics sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Hit { language: String },
    Miss { language: String },
    Exhausted { language: String },
    PodDestroyed { language: String },
}

/* ============================= CONFIG ============================= */

#[derive(Debug, Clone)]
pub struct PoolTuning {
    pub target_size: usize,
    pub parallel_batch: usize,
    pub replenish_interval: Duration,
    pub health_check_interval: Duration,
    pub exhaustion_trigger: bool,
    pub acquire_timeout: Duration,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            target_size: 0,
            parallel_batch: 5,
            replenish_interval: Duration::from_secs(2),
            health_check_interval: Duration::from_secs(30),
            exhaustion_trigger: true,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

const HEALTH_FAILURE_LIMIT: u32 = 3;

/* ============================= STATS ============================= */

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub language: String,
    pub target_size: usize,
    pub available: usize,
    pub total_pods: usize,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub exhaustion_events: u64,
    pub pods_created: u64,
    pub pods_destroyed: u64,
}

/* ============================= POOL ============================= */

struct PoolInner {
    /// Warm pods ready to hand out, FIFO.
    available: VecDeque<PodHandle>,
    /// Authoritative registry of every pod this pool believes exists.
    pods: HashMap<String, PodHandle>,
    /// Creations started but not yet registered, counted against target.
    in_flight_creations: usize,
}

/// Warm-pod pool for one language.
pub struct LanguagePool {
    language: String,
    tuning: PoolTuning,
    provider: Arc<dyn PodProvider>,
    inner: Mutex<PoolInner>,
    /// Wakes the replenish loop early on exhaustion.
    replenish_signal: Notify,
    /// Wakes acquirers when a warm pod lands in the queue.
    warm_signal: Notify,
    running: AtomicBool,
    events: Option<mpsc::UnboundedSender<PoolEvent>>,
    hits: AtomicU64,
    misses: AtomicU64,
    exhaustions: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl LanguagePool {
    pub fn new(
        language: &str,
        tuning: PoolTuning,
        provider: Arc<dyn PodProvider>,
        events: Option<mpsc::UnboundedSender<PoolEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            language: language.to_string(),
            tuning,
            provider,
            inner: Mutex::new(PoolInner {
                available: VecDeque::new(),
                pods: HashMap::new(),
                in_flight_creations: 0,
            }),
            replenish_signal: Notify::new(),
            warm_signal: Notify::new(),
            running: AtomicBool::new(false),
            events,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        })
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn target_size(&self) -> usize {
        self.tuning.target_size
    }

    fn emit(&self, event: PoolEvent) {
        if self.tuning.target_size == 0 {
            return;
        }
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /* ── LIFECYCLE ── */

    /// Start the replenish and health-probe loops. Loops end when the
    /// shutdown channel fires or `stop` is called.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.tuning.target_size == 0 {
            // On-demand only: nothing to maintain
            return;
        }

        info!(
            language = %self.language,
            target_size = self.tuning.target_size,
            "pool_started"
        );

        let pool = self.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move { pool.replenish_loop(rx).await });

        let pool = self.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move { pool.health_loop(rx).await });
    }

    /// Stop loops, drain the queue, and destroy every known pod.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.replenish_signal.notify_waiters();

        let doomed: Vec<PodHandle> = {
            let mut inner = self.inner.lock().await;
            inner.available.clear();
            inner.pods.drain().map(|(_, h)| h).collect()
        };

        info!(language = %self.language, count = doomed.len(), "pool_stopping");
        for handle in doomed {
            self.destroy_handle(handle).await;
        }
    }

    /* ── ACQUISITION ── */

    /// Hand out a pod: warm pod if one is queued, otherwise wait briefly
    /// for the replenisher, otherwise create on demand.
    ///
    /// Returns `None` only when on-demand creation also fails.
    pub async fn acquire(
        &self,
        session_id: Option<&str>,
    ) -> Option<(PodHandle, ContainerSource)> {
        let deadline = Instant::now() + self.tuning.acquire_timeout;

        if let Some(handle) = self.try_pop(session_id).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.emit(PoolEvent::Hit { language: self.language.clone() });
            debug!(language = %self.language, pod = %handle.name, "pool_hit");
            return Some((handle, ContainerSource::PoolHit));
        }

        if self.tuning.target_size > 0 && self.running.load(Ordering::SeqCst) {
            self.exhaustions.fetch_add(1, Ordering::Relaxed);
            self.emit(PoolEvent::Exhausted { language: self.language.clone() });
            self.replenish_signal.notify_one();

            // Wait for the replenisher to land a warm pod, racing other
            // acquirers; the queue pop stays the arbiter.
            while Instant::now() < deadline {
                let notified = self.warm_signal.notified();
                if timeout_at(deadline, notified).await.is_err() {
                    break;
                }
                if let Some(handle) = self.try_pop(session_id).await {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    self.emit(PoolEvent::Hit { language: self.language.clone() });
                    return Some((handle, ContainerSource::PoolHit));
                }
            }
        }

        self.create_on_demand(session_id).await
    }

    async fn try_pop(&self, session_id: Option<&str>) -> Option<PodHandle> {
        let mut inner = self.inner.lock().await;
        let mut handle = inner.available.pop_front()?;
        handle.status = PodStatus::Executing;
        handle.session_id = session_id.map(str::to_string);
        inner.pods.insert(handle.uid.clone(), handle.clone());
        Some(handle)
    }

    async fn create_on_demand(
        &self,
        session_id: Option<&str>,
    ) -> Option<(PodHandle, ContainerSource)> {
        match self.provider.create(&self.language, session_id).await {
            Ok(mut handle) => {
                handle.status = PodStatus::Executing;
                handle.session_id = session_id.map(str::to_string);
                self.created.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.emit(PoolEvent::Miss { language: self.language.clone() });
                let mut inner = self.inner.lock().await;
                inner.pods.insert(handle.uid.clone(), handle.clone());
                Some((handle, ContainerSource::PoolMiss))
            }
            Err(e) => {
                warn!(language = %self.language, error = %e, "on_demand_create_failed");
                None
            }
        }
    }

    /* ── RELEASE ── */

    /// Return a pod after use. `destroy` is the normal path: the pod is
    /// removed from the registry and deleted, never reused. `destroy =
    /// false` re-queues a warm pod (health-probe pass and administrative
    /// workflows only).
    pub async fn release(&self, handle: PodHandle, destroy: bool) {
        if destroy {
            let known = {
                let mut inner = self.inner.lock().await;
                inner.pods.remove(&handle.uid).is_some()
            };
            // Destroying an unknown pod is a no-op
            if known {
                self.destroy_handle(handle).await;
            }
        } else {
            let mut handle = handle;
            handle.status = PodStatus::Warm;
            handle.session_id = None;
            handle.health_check_failures = 0;
            let mut inner = self.inner.lock().await;
            inner.pods.insert(handle.uid.clone(), handle.clone());
            inner.available.push_back(handle);
            drop(inner);
            self.warm_signal.notify_one();
        }
    }

    async fn destroy_handle(&self, mut handle: PodHandle) {
        handle.status = PodStatus::Deleting;
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        self.emit(PoolEvent::PodDestroyed { language: self.language.clone() });
        if let Err(e) = self.provider.delete(&handle).await {
            warn!(pod = %handle.name, error = %e, "pod_delete_failed");
        }
    }

    /* ── REPLENISH LOOP ── */

    async fn replenish_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            self.replenish_once().await;

            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(language = %self.language, "replenish_loop_stopped");
                    return;
                }
                _ = sleep(self.tuning.replenish_interval) => {}
                _ = self.replenish_signal.notified(), if self.tuning.exhaustion_trigger => {
                    debug!(language = %self.language, "exhaustion_triggered_replenish");
                }
            }
        }
    }

    /// Top the pool up to target size, creating in parallel batches.
    async fn replenish_once(&self) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let batch = {
                let mut inner = self.inner.lock().await;
                let present = inner.pods.len() + inner.in_flight_creations;
                let need = self.tuning.target_size.saturating_sub(present);
                if need == 0 {
                    return;
                }
                let batch = need.min(self.tuning.parallel_batch);
                inner.in_flight_creations += batch;
                batch
            };

            let creations = (0..batch).map(|_| self.provider.create(&self.language, None));
            let results = join_all(creations).await;

            // If the pool stopped while we were creating, these pods must
            // die instead of being registered past the drain.
            if !self.running.load(Ordering::SeqCst) {
                let mut inner = self.inner.lock().await;
                inner.in_flight_creations -= batch;
                drop(inner);
                for result in results.into_iter().flatten() {
                    self.created.fetch_add(1, Ordering::Relaxed);
                    self.destroy_handle(result).await;
                }
                return;
            }

            let mut inner = self.inner.lock().await;
            inner.in_flight_creations -= batch;
            let mut added = 0;
            for result in results {
                match result {
                    Ok(mut handle) => {
                        handle.status = PodStatus::Warm;
                        self.created.fetch_add(1, Ordering::Relaxed);
                        inner.pods.insert(handle.uid.clone(), handle.clone());
                        inner.available.push_back(handle);
                        added += 1;
                    }
                    Err(e) => {
                        warn!(language = %self.language, error = %e, "warm_pod_create_failed");
                    }
                }
            }
            drop(inner);

            for _ in 0..added {
                self.warm_signal.notify_one();
            }
            if added > 0 {
                info!(language = %self.language, added, "pool_replenished");
            } else {
                // Every creation in the batch failed; let the next tick retry
                return;
            }
        }
    }

    /* ── HEALTH LOOP ── */

    async fn health_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(language = %self.language, "health_loop_stopped");
                    return;
                }
                _ = sleep(self.tuning.health_check_interval) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            self.health_pass().await;
        }
    }

    /// Probe every pod currently in the queue. Three consecutive failures
    /// retire a pod.
    async fn health_pass(&self) {
        let snapshot: Vec<PodHandle> = {
            let inner = self.inner.lock().await;
            inner.available.iter().cloned().collect()
        };

        for handle in snapshot {
            let healthy = self.provider.probe(&handle).await;
            let doomed = {
                let mut inner = self.inner.lock().await;
                // The pod may have been acquired while we probed
                let Some(queued) =
                    inner.available.iter_mut().find(|h| h.uid == handle.uid)
                else {
                    continue;
                };
                if healthy {
                    queued.health_check_failures = 0;
                    if let Some(pod) = inner.pods.get_mut(&handle.uid) {
                        pod.health_check_failures = 0;
                    }
                    None
                } else {
                    queued.health_check_failures += 1;
                    let failures = queued.health_check_failures;
                    if let Some(pod) = inner.pods.get_mut(&handle.uid) {
                        pod.health_check_failures = failures;
                    }
                    if failures >= HEALTH_FAILURE_LIMIT {
                        inner.available.retain(|h| h.uid != handle.uid);
                        inner.pods.remove(&handle.uid).map(|mut h| {
                            h.status = PodStatus::Unhealthy;
                            h
                        })
                    } else {
                        None
                    }
                }
            };

            if let Some(unhealthy) = doomed {
                warn!(
                    language = %self.language,
                    pod = %unhealthy.name,
                    "unhealthy_pod_retired"
                );
                self.destroy_handle(unhealthy).await;
                self.replenish_signal.notify_one();
            }
        }
    }

    /* ── STATS ── */

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            language: self.language.clone(),
            target_size: self.tuning.target_size,
            available: inner.available.len(),
            total_pods: inner.pods.len(),
            pool_hits: self.hits.load(Ordering::Relaxed),
            pool_misses: self.misses.load(Ordering::Relaxed),
            exhaustion_events: self.exhaustions.load(Ordering::Relaxed),
            pods_created: self.created.load(Ordering::Relaxed),
            pods_destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }

    /// Queue depth without the full stats snapshot.
    pub async fn available_count(&self) -> usize {
        self.inner.lock().await.available.len()
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Provider that manufactures handles instantly and counts lifecycle
    /// calls. `healthy` flips probe results; `fail_creates` makes every
    /// create error.
    struct MockProvider {
        counter: AtomicUsize,
        deletes: AtomicUsize,
        healthy: AtomicBool,
        fail_creates: AtomicBool,
    }

    impl MockProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                counter: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                healthy: AtomicBool::new(true),
                fail_creates: AtomicBool::new(false),
            })
        }

        fn created(&self) -> usize {
            self.counter.load(Ordering::SeqCst)
        }

        fn deleted(&self) -> usize {
            self.deletes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PodProvider for MockProvider {
        async fn create(
            &self,
            language: &str,
            session_id: Option<&str>,
        ) -> anyhow::Result<PodHandle> {
            if self.fail_creates.load(Ordering::SeqCst) {
                anyhow::bail!("cluster says no");
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(PodHandle {
                uid: format!("uid-{n}"),
                name: format!("codepod-{language}-{n}"),
                namespace: "default".to_string(),
                language: language.to_string(),
                pod_ip: "10.0.0.1".to_string(),
                status: PodStatus::Starting,
                created_at: Utc::now(),
                session_id: session_id.map(str::to_string),
                health_check_failures: 0,
            })
        }

        async fn delete(&self, _handle: &PodHandle) -> anyhow::Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn probe(&self, _handle: &PodHandle) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn tuning(target: usize) -> PoolTuning {
        PoolTuning {
            target_size: target,
            parallel_batch: 5,
            replenish_interval: Duration::from_millis(20),
            health_check_interval: Duration::from_millis(20),
            exhaustion_trigger: true,
            acquire_timeout: Duration::from_millis(200),
        }
    }

    async fn wait_for_available(pool: &LanguagePool, want: usize) {
        for _ in 0..100 {
            if pool.available_count().await >= want {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {want} available pods");
    }

    // ── warmup and acquire ──

    #[tokio::test]
    async fn test_warmup_fills_to_target() {
        let provider = MockProvider::new();
        let pool = LanguagePool::new("py", tuning(3), provider.clone(), None);
        let (shutdown, _) = broadcast::channel(1);
        pool.start(&shutdown);

        wait_for_available(&pool, 3).await;
        let stats = pool.stats().await;
        assert_eq!(stats.available, 3);
        assert_eq!(stats.total_pods, 3);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_acquire_from_warm_pool_is_hit() {
        let provider = MockProvider::new();
        let pool = LanguagePool::new("py", tuning(2), provider.clone(), None);
        let (shutdown, _) = broadcast::channel(1);
        pool.start(&shutdown);
        wait_for_available(&pool, 2).await;

        let (handle, source) = pool.acquire(Some("sess-1")).await.unwrap();
        assert_eq!(source, ContainerSource::PoolHit);
        assert_eq!(handle.status, PodStatus::Executing);
        assert_eq!(handle.session_id.as_deref(), Some("sess-1"));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_on_demand_when_target_zero() {
        let provider = MockProvider::new();
        let pool = LanguagePool::new("go", tuning(0), provider.clone(), None);

        let (handle, source) = pool.acquire(None).await.unwrap();
        assert_eq!(source, ContainerSource::PoolMiss);
        assert_eq!(handle.language, "go");
        assert_eq!(provider.created(), 1);
    }

    #[tokio::test]
    async fn test_acquire_none_when_create_fails() {
        let provider = MockProvider::new();
        provider.fail_creates.store(true, Ordering::SeqCst);
        let pool = LanguagePool::new("go", tuning(0), provider.clone(), None);
        assert!(pool.acquire(None).await.is_none());
    }

    // ── destroy-on-release ──

    #[tokio::test]
    async fn test_release_destroy_removes_and_deletes() {
        let provider = MockProvider::new();
        let pool = LanguagePool::new("py", tuning(1), provider.clone(), None);
        let (shutdown, _) = broadcast::channel(1);
        pool.start(&shutdown);
        wait_for_available(&pool, 1).await;

        let (handle, _) = pool.acquire(None).await.unwrap();
        pool.release(handle, true).await;

        assert_eq!(provider.deleted(), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_destroy_unknown_pod_is_noop() {
        let provider = MockProvider::new();
        let pool = LanguagePool::new("py", tuning(0), provider.clone(), None);

        let (handle, _) = pool.acquire(None).await.unwrap();
        pool.release(handle.clone(), true).await;
        assert_eq!(provider.deleted(), 1);

        // Second release of the same handle must not double-destroy
        pool.release(handle, true).await;
        assert_eq!(provider.deleted(), 1);
    }

    #[tokio::test]
    async fn test_release_keep_requeues_warm() {
        let provider = MockProvider::new();
        let pool = LanguagePool::new("py", tuning(1), provider.clone(), None);
        let (shutdown, _) = broadcast::channel(1);
        pool.start(&shutdown);
        wait_for_available(&pool, 1).await;

        let (handle, _) = pool.acquire(Some("sess")).await.unwrap();
        pool.release(handle, false).await;

        let stats = pool.stats().await;
        assert_eq!(stats.available, 1);
        let (back, _) = pool.acquire(None).await.unwrap();
        assert_eq!(back.session_id, None);
        pool.stop().await;
    }

    // ── exhaustion and replenishment ──

    #[tokio::test]
    async fn test_exhaustion_falls_through_to_on_demand() {
        let provider = MockProvider::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = LanguagePool::new("py", tuning(2), provider.clone(), Some(tx));
        let (shutdown, _) = broadcast::channel(1);
        pool.start(&shutdown);
        wait_for_available(&pool, 2).await;

        let a = pool.acquire(None).await.unwrap();
        let b = pool.acquire(None).await.unwrap();
        assert_eq!(a.1, ContainerSource::PoolHit);
        assert_eq!(b.1, ContainerSource::PoolHit);

        // Third acquire: the replenisher may win the race and hand us a
        // warm pod; either way the caller gets a pod.
        let c = pool.acquire(None).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(
            events.contains(&PoolEvent::Exhausted { language: "py".to_string() })
                || c.1 == ContainerSource::PoolHit
        );

        for (handle, _) in [a, b, c] {
            pool.release(handle, true).await;
        }
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_pool_replenishes_after_drain() {
        let provider = MockProvider::new();
        let pool = LanguagePool::new("py", tuning(2), provider.clone(), None);
        let (shutdown, _) = broadcast::channel(1);
        pool.start(&shutdown);
        wait_for_available(&pool, 2).await;

        let a = pool.acquire(None).await.unwrap();
        let b = pool.acquire(None).await.unwrap();
        pool.release(a.0, true).await;
        pool.release(b.0, true).await;

        // Replenisher restores the target within a few intervals
        wait_for_available(&pool, 2).await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_available_never_exceeds_target() {
        let provider = MockProvider::new();
        let pool = LanguagePool::new("py", tuning(3), provider.clone(), None);
        let (shutdown, _) = broadcast::channel(1);
        pool.start(&shutdown);
        wait_for_available(&pool, 3).await;

        // Let several replenish ticks pass
        sleep(Duration::from_millis(100)).await;
        let stats = pool.stats().await;
        assert!(stats.available <= 3, "available {} > target", stats.available);
        assert!(stats.total_pods <= 3, "pods {} > target", stats.total_pods);
        pool.stop().await;
    }

    // ── health probing ──

    #[tokio::test]
    async fn test_unhealthy_pods_retired_after_three_failures() {
        let provider = MockProvider::new();
        let pool = LanguagePool::new("py", tuning(1), provider.clone(), None);
        let (shutdown, _) = broadcast::channel(1);
        pool.start(&shutdown);
        wait_for_available(&pool, 1).await;

        provider.healthy.store(false, Ordering::SeqCst);

        // Three probe passes retire the pod; the replenisher then creates
        // a replacement which also eventually fails, so just wait for the
        // first deletion.
        for _ in 0..100 {
            if provider.deleted() >= 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(provider.deleted() >= 1, "unhealthy pod was never retired");
        pool.stop().await;
    }

    // ── stop ──

    #[tokio::test]
    async fn test_stop_destroys_everything_and_is_idempotent() {
        let provider = MockProvider::new();
        let pool = LanguagePool::new("py", tuning(2), provider.clone(), None);
        let (shutdown, _) = broadcast::channel(1);
        pool.start(&shutdown);
        wait_for_available(&pool, 2).await;

        pool.stop().await;
        let deleted = provider.deleted();
        assert_eq!(deleted, 2);

        pool.stop().await;
        assert_eq!(provider.deleted(), deleted, "stop must be idempotent");

        let stats = pool.stats().await;
        assert_eq!(stats.available, 0);
        assert_eq!(stats.total_pods, 0);
    }

    // ── no leaks ──

    #[tokio::test]
    async fn test_every_created_pod_is_destroyed() {
        let provider = MockProvider::new();
        let pool = LanguagePool::new("py", tuning(2), provider.clone(), None);
        let (shutdown, _) = broadcast::channel(1);
        pool.start(&shutdown);
        wait_for_available(&pool, 2).await;

        for _ in 0..5 {
            let (handle, _) = pool.acquire(None).await.unwrap();
            pool.release(handle, true).await;
        }

        pool.stop().await;
        // Give async deletions a moment
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            provider.created(),
            provider.deleted(),
            "created {} != destroyed {}",
            provider.created(),
            provider.deleted()
        );
    }
}
