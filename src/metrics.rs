use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::{Histogram, IntCounterVec, IntGaugeVec, Registry};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::dispatcher::ExecutionStatus;
use crate::kv::{KvOp, KvStore};
use crate::pool::{ContainerSource, PoolEvent, PoolStats};

/* ============================= PROMETHEUS ============================= */

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static EXECUTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("executions_total", "Total code executions by language and status"),
        &["language", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static POOL_EVENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("pool_events_total", "Pool events by language and kind"),
        &["language", "event"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static EXECUTION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "execution_duration_seconds",
            "Wall-clock duration of code executions in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

static WARM_PODS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("warm_pods", "Warm pods currently queued per language"),
        &["language"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

/* ============================= KV SCHEMA ============================= */

const HOURLY_PREFIX: &str = "metrics:detailed:hourly:";
const DAILY_PREFIX: &str = "metrics:detailed:daily:";
const API_KEY_PREFIX: &str = "metrics:api_key:";
const POOL_STATS_KEY: &str = "metrics:pool:stats";
const CURRENT_KEY: &str = "metrics:current";
const SNAPSHOT_HOURLY_PREFIX: &str = "metrics:hourly:";

const HOURLY_TTL: u64 = 7 * 24 * 3600;
const DAILY_TTL: u64 = 30 * 24 * 3600;
const API_KEY_TTL: u64 = 7200;
const CURRENT_TTL: u64 = 24 * 3600;

fn hour_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d-%H").to_string()
}

fn day_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/* ============================= METRIC RECORDS ============================= */

/// One finished execution as recorded by the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionMetric {
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    pub api_key_hash: Option<String>,
    pub language: String,
    pub status: ExecutionStatus,
    pub execution_time_ms: u64,
    pub memory_peak_mb: Option<f64>,
    pub exit_code: i32,
    pub files_uploaded: usize,
    pub files_generated: usize,
    pub container_source: ContainerSource,
}

/// Rolling per-language aggregate over the live window.
#[derive(Debug, Default)]
struct LanguageAggregate {
    count: u64,
    success: u64,
    failure: u64,
    timeout: u64,
    total_time_ms: u64,
    /// Rolling sample window for percentile sketches.
    samples: VecDeque<u64>,
}

const RING_CAPACITY: usize = 10_000;
const SAMPLE_WINDOW: usize = 500;

/* ============================= SUMMARY SHAPES ============================= */

#[derive(Debug, Clone, Serialize)]
pub struct LanguageSummary {
    pub language: String,
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    pub avg_execution_time_ms: f64,
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub exhaustion_events: u64,
    pub pods_destroyed: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub timestamp: DateTime<Utc>,
    pub total_executions: u64,
    pub languages: Vec<LanguageSummary>,
    pub pool: PoolSummary,
}

/* ============================= SINK ============================= */

/// Two-tier metrics sink: a live in-memory ring plus durable KV hour and
/// day aggregates built from atomic increments only.
pub struct MetricsSink {
    kv: Arc<dyn KvStore>,
    ring: Mutex<VecDeque<ExecutionMetric>>,
    languages: Mutex<HashMap<String, LanguageAggregate>>,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    pool_exhaustions: AtomicU64,
    pods_destroyed: AtomicU64,
}

impl MetricsSink {
    pub fn new(kv: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new(Self {
            kv,
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            languages: Mutex::new(HashMap::new()),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            pool_exhaustions: AtomicU64::new(0),
            pods_destroyed: AtomicU64::new(0),
        })
    }

    /* ── EXECUTIONS ── */

    pub async fn record_execution(&self, metric: ExecutionMetric) {
        EXECUTIONS_TOTAL
            .with_label_values(&[metric.language.as_str(), metric.status.as_str()])
            .inc();
        EXECUTION_DURATION.observe(metric.execution_time_ms as f64 / 1000.0);

        {
            let mut ring = self.ring.lock().expect("metrics ring lock poisoned");
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(metric.clone());
        }

        {
            let mut languages = self.languages.lock().expect("metrics lang lock poisoned");
            let agg = languages.entry(metric.language.clone()).or_default();
            agg.count += 1;
            match metric.status {
                ExecutionStatus::Completed => agg.success += 1,
                ExecutionStatus::Timeout => agg.timeout += 1,
                _ => agg.failure += 1,
            }
            agg.total_time_ms += metric.execution_time_ms;
            if agg.samples.len() == SAMPLE_WINDOW {
                agg.samples.pop_front();
            }
            agg.samples.push_back(metric.execution_time_ms);
        }

        self.update_durable(&metric).await;
    }

    /// Hour, day, and per-key hashes, all `HINCRBY`-style so no
    /// read-modify-write exists anywhere in the durable tier.
    async fn update_durable(&self, metric: &ExecutionMetric) {
        let now = metric.timestamp;
        let mut ops = Vec::new();

        for (key, ttl) in [
            (format!("{HOURLY_PREFIX}{}", hour_bucket(now)), HOURLY_TTL),
            (format!("{DAILY_PREFIX}{}", day_bucket(now)), DAILY_TTL),
        ] {
            push_aggregate_ops(&mut ops, &key, ttl, metric);
        }

        if let Some(short) = &metric.api_key_hash {
            let key = format!("{API_KEY_PREFIX}{}:hour:{}", short, hour_bucket(now));
            push_aggregate_ops(&mut ops, &key, API_KEY_TTL, metric);
        }

        if let Err(e) = self.kv.exec(ops).await {
            // Live tier keeps serving; durable writes are best-effort
            warn!(error = %e, "durable_metrics_write_failed");
        }
    }

    /* ── POOL EVENTS ── */

    pub async fn record_pool_event(&self, event: &PoolEvent) {
        let (language, field, kind) = match event {
            PoolEvent::Hit { language } => {
                self.pool_hits.fetch_add(1, Ordering::Relaxed);
                (language, "pool_hits", "hit")
            }
            PoolEvent::Miss { language } => {
                self.pool_misses.fetch_add(1, Ordering::Relaxed);
                (language, "pool_misses", "miss")
            }
            PoolEvent::Exhausted { language } => {
                self.pool_exhaustions.fetch_add(1, Ordering::Relaxed);
                (language, "exhaustion_events", "exhausted")
            }
            PoolEvent::PodDestroyed { language } => {
                self.pods_destroyed.fetch_add(1, Ordering::Relaxed);
                (language, "pods_destroyed", "destroyed")
            }
        };

        POOL_EVENTS_TOTAL
            .with_label_values(&[language.as_str(), kind])
            .inc();

        let ops = vec![
            KvOp::HIncr {
                key: POOL_STATS_KEY.to_string(),
                field: field.to_string(),
                by: 1,
            },
            KvOp::HIncr {
                key: POOL_STATS_KEY.to_string(),
                field: format!("{language}_{field}"),
                by: 1,
            },
        ];
        if let Err(e) = self.kv.exec(ops).await {
            warn!(error = %e, "pool_stats_write_failed");
        }
    }

    /// Mirror queue depths into the gauge family.
    pub fn update_pool_gauges(&self, stats: &[PoolStats]) {
        for s in stats {
            WARM_PODS
                .with_label_values(&[s.language.as_str()])
                .set(s.available as i64);
        }
    }

    /* ── SUMMARIES ── */

    pub fn summary(&self) -> MetricsSummary {
        let languages = self.languages.lock().expect("metrics lang lock poisoned");
        let mut summaries: Vec<LanguageSummary> = languages
            .iter()
            .map(|(language, agg)| {
                let mut sorted: Vec<u64> = agg.samples.iter().copied().collect();
                sorted.sort_unstable();
                LanguageSummary {
                    language: language.clone(),
                    execution_count: agg.count,
                    success_count: agg.success,
                    failure_count: agg.failure,
                    timeout_count: agg.timeout,
                    avg_execution_time_ms: if agg.count == 0 {
                        0.0
                    } else {
                        agg.total_time_ms as f64 / agg.count as f64
                    },
                    p50_ms: percentile(&sorted, 50),
                    p90_ms: percentile(&sorted, 90),
                    p95_ms: percentile(&sorted, 95),
                    p99_ms: percentile(&sorted, 99),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.language.cmp(&b.language));

        let hits = self.pool_hits.load(Ordering::Relaxed);
        let misses = self.pool_misses.load(Ordering::Relaxed);
        let total = hits + misses;

        MetricsSummary {
            timestamp: Utc::now(),
            total_executions: summaries.iter().map(|l| l.execution_count).sum(),
            languages: summaries,
            pool: PoolSummary {
                pool_hits: hits,
                pool_misses: misses,
                exhaustion_events: self.pool_exhaustions.load(Ordering::Relaxed),
                pods_destroyed: self.pods_destroyed.load(Ordering::Relaxed),
                hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            },
        }
    }

    pub fn recent_executions(&self, limit: usize) -> Vec<ExecutionMetric> {
        let ring = self.ring.lock().expect("metrics ring lock poisoned");
        ring.iter().rev().take(limit).cloned().collect()
    }

    /* ── BACKGROUND TASKS ── */

    /// Drain pool events from the pools into the sink.
    pub async fn run_event_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<PoolEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("metrics_event_pump_stopped");
                    return;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.record_pool_event(&event).await,
                        None => return,
                    }
                }
            }
        }
    }

    /// Periodically persist the live snapshot. Both writes tolerate
    /// transient KV failures.
    pub async fn run_flush_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.flush_snapshot().await;
                    debug!("metrics_flush_loop_stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    self.flush_snapshot().await;
                }
            }
        }
    }

    pub async fn flush_snapshot(&self) {
        let snapshot = match serde_json::to_string(&self.summary()) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "metrics_snapshot_encode_failed");
                return;
            }
        };
        let hourly_key = format!("{SNAPSHOT_HOURLY_PREFIX}{}", hour_bucket(Utc::now()));

        if let Err(e) = self.kv.set_ex(CURRENT_KEY, &snapshot, CURRENT_TTL).await {
            warn!(error = %e, "metrics_current_write_failed");
        }
        if let Err(e) = self.kv.set_ex(&hourly_key, &snapshot, HOURLY_TTL).await {
            warn!(error = %e, "metrics_hourly_write_failed");
        }
    }
}

fn push_aggregate_ops(ops: &mut Vec<KvOp>, key: &str, ttl: u64, metric: &ExecutionMetric) {
    let hincr = |ops: &mut Vec<KvOp>, field: &str, by: i64| {
        ops.push(KvOp::HIncr { key: key.to_string(), field: field.to_string(), by });
    };

    hincr(ops, "execution_count", 1);
    match metric.status {
        ExecutionStatus::Completed => hincr(ops, "success_count", 1),
        ExecutionStatus::Timeout => hincr(ops, "timeout_count", 1),
        _ => hincr(ops, "failure_count", 1),
    }
    hincr(ops, "total_execution_time_ms", metric.execution_time_ms as i64);
    if let Some(mb) = metric.memory_peak_mb {
        ops.push(KvOp::HIncrFloat {
            key: key.to_string(),
            field: "total_memory_mb".to_string(),
            by: mb,
        });
    }
    match metric.container_source {
        ContainerSource::PoolHit => hincr(ops, "pool_hits", 1),
        ContainerSource::PoolMiss => hincr(ops, "pool_misses", 1),
    }
    hincr(ops, &format!("lang_{}_count", metric.language), 1);
    hincr(
        ops,
        &format!("lang_{}_time_ms", metric.language),
        metric.execution_time_ms as i64,
    );
    ops.push(KvOp::Expire { key: key.to_string(), ttl });
}

/// Nearest-rank percentile over an already-sorted window.
fn percentile(sorted: &[u64], pct: u64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct as f64 / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn metric(language: &str, status: ExecutionStatus, time_ms: u64) -> ExecutionMetric {
        ExecutionMetric {
            execution_id: "exec-1".to_string(),
            timestamp: Utc::now(),
            api_key_hash: Some("abcdef0123456789".to_string()),
            language: language.to_string(),
            status,
            execution_time_ms: time_ms,
            memory_peak_mb: Some(10.0),
            exit_code: 0,
            files_uploaded: 0,
            files_generated: 0,
            container_source: ContainerSource::PoolHit,
        }
    }

    // ── percentile ──

    #[test]
    fn test_percentile_empty_is_zero() {
        assert_eq!(percentile(&[], 50), 0);
    }

    #[test]
    fn test_percentile_single_sample() {
        assert_eq!(percentile(&[42], 50), 42);
        assert_eq!(percentile(&[42], 99), 42);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 50), 50);
        assert_eq!(percentile(&sorted, 90), 90);
        assert_eq!(percentile(&sorted, 99), 99);
    }

    // ── live tier ──

    #[tokio::test]
    async fn test_record_updates_language_aggregate() {
        let sink = MetricsSink::new(Arc::new(MemoryStore::new()));
        sink.record_execution(metric("py", ExecutionStatus::Completed, 100)).await;
        sink.record_execution(metric("py", ExecutionStatus::Failed, 200)).await;
        sink.record_execution(metric("py", ExecutionStatus::Timeout, 300)).await;

        let summary = sink.summary();
        assert_eq!(summary.total_executions, 3);
        let py = summary.languages.iter().find(|l| l.language == "py").unwrap();
        assert_eq!(py.success_count, 1);
        assert_eq!(py.failure_count, 1);
        assert_eq!(py.timeout_count, 1);
        assert!((py.avg_execution_time_ms - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_recent_executions_newest_first() {
        let sink = MetricsSink::new(Arc::new(MemoryStore::new()));
        for i in 0..5 {
            let mut m = metric("py", ExecutionStatus::Completed, i);
            m.execution_id = format!("exec-{i}");
            sink.record_execution(m).await;
        }
        let recent = sink.recent_executions(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].execution_id, "exec-4");
        assert_eq!(recent[1].execution_id, "exec-3");
    }

    // ── pool events ──

    #[tokio::test]
    async fn test_pool_hit_rate() {
        let sink = MetricsSink::new(Arc::new(MemoryStore::new()));
        for _ in 0..3 {
            sink.record_pool_event(&PoolEvent::Hit { language: "py".to_string() }).await;
        }
        sink.record_pool_event(&PoolEvent::Miss { language: "py".to_string() }).await;

        let summary = sink.summary();
        assert_eq!(summary.pool.pool_hits, 3);
        assert_eq!(summary.pool.pool_misses, 1);
        assert!((summary.pool.hit_rate - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_pool_events_persisted_to_kv() {
        let kv = Arc::new(MemoryStore::new());
        let sink = MetricsSink::new(kv.clone());
        sink.record_pool_event(&PoolEvent::Hit { language: "py".to_string() }).await;
        sink.record_pool_event(&PoolEvent::Hit { language: "go".to_string() }).await;

        let stats = kv.hgetall(POOL_STATS_KEY).await.unwrap();
        assert_eq!(stats.get("pool_hits").map(String::as_str), Some("2"));
        assert_eq!(stats.get("py_pool_hits").map(String::as_str), Some("1"));
        assert_eq!(stats.get("go_pool_hits").map(String::as_str), Some("1"));
    }

    // ── durable tier ──

    #[tokio::test]
    async fn test_hourly_aggregate_written() {
        let kv = Arc::new(MemoryStore::new());
        let sink = MetricsSink::new(kv.clone());
        let m = metric("py", ExecutionStatus::Completed, 150);
        let key = format!("{HOURLY_PREFIX}{}", hour_bucket(m.timestamp));
        sink.record_execution(m).await;

        let hash = kv.hgetall(&key).await.unwrap();
        assert_eq!(hash.get("execution_count").map(String::as_str), Some("1"));
        assert_eq!(hash.get("success_count").map(String::as_str), Some("1"));
        assert_eq!(hash.get("total_execution_time_ms").map(String::as_str), Some("150"));
        assert_eq!(hash.get("pool_hits").map(String::as_str), Some("1"));
        assert_eq!(hash.get("lang_py_count").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_per_key_aggregate_written() {
        let kv = Arc::new(MemoryStore::new());
        let sink = MetricsSink::new(kv.clone());
        let m = metric("py", ExecutionStatus::Completed, 150);
        let key = format!(
            "{API_KEY_PREFIX}abcdef0123456789:hour:{}",
            hour_bucket(m.timestamp)
        );
        sink.record_execution(m).await;

        let hash = kv.hgetall(&key).await.unwrap();
        assert_eq!(hash.get("execution_count").map(String::as_str), Some("1"));
    }

    // ── snapshot flush ──

    #[tokio::test]
    async fn test_flush_writes_current_snapshot() {
        let kv = Arc::new(MemoryStore::new());
        let sink = MetricsSink::new(kv.clone());
        sink.record_execution(metric("py", ExecutionStatus::Completed, 100)).await;
        sink.flush_snapshot().await;

        let current = kv.get(CURRENT_KEY).await.unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&current).unwrap();
        assert_eq!(parsed["total_executions"], 1);
    }
}
