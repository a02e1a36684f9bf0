use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kube::Client;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use codepod::config::Settings;
use codepod::dispatcher::Dispatcher;
use codepod::factory::PodFactory;
use codepod::key_manager::ApiKeyManager;
use codepod::kv::{KvStore, MemoryStore, RedisStore};
use codepod::metrics::MetricsSink;
use codepod::pool_manager::PoolManager;
use codepod::server::{self, AppState};
use codepod::sessions::SessionStore;

const METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const POOL_STOP_CEILING: Duration = Duration::from_secs(30);
const FLUSH_CEILING: Duration = Duration::from_secs(5);

pub async fn run(addr_override: Option<String>) -> Result<()> {
    let mut settings = Settings::from_env()?;
    if let Some(addr) = addr_override {
        settings.bind_addr = addr;
    }
    init_tracing(settings.debug);

    println!("Starting codepod server...\n");
    info!("server_starting");

    println!("  Configuration ............... OK");
    let settings = Arc::new(settings);

    // KV store: degrade to an in-process store rather than refuse to
    // boot; rate limits and caches become per-process until Redis is
    // back and the service restarts against it.
    print!("  Redis ....................... ");
    let kv: Arc<dyn KvStore> = match RedisStore::connect(&settings.redis_url).await {
        Ok(store) => {
            println!("OK ({})", settings.redis_url);
            Arc::new(store)
        }
        Err(e) => {
            println!("DEGRADED (in-memory fallback)");
            warn!(error = %e, "redis_unavailable_using_memory_store");
            Arc::new(MemoryStore::new())
        }
    };

    print!("  Cluster connection .......... ");
    let kube_client = Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster")?;
    match kube_client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let mut env_keys = Vec::new();
    if let Some(primary) = &settings.api_key {
        env_keys.push(primary.clone());
    }
    env_keys.extend(settings.additional_api_keys.iter().cloned());

    let keys = Arc::new(ApiKeyManager::new(kv.clone(), env_keys));
    let metrics = MetricsSink::new(kv.clone());
    let sessions = SessionStore::new(kv.clone());
    let factory = Arc::new(PodFactory::new(kube_client.clone(), settings.clone()));

    let (pool_events_tx, pool_events_rx) = mpsc::unbounded_channel();
    let pools = Arc::new(PoolManager::new(&settings, factory, Some(pool_events_tx)));
    let dispatcher = Dispatcher::new(pools.clone(), metrics.clone(), settings.clone());

    print!("  Pod pools ................... ");
    let pooled = settings.pooled_languages();
    if settings.pod_pool_enabled && !pooled.is_empty() {
        println!("warming {:?}", pooled);
    } else {
        println!("on-demand only");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    pools.start();
    tokio::spawn(metrics.clone().run_event_pump(pool_events_rx, shutdown_tx.subscribe()));
    tokio::spawn(
        metrics
            .clone()
            .run_flush_loop(METRICS_FLUSH_INTERVAL, shutdown_tx.subscribe()),
    );
    tokio::spawn(
        dispatcher
            .clone()
            .run_sweep_loop(SWEEP_INTERVAL, shutdown_tx.subscribe()),
    );

    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .context("Invalid bind address")?;

    println!("  HTTP server ................. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /exec ................ Execute code");
    println!("    POST /upload .............. Upload session files");
    println!("    GET  /health .............. Liveness probe");
    println!("    GET  /health/detailed ..... Dependency health");
    println!("    GET  /metrics ............. Prometheus metrics");
    println!("    *    /admin/... ........... Key management (master key)");
    println!();
    println!("codepod running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let state = AppState {
        settings: settings.clone(),
        kv: kv.clone(),
        keys,
        pools: pools.clone(),
        dispatcher,
        metrics: metrics.clone(),
        sessions,
        kube: Some(kube_client),
    };

    let server_shutdown = shutdown_tx.subscribe();
    let server_handle =
        tokio::spawn(async move { server::serve(state, addr, server_shutdown).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping codepod...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());

    // Ordered shutdown, each step with its own ceiling so a wedged
    // dependency can never hold the process hostage.
    print!("  HTTP server ................. ");
    match tokio::time::timeout(Duration::from_secs(10), server_handle).await {
        Ok(_) => println!("stopped"),
        Err(_) => {
            println!("timed out, skipping");
            warn!("http_shutdown_timed_out");
        }
    }

    print!("  Pod pools ................... ");
    match tokio::time::timeout(POOL_STOP_CEILING, pools.stop()).await {
        Ok(()) => println!("drained"),
        Err(_) => {
            println!("timed out, skipping");
            warn!("pool_shutdown_timed_out");
        }
    }

    print!("  Metrics flush ............... ");
    match tokio::time::timeout(FLUSH_CEILING, metrics.flush_snapshot()).await {
        Ok(()) => println!("flushed"),
        Err(_) => {
            println!("timed out, skipping");
            warn!("metrics_flush_timed_out");
        }
    }

    info!("server_stopped");
    println!("codepod stopped.");
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v == "json");
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
