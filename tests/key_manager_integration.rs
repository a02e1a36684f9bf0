mod common;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use codepod::key_manager::{ApiKeyManager, KeyManagerError, KeyUpdate};
use codepod::keys::{ApiKeyRecord, KeySource, RateLimits, RatePeriod, hash_key};
use codepod::kv::MemoryStore;

// ══════════════════════════════════════════════════════════════════
// API-key manager integration tests (no cluster, no Redis server -
// the in-memory KV backend honours the same TTL and pipeline
// semantics the manager relies on).
// ══════════════════════════════════════════════════════════════════

fn manager() -> ApiKeyManager {
    ApiKeyManager::new(
        Arc::new(MemoryStore::new()),
        vec!["sk-env-primary".to_string(), "sk-env-extra".to_string()],
    )
}

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

// ── full lifecycle round-trip ──

#[tokio::test]
async fn test_create_get_list_revoke_roundtrip() {
    let mgr = manager();

    let limits = RateLimits { per_minute: Some(10), daily: Some(500), ..Default::default() };
    let mut metadata = HashMap::new();
    metadata.insert("team".to_string(), "data".to_string());

    let (full_key, created) = mgr
        .create("pipeline", Some(limits.clone()), Some(metadata))
        .await
        .unwrap();

    // get returns the stored record unchanged
    let fetched = mgr.get(&created.key_hash).await.unwrap().unwrap();
    assert_eq!(fetched.name, "pipeline");
    assert_eq!(fetched.rate_limits, limits);
    assert_eq!(fetched.metadata.get("team").map(String::as_str), Some("data"));
    assert_eq!(fetched.source, KeySource::Managed);

    // list sees it
    let listed = mgr.list(false).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key_hash, created.key_hash);

    // revoke removes record, index entry, and cache
    assert!(mgr.revoke(&created.key_hash).await.unwrap());
    assert!(mgr.get(&created.key_hash).await.unwrap().is_none());
    assert!(mgr.list(false).await.unwrap().is_empty());
    assert!(!mgr.validate(&full_key).await.is_valid());
}

#[tokio::test]
async fn test_record_survives_kv_encoding() {
    // Storing through the manager and reading back is the identity on
    // every field the encoding carries
    let mgr = manager();
    let limits = RateLimits {
        per_second: Some(1),
        per_minute: Some(2),
        hourly: Some(3),
        daily: Some(4),
        monthly: Some(5),
    };
    let (_, created) = mgr.create("full", Some(limits.clone()), None).await.unwrap();
    let fetched = mgr.get(&created.key_hash).await.unwrap().unwrap();
    assert_eq!(fetched.rate_limits, limits);
    assert_eq!(fetched.key_prefix, created.key_prefix);
    assert_eq!(fetched.usage_count, 0);
    assert!(fetched.enabled);
}

// ── validation cache behaviour ──

#[tokio::test]
async fn test_disable_takes_effect_before_cache_ttl() {
    let mgr = manager();
    let (full_key, record) = mgr.create("ci", None, None).await.unwrap();

    // Warm the validation cache, then disable
    assert!(mgr.validate(&full_key).await.is_valid());
    mgr.update(
        &record.key_hash,
        KeyUpdate { enabled: Some(false), ..Default::default() },
    )
    .await
    .unwrap();

    // The very next validate must reject without waiting out the TTL
    assert!(!mgr.validate(&full_key).await.is_valid());

    // Re-enable restores access
    mgr.update(
        &record.key_hash,
        KeyUpdate { enabled: Some(true), ..Default::default() },
    )
    .await
    .unwrap();
    assert!(mgr.validate(&full_key).await.is_valid());
}

#[tokio::test]
async fn test_env_keys_validate_and_refuse_mutation() {
    let mgr = manager();

    for env_key in ["sk-env-primary", "sk-env-extra"] {
        let result = mgr.validate(env_key).await;
        assert!(result.is_valid(), "{env_key}");
        assert!(result.is_env_key(), "{env_key}");
    }

    // Materialised records reject update and revoke
    let hash = hash_key("sk-env-primary");
    assert!(matches!(
        mgr.update(&hash, KeyUpdate { enabled: Some(false), ..Default::default() }).await,
        Err(KeyManagerError::ImmutableKey)
    ));
    assert!(matches!(mgr.revoke(&hash).await, Err(KeyManagerError::ImmutableKey)));

    // And they never show up in the managed listing
    assert!(mgr.list(false).await.unwrap().is_empty());
    assert_eq!(mgr.list(true).await.unwrap().len(), 2);
}

// ── usage counters ──

#[tokio::test]
async fn test_usage_buckets_are_monotonic() {
    let mgr = manager();
    let (_, record) = mgr.create("ci", None, None).await.unwrap();
    let now = at(2024, 7, 1, 9, 30, 0);

    let mut previous = 0;
    for i in 1..=4 {
        mgr.increment_usage_at(&record.key_hash, now).await.unwrap();
        let usage = mgr.get_usage_at(&record.key_hash, now).await.unwrap();
        let hourly = usage["hourly"];
        assert!(hourly > previous, "iteration {i}: {hourly} not > {previous}");
        previous = hourly;
    }

    let fetched = mgr.get(&record.key_hash).await.unwrap().unwrap();
    assert_eq!(fetched.usage_count, 4);
}

#[tokio::test]
async fn test_concurrent_checks_can_overshoot_by_concurrency() {
    // The documented race: checks do not consume, so C concurrent
    // requests all pass and then collectively exceed the limit by ≤ C.
    let mgr = Arc::new(manager());
    let limits = RateLimits { hourly: Some(5), ..Default::default() };
    let (_, record) = mgr.create("burst", Some(limits), None).await.unwrap();
    let now = at(2024, 7, 1, 9, 0, 0);

    let concurrency = 8;
    let mut admitted = 0;
    let mut handles = Vec::new();
    for _ in 0..concurrency {
        let mgr = mgr.clone();
        let hash = record.key_hash.clone();
        handles.push(tokio::spawn(async move {
            let (allowed, _) = mgr.check_rate_limits_at(&hash, now).await.unwrap();
            if allowed {
                mgr.increment_usage_at(&hash, now).await.unwrap();
            }
            allowed
        }));
    }
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }

    // Bounded by limit + concurrency, and at least the limit
    assert!(admitted >= 5, "admitted {admitted} < limit");
    assert!(admitted <= 5 + concurrency, "admitted {admitted} exceeds limit + C");
}

// ── reset times ──

#[tokio::test]
async fn test_reset_times_monotonic_within_each_period() {
    let start = at(2024, 11, 30, 22, 59, 58);
    for period in RatePeriod::ALL {
        let mut now = start;
        let mut previous = period.reset_time(now);
        for _ in 0..5 {
            now += chrono::Duration::seconds(3700);
            let next = period.reset_time(now);
            assert!(
                next >= previous,
                "{} reset went backwards: {next} < {previous}",
                period.as_str()
            );
            previous = next;
        }
    }
}

#[tokio::test]
async fn test_december_resets_into_next_year() {
    let december = at(2024, 12, 15, 12, 0, 0);
    let reset = RatePeriod::Monthly.reset_time(december);
    assert_eq!(reset, at(2025, 1, 1, 0, 0, 0));

    // Other months stay within the year
    let june = at(2024, 6, 15, 12, 0, 0);
    assert_eq!(RatePeriod::Monthly.reset_time(june), at(2024, 7, 1, 0, 0, 0));
}

// ── prefix lookup ──

#[tokio::test]
async fn test_find_by_prefix_across_many_keys() {
    let mgr = manager();
    let mut wanted = None;
    for i in 0..5 {
        let (full_key, record) = mgr.create(&format!("key-{i}"), None, None).await.unwrap();
        if i == 3 {
            wanted = Some((codepod::keys::key_prefix(&full_key), record.key_hash));
        }
    }
    let (prefix, expected_hash) = wanted.unwrap();
    assert_eq!(mgr.find_by_prefix(&prefix).await.unwrap(), Some(expected_hash));
}

// ── hash encoding sanity ──

#[tokio::test]
async fn test_stored_hash_matches_recomputed_hash() {
    let mgr = manager();
    let (full_key, record) = mgr.create("ci", None, None).await.unwrap();
    assert_eq!(record.key_hash, hash_key(&full_key));
    assert_eq!(record.key_hash.len(), 64);

    let roundtrip: HashMap<String, String> = record.to_kv_hash().into_iter().collect();
    let decoded = ApiKeyRecord::from_kv_hash(&roundtrip).unwrap();
    assert_eq!(decoded.key_hash, record.key_hash);
}
