use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::keys::{
    ApiKeyRecord, KeySource, RateLimitStatus, RateLimits, RatePeriod, ValidationResult,
    constant_time_eq, hash_key, key_prefix, short_hash,
};
use crate::kv::{KvError, KvOp, KvStore};

/* ============================= KEY PATTERNS ============================= */

const RECORD_PREFIX: &str = "api_keys:records:";
const VALID_CACHE_PREFIX: &str = "api_keys:valid:";
const USAGE_PREFIX: &str = "api_keys:usage:";
const INDEX_KEY: &str = "api_keys:index";
const ENV_INDEX_KEY: &str = "api_keys:env_index";

const VALIDATION_CACHE_TTL: u64 = 300;

fn record_key(key_hash: &str) -> String {
    format!("{RECORD_PREFIX}{key_hash}")
}

fn valid_cache_key(key_hash: &str) -> String {
    format!("{VALID_CACHE_PREFIX}{}", short_hash(key_hash))
}

fn usage_key(key_hash: &str, bucket: &str) -> String {
    format!("{USAGE_PREFIX}{}:{}", short_hash(key_hash), bucket)
}

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum KeyManagerError {
    /// Environment keys are configuration, not data: no mutation, no revocation.
    #[error("environment keys are immutable")]
    ImmutableKey,
    #[error(transparent)]
    Kv(#[from] KvError),
}

pub type KeyResult<T> = Result<T, KeyManagerError>;

/* ============================= UPDATE SHAPE ============================= */

#[derive(Debug, Clone, Default)]
pub struct KeyUpdate {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub rate_limits: Option<RateLimits>,
}

/* ============================= MANAGER ============================= */

/// CRUD, validation, and rate accounting for API keys over the KV store.
pub struct ApiKeyManager {
    kv: Arc<dyn KvStore>,
    env_keys: Vec<String>,
}

impl ApiKeyManager {
    /// `env_keys` is the primary `API_KEY` (if set) plus `API_KEYS`.
    pub fn new(kv: Arc<dyn KvStore>, env_keys: Vec<String>) -> Self {
        Self { kv, env_keys }
    }

    /* ── CRUD ── */

    /// Create a managed key. The returned full key is shown exactly once;
    /// only its hash is stored.
    pub async fn create(
        &self,
        name: &str,
        rate_limits: Option<RateLimits>,
        metadata: Option<HashMap<String, String>>,
    ) -> KeyResult<(String, ApiKeyRecord)> {
        let full_key = crate::keys::generate_full_key();
        let mut record = ApiKeyRecord::new_managed(&full_key, name);
        if let Some(limits) = rate_limits {
            record.rate_limits = limits;
        }
        if let Some(metadata) = metadata {
            record.metadata = metadata;
        }

        self.kv
            .exec(vec![
                KvOp::HSetAll {
                    key: record_key(&record.key_hash),
                    fields: record.to_kv_hash(),
                },
                KvOp::SAdd { key: INDEX_KEY.to_string(), member: record.key_hash.clone() },
            ])
            .await?;

        info!(name = %name, key_prefix = %record.key_prefix, "api_key_created");
        Ok((full_key, record))
    }

    pub async fn get(&self, key_hash: &str) -> KeyResult<Option<ApiKeyRecord>> {
        let data = self.kv.hgetall(&record_key(key_hash)).await?;
        Ok(ApiKeyRecord::from_kv_hash(&data))
    }

    /// All records, newest first. Environment records are included only
    /// when asked for; they exist in the index once materialised.
    pub async fn list(&self, include_environment: bool) -> KeyResult<Vec<ApiKeyRecord>> {
        let mut hashes = self.kv.smembers(INDEX_KEY).await?;
        if include_environment {
            hashes.extend(self.kv.smembers(ENV_INDEX_KEY).await?);
        }

        let mut records = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(record) = self.get(&hash).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Update a managed record. Returns `Ok(false)` if the key does not
    /// exist; refuses environment records.
    pub async fn update(&self, key_hash: &str, update: KeyUpdate) -> KeyResult<bool> {
        let Some(mut record) = self.get(key_hash).await? else {
            return Ok(false);
        };
        if record.source == KeySource::Environment {
            return Err(KeyManagerError::ImmutableKey);
        }

        if let Some(name) = update.name {
            record.name = name;
        }
        if let Some(enabled) = update.enabled {
            record.enabled = enabled;
        }
        if let Some(limits) = update.rate_limits {
            record.rate_limits = limits;
        }

        // Drop the validation cache so a disable takes effect immediately
        self.kv
            .exec(vec![
                KvOp::HSetAll { key: record_key(key_hash), fields: record.to_kv_hash() },
                KvOp::Del { key: valid_cache_key(key_hash) },
            ])
            .await?;

        info!(key_prefix = %record.key_prefix, "api_key_updated");
        Ok(true)
    }

    /// Delete a managed record, its index entry, and its validation-cache
    /// entry in one batch. Returns `Ok(false)` if the key does not exist.
    pub async fn revoke(&self, key_hash: &str) -> KeyResult<bool> {
        let Some(record) = self.get(key_hash).await? else {
            return Ok(false);
        };
        if record.source == KeySource::Environment {
            return Err(KeyManagerError::ImmutableKey);
        }

        self.kv
            .exec(vec![
                KvOp::Del { key: record_key(key_hash) },
                KvOp::SRem { key: INDEX_KEY.to_string(), member: key_hash.to_string() },
                KvOp::Del { key: valid_cache_key(key_hash) },
            ])
            .await?;

        info!(key_hash = %short_hash(key_hash), "api_key_revoked");
        Ok(true)
    }

    /// Linear scan of the managed index for a display prefix. Admin-CLI
    /// convenience; not on any hot path.
    pub async fn find_by_prefix(&self, prefix: &str) -> KeyResult<Option<String>> {
        for hash in self.kv.smembers(INDEX_KEY).await? {
            if let Some(record) = self.get(&hash).await?
                && record.key_prefix == prefix
            {
                return Ok(Some(hash));
            }
        }
        Ok(None)
    }

    /* ── VALIDATION ── */

    /// Validate a full key: validation cache, then managed records, then
    /// a constant-time comparison against the configured environment keys.
    ///
    /// KV outages degrade to the environment-key check so the service
    /// stays reachable for operators.
    pub async fn validate(&self, api_key: &str) -> ValidationResult {
        if api_key.is_empty() {
            return ValidationResult::Invalid { reason: "API key is required" };
        }

        let key_hash = hash_key(api_key);

        match self.kv.get(&valid_cache_key(&key_hash)).await {
            Ok(Some(cached)) if cached == "1" => {
                // Refresh the record so disabled-while-cached keys are caught
                if let Ok(Some(record)) = self.get(&key_hash).await
                    && record.enabled
                {
                    return ValidationResult::ValidManaged { key_hash, record };
                }
            }
            Ok(Some(cached)) if cached == "env" => {
                return ValidationResult::ValidEnvironment { key_hash };
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "validation_cache_read_failed");
                return self.validate_env_only(api_key, key_hash);
            }
        }

        match self.get(&key_hash).await {
            Ok(Some(record)) => {
                if record.enabled {
                    self.cache_validation(&key_hash, "1").await;
                    return ValidationResult::ValidManaged { key_hash, record };
                }
                return ValidationResult::Invalid { reason: "API key is disabled" };
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "record_read_failed");
                return self.validate_env_only(api_key, key_hash);
            }
        }

        let result = self.validate_env_only(api_key, key_hash.clone());
        if result.is_env_key() {
            self.cache_validation(&key_hash, "env").await;
            self.materialise_env_record(api_key, &key_hash).await;
        }
        result
    }

    fn validate_env_only(&self, api_key: &str, key_hash: String) -> ValidationResult {
        for env_key in &self.env_keys {
            if constant_time_eq(api_key, env_key) {
                return ValidationResult::ValidEnvironment { key_hash };
            }
        }
        ValidationResult::Invalid { reason: "Invalid API key" }
    }

    async fn cache_validation(&self, key_hash: &str, value: &str) {
        if let Err(e) = self
            .kv
            .set_ex(&valid_cache_key(key_hash), value, VALIDATION_CACHE_TTL)
            .await
        {
            warn!(error = %e, "validation_cache_write_failed");
        }
    }

    /// First sight of an environment key: write a record so it shows up
    /// in listings. The record itself still rejects mutation.
    async fn materialise_env_record(&self, api_key: &str, key_hash: &str) {
        match self.get(key_hash).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(_) => return,
        }
        let record = ApiKeyRecord {
            key_hash: key_hash.to_string(),
            key_prefix: key_prefix(api_key),
            name: "environment".to_string(),
            enabled: true,
            created_at: Utc::now(),
            last_used_at: None,
            usage_count: 0,
            metadata: HashMap::new(),
            rate_limits: RateLimits::default(),
            source: KeySource::Environment,
        };
        let result = self
            .kv
            .exec(vec![
                KvOp::HSetAll { key: record_key(key_hash), fields: record.to_kv_hash() },
                KvOp::SAdd { key: ENV_INDEX_KEY.to_string(), member: key_hash.to_string() },
            ])
            .await;
        if let Err(e) = result {
            warn!(error = %e, "env_record_materialise_failed");
        }
    }

    /* ── RATE LIMITS ── */

    pub async fn check_rate_limits(
        &self,
        key_hash: &str,
    ) -> KeyResult<(bool, Option<RateLimitStatus>)> {
        self.check_rate_limits_at(key_hash, Utc::now()).await
    }

    /// Fail-fast over configured windows, shortest first. The check reads
    /// counters only: admission is what increments, so concurrent bursts
    /// can overshoot a window by up to the burst size.
    pub async fn check_rate_limits_at(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> KeyResult<(bool, Option<RateLimitStatus>)> {
        let Some(record) = self.get(key_hash).await? else {
            // Unknown record = environment key = unlimited
            return Ok((true, None));
        };
        if record.source == KeySource::Environment || record.rate_limits.is_unlimited() {
            return Ok((true, None));
        }

        for period in RatePeriod::ALL {
            let Some(limit) = record.rate_limits.limit_for(period) else {
                continue;
            };
            let used = match self.read_counter(key_hash, period, now).await {
                Ok(used) => used,
                Err(e) => {
                    // Degrade open: a KV outage must not reject traffic
                    warn!(period = period.as_str(), error = %e, "rate_limit_read_failed");
                    continue;
                }
            };
            if used >= limit as u64 {
                debug!(
                    key_hash = %short_hash(key_hash),
                    period = period.as_str(),
                    used,
                    limit,
                    "rate_limit_exceeded"
                );
                return Ok((
                    false,
                    Some(RateLimitStatus {
                        period,
                        limit: Some(limit),
                        used,
                        remaining: Some(0),
                        resets_at: period.reset_time(now),
                        exceeded: true,
                    }),
                ));
            }
        }

        Ok((true, None))
    }

    pub async fn increment_usage(&self, key_hash: &str) -> KeyResult<()> {
        self.increment_usage_at(key_hash, Utc::now()).await
    }

    /// One pipelined batch: bump all five window counters (each with its
    /// own TTL) plus the record's usage_count and last_used_at.
    pub async fn increment_usage_at(&self, key_hash: &str, now: DateTime<Utc>) -> KeyResult<()> {
        let mut ops = Vec::with_capacity(RatePeriod::ALL.len() + 2);
        for period in RatePeriod::ALL {
            ops.push(KvOp::IncrExpire {
                key: usage_key(key_hash, &period.bucket_key(now)),
                ttl: period.counter_ttl(),
            });
        }
        ops.push(KvOp::HIncr {
            key: record_key(key_hash),
            field: "usage_count".to_string(),
            by: 1,
        });
        ops.push(KvOp::HSet {
            key: record_key(key_hash),
            field: "last_used_at".to_string(),
            value: now.to_rfc3339(),
        });
        self.kv.exec(ops).await?;
        Ok(())
    }

    pub async fn rate_limit_status(&self, key_hash: &str) -> KeyResult<Vec<RateLimitStatus>> {
        self.rate_limit_status_at(key_hash, Utc::now()).await
    }

    /// All five windows with limit/used/remaining/reset, whether or not a
    /// limit is configured for the window.
    pub async fn rate_limit_status_at(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> KeyResult<Vec<RateLimitStatus>> {
        let limits = self
            .get(key_hash)
            .await?
            .map(|r| r.rate_limits)
            .unwrap_or_default();

        let mut statuses = Vec::with_capacity(RatePeriod::ALL.len());
        for period in RatePeriod::ALL {
            let limit = limits.limit_for(period);
            let used = self.read_counter(key_hash, period, now).await.unwrap_or(0);
            statuses.push(RateLimitStatus {
                period,
                limit,
                used,
                remaining: limit.map(|l| (l as u64).saturating_sub(used)),
                resets_at: period.reset_time(now),
                exceeded: limit.is_some_and(|l| used >= l as u64),
            });
        }
        Ok(statuses)
    }

    /// Current bucket counts for all five windows.
    pub async fn get_usage_at(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> KeyResult<HashMap<&'static str, u64>> {
        let mut usage = HashMap::new();
        for period in RatePeriod::ALL {
            usage.insert(
                period.as_str(),
                self.read_counter(key_hash, period, now).await.unwrap_or(0),
            );
        }
        Ok(usage)
    }

    async fn read_counter(
        &self,
        key_hash: &str,
        period: RatePeriod,
        now: DateTime<Utc>,
    ) -> KeyResult<u64> {
        let value = self
            .kv
            .get(&usage_key(key_hash, &period.bucket_key(now)))
            .await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}

/* ============================= TESTS ============================= */
