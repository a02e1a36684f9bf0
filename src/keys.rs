use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/* ============================= HASHING ============================= */

/// Hex SHA-256 of a full API key. The full key value is never persisted.
pub fn hash_key(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// First 16 hex chars of a key hash, used as a compact KV key suffix.
pub fn short_hash(key_hash: &str) -> &str {
    &key_hash[..key_hash.len().min(16)]
}

/// Constant-time string comparison for environment-key checks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate a new full key: `sk-` + 24 URL-safe base64 chars of entropy.
pub fn generate_full_key() -> String {
    let mut bytes = [0u8; 18];
    OsRng.fill_bytes(&mut bytes);
    format!("sk-{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Display prefix: `sk-` plus the first 8 random chars.
pub fn key_prefix(full_key: &str) -> String {
    full_key.chars().take(11).collect()
}

/* ============================= RATE WINDOWS ============================= */

/// One of the five rate-limit periods, in fail-fast check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatePeriod {
    PerSecond,
    PerMinute,
    Hourly,
    Daily,
    Monthly,
}

impl RatePeriod {
    /// All periods, shortest window first.
    pub const ALL: [RatePeriod; 5] = [
        RatePeriod::PerSecond,
        RatePeriod::PerMinute,
        RatePeriod::Hourly,
        RatePeriod::Daily,
        RatePeriod::Monthly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RatePeriod::PerSecond => "per_second",
            RatePeriod::PerMinute => "per_minute",
            RatePeriod::Hourly => "hourly",
            RatePeriod::Daily => "daily",
            RatePeriod::Monthly => "monthly",
        }
    }

    /// Counter TTL in seconds: roughly twice the window so buckets die
    /// on their own and no reset code exists anywhere.
    pub fn counter_ttl(&self) -> u64 {
        match self {
            RatePeriod::PerSecond => 2,
            RatePeriod::PerMinute => 120,
            RatePeriod::Hourly => 7200,
            RatePeriod::Daily => 172_800,
            RatePeriod::Monthly => 2_764_800,
        }
    }

    /// Calendar-aligned bucket suffix, e.g. `minute:2024-01-15-10:30`.
    pub fn bucket_key(&self, now: DateTime<Utc>) -> String {
        match self {
            RatePeriod::PerSecond => format!("second:{}", now.format("%Y-%m-%d-%H:%M:%S")),
            RatePeriod::PerMinute => format!("minute:{}", now.format("%Y-%m-%d-%H:%M")),
            RatePeriod::Hourly => format!("hour:{}", now.format("%Y-%m-%d-%H")),
            RatePeriod::Daily => format!("day:{}", now.format("%Y-%m-%d")),
            RatePeriod::Monthly => format!("month:{}", now.format("%Y-%m")),
        }
    }

    /// Start of the next window: truncate `now` to the window, add one
    /// window. December rolls over to January of the following year.
    pub fn reset_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let truncated = match self {
            RatePeriod::PerSecond => now.with_nanosecond(0),
            RatePeriod::PerMinute => now.with_second(0).and_then(|t| t.with_nanosecond(0)),
            RatePeriod::Hourly => now
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0)),
            RatePeriod::Daily => Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
                .single(),
            RatePeriod::Monthly => {
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                return Utc
                    .with_ymd_and_hms(year, month, 1, 0, 0, 0)
                    .single()
                    .unwrap_or(now);
            }
        };
        let truncated = truncated.unwrap_or(now);
        match self {
            RatePeriod::PerSecond => truncated + Duration::seconds(1),
            RatePeriod::PerMinute => truncated + Duration::minutes(1),
            RatePeriod::Hourly => truncated + Duration::hours(1),
            RatePeriod::Daily => truncated + Duration::days(1),
            RatePeriod::Monthly => truncated,
        }
    }
}

/// Per-key limits; `None` means unlimited for that period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub per_second: Option<u32>,
    pub per_minute: Option<u32>,
    pub hourly: Option<u32>,
    pub daily: Option<u32>,
    pub monthly: Option<u32>,
}

impl RateLimits {
    pub fn is_unlimited(&self) -> bool {
        self.per_second.is_none()
            && self.per_minute.is_none()
            && self.hourly.is_none()
            && self.daily.is_none()
            && self.monthly.is_none()
    }

    pub fn limit_for(&self, period: RatePeriod) -> Option<u32> {
        match period {
            RatePeriod::PerSecond => self.per_second,
            RatePeriod::PerMinute => self.per_minute,
            RatePeriod::Hourly => self.hourly,
            RatePeriod::Daily => self.daily,
            RatePeriod::Monthly => self.monthly,
        }
    }
}

/// Current standing of one window for one key.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub period: RatePeriod,
    pub limit: Option<u32>,
    pub used: u64,
    pub remaining: Option<u64>,
    pub resets_at: DateTime<Utc>,
    pub exceeded: bool,
}

/* ============================= RECORD ============================= */

/// Where a credential came from.
///
/// `Environment` records are matched against process configuration,
/// treated as unlimited, and refuse mutation and revocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    Managed,
    Environment,
}

/// Identity of one credential. Keyed by the SHA-256 of the full key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key_hash: String,
    pub key_prefix: String,
    pub name: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub metadata: HashMap<String, String>,
    pub rate_limits: RateLimits,
    pub source: KeySource,
}

impl ApiKeyRecord {
    pub fn new_managed(full_key: &str, name: &str) -> Self {
        Self {
            key_hash: hash_key(full_key),
            key_prefix: key_prefix(full_key),
            name: name.to_string(),
            enabled: true,
            created_at: Utc::now(),
            last_used_at: None,
            usage_count: 0,
            metadata: HashMap::new(),
            rate_limits: RateLimits::default(),
            source: KeySource::Managed,
        }
    }

    /// Encode into the flat string map stored as a KV hash.
    pub fn to_kv_hash(&self) -> Vec<(String, String)> {
        let limit = |v: Option<u32>| v.map(|n| n.to_string()).unwrap_or_default();
        vec![
            ("key_hash".to_string(), self.key_hash.clone()),
            ("key_prefix".to_string(), self.key_prefix.clone()),
            ("name".to_string(), self.name.clone()),
            ("enabled".to_string(), self.enabled.to_string()),
            ("created_at".to_string(), self.created_at.to_rfc3339()),
            (
                "last_used_at".to_string(),
                self.last_used_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ),
            ("usage_count".to_string(), self.usage_count.to_string()),
            (
                "metadata".to_string(),
                serde_json::to_string(&self.metadata).unwrap_or_else(|_| "{}".to_string()),
            ),
            ("rate_limits_per_second".to_string(), limit(self.rate_limits.per_second)),
            ("rate_limits_per_minute".to_string(), limit(self.rate_limits.per_minute)),
            ("rate_limits_hourly".to_string(), limit(self.rate_limits.hourly)),
            ("rate_limits_daily".to_string(), limit(self.rate_limits.daily)),
            ("rate_limits_monthly".to_string(), limit(self.rate_limits.monthly)),
            (
                "source".to_string(),
                match self.source {
                    KeySource::Managed => "managed".to_string(),
                    KeySource::Environment => "environment".to_string(),
                },
            ),
        ]
    }

    /// Decode from a KV hash. Returns `None` for an empty or unusable map.
    pub fn from_kv_hash(data: &HashMap<String, String>) -> Option<Self> {
        let key_hash = data.get("key_hash")?.clone();
        let limit = |field: &str| -> Option<u32> {
            data.get(field).filter(|v| !v.is_empty()).and_then(|v| v.parse().ok())
        };
        let created_at = data
            .get("created_at")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))?;
        let last_used_at = data
            .get("last_used_at")
            .filter(|v| !v.is_empty())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc));

        Some(Self {
            key_hash,
            key_prefix: data.get("key_prefix").cloned().unwrap_or_default(),
            name: data.get("name").cloned().unwrap_or_default(),
            enabled: data.get("enabled").map(|v| v == "true").unwrap_or(true),
            created_at,
            last_used_at,
            usage_count: data
                .get("usage_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            metadata: data
                .get("metadata")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
            rate_limits: RateLimits {
                per_second: limit("rate_limits_per_second"),
                per_minute: limit("rate_limits_per_minute"),
                hourly: limit("rate_limits_hourly"),
                daily: limit("rate_limits_daily"),
                monthly: limit("rate_limits_monthly"),
            },
            source: match data.get("source").map(String::as_str) {
                Some("environment") => KeySource::Environment,
                _ => KeySource::Managed,
            },
        })
    }
}

/* ============================= VALIDATION RESULT ============================= */

#[derive(Debug, Clone)]
pub enum ValidationResult {
    /// A managed record matched and is enabled.
    ValidManaged { key_hash: String, record: ApiKeyRecord },
    /// The raw key matched a configured environment key.
    ValidEnvironment { key_hash: String },
    Invalid { reason: &'static str },
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        !matches!(self, ValidationResult::Invalid { .. })
    }

    pub fn is_env_key(&self) -> bool {
        matches!(self, ValidationResult::ValidEnvironment { .. })
    }

    pub fn key_hash(&self) -> Option<&str> {
        match self {
            ValidationResult::ValidManaged { key_hash, .. }
            | ValidationResult::ValidEnvironment { key_hash } => Some(key_hash),
            ValidationResult::Invalid { .. } => None,
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    // ── hashing ──

    #[test]
    fn test_hash_is_64_hex_chars() {
        let h = hash_key("sk-test");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_key("sk-abc"), hash_key("sk-abc"));
        assert_ne!(hash_key("sk-abc"), hash_key("sk-abd"));
    }

    #[test]
    fn test_short_hash_is_16_chars() {
        let h = hash_key("sk-test");
        assert_eq!(short_hash(&h).len(), 16);
        assert!(h.starts_with(short_hash(&h)));
    }

    // ── key generation ──

    #[test]
    fn test_generated_key_format() {
        let key = generate_full_key();
        assert!(key.starts_with("sk-"));
        assert_eq!(key.len(), 3 + 24);
    }

    #[test]
    fn test_generated_keys_are_unique() {
        let a = generate_full_key();
        let b = generate_full_key();
        assert_ne!(a, b);
    }

    #[test]
    fn test_prefix_is_eleven_chars() {
        let key = generate_full_key();
        assert_eq!(key_prefix(&key).len(), 11);
        assert!(key.starts_with(&key_prefix(&key)));
    }

    // ── constant-time compare ──

    #[test]
    fn test_ct_eq_matches() {
        assert!(constant_time_eq("sk-abc", "sk-abc"));
        assert!(!constant_time_eq("sk-abc", "sk-abd"));
        assert!(!constant_time_eq("sk-abc", "sk-abcd"));
        assert!(constant_time_eq("", ""));
    }

    // ── bucket keys ──

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_bucket_key_formats() {
        let now = at(2024, 1, 15, 10, 30, 5);
        assert_eq!(RatePeriod::PerSecond.bucket_key(now), "second:2024-01-15-10:30:05");
        assert_eq!(RatePeriod::PerMinute.bucket_key(now), "minute:2024-01-15-10:30");
        assert_eq!(RatePeriod::Hourly.bucket_key(now), "hour:2024-01-15-10");
        assert_eq!(RatePeriod::Daily.bucket_key(now), "day:2024-01-15");
        assert_eq!(RatePeriod::Monthly.bucket_key(now), "month:2024-01");
    }

    #[test]
    fn test_counter_ttls_exceed_windows() {
        assert_eq!(RatePeriod::PerSecond.counter_ttl(), 2);
        assert_eq!(RatePeriod::PerMinute.counter_ttl(), 120);
        assert_eq!(RatePeriod::Hourly.counter_ttl(), 7200);
        assert_eq!(RatePeriod::Daily.counter_ttl(), 172_800);
        assert_eq!(RatePeriod::Monthly.counter_ttl(), 2_764_800);
    }

    // ── reset times ──

    #[test]
    fn test_reset_truncates_and_advances() {
        let now = at(2024, 3, 15, 10, 30, 45);
        assert_eq!(RatePeriod::PerSecond.reset_time(now), at(2024, 3, 15, 10, 30, 46));
        assert_eq!(RatePeriod::PerMinute.reset_time(now), at(2024, 3, 15, 10, 31, 0));
        assert_eq!(RatePeriod::Hourly.reset_time(now), at(2024, 3, 15, 11, 0, 0));
        assert_eq!(RatePeriod::Daily.reset_time(now), at(2024, 3, 16, 0, 0, 0));
        assert_eq!(RatePeriod::Monthly.reset_time(now), at(2024, 4, 1, 0, 0, 0));
    }

    #[test]
    fn test_reset_december_rolls_over_year() {
        let now = at(2024, 12, 31, 23, 59, 59);
        assert_eq!(RatePeriod::Monthly.reset_time(now), at(2025, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_reset_times_strictly_in_future() {
        let now = at(2024, 6, 1, 0, 0, 0);
        for period in RatePeriod::ALL {
            assert!(period.reset_time(now) > now, "{}", period.as_str());
        }
    }

    // ── limits ──

    #[test]
    fn test_default_limits_unlimited() {
        assert!(RateLimits::default().is_unlimited());
    }

    #[test]
    fn test_any_limit_clears_unlimited() {
        let limits = RateLimits { per_minute: Some(3), ..Default::default() };
        assert!(!limits.is_unlimited());
        assert_eq!(limits.limit_for(RatePeriod::PerMinute), Some(3));
        assert_eq!(limits.limit_for(RatePeriod::Hourly), None);
    }

    // ── record round-trip ──

    #[test]
    fn test_record_kv_hash_roundtrip_is_identity() {
        let mut record = ApiKeyRecord::new_managed("sk-roundtrip-test-key", "ci");
        record.rate_limits = RateLimits {
            per_minute: Some(10),
            daily: Some(1000),
            ..Default::default()
        };
        record.metadata.insert("team".to_string(), "research".to_string());
        record.usage_count = 42;
        record.last_used_at = Some(Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap());
        // RFC 3339 round-trips at second precision
        record.created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let encoded: HashMap<String, String> = record.to_kv_hash().into_iter().collect();
        let decoded = ApiKeyRecord::from_kv_hash(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_record_from_empty_hash_is_none() {
        assert!(ApiKeyRecord::from_kv_hash(&HashMap::new()).is_none());
    }

    #[test]
    fn test_environment_source_roundtrip() {
        let mut record = ApiKeyRecord::new_managed("sk-env-key", "env");
        record.source = KeySource::Environment;
        record.created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let encoded: HashMap<String, String> = record.to_kv_hash().into_iter().collect();
        let decoded = ApiKeyRecord::from_kv_hash(&encoded).unwrap();
        assert_eq!(decoded.source, KeySource::Environment);
    }

    // ── validation result ──

    #[test]
    fn test_validation_result_accessors() {
        let invalid = ValidationResult::Invalid { reason: "Invalid API key" };
        assert!(!invalid.is_valid());
        assert!(invalid.key_hash().is_none());

        let env = ValidationResult::ValidEnvironment { key_hash: "abc".to_string() };
        assert!(env.is_valid());
        assert!(env.is_env_key());
        assert_eq!(env.key_hash(), Some("abc"));
    }
}
