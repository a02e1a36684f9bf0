use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

use crate::cli::KeysAction;
use codepod::keys::RateLimits;

/* ============================= CLIENT ============================= */

struct AdminClient {
    http: reqwest::Client,
    base_url: String,
    master_key: String,
}

impl AdminClient {
    fn new(base_url: &str) -> Result<Self> {
        let master_key = std::env::var("MASTER_API_KEY")
            .context("MASTER_API_KEY must be set to use the keys CLI")?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            master_key,
        })
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.master_key);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("Cannot reach codepod server at {}", self.base_url))?;

        let status = resp.status();
        let value: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let detail = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("no detail");
            bail!("Server returned {}: {}", status, detail);
        }
        Ok(value)
    }

    async fn list(&self) -> Result<Vec<Value>> {
        let value = self.request(reqwest::Method::GET, "/admin/keys", None).await?;
        value
            .as_array()
            .cloned()
            .context("Unexpected response shape from /admin/keys")
    }

    /// Resolve a display prefix to the record's full hash.
    async fn resolve(&self, prefix: &str) -> Result<(String, Value)> {
        for record in self.list().await? {
            if record.get("key_prefix").and_then(Value::as_str) == Some(prefix) {
                let hash = record
                    .get("key_hash")
                    .and_then(Value::as_str)
                    .context("Record missing key_hash")?
                    .to_string();
                return Ok((hash, record));
            }
        }
        bail!("No key found with prefix '{}'", prefix);
    }
}

/* ============================= ENTRY ============================= */

pub async fn run(api_url: &str, action: KeysAction) -> Result<()> {
    let client = AdminClient::new(api_url)?;

    match action {
        KeysAction::Create { name, per_second, per_minute, hourly, daily, monthly } => {
            let limits = RateLimits { per_second, per_minute, hourly, daily, monthly };
            let body = json!({ "name": name, "rate_limits": limits });
            let value = client
                .request(reqwest::Method::POST, "/admin/keys", Some(body))
                .await?;

            let api_key = value
                .get("api_key")
                .and_then(Value::as_str)
                .context("Response missing api_key")?;
            println!("Created API key '{}'\n", name);
            println!("  {}", api_key);
            println!("\nStore it now. The full key is never shown again.");
        }

        KeysAction::List => {
            let records = client.list().await?;
            println!(
                "{:<14} {:<24} {:<9} {:<12} {:>8}",
                "PREFIX", "NAME", "ENABLED", "SOURCE", "USED"
            );
            println!("{}", "-".repeat(70));
            for record in &records {
                println!(
                    "{:<14} {:<24} {:<9} {:<12} {:>8}",
                    record.get("key_prefix").and_then(Value::as_str).unwrap_or("-"),
                    record.get("name").and_then(Value::as_str).unwrap_or("-"),
                    record.get("enabled").and_then(Value::as_bool).unwrap_or(false),
                    record.get("source").and_then(Value::as_str).unwrap_or("-"),
                    record.get("usage_count").and_then(Value::as_u64).unwrap_or(0),
                );
            }
            println!("\nTotal: {} keys", records.len());
        }

        KeysAction::Show { prefix } => {
            let (_, record) = client.resolve(&prefix).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        KeysAction::Revoke { prefix } => {
            let (hash, _) = client.resolve(&prefix).await?;
            client
                .request(reqwest::Method::DELETE, &format!("/admin/keys/{hash}"), None)
                .await?;
            println!("Revoked key '{}'", prefix);
        }

        KeysAction::Update { prefix, enabled, name, per_minute, hourly, daily } => {
            let (hash, record) = client.resolve(&prefix).await?;

            let mut body = serde_json::Map::new();
            if let Some(enabled) = enabled {
                body.insert("enabled".to_string(), json!(enabled));
            }
            if let Some(name) = name {
                body.insert("name".to_string(), json!(name));
            }
            if per_minute.is_some() || hourly.is_some() || daily.is_some() {
                // Start from the current limits so one flag doesn't wipe the rest
                let mut limits: RateLimits = record
                    .get("rate_limits")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                if per_minute.is_some() {
                    limits.per_minute = per_minute;
                }
                if hourly.is_some() {
                    limits.hourly = hourly;
                }
                if daily.is_some() {
                    limits.daily = daily;
                }
                body.insert("rate_limits".to_string(), json!(limits));
            }
            if body.is_empty() {
                bail!("Nothing to update. Pass --enabled, --name, or a rate-limit flag.");
            }

            client
                .request(
                    reqwest::Method::PATCH,
                    &format!("/admin/keys/{hash}"),
                    Some(Value::Object(body)),
                )
                .await?;
            println!("Updated key '{}'", prefix);
        }

        KeysAction::Usage { prefix } => {
            let (hash, _) = client.resolve(&prefix).await?;
            let value = client
                .request(reqwest::Method::GET, &format!("/admin/keys/{hash}/usage"), None)
                .await?;

            println!("Key {}", prefix);
            println!(
                "  Total requests: {}",
                value.get("usage_count").and_then(Value::as_u64).unwrap_or(0)
            );
            println!();
            println!(
                "{:<12} {:>8} {:>8} {:>10}   {}",
                "WINDOW", "USED", "LIMIT", "REMAINING", "RESETS AT"
            );
            println!("{}", "-".repeat(64));
            for window in value
                .get("windows")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
            {
                let limit = window
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let remaining = window
                    .get("remaining")
                    .and_then(Value::as_u64)
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<12} {:>8} {:>8} {:>10}   {}",
                    window.get("period").and_then(Value::as_str).unwrap_or("-"),
                    window.get("used").and_then(Value::as_u64).unwrap_or(0),
                    limit,
                    remaining,
                    window.get("resets_at").and_then(Value::as_str).unwrap_or("-"),
                );
            }
        }
    }

    Ok(())
}
