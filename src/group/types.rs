use crate::config::ProxyDefaults;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A real provider endpoint plus its selection weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    pub url: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderAction {
    Set,
    Remove,
}

/// Ordered header rewrite rule. Keys are canonicalised to lowercase on
/// validation; duplicates are rejected there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRule {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub action: HeaderAction,
}

/// Per-group overrides of the system defaults. Unknown fields are rejected
/// at the admin surface by serde.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_conn_timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_header_timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blacklist_threshold: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_validation_interval_minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_validation_concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_validation_timeout_seconds: Option<u64>,
    /// 0 disables the hourly quota.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests_per_hour: Option<i64>,
    /// 0 disables the monthly quota.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests_per_month: Option<i64>,
    /// Local time, `YYYY-MM-DD HH:MM:SS`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

/// Group overrides merged over the system defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub max_retries: u32,
    pub upstream_timeout_seconds: u64,
    pub response_header_timeout_seconds: u64,
    pub blacklist_threshold: i64,
    pub key_validation_interval_minutes: u64,
    pub key_validation_concurrency: Option<usize>,
    pub key_validation_timeout_seconds: Option<u64>,
    pub max_requests_per_hour: i64,
    pub max_requests_per_month: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl GroupConfig {
    pub fn effective(&self, defaults: &ProxyDefaults) -> EffectiveConfig {
        EffectiveConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            upstream_timeout_seconds: self
                .upstream_timeout_seconds
                .unwrap_or(defaults.upstream_timeout_seconds),
            response_header_timeout_seconds: self
                .response_header_timeout_seconds
                .unwrap_or(defaults.response_header_timeout_seconds),
            blacklist_threshold: self
                .blacklist_threshold
                .unwrap_or(defaults.blacklist_threshold)
                .max(1),
            key_validation_interval_minutes: self.key_validation_interval_minutes.unwrap_or(0),
            key_validation_concurrency: self.key_validation_concurrency,
            key_validation_timeout_seconds: self.key_validation_timeout_seconds,
            max_requests_per_hour: self.max_requests_per_hour.unwrap_or(0),
            max_requests_per_month: self.max_requests_per_month.unwrap_or(0),
            expires_at: self.expires_at.as_deref().and_then(parse_expires_at),
        }
    }

    /// Bounds checks the admin surface applies before persisting.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(t) = self.upstream_timeout_seconds {
            if t < 1 {
                return Err("upstream_timeout_seconds must be >= 1".into());
            }
        }
        if let Some(t) = self.blacklist_threshold {
            if t < 1 {
                return Err("blacklist_threshold must be >= 1".into());
            }
        }
        if let Some(n) = self.max_requests_per_hour {
            if n < 0 {
                return Err("max_requests_per_hour must be >= 0".into());
            }
        }
        if let Some(n) = self.max_requests_per_month {
            if n < 0 {
                return Err("max_requests_per_month must be >= 0".into());
            }
        }
        if let Some(ref raw) = self.expires_at {
            if !raw.is_empty() && parse_expires_at(raw).is_none() {
                return Err(format!("invalid expires_at format: {raw}"));
            }
        }
        Ok(())
    }
}

/// `YYYY-MM-DD HH:MM:SS` interpreted in the server's local timezone.
pub fn parse_expires_at(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

/// Group names are URL path segments: lowercase alphanumerics, `_` and `-`,
/// at most 100 characters.
pub fn is_valid_group_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 100
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Validation endpoints are paths, never absolute URLs.
pub fn is_valid_validation_endpoint(endpoint: &str) -> bool {
    endpoint.is_empty() || (endpoint.starts_with('/') && !endpoint.contains("://"))
}

/// Canonicalise rule keys (lowercase, as the `http` crate stores them) and
/// reject duplicates.
pub fn normalize_header_rules(rules: &[HeaderRule]) -> Result<Vec<HeaderRule>, String> {
    let mut normalized = Vec::with_capacity(rules.len());
    let mut seen = std::collections::HashSet::new();
    for rule in rules {
        let key = rule.key.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        if key.parse::<http::header::HeaderName>().is_err() {
            return Err(format!("invalid header name: {key}"));
        }
        if !seen.insert(key.clone()) {
            return Err(format!("duplicate header rule: {key}"));
        }
        normalized.push(HeaderRule {
            key,
            value: rule.value.clone(),
            action: rule.action,
        });
    }
    Ok(normalized)
}

/// Split the opaque proxy-key blob on newlines and whitespace.
pub fn split_proxy_keys(raw: &str) -> Vec<String> {
    raw.split_whitespace()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
