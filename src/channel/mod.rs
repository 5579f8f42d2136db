//! Provider-specific transformers.
//!
//! An adapter owns the channel's URL shape, credential placement, streaming
//! detection and validation probe. Everything channel-independent (body
//! rewriting, header rules) lives in `transform`.

mod anthropic;
mod gemini;
mod openai;
pub mod transform;

use crate::error::FailureKind;
use crate::group::GroupRoute;
use axum::http::{HeaderMap, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use anthropic::AnthropicChannel;
pub use gemini::GeminiChannel;
pub use openai::OpenAiChannel;

pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Proxy-side credential from the incoming request (never forwarded).
    fn extract_credential(
        &self,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
    ) -> Option<String>;

    /// Compose the outbound URL from the upstream base, the request subpath
    /// and the (already percent-encoded) query pairs. Channels that carry
    /// the key in the URL append it here.
    fn upstream_url(&self, base: &str, subpath: &str, query: &[(String, String)], key: &str)
    -> String;

    /// Inject the real provider key into the outbound headers.
    fn apply_auth(&self, headers: &mut HeaderMap, key: &str);

    /// Whether this request expects a streamed response.
    fn is_stream(&self, body: Option<&Value>, headers: &HeaderMap, subpath: &str) -> bool;

    /// Probe path used when the group has no `validation_endpoint`.
    fn validation_path(&self, test_model: &str) -> String;

    /// Minimal probe body.
    fn validation_body(&self, test_model: &str) -> Value;
}

static REGISTRY: std::sync::LazyLock<Vec<Arc<dyn ChannelAdapter>>> =
    std::sync::LazyLock::new(|| {
        vec![
            Arc::new(OpenAiChannel),
            Arc::new(GeminiChannel),
            Arc::new(AnthropicChannel),
        ]
    });

/// Registered channels, in registration order.
pub fn registry() -> &'static [Arc<dyn ChannelAdapter>] {
    &REGISTRY
}

pub fn adapter_for(channel_type: &str) -> Option<Arc<dyn ChannelAdapter>> {
    registry().iter().find(|a| a.name() == channel_type).cloned()
}

pub fn channel_names() -> Vec<&'static str> {
    registry().iter().map(|a| a.name()).collect()
}

/// Shared outcome classification for proxied responses.
/// `None` means success.
pub fn classify_status(status: StatusCode) -> Option<FailureKind> {
    if status.is_success() {
        return None;
    }
    match status.as_u16() {
        401 | 403 => Some(FailureKind::KeyAttributable),
        408 | 429 => Some(FailureKind::Transient),
        s if (500..600).contains(&s) => Some(FailureKind::Transient),
        _ => Some(FailureKind::Permanent),
    }
}

/// Join an upstream base with the request subpath and query pairs.
pub(crate) fn join_url(base: &str, subpath: &str, query: &[(String, String)]) -> String {
    let base = base.trim_end_matches('/');
    let subpath = subpath.trim_start_matches('/');
    let mut url = if subpath.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{subpath}")
    };
    if !query.is_empty() {
        let encoded: Vec<String> = query
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect();
        url.push('?');
        url.push_str(&encoded.join("&"));
    }
    url
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

/// Result of a validation probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Ok,
    /// Network trouble or an upstream-side error; try again next cycle.
    Retryable(String),
    /// The key itself (or the probe shape) is rejected; stays invalid.
    Permanent(String),
}

/// Issue the minimal probe for a key against the group's first eligible
/// upstream.
pub async fn validate_key(
    client: &reqwest::Client,
    adapter: &dyn ChannelAdapter,
    route: &GroupRoute,
    key: &str,
    timeout: Duration,
) -> ValidationOutcome {
    let Some(upstream) = route
        .upstreams
        .iter()
        .find(|u| u.weight > 0)
        .or_else(|| route.upstreams.first())
    else {
        return ValidationOutcome::Retryable("group has no upstream".into());
    };

    let test_model = &route.group.test_model;
    let path = if route.group.validation_endpoint.is_empty() {
        adapter.validation_path(test_model)
    } else {
        route.group.validation_endpoint.clone()
    };
    let url = adapter.upstream_url(&upstream.url, &path, &[], key);

    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    adapter.apply_auth(&mut headers, key);

    let request = client
        .post(url)
        .headers(headers)
        .json(&adapter.validation_body(test_model));

    let response = match tokio::time::timeout(timeout, request.send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => return ValidationOutcome::Retryable(format!("request error: {e}")),
        Err(_) => return ValidationOutcome::Retryable("probe timeout".into()),
    };

    let status = response.status();
    match classify_status(status) {
        None => ValidationOutcome::Ok,
        Some(FailureKind::Transient) => {
            ValidationOutcome::Retryable(format!("upstream returned {status}"))
        }
        Some(_) => ValidationOutcome::Permanent(format!("upstream returned {status}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names() {
        assert_eq!(channel_names(), vec!["openai", "gemini", "anthropic"]);
        assert!(adapter_for("openai").is_some());
        assert!(adapter_for("cohere").is_none());
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            Some(FailureKind::KeyAttributable)
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            Some(FailureKind::KeyAttributable)
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(FailureKind::Transient)
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            Some(FailureKind::Transient)
        );
        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT),
            Some(FailureKind::Transient)
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            Some(FailureKind::Permanent)
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            Some(FailureKind::Permanent)
        );
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://api.openai.com/", "/v1/chat/completions", &[]),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(join_url("https://host", "", &[]), "https://host");
        assert_eq!(
            join_url(
                "https://host",
                "p",
                &[("a".into(), "1".into()), ("flag".into(), String::new())]
            ),
            "https://host/p?a=1&flag"
        );
    }
}
