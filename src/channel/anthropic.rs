use super::{ChannelAdapter, accepts_event_stream, join_url};
use axum::http::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use std::collections::HashMap;

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic channel: `x-api-key` auth plus a mandatory version header.
pub struct AnthropicChannel;

impl ChannelAdapter for AnthropicChannel {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn extract_credential(
        &self,
        headers: &HeaderMap,
        _query: &HashMap<String, String>,
    ) -> Option<String> {
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn upstream_url(
        &self,
        base: &str,
        subpath: &str,
        query: &[(String, String)],
        _key: &str,
    ) -> String {
        join_url(base, subpath, query)
    }

    fn apply_auth(&self, headers: &mut HeaderMap, key: &str) {
        if let Ok(value) = HeaderValue::from_str(key) {
            headers.insert("x-api-key", value);
        }
        if !headers.contains_key("anthropic-version") {
            headers.insert(
                "anthropic-version",
                HeaderValue::from_static(DEFAULT_ANTHROPIC_VERSION),
            );
        }
    }

    fn is_stream(&self, body: Option<&Value>, headers: &HeaderMap, _subpath: &str) -> bool {
        body.and_then(|b| b.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || accepts_event_stream(headers)
    }

    fn validation_path(&self, _test_model: &str) -> String {
        "/v1/messages".to_string()
    }

    fn validation_body(&self, test_model: &str) -> Value {
        json!({
            "model": test_model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_credential() {
        let channel = AnthropicChannel;
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "proxy-123".parse().unwrap());
        assert_eq!(
            channel.extract_credential(&headers, &HashMap::new()),
            Some("proxy-123".to_string())
        );
    }

    #[test]
    fn test_apply_auth_sets_version_once() {
        let channel = AnthropicChannel;
        let mut headers = HeaderMap::new();
        channel.apply_auth(&mut headers, "sk-ant-x");
        assert_eq!(headers["x-api-key"], "sk-ant-x");
        assert_eq!(headers["anthropic-version"], DEFAULT_ANTHROPIC_VERSION);

        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", "2024-01-01".parse().unwrap());
        channel.apply_auth(&mut headers, "sk-ant-x");
        assert_eq!(headers["anthropic-version"], "2024-01-01");
    }
}
