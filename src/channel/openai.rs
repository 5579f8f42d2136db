use super::{ChannelAdapter, accepts_event_stream, bearer_token, join_url};
use axum::http::{HeaderMap, HeaderValue, header};
use serde_json::{Value, json};
use std::collections::HashMap;

/// OpenAI-compatible channel: bearer auth, `stream` flag in the body.
pub struct OpenAiChannel;

impl ChannelAdapter for OpenAiChannel {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn extract_credential(
        &self,
        headers: &HeaderMap,
        _query: &HashMap<String, String>,
    ) -> Option<String> {
        bearer_token(headers)
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
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}")) {
            headers.insert(header::AUTHORIZATION, value);
        }
    }

    fn is_stream(&self, body: Option<&Value>, headers: &HeaderMap, _subpath: &str) -> bool {
        body.and_then(|b| b.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || accepts_event_stream(headers)
    }

    fn validation_path(&self, _test_model: &str) -> String {
        "/v1/chat/completions".to_string()
    }

    fn validation_body(&self, test_model: &str) -> Value {
        json!({
            "model": test_model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1,
            "stream": false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_credential() {
        let channel = OpenAiChannel;
        let mut headers = HeaderMap::new();
        assert!(channel.extract_credential(&headers, &HashMap::new()).is_none());

        headers.insert(header::AUTHORIZATION, "Bearer proxy-123".parse().unwrap());
        assert_eq!(
            channel.extract_credential(&headers, &HashMap::new()),
            Some("proxy-123".to_string())
        );

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(channel.extract_credential(&headers, &HashMap::new()).is_none());
    }

    #[test]
    fn test_apply_auth_replaces_credential() {
        let channel = OpenAiChannel;
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer proxy-123".parse().unwrap());
        channel.apply_auth(&mut headers, "sk-AAA");
        assert_eq!(headers[header::AUTHORIZATION], "Bearer sk-AAA");
    }

    #[test]
    fn test_is_stream() {
        let channel = OpenAiChannel;
        let headers = HeaderMap::new();
        let streaming = json!({"model": "gpt-4o", "stream": true});
        let plain = json!({"model": "gpt-4o"});
        assert!(channel.is_stream(Some(&streaming), &headers, "v1/chat/completions"));
        assert!(!channel.is_stream(Some(&plain), &headers, "v1/chat/completions"));
        assert!(!channel.is_stream(None, &headers, "v1/chat/completions"));

        let mut sse = HeaderMap::new();
        sse.insert(header::ACCEPT, "text/event-stream".parse().unwrap());
        assert!(channel.is_stream(None, &sse, "v1/chat/completions"));
    }
}
