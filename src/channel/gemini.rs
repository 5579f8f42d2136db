use super::{ChannelAdapter, accepts_event_stream, join_url};
use axum::http::HeaderMap;
use serde_json::{Value, json};
use std::collections::HashMap;
use url::form_urlencoded;

/// Gemini channel: the key rides in the `key` query parameter, streaming is
/// an RPC suffix on the path.
pub struct GeminiChannel;

impl ChannelAdapter for GeminiChannel {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn extract_credential(
        &self,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
    ) -> Option<String> {
        query.get("key").cloned().or_else(|| {
            headers
                .get("x-goog-api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
    }

    fn upstream_url(
        &self,
        base: &str,
        subpath: &str,
        query: &[(String, String)],
        key: &str,
    ) -> String {
        // The client's `key` parameter is the proxy credential; replace it
        // with the pooled provider key.
        let mut pairs: Vec<(String, String)> = query
            .iter()
            .filter(|(k, _)| k != "key")
            .cloned()
            .collect();
        let encoded: String = form_urlencoded::byte_serialize(key.as_bytes()).collect();
        pairs.push(("key".to_string(), encoded));
        join_url(base, subpath, &pairs)
    }

    fn apply_auth(&self, headers: &mut HeaderMap, _key: &str) {
        // Credential is carried in the URL; the incoming header variant is
        // stripped with the rest of the client auth headers.
        headers.remove("x-goog-api-key");
    }

    fn is_stream(&self, _body: Option<&Value>, headers: &HeaderMap, subpath: &str) -> bool {
        subpath.contains(":streamGenerateContent") || accepts_event_stream(headers)
    }

    fn validation_path(&self, test_model: &str) -> String {
        format!("/v1beta/models/{test_model}:generateContent")
    }

    fn validation_body(&self, _test_model: &str) -> Value {
        json!({
            "contents": [{"parts": [{"text": "hi"}]}],
            "generationConfig": {"maxOutputTokens": 1},
        })
    }
}
