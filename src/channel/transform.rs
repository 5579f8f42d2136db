//! Channel-independent request rewriting: model redirects, parameter
//! overrides and header rules.

use crate::error::AppError;
use crate::group::{GroupRoute, HeaderAction};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;

/// Outcome of the body rewrite: the bytes to forward and the (possibly
/// redirected) model name for observability.
pub struct TransformedBody {
    pub bytes: Bytes,
    pub model: Option<String>,
}

/// Apply model redirect rules and top-level parameter overrides to a JSON
/// body. Non-JSON bodies pass through untouched.
pub fn transform_body(body: &[u8], route: &GroupRoute) -> Result<TransformedBody, AppError> {
    if body.is_empty() {
        return Ok(TransformedBody {
            bytes: Bytes::new(),
            model: None,
        });
    }

    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return Ok(TransformedBody {
            bytes: Bytes::copy_from_slice(body),
            model: None,
        });
    };
    let Some(obj) = value.as_object_mut() else {
        return Ok(TransformedBody {
            bytes: Bytes::copy_from_slice(body),
            model: None,
        });
    };

    if let Some(model) = obj.get("model").and_then(|m| m.as_str()).map(str::to_string) {
        match route.model_redirects.get(&model) {
            Some(target) => {
                obj.insert("model".to_string(), serde_json::Value::String(target.clone()));
            }
            None if route.group.model_redirect_strict => {
                return Err(AppError::ModelNotAllowed(model));
            }
            None => {}
        }
    }

    for (key, value) in &route.param_overrides {
        obj.insert(key.clone(), value.clone());
    }

    let model = obj.get("model").and_then(|m| m.as_str()).map(str::to_string);
    let bytes = Bytes::from(serde_json::to_vec(&value).map_err(|e| {
        AppError::Internal(format!("failed to serialise transformed body: {e}"))
    })?);
    Ok(TransformedBody { bytes, model })
}

/// Headers that must never be forwarded verbatim: hop-by-hop headers, the
/// framing headers the outbound client recomputes, and every client
/// credential slot.
const STRIPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "authorization",
    "x-api-key",
    "x-goog-api-key",
];

/// Copy request headers for forwarding, dropping the stripped set.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Apply the group's ordered header rules. `set` writes the exact value,
/// `remove` deletes; rules for `host`/`content-length` are ignored because
/// those are owned by the outbound client.
pub fn apply_header_rules(headers: &mut HeaderMap, rules: &[crate::group::HeaderRule]) {
    for rule in rules {
        if rule.key == "host" || rule.key == "content-length" {
            continue;
        }
        let Ok(name) = rule.key.parse::<HeaderName>() else {
            continue;
        };
        match rule.action {
            HeaderAction::Set => {
                if let Ok(value) = HeaderValue::from_str(&rule.value) {
                    headers.insert(name, value);
                }
            }
            HeaderAction::Remove => {
                headers.remove(name);
            }
        }
    }
}

/// Response headers that must not be relayed to the client: connection
/// framing is re-established by our server.
pub fn relayable_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if matches!(
            name.as_str(),
            "connection" | "keep-alive" | "transfer-encoding" | "content-length"
        ) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}
