//! The request dispatch pipeline.
//!
//! Intake → group resolution → proxy auth → rate limit → (aggregate child)
//! → retry loop over upstream × key → relay. Non-streaming responses are
//! relayed whole under the upstream timeout; streaming responses get a
//! header deadline only and are flushed to the client chunk by chunk.

mod relay;

use crate::channel::{ChannelAdapter, classify_status, transform};
use crate::error::{AppError, FailureKind};
use crate::group::{GroupManager, GroupRoute};
use crate::logs::RequestLogRecord;
use crate::pool::KeyHandle;
use crate::rate_limit::Denial;
use crate::server::Server;
use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::any,
};
use bytes::Bytes;
use chrono::Utc;
use metrics::counter;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::form_urlencoded;
use uuid::Uuid;

/// Request bodies are buffered for rewriting, so they need a hard cap.
const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

pub fn router() -> Router<Server> {
    Router::new()
        .route("/proxy/{group}", any(proxy_root_handler))
        .route("/proxy/{group}/{*subpath}", any(proxy_handler))
}

async fn proxy_root_handler(
    state: State<Server>,
    Path(group): Path<String>,
    request: axum::extract::Request,
) -> Response {
    dispatch(state, group, String::new(), request).await
}

async fn proxy_handler(
    state: State<Server>,
    Path((group, subpath)): Path<(String, String)>,
    request: axum::extract::Request,
) -> Response {
    dispatch(state, group, subpath, request).await
}

fn proxy_error(status: StatusCode, error: &str, retries: u32, request_id: &str) -> Response {
    let body = json!({
        "error": error,
        "retries": retries,
        "request_id": request_id,
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn denial_response(denial: &Denial, request_id: &str) -> Response {
    let retry_after = denial.retry_after_seconds(Utc::now());
    let body = json!({
        "error": denial.reason,
        "limit": denial.limit,
        "used": denial.used,
        "reset_at": denial.reset_at.to_rfc3339(),
        "request_id": request_id,
    });
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::RETRY_AFTER, retry_after.to_string()),
            (header::CONTENT_TYPE, "application/json".to_string()),
        ],
        body.to_string(),
    )
        .into_response()
}

struct RequestContext {
    request_id: String,
    method: Method,
    headers: HeaderMap,
    subpath: String,
    query_pairs: Vec<(String, String)>,
    start: Instant,
}

async fn dispatch(
    State(server): State<Server>,
    group_name: String,
    subpath: String,
    request: axum::extract::Request,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    counter!("proxy_requests_total").increment(1);

    let route = match server.groups.get(&group_name).await {
        Ok(route) => route,
        Err(AppError::NotFound(_)) => {
            return proxy_error(StatusCode::NOT_FOUND, "group_not_found", 0, &request_id);
        }
        Err(e) => {
            warn!(group = %group_name, error = %e, "group lookup failed");
            return proxy_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", 0, &request_id);
        }
    };

    let Some(adapter) = crate::channel::adapter_for(&route.group.channel_type) else {
        warn!(group = %group_name, channel = %route.group.channel_type, "unregistered channel");
        return proxy_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", 0, &request_id);
    };

    let (parts, body) = request.into_parts();
    let query_pairs: Vec<(String, String)> = parts
        .uri
        .query()
        .map(|q| {
            form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();
    let query_map: HashMap<String, String> = query_pairs.iter().cloned().collect();

    // Proxy credential check, on the group the client addressed.
    let credential = adapter.extract_credential(&parts.headers, &query_map);
    let authorized = credential
        .as_deref()
        .map(|c| route.authorize(c))
        .unwrap_or(false);
    if !authorized {
        counter!("proxy_auth_failures_total").increment(1);
        return proxy_error(StatusCode::UNAUTHORIZED, "invalid_proxy_key", 0, &request_id);
    }

    // Aggregate groups dispatch to a weighted child; limits and accounting
    // then apply to the resolved standard group.
    let (serving_route, adapter) = if route.is_aggregate() {
        let child = match server.groups.pick_child(&route).await {
            Ok(child) => child,
            Err(AppError::NoChildGroupAvailable(_)) => {
                return proxy_error(StatusCode::NOT_FOUND, "no_child_group_available", 0, &request_id);
            }
            Err(e) => {
                warn!(group = %group_name, error = %e, "child resolution failed");
                return proxy_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", 0, &request_id);
            }
        };
        let Some(child_adapter) = crate::channel::adapter_for(&child.group.channel_type) else {
            return proxy_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", 0, &request_id);
        };
        (child, child_adapter)
    } else {
        (route, adapter)
    };

    match server.limiter.check(&serving_route).await {
        Ok(None) => {}
        Ok(Some(denial)) => {
            counter!("proxy_rate_limited_total").increment(1);
            debug!(group = %serving_route.name(), reason = denial.reason, "request denied by rate limit");
            return denial_response(&denial, &request_id);
        }
        Err(e) => {
            warn!(group = %serving_route.name(), error = %e, "rate limit check failed");
            return proxy_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", 0, &request_id);
        }
    }

    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return proxy_error(StatusCode::PAYLOAD_TOO_LARGE, "request_body_too_large", 0, &request_id);
        }
    };

    let parsed_body: Option<serde_json::Value> = if body_bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(&body_bytes).ok()
    };
    let is_stream = adapter.is_stream(parsed_body.as_ref(), &parts.headers, &subpath);

    let transformed = match transform::transform_body(&body_bytes, &serving_route) {
        Ok(t) => t,
        Err(AppError::ModelNotAllowed(model)) => {
            debug!(group = %serving_route.name(), model, "model rejected by redirect rules");
            return proxy_error(StatusCode::BAD_REQUEST, "model_not_allowed", 0, &request_id);
        }
        Err(e) => {
            warn!(error = %e, "body transform failed");
            return proxy_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", 0, &request_id);
        }
    };

    let ctx = RequestContext {
        request_id,
        method: parts.method,
        headers: parts.headers,
        subpath,
        query_pairs,
        start: Instant::now(),
    };
    run_attempts(
        server,
        serving_route,
        adapter,
        ctx,
        transformed.bytes,
        transformed.model.unwrap_or_default(),
        is_stream,
    )
    .await
}

/// What one upstream attempt produced.
enum Attempt {
    /// 2xx: relay and stop.
    Success(Response),
    /// Permanent, non-attributable: relay the provider diagnostic.
    RelayVerbatim {
        response: Response,
        status: u16,
        error: String,
    },
    /// Transient or key-attributable: rotate and try again.
    Retry { status: Option<u16>, error: String },
}

#[allow(clippy::too_many_arguments)]
async fn run_attempts(
    server: Server,
    route: Arc<GroupRoute>,
    adapter: Arc<dyn ChannelAdapter>,
    ctx: RequestContext,
    body: Bytes,
    model: String,
    is_stream: bool,
) -> Response {
    let effective = route.effective(&server.settings.snapshot());
    let attempts = effective.max_retries + 1;

    let mut last_error = String::new();
    let mut last_status: Option<u16> = None;
    let mut last_key_hash = String::new();
    let mut last_key_encrypted = String::new();
    let mut last_upstream = String::new();

    for attempt in 0..attempts {
        let upstream = match GroupManager::select_upstream(&route) {
            Ok(u) => u,
            Err(e) => {
                warn!(group = %route.name(), error = %e, "no upstream eligible");
                return proxy_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    attempt,
                    &ctx.request_id,
                );
            }
        };

        let key = match server.pool.acquire(route.id()).await {
            Ok(key) => key,
            Err(AppError::NoActiveKey(_)) => {
                counter!("proxy_pool_exhausted_total").increment(1);
                record_outcome(
                    &server, &route, &ctx, &model, is_stream, attempt,
                    &last_upstream, "", "",
                    StatusCode::SERVICE_UNAVAILABLE.as_u16() as i32,
                    Some("no_active_key".to_string()),
                );
                return proxy_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "no_active_key",
                    attempt,
                    &ctx.request_id,
                );
            }
            Err(e) => {
                warn!(group = %route.name(), error = %e, "key acquisition failed");
                return proxy_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    attempt,
                    &ctx.request_id,
                );
            }
        };

        last_upstream = upstream.url.clone();
        last_key_hash = key.key_hash.clone();
        last_key_encrypted = server.crypto.encrypt(&key.key_value).unwrap_or_default();

        let outcome = forward_once(
            &server, &route, adapter.as_ref(), &ctx, &upstream.url, &key, &last_key_encrypted,
            &body, &model, is_stream, &effective, attempt,
        )
        .await;

        match outcome {
            Attempt::Success(response) => return response,
            Attempt::RelayVerbatim {
                response,
                status,
                error,
            } => {
                record_outcome(
                    &server, &route, &ctx, &model, is_stream, attempt,
                    &last_upstream, &last_key_hash, &last_key_encrypted,
                    status as i32, Some(error),
                );
                return response;
            }
            Attempt::Retry { status, error } => {
                debug!(
                    group = %route.name(),
                    attempt,
                    status,
                    error = %error,
                    "attempt failed, rotating"
                );
                last_status = status;
                last_error = error;
            }
        }
    }

    counter!("proxy_retries_exhausted_total").increment(1);
    let retries = attempts - 1;
    record_outcome(
        &server, &route, &ctx, &model, is_stream, retries,
        &last_upstream, &last_key_hash, &last_key_encrypted,
        StatusCode::BAD_GATEWAY.as_u16() as i32,
        Some(match last_status {
            Some(s) => format!("retries exhausted, last upstream status {s}: {last_error}"),
            None => format!("retries exhausted: {last_error}"),
        }),
    );
    proxy_error(
        StatusCode::BAD_GATEWAY,
        "upstream_unavailable",
        retries,
        &ctx.request_id,
    )
}

#[allow(clippy::too_many_arguments)]
async fn forward_once(
    server: &Server,
    route: &Arc<GroupRoute>,
    adapter: &dyn ChannelAdapter,
    ctx: &RequestContext,
    upstream_url: &str,
    key: &KeyHandle,
    key_encrypted: &str,
    body: &Bytes,
    model: &str,
    is_stream: bool,
    effective: &crate::group::EffectiveConfig,
    retries_so_far: u32,
) -> Attempt {
    let url = adapter.upstream_url(upstream_url, &ctx.subpath, &ctx.query_pairs, &key.key_value);

    let mut headers = transform::forwardable_headers(&ctx.headers);
    adapter.apply_auth(&mut headers, &key.key_value);
    transform::apply_header_rules(&mut headers, &route.header_rules);

    let request = server
        .http_client
        .request(ctx.method.clone(), url)
        .headers(headers)
        .body(body.clone());

    // Streaming gets a header deadline only; full relays are bounded end to
    // end by the upstream timeout.
    let header_deadline = Duration::from_secs(if is_stream {
        effective.response_header_timeout_seconds
    } else {
        effective.upstream_timeout_seconds
    });

    let response = match tokio::time::timeout(header_deadline, request.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            report_failure(server, route, key, FailureKind::Transient, effective, &e.to_string())
                .await;
            return Attempt::Retry {
                status: None,
                error: format!("request error: {e}"),
            };
        }
        Err(_) => {
            report_failure(server, route, key, FailureKind::Transient, effective, "upstream timeout")
                .await;
            return Attempt::Retry {
                status: None,
                error: "upstream timeout".to_string(),
            };
        }
    };

    let status = response.status();
    match classify_status(status) {
        None => {
            server.pool.report_success(key).await;
            if is_stream {
                Attempt::Success(relay::stream_response(
                    server, route, ctx, response, model, key, upstream_url, retries_so_far,
                ))
            } else {
                match relay_buffered(response, effective).await {
                    Ok(resp) => {
                        record_outcome(
                            server, route, ctx, model, false, retries_so_far,
                            upstream_url, &key.key_hash, key_encrypted,
                            status.as_u16() as i32, None,
                        );
                        Attempt::Success(resp)
                    }
                    Err(error) => {
                        // Body read failed after a 2xx: nothing has reached
                        // the client yet, so this attempt can be retried.
                        report_failure(server, route, key, FailureKind::Transient, effective, &error)
                            .await;
                        Attempt::Retry {
                            status: Some(status.as_u16()),
                            error,
                        }
                    }
                }
            }
        }
        Some(kind @ (FailureKind::Transient | FailureKind::KeyAttributable)) => {
            let error = format!("upstream returned {status}");
            report_failure(server, route, key, kind, effective, &error).await;
            Attempt::Retry {
                status: Some(status.as_u16()),
                error,
            }
        }
        Some(FailureKind::Permanent) => {
            let error = format!("upstream returned {status}");
            report_failure(server, route, key, FailureKind::Permanent, effective, &error).await;
            match relay_buffered(response, effective).await {
                Ok(resp) => Attempt::RelayVerbatim {
                    response: resp,
                    status: status.as_u16(),
                    error,
                },
                Err(read_error) => Attempt::Retry {
                    status: Some(status.as_u16()),
                    error: read_error,
                },
            }
        }
    }
}

async fn report_failure(
    server: &Server,
    route: &Arc<GroupRoute>,
    key: &KeyHandle,
    kind: FailureKind,
    effective: &crate::group::EffectiveConfig,
    error: &str,
) {
    if let Err(e) = server
        .pool
        .report_failure(key, kind, effective.blacklist_threshold, error)
        .await
    {
        warn!(key_id = key.id, group = %route.name(), error = %e, "failure accounting error");
    }
}

/// Read the whole upstream body and mirror status, headers and bytes.
async fn relay_buffered(
    response: reqwest::Response,
    effective: &crate::group::EffectiveConfig,
) -> Result<Response, String> {
    let status = response.status();
    let headers = transform::relayable_response_headers(response.headers());

    let body = tokio::time::timeout(
        Duration::from_secs(effective.upstream_timeout_seconds),
        response.bytes(),
    )
    .await
    .map_err(|_| "upstream body read timeout".to_string())?
    .map_err(|e| format!("upstream body read error: {e}"))?;

    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder
        .body(Body::from(body))
        .map_err(|e| format!("response build error: {e}"))
}

/// Hand the final per-request record to the log pipeline (never blocks).
#[allow(clippy::too_many_arguments)]
fn record_outcome(
    server: &Server,
    route: &Arc<GroupRoute>,
    ctx: &RequestContext,
    model: &str,
    is_stream: bool,
    retries: u32,
    upstream_url: &str,
    key_hash: &str,
    key_encrypted: &str,
    status_code: i32,
    error_message: Option<String>,
) {
    server.logs.record(RequestLogRecord {
        id: ctx.request_id.clone(),
        timestamp: Utc::now(),
        group_id: route.id(),
        group_name: route.name().to_string(),
        upstream_url: upstream_url.to_string(),
        key_hash: key_hash.to_string(),
        key_value_encrypted: key_encrypted.to_string(),
        model: model.to_string(),
        status_code,
        duration_ms: ctx.start.elapsed().as_millis() as i64,
        is_stream,
        retries: retries as i32,
        error_message,
    });
}
