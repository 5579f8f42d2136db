//! Shared fixtures: an in-memory server and a scriptable mock upstream.
#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use keygate::database::entities::{api_keys, groups};
use keygate::{Config, Server};
use sea_orm::{ActiveModelTrait, ActiveValue::Set};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub async fn test_server() -> Server {
    let mut config = Config::default();
    config.auth.auth_key = "admin-key".into();
    config.auth.max_failed_login_attempts = 3;
    config.encryption.key = "integration-test-secret".into();
    config.database.url = "sqlite::memory:".into();
    config.log_pipeline.flush_interval_ms = 20;

    let server = Server::new(config).await.expect("server init");
    server.db.migrate().await.expect("migrations");
    server
}

/// Insert a group row directly; tests that exercise the admin API create
/// groups through it instead.
#[allow(clippy::too_many_arguments)]
pub async fn create_group(
    server: &Server,
    name: &str,
    channel_type: &str,
    group_type: &str,
    upstreams: serde_json::Value,
    proxy_keys: &str,
    config: serde_json::Value,
    extra: serde_json::Value,
) -> groups::Model {
    let now = Utc::now();
    let redirects = extra
        .get("model_redirect_rules")
        .cloned()
        .unwrap_or(json!({}));
    let strict = extra
        .get("model_redirect_strict")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let overrides = extra.get("param_overrides").cloned().unwrap_or(json!({}));

    groups::ActiveModel {
        name: Set(name.to_string()),
        display_name: Set(String::new()),
        description: Set(String::new()),
        group_type: Set(group_type.to_string()),
        channel_type: Set(channel_type.to_string()),
        upstreams: Set(upstreams),
        test_model: Set(if group_type == "aggregate" {
            "-".to_string()
        } else {
            "gpt-4o-mini".to_string()
        }),
        validation_endpoint: Set(String::new()),
        param_overrides: Set(overrides),
        model_redirect_rules: Set(redirects),
        model_redirect_strict: Set(strict),
        header_rules: Set(json!([])),
        proxy_keys: Set(proxy_keys.to_string()),
        config: Set(config),
        sort: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(&server.db.connection)
    .await
    .expect("insert group")
}

pub async fn add_sub_group(server: &Server, parent_id: i32, child_id: i32, weight: i32) {
    keygate::database::entities::group_sub_groups::ActiveModel {
        group_id: Set(parent_id),
        sub_group_id: Set(child_id),
        weight: Set(weight),
        ..Default::default()
    }
    .insert(&server.db.connection)
    .await
    .expect("insert sub group");
}

/// Insert a provider key and register it with the pool.
pub async fn add_key(server: &Server, group_id: i32, value: &str) -> api_keys::Model {
    let model = api_keys::ActiveModel {
        group_id: Set(group_id),
        key_value: Set(server.crypto.encrypt(value).unwrap()),
        key_hash: Set(keygate::crypto::hash_key(value)),
        status: Set("active".to_string()),
        failure_count: Set(0),
        last_used_at: Set(None),
        last_error: Set(None),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(&server.db.connection)
    .await
    .expect("insert key");

    let mut plaintexts = HashMap::new();
    plaintexts.insert(model.id, value.to_string());
    server
        .pool
        .add_keys(std::slice::from_ref(&model), &plaintexts)
        .await
        .expect("pool add");
    model
}

/// One scripted upstream response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
    pub content_type: &'static str,
}

impl MockResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: json!({"error": {"message": "scripted"}}).to_string(),
            content_type: "application/json",
        }
    }

    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            status: 200,
            body: body.to_string(),
            content_type: "application/json",
        }
    }

    pub fn sse(body: &str) -> Self {
        Self {
            status: 200,
            body: body.to_string(),
            content_type: "text/event-stream",
        }
    }
}

/// A request observed by the mock upstream.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub x_api_key: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Clone, Default)]
struct MockState {
    hits: Arc<Mutex<Vec<CapturedRequest>>>,
    script: Arc<Mutex<VecDeque<MockResponse>>>,
}

pub struct MockUpstream {
    pub url: String,
    hits: Arc<Mutex<Vec<CapturedRequest>>>,
    script: Arc<Mutex<VecDeque<MockResponse>>>,
}

impl MockUpstream {
    pub fn push(&self, response: MockResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn hits(&self) -> Vec<CapturedRequest> {
        self.hits.lock().unwrap().clone()
    }

    pub fn hit_count(&self) -> usize {
        self.hits.lock().unwrap().len()
    }
}

async fn mock_handler(State(state): State<MockState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, 1024 * 1024).await.unwrap_or_default();
    let captured = CapturedRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        authorization: parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        x_api_key: parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
    };
    state.hits.lock().unwrap().push(captured);

    let scripted = state.script.lock().unwrap().pop_front();
    match scripted {
        Some(response) => (
            StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            [(header::CONTENT_TYPE, response.content_type)],
            response.body,
        )
            .into_response(),
        None => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            json!({"ok": true}).to_string(),
        )
            .into_response(),
    }
}

/// Bind a throwaway upstream on a random local port.
pub async fn spawn_mock_upstream() -> MockUpstream {
    let state = MockState::default();
    let hits = state.hits.clone();
    let script = state.script.clone();

    let app: Router = Router::new().fallback(mock_handler).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockUpstream {
        url: format!("http://{addr}"),
        hits,
        script,
    }
}

/// Convenience body reader.
pub async fn body_json(body: Body) -> serde_json::Value {
    let bytes = axum::body::to_bytes(body, 10 * 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

pub async fn body_bytes(body: Body) -> Vec<u8> {
    axum::body::to_bytes(body, 10 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}
