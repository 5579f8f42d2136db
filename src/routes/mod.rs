//! Administrative JSON API consumed by the web UI.
//!
//! All responses use the uniform `{code, message, data}` envelope. Every
//! route except login requires `Authorization: Bearer <AUTH_KEY>`,
//! compared in constant time.

mod auth;
mod groups;
mod keys;
mod logs;

use crate::crypto::constant_time_eq;
use crate::server::Server;
use axum::{
    Json, Router,
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::Serialize;

pub use auth::LoginLimiter;

/// Uniform admin response envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: u16,
    pub message: String,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        code: 0,
        message: "success".to_string(),
        data,
    })
}

/// Routes reachable without a session.
pub fn public_admin_routes() -> Router<Server> {
    Router::new().route("/auth/login", post(auth::login))
}

/// Routes behind the admin bearer check.
pub fn protected_admin_routes() -> Router<Server> {
    Router::new()
        .route("/groups", get(groups::list_groups))
        .route("/groups", post(groups::create_group))
        .route("/groups/{id}", put(groups::update_group))
        .route("/groups/{id}", delete(groups::delete_group))
        .route("/groups/{id}/stats", get(groups::group_stats))
        .route("/groups/{id}/keys", get(keys::list_keys))
        .route("/groups/{id}/keys", post(keys::import_keys))
        .route("/groups/{id}/keys", delete(keys::delete_keys))
        .route("/logs", get(logs::query_logs))
        .route("/channels", get(groups::list_channels))
        .route("/settings", get(system_settings))
}

/// Current system defaults after database overrides.
async fn system_settings(State(server): State<Server>) -> Response {
    ok(server.settings.snapshot().as_ref().clone()).into_response()
}

/// Bearer check against the configured admin key.
pub async fn admin_auth(State(server): State<Server>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if constant_time_eq(token, &server.config.auth.auth_key) => {
            next.run(req).await
        }
        _ => crate::error::AppError::Unauthorized("invalid admin credentials".into())
            .into_response(),
    }
}
