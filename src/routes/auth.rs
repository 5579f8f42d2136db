use super::ok;
use crate::crypto::constant_time_eq;
use crate::error::AppError;
use crate::server::Server;
use axum::{
    Json,
    extract::{ConnectInfo, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Per-process login lockout. Called only on the low-frequency admin
/// surface, so one mutex is plenty.
pub struct LoginLimiter {
    attempts: Mutex<HashMap<IpAddr, Failures>>,
    max_attempts: u32,
    lockout: Duration,
}

struct Failures {
    count: u32,
    locked_until: Option<Instant>,
}

impl LoginLimiter {
    pub fn new(max_attempts: u32, lockout: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
            lockout,
        }
    }

    /// Remaining lockout, if this address is currently locked out.
    pub fn locked(&self, ip: IpAddr) -> Option<Duration> {
        let mut attempts = self.attempts.lock().unwrap();
        if let Some(failures) = attempts.get_mut(&ip) {
            if let Some(until) = failures.locked_until {
                let now = Instant::now();
                if until > now {
                    return Some(until - now);
                }
                attempts.remove(&ip);
            }
        }
        None
    }

    pub fn record_failure(&self, ip: IpAddr) {
        let mut attempts = self.attempts.lock().unwrap();
        let failures = attempts.entry(ip).or_insert(Failures {
            count: 0,
            locked_until: None,
        });
        failures.count += 1;
        if failures.count >= self.max_attempts {
            failures.locked_until = Some(Instant::now() + self.lockout);
            warn!(%ip, attempts = failures.count, "login locked out");
        }
    }

    pub fn reset(&self, ip: IpAddr) {
        self.attempts.lock().unwrap().remove(&ip);
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub auth_key: String,
}

pub async fn login(
    State(server): State<Server>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<LoginRequest>,
) -> Response {
    let ip = addr.ip();
    if let Some(remaining) = server.login_limiter.locked(ip) {
        return AppError::Unauthorized(format!(
            "too many failed attempts, retry in {}s",
            remaining.as_secs().max(1)
        ))
        .into_response();
    }

    if constant_time_eq(&payload.auth_key, &server.config.auth.auth_key) {
        server.login_limiter.reset(ip);
        ok(json!({"authenticated": true})).into_response()
    } else {
        server.login_limiter.record_failure(ip);
        AppError::Unauthorized("invalid credentials".into()).into_response()
    }
}
