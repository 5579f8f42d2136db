use super::ok;
use crate::database::LogQuery;
use crate::error::AppError;
use crate::server::Server;
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct LogQueryParams {
    pub group_name: Option<String>,
    pub key_hash: Option<String>,
    pub status_code: Option<i32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub page: Option<u64>,
    pub page_size: Option<u64>,
}

/// Log view: the encrypted key value is withheld, the hash is enough to
/// correlate with the key list.
#[derive(Debug, Serialize)]
pub struct LogView {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub group_name: String,
    pub upstream_url: String,
    pub key_hash: String,
    pub model: String,
    pub status_code: i32,
    pub duration_ms: i64,
    pub is_stream: bool,
    pub retries: i32,
    pub error_message: Option<String>,
}

pub async fn query_logs(
    State(server): State<Server>,
    Query(params): Query<LogQueryParams>,
) -> Result<Response, AppError> {
    let query = LogQuery {
        group_name: params.group_name.filter(|s| !s.is_empty()),
        key_hash: params.key_hash.filter(|s| !s.is_empty()),
        status_code: params.status_code,
        start_time: params.start_time,
        end_time: params.end_time,
        page: params.page.unwrap_or(1),
        page_size: params.page_size.unwrap_or(50),
    };

    let (rows, total) = server.db.request_logs().query(&query).await?;
    let items: Vec<LogView> = rows
        .into_iter()
        .map(|r| LogView {
            id: r.id,
            timestamp: r.timestamp,
            group_name: r.group_name,
            upstream_url: r.upstream_url,
            key_hash: r.key_hash,
            model: r.model,
            status_code: r.status_code,
            duration_ms: r.duration_ms,
            is_stream: r.is_stream,
            retries: r.retries,
            error_message: r.error_message,
        })
        .collect();

    Ok(ok(json!({
        "items": items,
        "total": total,
        "page": query.page,
        "page_size": query.page_size,
    }))
    .into_response())
}
