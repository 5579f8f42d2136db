use super::ok;
use crate::crypto::hash_key;
use crate::database::dao::ApiKeysDao;
use crate::error::AppError;
use crate::server::Server;
use axum::{
    Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct ImportKeysRequest {
    /// Newline/whitespace-separated key values.
    pub keys: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteKeysRequest {
    pub ids: Vec<i32>,
}

/// Key view without the (encrypted) value.
#[derive(Debug, Serialize)]
pub struct KeyView {
    pub id: i32,
    pub group_id: i32,
    pub key_hash: String,
    pub status: String,
    pub failure_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub async fn list_keys(
    State(server): State<Server>,
    Path(group_id): Path<i32>,
) -> Result<Response, AppError> {
    let keys = server.db.api_keys().list_by_group(group_id).await?;
    let views: Vec<KeyView> = keys
        .into_iter()
        .map(|k| KeyView {
            id: k.id,
            group_id: k.group_id,
            key_hash: k.key_hash,
            status: k.status,
            failure_count: k.failure_count,
            last_used_at: k.last_used_at,
            last_error: k.last_error,
            created_at: k.created_at,
        })
        .collect();
    Ok(ok(views).into_response())
}

pub async fn import_keys(
    State(server): State<Server>,
    Path(group_id): Path<i32>,
    Json(payload): Json<ImportKeysRequest>,
) -> Result<Response, AppError> {
    server
        .db
        .groups()
        .find_by_id(group_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("group #{group_id}")))?;

    let values: Vec<String> = payload
        .keys
        .split_whitespace()
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    if values.is_empty() {
        return Err(AppError::Validation("no keys provided".into()));
    }

    let mut rows = Vec::with_capacity(values.len());
    let mut by_hash: HashMap<String, String> = HashMap::new();
    for value in &values {
        let encrypted = server
            .crypto
            .encrypt(value)
            .map_err(|e| AppError::Internal(format!("encryption failed: {e}")))?;
        let hash = hash_key(value);
        by_hash.insert(hash.clone(), value.clone());
        rows.push((encrypted, hash));
    }

    let inserted = server.db.api_keys().insert_keys(group_id, &rows).await?;
    let plaintexts: HashMap<i32, String> = inserted
        .iter()
        .filter_map(|k| by_hash.get(&k.key_hash).map(|v| (k.id, v.clone())))
        .collect();
    server.pool.add_keys(&inserted, &plaintexts).await?;

    Ok(ok(json!({
        "added": inserted.len(),
        "skipped": values.len() - inserted.len(),
    }))
    .into_response())
}

pub async fn delete_keys(
    State(server): State<Server>,
    Path(group_id): Path<i32>,
    Json(payload): Json<DeleteKeysRequest>,
) -> Result<Response, AppError> {
    let keys = server.db.api_keys().find_by_ids(&payload.ids).await?;
    let ids: Vec<i32> = keys
        .iter()
        .filter(|k| k.group_id == group_id)
        .map(|k| k.id)
        .collect();

    let txn = server.db.begin().await?;
    let deleted = ApiKeysDao::delete_by_ids(&txn, &ids).await?;
    if let Err(e) = server.pool.remove_keys(group_id, &ids).await {
        let _ = txn.rollback().await;
        return Err(e);
    }
    txn.commit()
        .await
        .map_err(crate::database::DatabaseError::from)?;

    Ok(ok(json!({"deleted": deleted})).into_response())
}
