use super::ok;
use crate::channel::channel_names;
use crate::database::dao::{GroupsDao, hour_bucket};
use crate::database::entities::groups::{self, GROUP_TYPE_AGGREGATE, GROUP_TYPE_STANDARD};
use crate::error::AppError;
use crate::group::{
    GroupConfig, HeaderRule, Upstream, is_valid_group_name, is_valid_validation_endpoint,
    normalize_header_rules,
};
use crate::server::Server;
use axum::{
    Json,
    extract::{Path, State},
    response::Response,
};
use chrono::{Duration, Utc};
use sea_orm::ActiveValue::Set;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct SubGroupInput {
    pub sub_group_id: i32,
    pub weight: i32,
}

#[derive(Debug, Deserialize)]
pub struct GroupPayload {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub group_type: Option<String>,
    pub channel_type: Option<String>,
    pub upstreams: Option<Vec<Upstream>>,
    pub test_model: Option<String>,
    pub validation_endpoint: Option<String>,
    pub param_overrides: Option<serde_json::Map<String, serde_json::Value>>,
    pub model_redirect_rules: Option<HashMap<String, String>>,
    pub model_redirect_strict: Option<bool>,
    pub header_rules: Option<Vec<HeaderRule>>,
    pub proxy_keys: Option<String>,
    pub config: Option<GroupConfig>,
    pub sort: Option<i32>,
    pub sub_groups: Option<Vec<SubGroupInput>>,
}

fn validate_upstreams(upstreams: &[Upstream]) -> Result<(), AppError> {
    if upstreams.is_empty() {
        return Err(AppError::Validation("at least one upstream is required".into()));
    }
    let mut any_active = false;
    for upstream in upstreams {
        let url = upstream.url.trim();
        if url.is_empty() {
            return Err(AppError::Validation("upstream URL cannot be empty".into()));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(AppError::Validation(format!("invalid upstream URL: {url}")));
        }
        if upstream.weight > 0 {
            any_active = true;
        }
    }
    if !any_active {
        return Err(AppError::Validation(
            "at least one upstream must have a weight greater than 0".into(),
        ));
    }
    Ok(())
}

fn validate_model_redirects(rules: &HashMap<String, String>) -> Result<(), AppError> {
    for (source, target) in rules {
        if source.trim().is_empty() || target.trim().is_empty() {
            return Err(AppError::Validation("model name cannot be empty".into()));
        }
    }
    Ok(())
}

async fn validate_sub_groups(
    server: &Server,
    edges: &[SubGroupInput],
) -> Result<Vec<(i32, i32)>, AppError> {
    let mut validated = Vec::with_capacity(edges.len());
    for edge in edges {
        if edge.weight < 0 {
            return Err(AppError::Validation("sub-group weight must be >= 0".into()));
        }
        let child = server
            .db
            .groups()
            .find_by_id(edge.sub_group_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("sub-group #{}", edge.sub_group_id)))?;
        if child.is_aggregate() {
            return Err(AppError::Validation(format!(
                "group {} is aggregate and cannot be a sub-group",
                child.name
            )));
        }
        validated.push((edge.sub_group_id, edge.weight));
    }
    Ok(validated)
}

pub async fn list_channels(State(_server): State<Server>) -> Response {
    use axum::response::IntoResponse;
    ok(channel_names()).into_response()
}

pub async fn list_groups(State(server): State<Server>) -> Result<Response, AppError> {
    use axum::response::IntoResponse;
    let groups = server.db.groups().list().await?;
    Ok(ok(groups).into_response())
}

pub async fn create_group(
    State(server): State<Server>,
    Json(payload): Json<GroupPayload>,
) -> Result<Response, AppError> {
    use axum::response::IntoResponse;

    let name = payload.name.as_deref().unwrap_or("").trim().to_string();
    if !is_valid_group_name(&name) {
        return Err(AppError::Validation(
            "group name must match ^[a-z0-9_-]{1,100}$".into(),
        ));
    }

    let channel_type = payload.channel_type.as_deref().unwrap_or("").trim().to_string();
    if !channel_names().contains(&channel_type.as_str()) {
        return Err(AppError::Validation(format!(
            "invalid channel type {channel_type}, supported: {}",
            channel_names().join(", ")
        )));
    }

    let group_type = payload
        .group_type
        .as_deref()
        .unwrap_or(GROUP_TYPE_STANDARD)
        .trim()
        .to_string();
    if group_type != GROUP_TYPE_STANDARD && group_type != GROUP_TYPE_AGGREGATE {
        return Err(AppError::Validation("invalid group type".into()));
    }

    let redirect_rules = payload.model_redirect_rules.unwrap_or_default();
    validate_model_redirects(&redirect_rules)?;

    let (upstreams, test_model, validation_endpoint, sub_groups) = match group_type.as_str() {
        GROUP_TYPE_AGGREGATE => {
            if !redirect_rules.is_empty() {
                return Err(AppError::Validation(
                    "aggregate groups cannot define model redirect rules".into(),
                ));
            }
            let edges = validate_sub_groups(&server, payload.sub_groups.as_deref().unwrap_or(&[]))
                .await?;
            (Vec::new(), "-".to_string(), String::new(), edges)
        }
        _ => {
            let test_model = payload.test_model.as_deref().unwrap_or("").trim().to_string();
            if test_model.is_empty() {
                return Err(AppError::Validation(
                    "test_model is required for standard groups".into(),
                ));
            }
            let upstreams = payload.upstreams.unwrap_or_default();
            validate_upstreams(&upstreams)?;
            let endpoint = payload
                .validation_endpoint
                .as_deref()
                .unwrap_or("")
                .trim()
                .to_string();
            if !is_valid_validation_endpoint(&endpoint) {
                return Err(AppError::Validation(
                    "validation_endpoint must be a path starting with /".into(),
                ));
            }
            (upstreams, test_model, endpoint, Vec::new())
        }
    };

    let config = payload.config.unwrap_or_default();
    config.validate().map_err(AppError::Validation)?;
    let header_rules =
        normalize_header_rules(payload.header_rules.as_deref().unwrap_or(&[]))
            .map_err(AppError::Validation)?;

    let now = Utc::now();
    let model = groups::ActiveModel {
        name: Set(name),
        display_name: Set(payload.display_name.unwrap_or_default().trim().to_string()),
        description: Set(payload.description.unwrap_or_default().trim().to_string()),
        group_type: Set(group_type),
        channel_type: Set(channel_type),
        upstreams: Set(serde_json::to_value(&upstreams).unwrap_or(json!([]))),
        test_model: Set(test_model),
        validation_endpoint: Set(validation_endpoint),
        param_overrides: Set(serde_json::Value::Object(
            payload.param_overrides.unwrap_or_default(),
        )),
        model_redirect_rules: Set(serde_json::to_value(&redirect_rules).unwrap_or(json!({}))),
        model_redirect_strict: Set(payload.model_redirect_strict.unwrap_or(false)),
        header_rules: Set(serde_json::to_value(&header_rules).unwrap_or(json!([]))),
        proxy_keys: Set(payload.proxy_keys.unwrap_or_default().trim().to_string()),
        config: Set(serde_json::to_value(&config).unwrap_or(json!({}))),
        sort: Set(payload.sort.unwrap_or(0)),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };

    let created = server.db.groups().insert(model).await?;
    if !sub_groups.is_empty() {
        GroupsDao::replace_sub_groups(&server.db.connection, created.id, &sub_groups).await?;
    }
    server.groups.invalidate().await;
    Ok(ok(created).into_response())
}

pub async fn update_group(
    State(server): State<Server>,
    Path(id): Path<i32>,
    Json(payload): Json<GroupPayload>,
) -> Result<Response, AppError> {
    use axum::response::IntoResponse;

    let existing = server
        .db
        .groups()
        .find_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("group #{id}")))?;
    let mut model: groups::ActiveModel = existing.clone().into();

    if let Some(ref name) = payload.name {
        let name = name.trim();
        if !is_valid_group_name(name) {
            return Err(AppError::Validation(
                "group name must match ^[a-z0-9_-]{1,100}$".into(),
            ));
        }
        model.name = Set(name.to_string());
    }
    if let Some(display_name) = payload.display_name {
        model.display_name = Set(display_name.trim().to_string());
    }
    if let Some(description) = payload.description {
        model.description = Set(description.trim().to_string());
    }

    // A group referenced by aggregates cannot change its dispatch identity.
    if existing.group_type != GROUP_TYPE_AGGREGATE
        && (payload.channel_type.is_some() || payload.validation_endpoint.is_some())
    {
        let referencing = server.db.groups().count_parents_using(id).await?;
        if referencing > 0 {
            let channel_changed = payload
                .channel_type
                .as_deref()
                .is_some_and(|c| c.trim() != existing.channel_type);
            let endpoint_changed = payload
                .validation_endpoint
                .as_deref()
                .is_some_and(|e| e.trim() != existing.validation_endpoint);
            if channel_changed || endpoint_changed {
                return Err(AppError::Validation(format!(
                    "group is referenced by {referencing} aggregate group(s) and cannot change channel or endpoint"
                )));
            }
        }
    }

    if let Some(ref channel_type) = payload.channel_type {
        let channel_type = channel_type.trim();
        if !channel_names().contains(&channel_type) {
            return Err(AppError::Validation(format!(
                "invalid channel type {channel_type}"
            )));
        }
        model.channel_type = Set(channel_type.to_string());
    }
    if let Some(upstreams) = payload.upstreams {
        if existing.group_type != GROUP_TYPE_AGGREGATE {
            validate_upstreams(&upstreams)?;
            model.upstreams = Set(serde_json::to_value(&upstreams).unwrap_or(json!([])));
        }
    }
    if let Some(ref test_model) = payload.test_model {
        let test_model = test_model.trim();
        if existing.group_type != GROUP_TYPE_AGGREGATE {
            if test_model.is_empty() {
                return Err(AppError::Validation("test_model cannot be empty".into()));
            }
            model.test_model = Set(test_model.to_string());
        }
    }
    if let Some(ref endpoint) = payload.validation_endpoint {
        let endpoint = endpoint.trim();
        if !is_valid_validation_endpoint(endpoint) {
            return Err(AppError::Validation(
                "validation_endpoint must be a path starting with /".into(),
            ));
        }
        model.validation_endpoint = Set(endpoint.to_string());
    }
    if let Some(param_overrides) = payload.param_overrides {
        model.param_overrides = Set(serde_json::Value::Object(param_overrides));
    }
    if let Some(ref rules) = payload.model_redirect_rules {
        if existing.group_type == GROUP_TYPE_AGGREGATE && !rules.is_empty() {
            return Err(AppError::Validation(
                "aggregate groups cannot define model redirect rules".into(),
            ));
        }
        validate_model_redirects(rules)?;
        model.model_redirect_rules = Set(serde_json::to_value(rules).unwrap_or(json!({})));
    }
    if let Some(strict) = payload.model_redirect_strict {
        model.model_redirect_strict = Set(strict);
    }
    if let Some(ref rules) = payload.header_rules {
        let normalized = normalize_header_rules(rules).map_err(AppError::Validation)?;
        model.header_rules = Set(serde_json::to_value(&normalized).unwrap_or(json!([])));
    }
    if let Some(proxy_keys) = payload.proxy_keys {
        model.proxy_keys = Set(proxy_keys.trim().to_string());
    }
    if let Some(ref config) = payload.config {
        config.validate().map_err(AppError::Validation)?;
        model.config = Set(serde_json::to_value(config).unwrap_or(json!({})));
    }
    if let Some(sort) = payload.sort {
        model.sort = Set(sort);
    }
    model.updated_at = Set(Utc::now());

    let updated = server.db.groups().update(model).await?;

    if let Some(ref edges) = payload.sub_groups {
        if existing.group_type == GROUP_TYPE_AGGREGATE {
            let validated = validate_sub_groups(&server, edges).await?;
            GroupsDao::replace_sub_groups(&server.db.connection, id, &validated).await?;
        }
    }

    server.groups.invalidate().await;
    Ok(ok(updated).into_response())
}

pub async fn delete_group(
    State(server): State<Server>,
    Path(id): Path<i32>,
) -> Result<Response, AppError> {
    use axum::response::IntoResponse;

    let keys = server.db.api_keys().list_by_group(id).await?;
    let key_ids: Vec<i32> = keys.iter().map(|k| k.id).collect();

    let txn = server.db.begin().await?;
    GroupsDao::delete_cascade(&txn, id).await?;

    // KV removal is part of the delete's durability: a failure here rolls
    // the whole transaction back so no stale id survives.
    if let Err(e) = server.pool.remove_keys(id, &key_ids).await {
        let _ = txn.rollback().await;
        return Err(e);
    }
    txn.commit()
        .await
        .map_err(crate::database::DatabaseError::from)?;

    server.groups.invalidate().await;
    Ok(ok(json!({"deleted": true, "keys_removed": key_ids.len()})).into_response())
}

pub async fn group_stats(
    State(server): State<Server>,
    Path(id): Path<i32>,
) -> Result<Response, AppError> {
    use axum::response::IntoResponse;

    let route = server.groups.get_by_id(id).await?;
    let group_ids: Vec<i32> = if route.is_aggregate() {
        route.children.iter().map(|(id, _)| *id).collect()
    } else {
        vec![id]
    };

    let end = hour_bucket(Utc::now()) + Duration::hours(1);
    let (s24, f24) = server
        .db
        .stats()
        .hourly_totals(&group_ids, end - Duration::hours(24), end)
        .await?;
    let (s7d, f7d) = server
        .db
        .stats()
        .hourly_totals(&group_ids, end - Duration::days(7), end)
        .await?;

    let key_stats = if route.is_aggregate() {
        json!(null)
    } else {
        let (total, active) = server.db.api_keys().counts(id).await?;
        json!({
            "total_keys": total,
            "active_keys": active,
            "invalid_keys": total - active,
        })
    };

    let rate = |success: i64, failure: i64| {
        let total = success + failure;
        if total > 0 {
            (failure as f64 / total as f64 * 10_000.0).round() / 10_000.0
        } else {
            0.0
        }
    };

    Ok(ok(json!({
        "key_stats": key_stats,
        "stats_24_hour": {
            "total_requests": s24 + f24,
            "failed_requests": f24,
            "failure_rate": rate(s24, f24),
        },
        "stats_7_day": {
            "total_requests": s7d + f7d,
            "failed_requests": f7d,
            "failure_rate": rate(s7d, f7d),
        },
    }))
    .into_response())
}
