mod common;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode, header},
};
use common::*;
use serde_json::json;
use std::net::SocketAddr;
use tower::ServiceExt;

fn admin_request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(uri)
        .method(method)
        .header(header::AUTHORIZATION, "Bearer admin-key");
    if body.is_some() {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }
    builder
        .body(match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        })
        .unwrap()
}

fn login_request(auth_key: &str, from: &str) -> Request<Body> {
    let mut request = Request::builder()
        .uri("/api/auth/login")
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"auth_key": auth_key}).to_string()))
        .unwrap();
    let addr: SocketAddr = format!("{from}:40000").parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

#[tokio::test]
async fn test_login_and_lockout() {
    let server = test_server().await;
    let app = server.create_app();

    let response = app.clone().oneshot(login_request("admin-key", "10.1.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["data"]["authenticated"], true);

    // Three failures lock the address out; the right key no longer helps.
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(login_request("wrong", "10.1.0.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    let response = app
        .clone()
        .oneshot(login_request("admin-key", "10.1.0.2"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // A different address is unaffected.
    let response = app.oneshot(login_request("admin-key", "10.1.0.3")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_routes_require_bearer() {
    let server = test_server().await;
    let app = server.create_app();

    let request = Request::builder()
        .uri("/api/groups")
        .method("GET")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/groups")
        .method("GET")
        .header(header::AUTHORIZATION, "Bearer not-the-key")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_group_crud_flow() {
    let server = test_server().await;
    let app = server.create_app();

    // Invalid payloads are rejected with 400s.
    for payload in [
        json!({"name": "Bad Name", "channel_type": "openai", "test_model": "m",
               "upstreams": [{"url": "https://u", "weight": 1}]}),
        json!({"name": "g1", "channel_type": "cohere", "test_model": "m",
               "upstreams": [{"url": "https://u", "weight": 1}]}),
        json!({"name": "g1", "channel_type": "openai",
               "upstreams": [{"url": "https://u", "weight": 1}]}),
        json!({"name": "g1", "channel_type": "openai", "test_model": "m",
               "upstreams": [{"url": "https://u", "weight": 0}]}),
        json!({"name": "g1", "channel_type": "openai", "test_model": "m",
               "upstreams": [{"url": "ftp://u", "weight": 1}]}),
    ] {
        let response = app
            .clone()
            .oneshot(admin_request("POST", "/api/groups", Some(payload)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // A valid create round-trips.
    let response = app
        .clone()
        .oneshot(admin_request(
            "POST",
            "/api/groups",
            Some(json!({
                "name": "g1",
                "channel_type": "openai",
                "test_model": "gpt-4o-mini",
                "upstreams": [{"url": "https://api.openai.com", "weight": 1}],
                "proxy_keys": "proxy-123",
                "config": {"max_retries": 1, "max_requests_per_hour": 100},
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await;
    let group_id = body["data"]["id"].as_i64().unwrap();
    assert_eq!(body["data"]["name"], "g1");

    // Unknown config fields are rejected by the typed override bag.
    let response = app
        .clone()
        .oneshot(admin_request(
            "PUT",
            &format!("/api/groups/{group_id}"),
            Some(json!({"config": {"no_such_option": 1}})),
        ))
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::OK);

    // Update and list.
    let response = app
        .clone()
        .oneshot(admin_request(
            "PUT",
            &format!("/api/groups/{group_id}"),
            Some(json!({"description": "primary pool", "sort": 5})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(admin_request("GET", "/api/groups", None))
        .await
        .unwrap();
    let body = body_json(response.into_body()).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["description"], "primary pool");

    // Delete removes the group and its keys.
    let response = app
        .clone()
        .oneshot(admin_request(
            "POST",
            &format!("/api/groups/{group_id}/keys"),
            Some(json!({"keys": "sk-AAA\nsk-BBB"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(admin_request("DELETE", &format!("/api/groups/{group_id}"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let remaining = server.db.api_keys().list_by_group(group_id as i32).await.unwrap();
    assert!(remaining.is_empty());
    let response = app
        .oneshot(admin_request("GET", "/api/groups", None))
        .await
        .unwrap();
    let body = body_json(response.into_body()).await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_key_import_dedup_and_delete() {
    let server = test_server().await;
    let mock = spawn_mock_upstream().await;
    let group = create_group(
        &server,
        "g1",
        "openai",
        "standard",
        json!([{"url": mock.url, "weight": 1}]),
        "proxy-123",
        json!({}),
        json!({}),
    )
    .await;

    let app = server.create_app();
    let response = app
        .clone()
        .oneshot(admin_request(
            "POST",
            &format!("/api/groups/{}/keys", group.id),
            Some(json!({"keys": "sk-AAA sk-BBB\nsk-AAA"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["data"]["added"], 2);
    assert_eq!(body["data"]["skipped"], 1);

    // Re-import skips everything.
    let response = app
        .clone()
        .oneshot(admin_request(
            "POST",
            &format!("/api/groups/{}/keys", group.id),
            Some(json!({"keys": "sk-AAA\nsk-BBB"})),
        ))
        .await
        .unwrap();
    let body = body_json(response.into_body()).await;
    assert_eq!(body["data"]["added"], 0);
    assert_eq!(body["data"]["skipped"], 2);

    // Keys are listed without values and acquirable by the pool.
    let response = app
        .clone()
        .oneshot(admin_request("GET", &format!("/api/groups/{}/keys", group.id), None))
        .await
        .unwrap();
    let body = body_json(response.into_body()).await;
    let items = body["data"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items[0].get("key_value").is_none());
    let first_id = items[0]["id"].as_i64().unwrap() as i32;
    assert!(server.pool.acquire(group.id).await.is_ok());

    // Delete one key: it leaves both the table and the rotation.
    let response = app
        .clone()
        .oneshot(admin_request(
            "DELETE",
            &format!("/api/groups/{}/keys", group.id),
            Some(json!({"ids": [first_id]})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.db.api_keys().list_by_group(group.id).await.unwrap().len(), 1);
    assert_eq!(server.pool.active_len(group.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_log_query_filters() {
    let server = test_server().await;
    let mock = spawn_mock_upstream().await;
    mock.push(MockResponse::status(500));

    let group = create_group(
        &server,
        "g1",
        "openai",
        "standard",
        json!([{"url": mock.url, "weight": 1}]),
        "proxy-123",
        json!({"max_retries": 0}),
        json!({}),
    )
    .await;
    add_key(&server, group.id, "sk-AAA").await;

    let app = server.create_app();
    // One failed (500 -> retries exhausted -> 502) and one OK request.
    for _ in 0..2 {
        let request = Request::builder()
            .uri("/proxy/g1/v1/chat/completions")
            .method("POST")
            .header(header::AUTHORIZATION, "Bearer proxy-123")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"model": "m"}).to_string()))
            .unwrap();
        app.clone().oneshot(request).await.unwrap();
    }
    server.logs.flush_once().await.unwrap();

    let response = app
        .clone()
        .oneshot(admin_request("GET", "/api/logs?page=1&page_size=10", None))
        .await
        .unwrap();
    let body = body_json(response.into_body()).await;
    assert_eq!(body["data"]["total"], 2);

    let response = app
        .clone()
        .oneshot(admin_request("GET", "/api/logs?status_code=502", None))
        .await
        .unwrap();
    let body = body_json(response.into_body()).await;
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["items"][0]["status_code"], 502);

    // LIKE wildcards in the filter are escaped, not interpreted.
    let response = app
        .clone()
        .oneshot(admin_request("GET", "/api/logs?group_name=%25", None))
        .await
        .unwrap();
    let body = body_json(response.into_body()).await;
    assert_eq!(body["data"]["total"], 0);

    let response = app
        .oneshot(admin_request("GET", "/api/logs?group_name=g1", None))
        .await
        .unwrap();
    let body = body_json(response.into_body()).await;
    assert_eq!(body["data"]["total"], 2);
}

#[tokio::test]
async fn test_group_stats_endpoint() {
    let server = test_server().await;
    let mock = spawn_mock_upstream().await;
    let group = create_group(
        &server,
        "g1",
        "openai",
        "standard",
        json!([{"url": mock.url, "weight": 1}]),
        "proxy-123",
        json!({}),
        json!({}),
    )
    .await;
    add_key(&server, group.id, "sk-AAA").await;

    let hour = keygate::database::dao::hour_bucket(chrono::Utc::now());
    server.db.stats().add_hourly(group.id, hour, 9, 1).await.unwrap();

    let app = server.create_app();
    let response = app
        .oneshot(admin_request("GET", &format!("/api/groups/{}/stats", group.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["data"]["key_stats"]["total_keys"], 1);
    assert_eq!(body["data"]["key_stats"]["active_keys"], 1);
    assert_eq!(body["data"]["stats_24_hour"]["total_requests"], 10);
    assert_eq!(body["data"]["stats_24_hour"]["failed_requests"], 1);
    assert_eq!(body["data"]["stats_24_hour"]["failure_rate"], 0.1);
}
