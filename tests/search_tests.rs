mod common;

use std::collections::HashMap;

use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use common::spawn;
use mcp_scan_rs::error::SearchError;
use mcp_scan_rs::search::{SearchClient, ShodanClient};
use serde_json::json;

const GOOD_KEY: &str = "good-key";

/// 105 matches for any query: a full first page and 5 on the second.
async fn host_search(Query(params): Query<HashMap<String, String>>) -> Response {
    if params.get("key").map(String::as_str) != Some(GOOD_KEY) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "Invalid API key"}))).into_response();
    }
    let query = params.get("query").cloned().unwrap_or_default();
    if query.contains("((") {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "Invalid query"}))).into_response();
    }
    if query == "flaky" {
        return StatusCode::BAD_GATEWAY.into_response();
    }
    let page: usize = params.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let range = match page {
        1 => 0..100,
        2 => 100..105,
        _ => 0..0,
    };
    let matches: Vec<_> = range
        .map(|i| {
            json!({
                "ip_str": format!("10.0.{}.{}", i / 256, i % 256),
                "port": 8000,
                "hostnames": [format!("h{i}.example")],
                "org": "Example"
            })
        })
        .collect();
    Json(json!({"matches": matches, "total": 105})).into_response()
}

async fn api_info(Query(params): Query<HashMap<String, String>>) -> Response {
    if params.get("key").map(String::as_str) != Some(GOOD_KEY) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "Invalid API key"}))).into_response();
    }
    Json(json!({"query_credits": 42, "scan_credits": 0, "plan": "dev"})).into_response()
}

async fn shodan_stub() -> String {
    let router = Router::new()
        .route("/shodan/host/search", get(host_search))
        .route("/api-info", get(api_info));
    format!("http://{}", spawn(router).await)
}

fn client(base: &str, key: &str) -> ShodanClient {
    ShodanClient::new(key, "mcp-scan-rs-tests").unwrap().with_base_url(base)
}

#[tokio::test]
async fn search_follows_pages_up_to_the_limit() {
    let base = shodan_stub().await;
    let c = client(&base, GOOD_KEY);

    let all = c.search("\"Model Context Protocol\"", 1000).await.unwrap();
    assert_eq!(all.len(), 105);
    assert_eq!(all[0].ip_str, "10.0.0.0");
    assert_eq!(all[0].hostnames, vec!["h0.example".to_string()]);
    assert_eq!(all[0].raw["org"], "Example");

    let capped = c.search("mcp", 50).await.unwrap();
    assert_eq!(capped.len(), 50);
}

#[tokio::test]
async fn failures_map_to_the_error_taxonomy() {
    let base = shodan_stub().await;

    let err = client(&base, "wrong").search("mcp", 10).await.unwrap_err();
    assert!(matches!(err, SearchError::Auth(_)));

    let good = client(&base, GOOD_KEY);
    let err = good.search("((", 10).await.unwrap_err();
    assert!(matches!(err, SearchError::InvalidQuery(_)));
    let err = good.search("flaky", 10).await.unwrap_err();
    assert!(matches!(err, SearchError::Transient(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn account_info_reports_credits() {
    let base = shodan_stub().await;
    let info = client(&base, GOOD_KEY).account_info().await.unwrap();
    assert_eq!(info.query_credits, 42);
    assert_eq!(info.plan.as_deref(), Some("dev"));
    assert!(matches!(
        client(&base, "wrong").account_info().await,
        Err(SearchError::Auth(_))
    ));
}
