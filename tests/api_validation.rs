//! Integration tests for the read API's input validation and response
//! shapes.
//!
//! These drive the real control router. The store handle's connections are
//! lazy and every case here is rejected before any store call, so no
//! backend is needed.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use std::sync::Arc;
use tower::ServiceExt;

use kestrel::api::{control_router, AppState};
use kestrel::blocklist::Blocklist;
use kestrel::proxy;
use kestrel::stats::StatsAccumulator;
use kestrel::storage::RecordStore;

fn test_router() -> Router {
    let store = RecordStore::connect("127.0.0.1:1", None).unwrap();
    let state = Arc::new(AppState {
        store: store.clone(),
        accumulator: Arc::new(StatsAccumulator::new(store)),
        blocklist: Arc::new(Blocklist::empty()),
        geo: None,
        forward_client: proxy::forward_client().unwrap(),
    });
    control_router(state)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn daily_stats_requires_dates() {
    let response = test_router()
        .oneshot(
            Request::builder()
                .uri("/api/stats/daily")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "Missing from_date or to_date parameters");
    assert!(json["keys"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn daily_stats_rejects_bad_date_format() {
    let response = test_router()
        .oneshot(
            Request::builder()
                .uri("/api/stats/daily?from_date=22-03-2024&to_date=2024-03-23")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "Invalid from_date format. Use YYYY-MM-DD");
}

#[tokio::test]
async fn daily_stats_rejects_unknown_granularity() {
    let response = test_router()
        .oneshot(
            Request::builder()
                .uri("/api/stats/daily?from_date=2024-03-22&to_date=2024-03-23&granularity=week")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "Invalid granularity. Use 'day' or 'hour'");
}

#[tokio::test]
async fn daily_stats_rejects_sharp_edged_host_filter() {
    for filter in ["a:b", "HOUR", "xDAYx"] {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "/api/stats/daily?from_date=2024-03-22&to_date=2024-03-23&host_filter={filter}"
                    ))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.status(),
            StatusCode::BAD_REQUEST,
            "filter {filter} must be rejected"
        );
    }
}

#[tokio::test]
async fn daily_stats_post_validates_like_get() {
    let response = test_router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/stats/daily")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"from_date": "2024-03-22", "to_date": "not-a-date"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "Invalid to_date format. Use YYYY-MM-DD");
}

#[tokio::test]
async fn hourly_stats_validates_hour_range() {
    let response = test_router()
        .oneshot(
            Request::builder()
                .uri("/api/stats/hourly?date=2024-03-22&from_hour=0&to_hour=24")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "hours must be between 0 and 23");
}

#[tokio::test]
async fn hourly_stats_rejects_reversed_range() {
    let response = test_router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/stats/hourly")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"date": "2024-03-22", "from_hour": 16, "to_hour": 10}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "from_hour must not be after to_hour");
}

#[tokio::test]
async fn hourly_stats_rejects_non_numeric_hours() {
    let response = test_router()
        .oneshot(
            Request::builder()
                .uri("/api/stats/hourly?date=2024-03-22&from_hour=ten&to_hour=16")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn geo_endpoint_reports_disabled_enrichment() {
    let response = test_router()
        .oneshot(
            Request::builder()
                .uri("/api/geo")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["error"], "Geolocation system not initialized");
}

#[tokio::test]
async fn metrics_rejects_unsupported_methods() {
    let response = test_router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn api_responses_carry_cors_headers() {
    let response = test_router()
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/api/stats/daily")
                .header(header::ORIGIN, "http://dashboard.local")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let allow_origin = response
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .expect("preflight must advertise an allowed origin");
    assert_eq!(allow_origin, "*");
}

#[tokio::test]
async fn proxied_request_without_host_is_rejected() {
    let response = test_router()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
