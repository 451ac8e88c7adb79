use axum::http::{header, Method};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::handlers::{
    daily_stats_get, daily_stats_post, geo_records, hourly_stats_get, hourly_stats_post, metrics,
    AppState,
};
use crate::proxy::forward_http;

/// Router for the control port: the read API under `/api`, everything else
/// treated as a proxied HTTP request.
pub fn control_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let api = Router::new()
        .route("/stats/daily", get(daily_stats_get).post(daily_stats_post))
        .route(
            "/stats/hourly",
            get(hourly_stats_get).post(hourly_stats_post),
        )
        .route("/metrics", get(metrics))
        .route("/geo", get(geo_records))
        .layer(cors);

    Router::new()
        .nest("/api", api)
        .fallback(forward_http)
        .with_state(state)
}
