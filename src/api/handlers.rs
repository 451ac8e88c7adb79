//! Read API handlers serving the accumulated statistics and geolocation
//! records.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::blocklist::Blocklist;
use crate::geo::{GeoCache, GeoData};
use crate::query::{self, Granularity, QueryError};
use crate::stats::{metric_points, HostStats, StatsAccumulator};
use crate::storage::{BucketKey, BucketKind, RecordStore};

const DATE_FMT: &str = "%Y-%m-%d";

/// Everything the control-port handlers need, threaded through the router
/// instead of living in globals.
pub struct AppState {
    pub store: RecordStore,
    pub accumulator: Arc<StatsAccumulator>,
    pub blocklist: Arc<Blocklist>,
    pub geo: Option<Arc<GeoCache>>,
    pub forward_client: reqwest::Client,
}

#[derive(Debug, Default, Deserialize)]
pub struct DailyStatsParams {
    #[serde(default)]
    pub from_date: Option<String>,
    #[serde(default)]
    pub to_date: Option<String>,
    #[serde(default)]
    pub host_filter: Option<String>,
    #[serde(default)]
    pub granularity: Option<String>,
}

/// GET form of the hourly parameters; hours arrive as strings and are
/// parsed by hand so malformed input still yields the documented error
/// shape.
#[derive(Debug, Default, Deserialize)]
pub struct HourlyStatsQuery {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub from_hour: Option<String>,
    #[serde(default)]
    pub to_hour: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HourlyStatsBody {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub from_hour: Option<u32>,
    #[serde(default)]
    pub to_hour: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub keys: Vec<String>,
    pub records: HashMap<String, HostStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GeoResponse {
    pub records: HashMap<String, GeoData>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn stats_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(StatsResponse {
            keys: Vec::new(),
            records: HashMap::new(),
            error: Some(message.to_string()),
        }),
    )
        .into_response()
}

/// The substring filter is spliced into a glob over the whole keyspace, so
/// a `:` or a granularity literal could make it match adjacent keyspaces.
pub fn validate_host_filter(filter: &str) -> Result<(), String> {
    if filter.contains(':') || filter.contains("HOUR") || filter.contains("DAY") {
        return Err("host_filter must not contain ':' or the literals HOUR/DAY".to_string());
    }
    Ok(())
}

pub async fn daily_stats_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DailyStatsParams>,
) -> Response {
    run_daily(state, params).await
}

pub async fn daily_stats_post(
    State(state): State<Arc<AppState>>,
    Json(params): Json<DailyStatsParams>,
) -> Response {
    run_daily(state, params).await
}

async fn run_daily(state: Arc<AppState>, params: DailyStatsParams) -> Response {
    let (Some(from_str), Some(to_str)) = (params.from_date, params.to_date) else {
        return stats_error(
            StatusCode::BAD_REQUEST,
            "Missing from_date or to_date parameters",
        );
    };

    let Ok(from) = NaiveDate::parse_from_str(&from_str, DATE_FMT) else {
        return stats_error(
            StatusCode::BAD_REQUEST,
            "Invalid from_date format. Use YYYY-MM-DD",
        );
    };
    let Ok(to) = NaiveDate::parse_from_str(&to_str, DATE_FMT) else {
        return stats_error(
            StatusCode::BAD_REQUEST,
            "Invalid to_date format. Use YYYY-MM-DD",
        );
    };

    let granularity = match params.granularity.as_deref() {
        None | Some("") => Granularity::Day,
        Some(g) => match Granularity::parse(g) {
            Some(g) => g,
            None => {
                return stats_error(
                    StatusCode::BAD_REQUEST,
                    "Invalid granularity. Use 'day' or 'hour'",
                );
            }
        },
    };

    let host_filter = params.host_filter.filter(|f| !f.is_empty());
    if let Some(filter) = &host_filter {
        if let Err(msg) = validate_host_filter(filter) {
            return stats_error(StatusCode::BAD_REQUEST, &msg);
        }
    }

    match query::query_by_date(&state.store, from, to, host_filter.as_deref(), granularity).await {
        Ok((keys, records)) => {
            info!(
                "stats query {from_str}..{to_str} returned {} records",
                keys.len()
            );
            Json(StatsResponse {
                keys,
                records,
                error: None,
            })
            .into_response()
        }
        Err(QueryError::BadArgs(msg)) => stats_error(StatusCode::BAD_REQUEST, &msg),
        Err(QueryError::Store(e)) => {
            error!("daily stats query failed: {e}");
            stats_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to fetch data: {e}"),
            )
        }
    }
}

pub async fn hourly_stats_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HourlyStatsQuery>,
) -> Response {
    let (Some(date), Some(from_raw), Some(to_raw)) =
        (params.date, params.from_hour, params.to_hour)
    else {
        return stats_error(StatusCode::BAD_REQUEST, "Missing required parameters");
    };

    let (Ok(from_hour), Ok(to_hour)) = (from_raw.parse::<u32>(), to_raw.parse::<u32>()) else {
        return stats_error(StatusCode::BAD_REQUEST, "Hours must be between 0 and 23");
    };

    run_hourly(state, date, from_hour, to_hour).await
}

pub async fn hourly_stats_post(
    State(state): State<Arc<AppState>>,
    Json(params): Json<HourlyStatsBody>,
) -> Response {
    let (Some(date), Some(from_hour), Some(to_hour)) =
        (params.date, params.from_hour, params.to_hour)
    else {
        return stats_error(StatusCode::BAD_REQUEST, "Missing required parameters");
    };

    run_hourly(state, date, from_hour, to_hour).await
}

async fn run_hourly(state: Arc<AppState>, date: String, from_hour: u32, to_hour: u32) -> Response {
    let Ok(date) = NaiveDate::parse_from_str(&date, DATE_FMT) else {
        return stats_error(
            StatusCode::BAD_REQUEST,
            "Invalid date format. Use YYYY-MM-DD",
        );
    };

    match query::query_by_hour(&state.store, date, from_hour, to_hour).await {
        Ok((keys, records)) => Json(StatsResponse {
            keys,
            records,
            error: None,
        })
        .into_response(),
        Err(QueryError::BadArgs(msg)) => stats_error(StatusCode::BAD_REQUEST, &msg),
        Err(QueryError::Store(e)) => {
            error!("hourly stats query failed: {e}");
            stats_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to fetch data: {e}"),
            )
        }
    }
}

/// Flat dashboard series: every host seen in the last hour expands to a
/// point per counter type, stamped with the record's `last_seen`.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let now = Utc::now();
    let hour_ago = now - chrono::Duration::hours(1);

    let result = query::query_by_date(
        &state.store,
        hour_ago.date_naive(),
        now.date_naive(),
        None,
        Granularity::Hour,
    )
    .await;

    let (_, records) = match result {
        Ok(found) => found,
        Err(e) => {
            error!("metrics query failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Failed to fetch metrics".to_string(),
                }),
            )
                .into_response();
        }
    };

    let window = [
        BucketKind::Hour.stamp(hour_ago),
        BucketKind::Hour.stamp(now),
    ];
    let recent: HashMap<String, HostStats> = records
        .into_iter()
        .filter(|(key, _)| {
            BucketKey::decode(key)
                .map(|k| window.contains(&k.stamp))
                .unwrap_or(false)
        })
        .collect();

    Json(metric_points(&recent)).into_response()
}

pub async fn geo_records(State(state): State<Arc<AppState>>) -> Response {
    if state.geo.is_none() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Geolocation system not initialized".to_string(),
            }),
        )
            .into_response();
    }

    let hosts = match state.store.scan_geo_hosts().await {
        Ok(hosts) => hosts,
        Err(e) => {
            error!("geo scan failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("Failed to get geolocation data: {e}"),
                }),
            )
                .into_response();
        }
    };

    let mut records = HashMap::new();
    for host in hosts {
        // One unreadable record never empties the dump.
        if let Ok(Some(data)) = state.store.get_geo(&host).await {
            records.insert(host, data);
        }
    }

    Json(GeoResponse { records }).into_response()
}
