//! Upstream geolocation lookups against the GeoJS API.

use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{GeoData, GeoError};

const GEOJS_BASE: &str = "https://get.geojs.io/v1/ip/geo";

/// Wire shape of a GeoJS response. Fields the upstream omits (bogons,
/// unroutable space) default to empty rather than failing the parse.
#[derive(Debug, Deserialize)]
pub(super) struct GeoJsResponse {
    #[serde(default)]
    country_code: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
    #[serde(default)]
    timezone: String,
}

impl From<GeoJsResponse> for GeoData {
    fn from(resp: GeoJsResponse) -> Self {
        GeoData {
            country_code: resp.country_code,
            country: resp.country,
            city: resp.city,
            region: resp.region,
            timezone: resp.timezone,
            latitude: resp.latitude,
            longitude: resp.longitude,
        }
    }
}

pub(super) async fn fetch(client: &Client, host: &str) -> Result<GeoData, GeoError> {
    let url = format!("{GEOJS_BASE}/{host}.json");
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| GeoError::LookupFailed(format!("request failed: {e}")))?;

    if resp.status() != StatusCode::OK {
        return Err(GeoError::LookupFailed(format!(
            "upstream returned {}",
            resp.status()
        )));
    }

    let parsed: GeoJsResponse = resp
        .json()
        .await
        .map_err(|e| GeoError::LookupFailed(format!("unparseable response: {e}")))?;
    Ok(parsed.into())
}
