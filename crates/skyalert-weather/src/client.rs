//! Weather provider client — city lookup + daily forecast with bounded
//! retry, fronted by the TTL cache.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use skyalert_core::config::Settings;
use skyalert_core::error::{Result, SkyAlertError};
use skyalert_core::types::{ForecastPoint, RegionForecast};
use skyalert_store::health::HealthLog;

use crate::cache::WeatherCache;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

const DEFAULT_GEO_BASE: &str = "https://geoapi.qweather.com";
const DEFAULT_API_BASE: &str = "https://api.qweather.com";

/// Forecast horizon offered by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastSpan {
    ThreeDay,
    SevenDay,
}

impl ForecastSpan {
    /// Advance windows beyond two days need the 7-day endpoint.
    pub fn for_advance_days(advance_days: u32) -> Self {
        if advance_days > 2 {
            ForecastSpan::SevenDay
        } else {
            ForecastSpan::ThreeDay
        }
    }

    pub fn days(&self) -> usize {
        match self {
            ForecastSpan::ThreeDay => 3,
            ForecastSpan::SevenDay => 7,
        }
    }

    fn path(&self) -> &'static str {
        match self {
            ForecastSpan::ThreeDay => "3d",
            ForecastSpan::SevenDay => "7d",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CityInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    #[serde(default)]
    code: String,
    #[serde(default)]
    location: Vec<CityInfo>,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    daily: Vec<ApiDaily>,
}

/// Raw provider shape; coerced into the typed [`ForecastPoint`] here and
/// nowhere else.
#[derive(Debug, Deserialize)]
struct ApiDaily {
    #[serde(rename = "fxDate", default)]
    fx_date: String,
    #[serde(rename = "tempMax", default)]
    temp_max: Option<String>,
    #[serde(rename = "tempMin", default)]
    temp_min: Option<String>,
    #[serde(rename = "textDay", default)]
    text_day: String,
    #[serde(rename = "textNight", default)]
    text_night: String,
    #[serde(rename = "windSpeedDay", default)]
    wind_speed_day: Option<String>,
    #[serde(rename = "windDirDay", default)]
    wind_dir_day: String,
    #[serde(default)]
    precip: Option<String>,
    #[serde(default)]
    vis: Option<String>,
}

impl ApiDaily {
    fn into_point(self) -> Option<ForecastPoint> {
        let date = NaiveDate::parse_from_str(&self.fx_date, "%Y-%m-%d").ok()?;
        Some(ForecastPoint {
            date,
            temp_max: parse_metric(self.temp_max),
            temp_min: parse_metric(self.temp_min),
            wind_speed: parse_metric(self.wind_speed_day),
            precip: parse_metric(self.precip),
            visibility: parse_metric(self.vis),
            text_day: self.text_day,
            text_night: self.text_night,
            wind_dir: self.wind_dir_day,
        })
    }
}

/// Unparseable metric values become `None`: the evaluator treats them as
/// never matching rather than failing the cycle.
fn parse_metric(raw: Option<String>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
}

pub struct WeatherClient {
    http: reqwest::Client,
    api_key: String,
    geo_base: String,
    api_base: String,
}

impl WeatherClient {
    pub fn new(api_key: &str) -> Self {
        Self::with_bases(api_key, DEFAULT_GEO_BASE, DEFAULT_API_BASE)
    }

    /// Override endpoints (used by tests against a local stub server).
    pub fn with_bases(api_key: &str, geo_base: &str, api_base: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_key: api_key.to_string(),
            geo_base: geo_base.trim_end_matches('/').to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Resolve a region name to the provider's city id.
    pub async fn lookup_city(&self, region: &str) -> Result<CityInfo> {
        let url = format!(
            "{}/v2/city/lookup?location={region}&key={}",
            self.geo_base, self.api_key
        );
        let resp: GeoResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SkyAlertError::Weather(format!("City lookup for {region}: {e}")))?
            .json()
            .await
            .map_err(|e| SkyAlertError::Weather(format!("City lookup parse for {region}: {e}")))?;
        if resp.code != "200" {
            return Err(SkyAlertError::Weather(format!(
                "City lookup for {region}: provider code {}",
                resp.code
            )));
        }
        resp.location
            .into_iter()
            .next()
            .ok_or_else(|| SkyAlertError::Weather(format!("No city id for {region}")))
    }

    /// Fetch the daily forecast series for a city id.
    pub async fn fetch_daily(&self, city_id: &str, span: ForecastSpan) -> Result<Vec<ForecastPoint>> {
        let url = format!(
            "{}/v7/weather/{}?location={city_id}&key={}",
            self.api_base,
            span.path(),
            self.api_key
        );
        let resp: ForecastResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SkyAlertError::Weather(format!("Forecast for {city_id}: {e}")))?
            .json()
            .await
            .map_err(|e| SkyAlertError::Weather(format!("Forecast parse for {city_id}: {e}")))?;
        if resp.code != "200" {
            return Err(SkyAlertError::Weather(format!(
                "Forecast for {city_id}: provider code {} {}",
                resp.code,
                resp.message.unwrap_or_default()
            )));
        }
        Ok(resp.daily.into_iter().filter_map(ApiDaily::into_point).collect())
    }
}

/// Result of one fetch sweep across all subscriber regions.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub regions: HashMap<String, RegionForecast>,
    /// Regions that produced no usable data this sweep, with the reason.
    pub failures: Vec<String>,
}

/// Fetch forecasts for every region, consulting the cache first. Per-region
/// failures are collected, never fatal; the health log records the sweep
/// outcome for operators.
pub async fn fetch_all_regions(
    client: &WeatherClient,
    cache: &WeatherCache,
    health: &HealthLog,
    regions: &[String],
    settings: &Settings,
) -> FetchOutcome {
    let span = ForecastSpan::for_advance_days(settings.advance_days());
    let mut outcome = FetchOutcome::default();

    for region in regions {
        match fetch_region(client, cache, region, span, settings).await {
            Ok(forecast) => {
                outcome.regions.insert(region.clone(), forecast);
            }
            Err(e) => {
                tracing::warn!("⚠️ Weather fetch failed for {region}: {e}");
                outcome.failures.push(format!("{region} ({e})"));
            }
        }
    }

    if outcome.regions.is_empty() && !regions.is_empty() {
        health
            .record("WeatherAPI", false, "no weather data retrieved this cycle")
            .ok();
    } else if !outcome.failures.is_empty() {
        health
            .record(
                "WeatherAPI",
                false,
                &format!("partial failure: {}", outcome.failures.join(", ")),
            )
            .ok();
    } else if !regions.is_empty() {
        health
            .record(
                "WeatherAPI",
                true,
                &format!("fetched forecasts for {} region(s)", outcome.regions.len()),
            )
            .ok();
    }

    outcome
}

async fn fetch_region(
    client: &WeatherClient,
    cache: &WeatherCache,
    region: &str,
    span: ForecastSpan,
    settings: &Settings,
) -> Result<RegionForecast> {
    let city_key = WeatherCache::city_key(region);
    let city: CityInfo = match cache.get(&city_key)? {
        Some(raw) => serde_json::from_str(&raw)?,
        None => {
            let city = client.lookup_city(region).await?;
            cache.set(&city_key, &serde_json::to_string(&city)?).ok();
            city
        }
    };

    let forecast_key = WeatherCache::forecast_key(&city.id);
    if let Some(raw) = cache.get(&forecast_key)? {
        let forecasts: Vec<ForecastPoint> = serde_json::from_str(&raw)?;
        if forecasts.len() >= span.days() {
            return Ok(RegionForecast {
                region: region.to_string(),
                update_time: String::new(),
                forecasts,
            });
        }
        // Cached series is shorter than the requested horizon (the
        // advance window may have grown past 2 days); refetch.
    }

    let max_attempts = settings.retry_count();
    let mut last_err = SkyAlertError::Weather(format!("No forecast data for {region}"));
    for attempt in 1..=max_attempts {
        match client.fetch_daily(&city.id, span).await {
            Ok(forecasts) if forecasts.len() >= span.days() => {
                cache
                    .set(&forecast_key, &serde_json::to_string(&forecasts)?)
                    .ok();
                tracing::info!(
                    "🌤️ Fetched {}-day forecast for {region} (attempt {attempt})",
                    span.days()
                );
                return Ok(RegionForecast {
                    region: region.to_string(),
                    update_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                    forecasts,
                });
            }
            Ok(forecasts) => {
                last_err = SkyAlertError::Weather(format!(
                    "Forecast for {region} covers {} day(s), need {}",
                    forecasts.len(),
                    span.days()
                ));
            }
            Err(e) => last_err = e,
        }
        if attempt < max_attempts && settings.auto_retry() {
            tracing::info!("Retrying forecast for {region} ({attempt}/{max_attempts})");
            tokio::time::sleep(RETRY_BACKOFF).await;
        } else if !settings.auto_retry() {
            break;
        }
    }
    Err(last_err)
}
