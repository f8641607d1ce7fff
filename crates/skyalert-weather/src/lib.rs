//! # SkyAlert Weather
//!
//! Weather provider access for the alert engine: a two-step client (city
//! lookup, then 3-day or 7-day daily forecast) with bounded per-region
//! retry, fronted by a sqlite-backed TTL cache so repeated cycles do not
//! hammer the provider.

pub mod cache;
pub mod client;

pub use cache::{DEFAULT_TTL_SECS, WeatherCache};
pub use client::{CityInfo, FetchOutcome, ForecastSpan, WeatherClient, fetch_all_regions};
