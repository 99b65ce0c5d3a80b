//! Weather context provider
//!
//! Fetches current conditions for a ship's position from the configured
//! weather endpoint, with a short per-ship cache. An unconfigured or
//! unreachable provider degrades to an empty snapshot tagged `source: none`
//! so the pipeline never blocks on weather.

use crate::types::WeatherImpact;
use dashmap::DashMap;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long one ship's weather snapshot stays fresh
const WEATHER_CACHE_SECS: u64 = 300;

#[derive(Debug, Deserialize, Default)]
struct WeatherResponse {
    #[serde(default)]
    rain_rate_mm_h: f64,
    #[serde(default)]
    wind_speed_kn: f64,
    #[serde(default)]
    wave_height_m: f64,
    #[serde(default)]
    temperature_c: f64,
}

struct CacheEntry {
    weather: WeatherImpact,
    fetched_at: Instant,
}

pub struct WeatherProvider {
    http: reqwest::Client,
    base_url: String,
    cache: DashMap<String, CacheEntry>,
}

impl WeatherProvider {
    /// An empty `base_url` disables the provider.
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: DashMap::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty()
    }

    /// Current weather for a ship. Never fails.
    pub async fn current(&self, ship_id: &str) -> WeatherImpact {
        if !self.is_configured() {
            return disabled();
        }

        if let Some(entry) = self.cache.get(ship_id) {
            if entry.fetched_at.elapsed() < Duration::from_secs(WEATHER_CACHE_SECS) {
                return entry.weather.clone();
            }
        }

        let url = format!("{}/current", self.base_url);
        let weather = match self
            .http
            .get(&url)
            .query(&[("ship_id", ship_id)])
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                match response.json::<WeatherResponse>().await {
                    Ok(body) => WeatherImpact {
                        rain_rate_mm_h: body.rain_rate_mm_h,
                        wind_speed_kn: body.wind_speed_kn,
                        wave_height_m: body.wave_height_m,
                        temperature_c: body.temperature_c,
                        source: "weather_api".to_string(),
                    },
                    Err(e) => {
                        debug!(ship_id, error = %e, "Weather response undecodable");
                        disabled()
                    }
                }
            }
            Ok(response) => {
                debug!(ship_id, status = %response.status(), "Weather fetch non-200");
                disabled()
            }
            Err(e) => {
                debug!(ship_id, error = %e, "Weather fetch failed");
                disabled()
            }
        };

        if weather.source == "weather_api" {
            self.cache.insert(
                ship_id.to_string(),
                CacheEntry {
                    weather: weather.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        weather
    }
}

fn disabled() -> WeatherImpact {
    WeatherImpact {
        source: "none".to_string(),
        ..WeatherImpact::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_provider_returns_empty_snapshot() {
        let provider = WeatherProvider::new("");
        let weather = provider.current("alpha-ship").await;
        assert_eq!(weather.source, "none");
        assert_eq!(weather.rain_rate_mm_h, 0.0);
    }

    #[tokio::test]
    async fn unreachable_provider_degrades() {
        let provider = WeatherProvider::new("http://127.0.0.1:1");
        let weather = provider.current("alpha-ship").await;
        assert_eq!(weather.source, "none");
    }
}
