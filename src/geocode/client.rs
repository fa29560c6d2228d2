// src/geocode/client.rs
//! Free-text geocoding. The Nominatim client retries transient failures,
//! passes every request through the shared rate gate and caches answers.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use lru::LruCache;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use url::Url;

use crate::geocode::rate_gate::{RateGate, GEOCODER_GATE};
use crate::utils::config::GeocodeConfig;
use crate::utils::constants::GEOCODE_CACHE_SIZE;

const BASE_BACKOFF_MS: u64 = 1000;
const MAX_JITTER_MS: u64 = 250;

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeHit {
    pub lat: f64,
    pub lon: f64,
    pub display_name: String,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Best match for `query`, or `None` when the service knows nothing.
    async fn geocode(&self, query: &str) -> Result<Option<GeocodeHit>>;
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: String,
}

/// First usable place of a Nominatim `format=jsonv2` answer.
fn parse_places(body: &str) -> Result<Option<GeocodeHit>> {
    let places: Vec<NominatimPlace> =
        serde_json::from_str(body).context("Unexpected geocoder response shape")?;
    Ok(places.into_iter().find_map(|p| {
        let lat = p.lat.trim().parse::<f64>().ok()?;
        let lon = p.lon.trim().parse::<f64>().ok()?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return None;
        }
        Some(GeocodeHit {
            lat,
            lon,
            display_name: p.display_name,
        })
    }))
}

enum FetchError {
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub struct NominatimGeocoder {
    http: Client,
    url: Url,
    max_retries: usize,
    gate: Arc<RateGate>,
    cache: Mutex<LruCache<String, Option<GeocodeHit>>>,
    jitter_rng: Mutex<StdRng>,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocodeConfig) -> Result<Self> {
        Self::with_gate(config, GEOCODER_GATE.clone())
    }

    pub fn with_gate(config: &GeocodeConfig, gate: Arc<RateGate>) -> Result<Self> {
        let url = Url::parse(&config.url)
            .with_context(|| format!("Invalid GEOCODER_URL '{}'", config.url))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build geocoder HTTP client")?;
        let capacity = NonZeroUsize::new(GEOCODE_CACHE_SIZE)
            .ok_or_else(|| anyhow!("geocode cache size must be non-zero"))?;
        Ok(Self {
            http,
            url,
            max_retries: config.max_retries.max(1),
            gate,
            cache: Mutex::new(LruCache::new(capacity)),
            jitter_rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    async fn fetch(&self, query: &str) -> Result<Option<GeocodeHit>, FetchError> {
        self.gate.wait().await;
        let response = self
            .http
            .get(self.url.clone())
            .query(&[("q", query), ("format", "jsonv2"), ("limit", "1")])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    FetchError::Retryable(e.into())
                } else {
                    FetchError::Fatal(e.into())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let err = anyhow!("Geocoder returned status: {}", status);
            return Err(if is_retryable_status(status) {
                FetchError::Retryable(err)
            } else {
                FetchError::Fatal(err)
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Retryable(e.into()))?;
        parse_places(&body).map_err(FetchError::Fatal)
    }

    async fn backoff_delay(&self, attempt: usize) -> Duration {
        let jitter = self.jitter_rng.lock().await.gen_range(0..MAX_JITTER_MS);
        Duration::from_millis(BASE_BACKOFF_MS * attempt as u64 + jitter)
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<GeocodeHit>> {
        let key = query.trim().to_lowercase();
        if let Some(cached) = self.cache.lock().await.get(&key) {
            debug!("Geocode cache hit for '{}'", query);
            return Ok(cached.clone());
        }

        let mut last_error = None;
        for attempt in 1..=self.max_retries {
            match self.fetch(query).await {
                Ok(hit) => {
                    self.cache.lock().await.put(key, hit.clone());
                    return Ok(hit);
                }
                Err(FetchError::Fatal(e)) => {
                    return Err(e.context(format!("Geocoding '{}' failed", query)))
                }
                Err(FetchError::Retryable(e)) => {
                    if attempt < self.max_retries {
                        let delay = self.backoff_delay(attempt).await;
                        warn!(
                            "Geocoding '{}' failed (attempt {}/{}): {}. Retrying in {:?}",
                            query, attempt, self.max_retries, e, delay
                        );
                        sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| anyhow!("no attempts made"))
            .context(format!("Geocoding '{}' failed after {} attempts", query, self.max_retries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_first_usable_place() {
        let body = r#"[
            {"lat": "not a number", "lon": "1.0", "display_name": "Broken"},
            {"lat": "48.9467", "lon": "11.4038", "display_name": "Bayern, Deutschland"}
        ]"#;
        let hit = parse_places(body).unwrap().unwrap();
        assert_eq!(hit.display_name, "Bayern, Deutschland");
        assert!((hit.lat - 48.9467).abs() < 1e-9);
        assert!((hit.lon - 11.4038).abs() < 1e-9);
    }

    #[test]
    fn test_parse_empty_and_invalid() {
        assert_eq!(parse_places("[]").unwrap(), None);
        assert_eq!(parse_places(r#"[{"lat": "95.0", "lon": "0"}]"#).unwrap(), None);
        assert!(parse_places(r#"{"error": "bad"}"#).is_err());
    }

    #[test]
    fn test_rejects_malformed_url() {
        let config = GeocodeConfig {
            url: "not a url".to_string(),
            ..GeocodeConfig::default()
        };
        let gate = Arc::new(RateGate::new(Duration::ZERO));
        assert!(NominatimGeocoder::with_gate(&config, gate).is_err());
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }
}
