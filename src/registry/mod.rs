//! Device Registry Client — hostname/IP → ship & device identity
//!
//! Resolves `host` strings seen in telemetry to `(ship_id, device_id)` via
//! the fleet device registry, with a per-process TTL cache in front.
//!
//! Lookup never fails: any transport error, timeout, or missing mapping
//! yields `None` and callers fall back to hostname derivation. Negative
//! results are not cached, so the next request retries the registry.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Mapping returned by the registry for one hostname or IP
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceMapping {
    pub ship_id: String,
    pub device_id: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub location: String,
}

/// Wire shape of `GET /lookup/{host}`
#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    success: bool,
    mapping: Option<DeviceMapping>,
}

struct CacheEntry {
    mapping: DeviceMapping,
    cached_at: Instant,
}

/// TTL-cached registry client
pub struct DeviceRegistryClient {
    http: reqwest::Client,
    base_url: String,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl DeviceRegistryClient {
    pub fn new(base_url: &str, ttl: Duration, lookup_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(lookup_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Build from the global settings.
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self::new(
            &settings.endpoints.device_registry_url,
            Duration::from_secs(settings.device_registry.cache_ttl_seconds),
            Duration::from_millis(settings.device_registry.lookup_timeout_ms),
        )
    }

    /// Look up a hostname or IP. Cache hit is non-blocking; a miss issues one
    /// remote lookup bounded by the client timeout.
    pub async fn lookup(&self, host_or_ip: &str) -> Option<DeviceMapping> {
        if matches!(host_or_ip, "" | "unknown" | "localhost") {
            return None;
        }

        if let Some(entry) = self.cache.get(host_or_ip) {
            if entry.cached_at.elapsed() < self.ttl {
                debug!(host = host_or_ip, "Registry cache hit");
                return Some(entry.mapping.clone());
            }
        }

        let url = format!("{}/lookup/{}", self.base_url, host_or_ip);
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(host = host_or_ip, error = %e, "Registry lookup failed");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(host = host_or_ip, status = %response.status(), "Registry lookup non-200");
            return None;
        }

        let body: LookupResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(host = host_or_ip, error = %e, "Registry response undecodable");
                return None;
            }
        };

        if !body.success {
            return None;
        }

        let mapping = body.mapping?;
        self.cache.insert(
            host_or_ip.to_string(),
            CacheEntry {
                mapping: mapping.clone(),
                cached_at: Instant::now(),
            },
        );
        debug!(
            host = host_or_ip,
            ship_id = %mapping.ship_id,
            "Registry lookup resolved"
        );
        Some(mapping)
    }

    /// Probe `GET /health` with a short deadline.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }

    /// Number of live cache entries (for health counters).
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Seed the cache directly (tests).
    #[cfg(test)]
    pub fn seed(&self, host: &str, mapping: DeviceMapping) {
        self.cache.insert(
            host.to_string(),
            CacheEntry {
                mapping,
                cached_at: Instant::now(),
            },
        );
    }
}

/// Derive a ship id from a hostname when the registry has no answer.
///
/// `alpha-bridge-01` → `alpha-ship`; a hostname without a hyphen becomes
/// `<host>-ship`; empty/unknown hosts become `unknown-ship`.
pub fn derive_ship_id(host: &str) -> String {
    if host.is_empty() || host == "unknown" {
        return "unknown-ship".to_string();
    }
    match host.split('-').next() {
        Some(prefix) if prefix != host => format!("{prefix}-ship"),
        _ => format!("{host}-ship"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_ship_id_from_hyphenated_host() {
        assert_eq!(derive_ship_id("alpha-bridge-01"), "alpha-ship");
        assert_eq!(derive_ship_id("alpha-engine-02"), "alpha-ship");
    }

    #[test]
    fn derive_ship_id_from_plain_host() {
        assert_eq!(derive_ship_id("bridge01"), "bridge01-ship");
    }

    #[test]
    fn derive_ship_id_unknown() {
        assert_eq!(derive_ship_id(""), "unknown-ship");
        assert_eq!(derive_ship_id("unknown"), "unknown-ship");
    }

    #[test]
    fn lookup_short_circuits_reserved_values() {
        let client = DeviceRegistryClient::new(
            "http://127.0.0.1:1",
            Duration::from_secs(300),
            Duration::from_millis(100),
        );
        tokio_test::block_on(async {
            assert!(client.lookup("").await.is_none());
            assert!(client.lookup("unknown").await.is_none());
            assert!(client.lookup("localhost").await.is_none());
        });
    }

    #[tokio::test]
    async fn lookup_serves_cache_without_network() {
        let client = DeviceRegistryClient::new(
            "http://127.0.0.1:1",
            Duration::from_secs(300),
            Duration::from_millis(100),
        );
        client.seed(
            "alpha-bridge-01",
            DeviceMapping {
                ship_id: "alpha-ship".to_string(),
                device_id: "alpha-bridge-01".to_string(),
                device_type: "workstation".to_string(),
                location: "bridge".to_string(),
            },
        );
        let mapping = client.lookup("alpha-bridge-01").await.unwrap();
        assert_eq!(mapping.ship_id, "alpha-ship");
    }

    #[tokio::test]
    async fn lookup_unreachable_registry_yields_none() {
        let client = DeviceRegistryClient::new(
            "http://127.0.0.1:1",
            Duration::from_secs(300),
            Duration::from_millis(50),
        );
        assert!(client.lookup("alpha-bridge-01").await.is_none());
    }
}
