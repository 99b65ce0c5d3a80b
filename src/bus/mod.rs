//! Bus Gateway — NATS pub/sub for the pipeline topics
//!
//! Thin wrapper over an `async_nats::Client` carrying the static topic set,
//! JSON encode/decode with bounded payload sampling on parse failures, and a
//! delivery dedup cache.
//!
//! Delivery is at-least-once: the client reconnects on its own, publishes are
//! flushed, and consumers dedup by `(topic, tracking_id)` before acting.

use crate::config::defaults::{DEDUP_RETENTION_SECS, PAYLOAD_SAMPLE_LEN};
use crate::error::{PipelineError, Result};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Static topic names used by the pipeline.
pub mod topics {
    /// Raw anomalous log records from the external log router (in)
    pub const LOGS_ANOMALOUS: &str = "logs.anomalous";
    /// First-stage anomaly events (out of detector, into enricher)
    pub const ANOMALY_DETECTED: &str = "anomaly.detected";
    /// Level-1 enriched events (out of enricher stage 1, into stage 2)
    pub const ANOMALY_ENRICHED: &str = "anomaly.detected.enriched";
    /// Level-2 enhanced events (out of enricher stage 2, into correlator)
    pub const ANOMALY_ENRICHED_FINAL: &str = "anomaly.detected.enriched.final";
    /// Correlated incidents (out of correlator, into writer + remediation)
    pub const INCIDENTS_CREATED: &str = "incidents.created";
    /// Approval requests published by the remediation engine (out)
    pub const REMEDIATION_APPROVAL_REQUEST: &str = "remediation.approval.request";
    /// Link-health alerts from the link monitor (in, remediation trigger)
    pub const LINK_HEALTH_ALERT: &str = "link.health.alert";
}

/// Shared bus handle. Cheap to clone; safe for concurrent publishes.
#[derive(Clone)]
pub struct BusGateway {
    client: async_nats::Client,
}

impl BusGateway {
    /// Connect to the bus. The underlying client reconnects automatically;
    /// this only fails when the initial connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| PipelineError::Bus(format!("connect to {url}: {e}")))?;
        info!(url, "Connected to message bus");
        Ok(Self { client })
    }

    /// Wrap an already-connected client (tests).
    pub fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// Serialize `payload` as JSON and publish it on `topic`.
    ///
    /// Publish failures are returned to the caller, which logs and drops —
    /// upstream redelivery covers the gap.
    pub async fn publish_json<T: Serialize>(&self, topic: &'static str, payload: &T) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.client.publish(topic, bytes.into()).await?;
        self.client
            .flush()
            .await
            .map_err(|e| PipelineError::Bus(format!("flush: {e}")))?;
        debug!(topic, "Published event");
        Ok(())
    }

    /// Subscribe to a topic. Returned subscriber is a `Stream` of messages.
    pub async fn subscribe(&self, topic: &'static str) -> Result<async_nats::Subscriber> {
        let sub = self.client.subscribe(topic).await?;
        info!(topic, "Subscribed");
        Ok(sub)
    }

    /// Whether the client currently holds a server connection.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }
}

/// Subscribe with retry until cancelled. Returns `None` only on shutdown.
pub async fn subscribe_with_retry(
    bus: &BusGateway,
    topic: &'static str,
    cancel: &tokio_util::sync::CancellationToken,
) -> Option<async_nats::Subscriber> {
    loop {
        match bus.subscribe(topic).await {
            Ok(sub) => return Some(sub),
            Err(e) => {
                tracing::error!(topic, error = %e, "Subscribe failed — retrying");
                tokio::select! {
                    () = cancel.cancelled() => return None,
                    () = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        }
    }
}

/// Decode a JSON bus payload, logging a bounded sample on failure.
///
/// Poison-pill protection: the caller drops the message and moves on; the
/// sample makes the bad payload diagnosable without flooding the log.
pub fn decode_payload<T: DeserializeOwned>(topic: &str, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| {
        let sample: String = String::from_utf8_lossy(payload)
            .chars()
            .take(PAYLOAD_SAMPLE_LEN)
            .collect();
        warn!(topic, error = %e, sample = %sample, "Dropping undecodable payload");
        PipelineError::Parse(e)
    })
}

/// Tracks which `(topic, tracking_id)` pairs have already been acted upon.
///
/// At-least-once delivery means redeliveries are normal; a consumer asks
/// `first_delivery` before doing side-effectful work.
pub struct DedupCache {
    seen: DashMap<(String, String), Instant>,
    retention: Duration,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEDUP_RETENTION_SECS))
    }
}

impl DedupCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            retention,
        }
    }

    /// Returns true exactly once per (topic, tracking_id) within the
    /// retention period.
    pub fn first_delivery(&self, topic: &str, tracking_id: &str) -> bool {
        let key = (topic.to_string(), tracking_id.to_string());
        if let Some(entry) = self.seen.get(&key) {
            if entry.elapsed() < self.retention {
                debug!(topic, tracking_id, "Duplicate delivery suppressed");
                return false;
            }
        }
        self.seen.insert(key, Instant::now());
        true
    }

    /// Drop entries past retention. Called opportunistically by consumers.
    pub fn sweep(&self) {
        let retention = self.retention;
        self.seen.retain(|_, seen_at| seen_at.elapsed() < retention);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_suppresses_redelivery() {
        let cache = DedupCache::new(Duration::from_secs(60));
        assert!(cache.first_delivery(topics::ANOMALY_DETECTED, "T1"));
        assert!(!cache.first_delivery(topics::ANOMALY_DETECTED, "T1"));
        // Same tracking id on a different topic is a distinct delivery
        assert!(cache.first_delivery(topics::ANOMALY_ENRICHED, "T1"));
    }

    #[test]
    fn dedup_forgets_after_retention() {
        let cache = DedupCache::new(Duration::from_millis(0));
        assert!(cache.first_delivery(topics::INCIDENTS_CREATED, "T2"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.first_delivery(topics::INCIDENTS_CREATED, "T2"));
    }

    #[test]
    fn decode_surfaces_parse_errors() {
        let err = decode_payload::<crate::types::AnomalyEvent>(
            topics::ANOMALY_DETECTED,
            b"{not json",
        )
        .unwrap_err();
        assert_eq!(err.kind(), "parse");
    }
}
