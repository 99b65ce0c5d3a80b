//! Built-in constants that are not operator-tunable.
//!
//! Anything an operator may reasonably change lives in [`super::Settings`];
//! the values here are pipeline-internal knobs with a single correct default.

/// Samples required before the z-score detector produces a score
pub const ZSCORE_WARMUP_SAMPLES: usize = 10;

/// Samples required before the EWMA detector produces a score
pub const EWMA_WARMUP_SAMPLES: usize = 5;

/// Samples required before the MAD detector produces a score
pub const MAD_WARMUP_SAMPLES: usize = 10;

/// Modified z-score scale factor (0.6745 = Φ⁻¹(0.75))
pub const MAD_SCALE: f64 = 0.6745;

/// Threshold applied to log-pattern anomaly events
pub const LOG_ANOMALY_THRESHOLD: f64 = 0.7;

/// Baselines older than this are recomputed (6 hours)
pub const BASELINE_STALE_SECS: i64 = 6 * 3600;

/// Fixed per-metric caps for the threshold detector (percent scales)
pub const FIXED_CAPS: &[(&str, f64)] = &[
    ("cpu_usage", 85.0),
    ("memory_usage", 90.0),
    ("disk_usage", 85.0),
];

/// Cap applied to metrics without an entry in [`FIXED_CAPS`]
pub const FIXED_CAP_DEFAULT: f64 = 100.0;

/// How long a closed dedup entry is remembered by bus consumers
pub const DEDUP_RETENTION_SECS: u64 = 3600;

/// Expiry sweeper tick in the remediation engine
pub const APPROVAL_SWEEP_SECS: u64 = 30;

/// Health refresh tick for dependency probes
pub const HEALTH_CHECK_SECS: u64 = 30;

/// Bounded payload sample length kept in logs for poison messages
pub const PAYLOAD_SAMPLE_LEN: usize = 200;
