//! Statistical detectors over per-metric rolling windows
//!
//! Four detectors, each returning a score in [0, 1]:
//! - z-score against the window mean/std (10-sample warm-up)
//! - EWMA deviation normalized by recent mean (5-sample warm-up)
//! - modified z-score via median absolute deviation (10-sample warm-up)
//! - fixed per-metric caps (no warm-up)
//!
//! Windows hold the last N values in insertion order and are appended AFTER
//! scoring, so the current value never sits in its own baseline. With an
//! all-constant window, a repeat of the same value scores 0 from every
//! statistical detector.

use crate::config::defaults::{
    EWMA_WARMUP_SAMPLES, FIXED_CAPS, FIXED_CAP_DEFAULT, MAD_SCALE, MAD_WARMUP_SAMPLES,
    ZSCORE_WARMUP_SAMPLES,
};
use crate::types::{OperationalStatus, WeatherImpact};
use statrs::statistics::{Data, OrderStatistics, Statistics};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Scores produced by one `update_and_detect` call, keyed by detector name
pub type DetectorScores = BTreeMap<&'static str, f64>;

/// Per-metric rolling windows plus the detector functions
pub struct DetectorBank {
    window_size: usize,
    ewma_alpha: f64,
    zscore_divisor: f64,
    mad_divisor: f64,
    history: HashMap<String, VecDeque<f64>>,
}

impl DetectorBank {
    pub fn new(window_size: usize, ewma_alpha: f64, zscore_divisor: f64, mad_divisor: f64) -> Self {
        Self {
            window_size,
            ewma_alpha,
            zscore_divisor,
            mad_divisor,
            history: HashMap::new(),
        }
    }

    pub fn from_settings(detection: &crate::config::DetectionSettings) -> Self {
        Self::new(
            detection.window_size,
            detection.ewma_alpha,
            detection.zscore_divisor,
            detection.mad_divisor,
        )
    }

    /// Score `value` against the current window, then append it.
    ///
    /// Non-finite inputs score 0 everywhere and are not appended, so one bad
    /// sample cannot poison the window.
    pub fn update_and_detect(&mut self, metric_name: &str, value: f64) -> DetectorScores {
        let mut scores = DetectorScores::new();
        if !value.is_finite() {
            for name in ["zscore", "ewma", "mad", "threshold"] {
                scores.insert(name, 0.0);
            }
            return scores;
        }

        let window = self
            .history
            .entry(metric_name.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.window_size));
        let values: Vec<f64> = window.iter().copied().collect();

        scores.insert(
            "zscore",
            zscore_score(&values, value, self.zscore_divisor),
        );
        scores.insert(
            "ewma",
            ewma_score(&values, value, self.ewma_alpha),
        );
        scores.insert("mad", mad_score(&values, value, self.mad_divisor));
        scores.insert("threshold", threshold_score(metric_name, value));

        if window.len() == self.window_size {
            window.pop_front();
        }
        window.push_back(value);

        scores
    }

    /// Current window length for a metric (tests and counters).
    pub fn window_len(&self, metric_name: &str) -> usize {
        self.history.get(metric_name).map_or(0, VecDeque::len)
    }
}

fn zscore_score(history: &[f64], value: f64, divisor: f64) -> f64 {
    if history.len() < ZSCORE_WARMUP_SAMPLES {
        return 0.0;
    }
    let mean = history.mean();
    let std_dev = history.std_dev();
    if std_dev == 0.0 || !std_dev.is_finite() {
        return 0.0;
    }
    (((value - mean) / std_dev).abs() / divisor).min(1.0)
}

fn ewma_score(history: &[f64], value: f64, alpha: f64) -> f64 {
    if history.len() < EWMA_WARMUP_SAMPLES {
        return 0.0;
    }
    // Fold the window newest-first into the smoothed estimate, seeded with
    // the current value (matches the reference detector exactly).
    let mut ewma = value;
    for &past in history.iter().rev() {
        ewma = alpha * past + (1.0 - alpha) * ewma;
    }

    let recent_start = history.len().saturating_sub(10);
    let recent_mean = history[recent_start..].mean();
    if recent_mean == 0.0 || !recent_mean.is_finite() {
        return 0.0;
    }
    let deviation = (value - ewma).abs() / recent_mean.max(1.0);
    (deviation / 2.0).min(1.0)
}

fn mad_score(history: &[f64], value: f64, divisor: f64) -> f64 {
    if history.len() < MAD_WARMUP_SAMPLES {
        return 0.0;
    }
    let median = Data::new(history.to_vec()).median();
    let deviations: Vec<f64> = history.iter().map(|x| (x - median).abs()).collect();
    let mad = Data::new(deviations).median();
    if !mad.is_finite() {
        return 0.0;
    }
    if mad == 0.0 {
        return 0.0;
    }
    let modified_z = MAD_SCALE * (value - median) / mad;
    (modified_z.abs() / divisor).min(1.0)
}

/// Fixed caps in percent units; score scales linearly into [0,1] above the cap.
fn threshold_score(metric_name: &str, value: f64) -> f64 {
    let cap = FIXED_CAPS
        .iter()
        .find(|(name, _)| *name == metric_name)
        .map_or(FIXED_CAP_DEFAULT, |(_, cap)| *cap);
    if value > cap {
        ((value - cap) / (100.0 - cap)).min(1.0)
    } else {
        0.0
    }
}

/// Modulate a base detection threshold by operational context.
///
/// Status adjustments first; heavy rain (> 5 mm/h) then takes over for
/// satellite metrics regardless of status.
pub fn contextual_threshold(
    base: f64,
    metric_name: &str,
    status: OperationalStatus,
    weather: &WeatherImpact,
) -> f64 {
    let lower = metric_name.to_lowercase();
    let is_compute = lower.contains("cpu") || lower.contains("memory");
    let is_satellite = lower.contains("satellite");
    let is_network = lower.contains("network");

    if weather.rain_rate_mm_h > 5.0 && is_satellite {
        return base * 0.75;
    }

    match status {
        OperationalStatus::WeatherImpacted if is_compute => base * 0.85,
        OperationalStatus::WeatherImpacted if is_satellite => base * 0.80,
        OperationalStatus::DegradedComms if is_network => base * 1.20,
        OperationalStatus::DegradedComms => base * 0.90,
        OperationalStatus::SystemOverloaded if is_compute => base * 1.10,
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> DetectorBank {
        DetectorBank::new(50, 0.3, 3.0, 3.5)
    }

    #[test]
    fn zscore_returns_zero_during_warmup() {
        let mut bank = bank();
        for v in [20.0, 22.0, 21.0, 23.0, 22.0] {
            let scores = bank.update_and_detect("cpu_usage", v);
            assert_eq!(scores["zscore"], 0.0);
        }
    }

    #[test]
    fn spike_after_stable_window_scores_high() {
        let mut bank = bank();
        for v in [20.0, 22.0, 21.0, 23.0, 22.0, 21.0, 22.0, 23.0, 22.0, 21.0] {
            bank.update_and_detect("cpu_usage", v);
        }
        let scores = bank.update_and_detect("cpu_usage", 95.0);
        let max = scores.values().copied().fold(0.0_f64, f64::max);
        assert!(max >= 0.7, "spike scored only {max}");
        // Threshold detector contributes too: 95 > 85 cap
        assert!(scores["threshold"] > 0.0);
    }

    #[test]
    fn constant_window_scores_zero_for_repeat_value() {
        let mut bank = bank();
        for _ in 0..20 {
            bank.update_and_detect("memory_usage", 40.0);
        }
        let scores = bank.update_and_detect("memory_usage", 40.0);
        assert_eq!(scores["zscore"], 0.0);
        assert_eq!(scores["ewma"], 0.0);
        assert_eq!(scores["mad"], 0.0);
        assert_eq!(scores["threshold"], 0.0);
    }

    #[test]
    fn threshold_detector_zero_at_or_below_cap() {
        assert_eq!(threshold_score("cpu_usage", 85.0), 0.0);
        assert_eq!(threshold_score("cpu_usage", 50.0), 0.0);
        assert!(threshold_score("cpu_usage", 90.0) > 0.0);
        assert_eq!(threshold_score("cpu_usage", 100.0), 1.0);
        // Metrics without a cap never trip the fixed detector below 100
        assert_eq!(threshold_score("network_latency", 99.0), 0.0);
    }

    #[test]
    fn window_appends_after_scoring_and_is_bounded() {
        let mut bank = DetectorBank::new(5, 0.3, 3.0, 3.5);
        for i in 0..10 {
            bank.update_and_detect("disk_usage", f64::from(i));
        }
        assert_eq!(bank.window_len("disk_usage"), 5);
    }

    #[test]
    fn non_finite_value_is_ignored() {
        let mut bank = bank();
        bank.update_and_detect("cpu_usage", f64::NAN);
        assert_eq!(bank.window_len("cpu_usage"), 0);
    }

    #[test]
    fn contextual_threshold_table() {
        let calm = WeatherImpact::default();
        let storm = WeatherImpact {
            rain_rate_mm_h: 8.0,
            ..WeatherImpact::default()
        };

        let t = contextual_threshold(0.7, "cpu_usage", OperationalStatus::WeatherImpacted, &calm);
        assert!((t - 0.595).abs() < 1e-9);

        let t = contextual_threshold(15.0, "satellite_snr", OperationalStatus::Normal, &storm);
        assert!((t - 11.25).abs() < 1e-9);

        let t = contextual_threshold(200.0, "network_latency", OperationalStatus::DegradedComms, &calm);
        assert!((t - 240.0).abs() < 1e-9);

        let t = contextual_threshold(0.6, "memory_usage", OperationalStatus::SystemOverloaded, &calm);
        assert!((t - 0.66).abs() < 1e-9);

        let t = contextual_threshold(0.8, "disk_usage", OperationalStatus::Normal, &calm);
        assert!((t - 0.8).abs() < f64::EPSILON);
    }
}
