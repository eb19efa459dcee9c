use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::ConfigError;

// Trend histograms: 10ms buckets up to 10s, one overflow bucket on top.
const BUCKET_WIDTH_MS: u64 = 10;
const BUCKET_COUNT: usize = 1001;

struct RateCell {
    hits: AtomicU64,
    total: AtomicU64,
}

struct TrendCell {
    count: AtomicU64,
    sum_ms: AtomicU64,
    max_ms: AtomicU64,
    buckets: Vec<AtomicU64>,
}

impl TrendCell {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
            max_ms: AtomicU64::new(0),
            buckets: (0..BUCKET_COUNT).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn record(&self, ms: u64) {
        let index = ((ms / BUCKET_WIDTH_MS) as usize).min(BUCKET_COUNT - 1);
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Streaming percentile from the bucket counts; reports the upper edge of
    /// the bucket holding the requested rank (the true value is at or below
    /// it), and the exact observed max for the overflow bucket.
    fn percentile_ms(&self, pct: f64) -> Option<f64> {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return None;
        }
        let rank = ((pct / 100.0) * count as f64).ceil().max(1.0) as u64;
        let mut cumulative = 0u64;
        for (index, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= rank {
                if index == BUCKET_COUNT - 1 {
                    return Some(self.max_ms.load(Ordering::Relaxed) as f64);
                }
                return Some(((index as u64 + 1) * BUCKET_WIDTH_MS) as f64);
            }
        }
        Some(self.max_ms.load(Ordering::Relaxed) as f64)
    }

    fn summary(&self) -> TrendSummary {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_ms.load(Ordering::Relaxed);
        TrendSummary {
            count,
            avg_ms: if count == 0 { 0.0 } else { sum as f64 / count as f64 },
            p50_ms: self.percentile_ms(50.0).unwrap_or(0.0),
            p90_ms: self.percentile_ms(90.0).unwrap_or(0.0),
            p95_ms: self.percentile_ms(95.0).unwrap_or(0.0),
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrendSummary {
    pub count: u64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    RateBelow(f64),
    RateAbove(f64),
    PercentileBelow { pct: f64, limit_ms: f64 },
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::RateBelow(bound) => write!(f, "rate<{}", bound),
            Check::RateAbove(bound) => write!(f, "rate>{}", bound),
            Check::PercentileBelow { pct, limit_ms } => write!(f, "p({})<{}ms", pct, limit_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Threshold {
    pub metric: &'static str,
    pub check: Check,
}

#[derive(Debug, Clone)]
pub struct Violation {
    pub metric: &'static str,
    pub check: String,
    pub observed: f64,
    pub bound: f64,
}

#[derive(Debug, Clone)]
pub enum Verdict {
    Pass,
    Fail(Vec<Violation>),
}

/// Run-wide metric store shared by every virtual user.
///
/// The name → cell registry is fixed at construction and every cell is plain
/// atomics, so concurrent units record without taking any lock. Aggregated
/// state is only read once the run is over.
pub struct Metrics {
    counters: Vec<(&'static str, AtomicU64)>,
    rates: Vec<(&'static str, RateCell)>,
    trends: Vec<(&'static str, TrendCell)>,
}

impl Metrics {
    pub fn new(counters: &[&'static str], rates: &[&'static str], trends: &[&'static str]) -> Self {
        Self {
            counters: counters
                .iter()
                .map(|name| (*name, AtomicU64::new(0)))
                .collect(),
            rates: rates
                .iter()
                .map(|name| {
                    (
                        *name,
                        RateCell {
                            hits: AtomicU64::new(0),
                            total: AtomicU64::new(0),
                        },
                    )
                })
                .collect(),
            trends: trends.iter().map(|name| (*name, TrendCell::new())).collect(),
        }
    }

    pub fn add_count(&self, name: &str, by: u64) {
        if let Some((_, cell)) = self.counters.iter().find(|(n, _)| *n == name) {
            cell.fetch_add(by, Ordering::Relaxed);
        } else {
            debug_assert!(false, "unregistered counter {}", name);
        }
    }

    /// Records one boolean observation; the rate is the fraction observed true.
    pub fn observe(&self, name: &str, hit: bool) {
        if let Some((_, cell)) = self.rates.iter().find(|(n, _)| *n == name) {
            cell.total.fetch_add(1, Ordering::Relaxed);
            if hit {
                cell.hits.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            debug_assert!(false, "unregistered rate {}", name);
        }
    }

    pub fn record_ms(&self, name: &str, ms: u64) {
        if let Some((_, cell)) = self.trends.iter().find(|(n, _)| *n == name) {
            cell.record(ms);
        } else {
            debug_assert!(false, "unregistered trend {}", name);
        }
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, cell)| cell.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// `None` until at least one observation has been recorded.
    pub fn rate_value(&self, name: &str) -> Option<f64> {
        let (_, cell) = self.rates.iter().find(|(n, _)| *n == name)?;
        let total = cell.total.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        Some(cell.hits.load(Ordering::Relaxed) as f64 / total as f64)
    }

    pub fn percentile_ms(&self, name: &str, pct: f64) -> Option<f64> {
        let (_, cell) = self.trends.iter().find(|(n, _)| *n == name)?;
        cell.percentile_ms(pct)
    }

    pub fn counters(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.counters
            .iter()
            .map(|(name, cell)| (*name, cell.load(Ordering::Relaxed)))
    }

    pub fn rates(&self) -> impl Iterator<Item = (&'static str, u64, u64)> + '_ {
        self.rates.iter().map(|(name, cell)| {
            (
                *name,
                cell.hits.load(Ordering::Relaxed),
                cell.total.load(Ordering::Relaxed),
            )
        })
    }

    pub fn trends(&self) -> impl Iterator<Item = (&'static str, TrendSummary)> + '_ {
        self.trends.iter().map(|(name, cell)| (*name, cell.summary()))
    }

    /// Fails fast on thresholds naming metrics that were never registered, or
    /// registered under a different kind.
    pub fn validate_thresholds(&self, thresholds: &[Threshold]) -> Result<(), ConfigError> {
        for threshold in thresholds {
            let (kind, known) = match threshold.check {
                Check::RateBelow(_) | Check::RateAbove(_) => (
                    "rate",
                    self.rates.iter().any(|(n, _)| *n == threshold.metric),
                ),
                Check::PercentileBelow { .. } => (
                    "trend",
                    self.trends.iter().any(|(n, _)| *n == threshold.metric),
                ),
            };
            if !known {
                return Err(ConfigError::UnknownMetric {
                    kind,
                    metric: threshold.metric.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Compares each threshold against the accumulated samples. Metrics with
    /// zero observations are skipped; failing comparisons are reported
    /// individually, never collapsed into a bare boolean.
    pub fn evaluate(&self, thresholds: &[Threshold]) -> Verdict {
        let mut violations = Vec::new();
        for threshold in thresholds {
            match threshold.check {
                Check::RateBelow(bound) => {
                    if let Some(observed) = self.rate_value(threshold.metric) {
                        if observed >= bound {
                            violations.push(self.violation(threshold, observed, bound));
                        }
                    }
                }
                Check::RateAbove(bound) => {
                    if let Some(observed) = self.rate_value(threshold.metric) {
                        if observed <= bound {
                            violations.push(self.violation(threshold, observed, bound));
                        }
                    }
                }
                Check::PercentileBelow { pct, limit_ms } => {
                    if let Some(observed) = self.percentile_ms(threshold.metric, pct) {
                        if observed >= limit_ms {
                            violations.push(self.violation(threshold, observed, limit_ms));
                        }
                    }
                }
            }
        }
        if violations.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Fail(violations)
        }
    }

    fn violation(&self, threshold: &Threshold, observed: f64, bound: f64) -> Violation {
        Violation {
            metric: threshold.metric,
            check: threshold.check.to_string(),
            observed,
            bound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Metrics {
        Metrics::new(&["ops"], &["errors", "availability"], &["latency"])
    }

    #[test]
    fn counter_accumulates_monotonically() {
        let m = metrics();
        m.add_count("ops", 1);
        m.add_count("ops", 2);
        assert_eq!(m.counter_value("ops"), 3);
    }

    #[test]
    fn rate_is_fraction_of_true_observations() {
        let m = metrics();
        m.observe("availability", true);
        m.observe("availability", true);
        m.observe("availability", false);
        let rate = m.rate_value("availability").unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn rate_threshold_verdicts_match_observed_fraction() {
        let m = metrics();
        for hit in [true, true, false] {
            m.observe("availability", hit);
        }
        let pass = m.evaluate(&[Threshold {
            metric: "availability",
            check: Check::RateAbove(0.5),
        }]);
        assert!(matches!(pass, Verdict::Pass));

        let fail = m.evaluate(&[Threshold {
            metric: "availability",
            check: Check::RateAbove(0.7),
        }]);
        match fail {
            Verdict::Fail(violations) => {
                assert_eq!(violations.len(), 1);
                assert_eq!(violations[0].metric, "availability");
                assert!((violations[0].observed - 0.667).abs() < 0.01);
            }
            Verdict::Pass => panic!("expected a violation"),
        }
    }

    #[test]
    fn unobserved_metrics_are_skipped() {
        let m = metrics();
        let verdict = m.evaluate(&[
            Threshold {
                metric: "errors",
                check: Check::RateBelow(0.1),
            },
            Threshold {
                metric: "latency",
                check: Check::PercentileBelow {
                    pct: 95.0,
                    limit_ms: 1000.0,
                },
            },
        ]);
        assert!(matches!(verdict, Verdict::Pass));
    }

    #[test]
    fn trend_percentiles_track_recorded_distribution() {
        let m = metrics();
        for ms in (10..=1000).step_by(10) {
            m.record_ms("latency", ms);
        }
        let p90 = m.percentile_ms("latency", 90.0).unwrap();
        assert!((p90 - 900.0).abs() <= BUCKET_WIDTH_MS as f64, "p90 was {}", p90);
        let p50 = m.percentile_ms("latency", 50.0).unwrap();
        assert!((p50 - 500.0).abs() <= BUCKET_WIDTH_MS as f64, "p50 was {}", p50);
    }

    #[test]
    fn overflow_bucket_reports_observed_max() {
        let m = metrics();
        m.record_ms("latency", 25_000);
        assert_eq!(m.percentile_ms("latency", 99.0), Some(25_000.0));
    }

    #[test]
    fn threshold_validation_rejects_unknown_metric() {
        let m = metrics();
        let err = m
            .validate_thresholds(&[Threshold {
                metric: "nope",
                check: Check::RateBelow(0.1),
            }])
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMetric { .. }));
    }

    #[test]
    fn threshold_validation_rejects_kind_mismatch() {
        let m = metrics();
        // latency is a trend, not a rate
        let err = m
            .validate_thresholds(&[Threshold {
                metric: "latency",
                check: Check::RateBelow(0.1),
            }])
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMetric { kind: "rate", .. }));
    }
}
