//! Peak period detection
//!
//! Segments an hourly prediction series into maximal runs at or above a
//! threshold derived from the baseline, and classifies each run.

use chrono::Duration;
use tracing::debug;

use super::profile::round2;
use crate::domain::{PeakAnalysis, PeakPeriod, PredictionPoint, Severity};

/// Confidence attached to every detected peak
pub const PEAK_CONFIDENCE: f64 = 0.85;

pub const NO_PEAKS: &str = "No significant peaks detected";
pub const NO_BASELINE: &str = "No baseline load available, peak detection skipped";

/// Peak being accumulated during the scan
struct OpenPeak<'a> {
    start: &'a PredictionPoint,
    peak_value: f64,
    expected_load: f64,
}

impl<'a> OpenPeak<'a> {
    fn new(point: &'a PredictionPoint) -> Self {
        Self {
            start: point,
            peak_value: point.predicted_value,
            expected_load: point.predicted_value,
        }
    }

    fn extend(&mut self, point: &PredictionPoint) {
        self.peak_value = self.peak_value.max(point.predicted_value);
        self.expected_load += point.predicted_value;
    }

    fn close(self, end_time: chrono::DateTime<chrono::Utc>, baseline: f64) -> PeakPeriod {
        let percent_above_base = (self.peak_value - baseline) / baseline * 100.0;
        let severity = Severity::classify(percent_above_base);
        PeakPeriod {
            start_time: self.start.timestamp,
            end_time,
            peak_value: round2(self.peak_value),
            expected_load: round2(self.expected_load),
            percent_above_base: round2(percent_above_base),
            severity,
            confidence: PEAK_CONFIDENCE,
            mitigation_actions: severity.mitigation_actions(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PeakPeriodDetector;

impl PeakPeriodDetector {
    pub fn new() -> Self {
        Self
    }

    /// Detect peaks at `baseline × (1 + threshold_percent / 100)`.
    pub fn detect(
        &self,
        series: &[PredictionPoint],
        baseline: f64,
        threshold_percent: f64,
    ) -> PeakAnalysis {
        let threshold = baseline * (1.0 + threshold_percent / 100.0);
        self.detect_with_threshold(series, baseline, threshold)
    }

    /// Single left-to-right pass. A peak still open at the end of the series
    /// closes one hour after its last point.
    pub fn detect_with_threshold(
        &self,
        series: &[PredictionPoint],
        baseline: f64,
        threshold: f64,
    ) -> PeakAnalysis {
        if !baseline.is_finite() || baseline <= 0.0 {
            debug!(baseline, "non-positive baseline, skipping peak detection");
            return PeakAnalysis {
                baseline,
                threshold,
                peaks: Vec::new(),
                recommendations: vec![NO_BASELINE.to_string()],
                total_peak_hours: 0.0,
            };
        }

        let mut peaks = Vec::new();
        let mut open: Option<OpenPeak<'_>> = None;

        for point in series {
            if point.predicted_value >= threshold {
                match open.as_mut() {
                    Some(peak) => peak.extend(point),
                    None => open = Some(OpenPeak::new(point)),
                }
            } else if let Some(peak) = open.take() {
                peaks.push(peak.close(point.timestamp, baseline));
            }
        }

        if let (Some(peak), Some(last)) = (open.take(), series.last()) {
            peaks.push(peak.close(last.timestamp + Duration::hours(1), baseline));
        }

        let total_peak_hours = peaks.iter().map(PeakPeriod::duration_hours).sum();
        let recommendations = recommendations(&peaks);

        PeakAnalysis {
            baseline: round2(baseline),
            threshold: round2(threshold),
            peaks,
            recommendations,
            total_peak_hours,
        }
    }
}

fn recommendations(peaks: &[PeakPeriod]) -> Vec<String> {
    let Some(worst) = peaks.iter().max_by_key(|p| p.severity) else {
        return vec![NO_PEAKS.to_string()];
    };

    let mut out = vec![format!(
        "{} peak period(s) detected, highest severity {} at {:.2} kW ({:.1}% above baseline)",
        peaks.len(),
        worst.severity,
        worst.peak_value,
        worst.percent_above_base
    )];
    out.extend(worst.severity.mitigation_actions());
    out
}
