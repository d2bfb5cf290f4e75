use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Peak severity, ordered from least to most severe
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Classify by how far a peak rises above the baseline (%).
    pub fn classify(percent_above_base: f64) -> Self {
        if percent_above_base >= 50.0 {
            Self::Critical
        } else if percent_above_base >= 30.0 {
            Self::High
        } else if percent_above_base >= 15.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Mitigation steps for this severity. Each level includes everything the
    /// level below it recommends.
    pub fn mitigation_actions(&self) -> Vec<String> {
        let mut actions = vec!["Monitor real-time load against forecast".to_string()];
        if *self >= Self::Medium {
            actions.push("Optimize HVAC schedules around the peak window".to_string());
            actions.push("Dim non-essential lighting".to_string());
        }
        if *self >= Self::High {
            actions.push("Pre-cool building before peak onset".to_string());
            actions.push("Shift deferrable loads outside the peak window".to_string());
        }
        if *self >= Self::Critical {
            actions.push("Shed non-critical loads".to_string());
            actions.push("Enroll in utility demand-response event".to_string());
        }
        actions
    }
}

/// A maximal contiguous run of predictions at or above the peak threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeakPeriod {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub peak_value: f64,
    /// Sum of predicted load over the period (kWh for hourly points)
    pub expected_load: f64,
    pub percent_above_base: f64,
    pub severity: Severity,
    pub confidence: f64,
    pub mitigation_actions: Vec<String>,
}

impl PeakPeriod {
    pub fn duration_hours(&self) -> f64 {
        (self.end_time - self.start_time).num_seconds() as f64 / 3600.0
    }
}

/// Result of running peak detection over a forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeakAnalysis {
    pub baseline: f64,
    pub threshold: f64,
    pub peaks: Vec<PeakPeriod>,
    pub recommendations: Vec<String>,
    pub total_peak_hours: f64,
}

impl PeakAnalysis {
    pub fn highest_severity(&self) -> Option<Severity> {
        self.peaks.iter().map(|p| p.severity).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(10.0, Severity::Low)]
    #[case(14.99, Severity::Low)]
    #[case(15.0, Severity::Medium)]
    #[case(20.0, Severity::Medium)]
    #[case(30.0, Severity::High)]
    #[case(40.0, Severity::High)]
    #[case(50.0, Severity::Critical)]
    #[case(60.0, Severity::Critical)]
    fn test_classify(#[case] pct: f64, #[case] expected: Severity) {
        assert_eq!(Severity::classify(pct), expected);
    }

    #[test]
    fn test_classify_is_monotonic() {
        let mut last = Severity::Low;
        for step in 0..1000 {
            let current = Severity::classify(step as f64 / 10.0);
            assert!(current >= last);
            last = current;
        }
    }

    #[test]
    fn test_mitigation_sets_are_cumulative() {
        let levels = [Severity::Low, Severity::Medium, Severity::High, Severity::Critical];
        for pair in levels.windows(2) {
            let lower = pair[0].mitigation_actions();
            let higher = pair[1].mitigation_actions();
            assert!(!lower.is_empty());
            assert!(higher.len() > lower.len());
            assert!(lower.iter().all(|a| higher.contains(a)));
        }
    }

    #[test]
    fn test_severity_tokens() {
        assert_eq!(Severity::Critical.to_string(), "CRITICAL");
        assert_eq!(serde_json::to_string(&Severity::Medium).unwrap(), "\"MEDIUM\"");
    }
}
