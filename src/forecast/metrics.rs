//! Forecast accuracy metrics
//!
//! MAE, RMSE and MAPE over paired actual/predicted series, plus the
//! fixed descriptors attached when nothing can be measured.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::{AccuracyMethod, ForecastAccuracy};

/// Placeholder accuracy for the statistical tier when no backtest is possible
pub const STATISTICAL_HEURISTIC: (f64, f64, f64, f64) = (5.2, 7.8, 8.5, 0.85);
/// Placeholder accuracy for the synthetic tier
pub const SYNTHETIC_HEURISTIC: (f64, f64, f64, f64) = (8.5, 12.4, 15.0, 0.70);

pub fn heuristic_accuracy((mae, rmse, mape, score): (f64, f64, f64, f64)) -> ForecastAccuracy {
    ForecastAccuracy::heuristic(mae, rmse, mape, score)
}

/// Forecast error metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastMetrics {
    /// Mean Absolute Error
    pub mae: f64,
    /// Root Mean Square Error
    pub rmse: f64,
    /// Mean Absolute Percentage Error (%)
    pub mape: f64,
    /// Number of samples evaluated
    pub sample_count: usize,
}

impl ForecastMetrics {
    /// Calculate metrics from actual and predicted values
    pub fn calculate(actual: &[f64], predicted: &[f64]) -> Result<Self, ForecastMetricsError> {
        if actual.len() != predicted.len() {
            return Err(ForecastMetricsError::DimensionMismatch {
                actual: actual.len(),
                predicted: predicted.len(),
            });
        }

        if actual.is_empty() {
            return Err(ForecastMetricsError::EmptyData);
        }

        let n = actual.len();
        let mut abs_sum = 0.0;
        let mut sq_sum = 0.0;
        let mut percentage_errors = Vec::with_capacity(n);

        for (a, p) in actual.iter().zip(predicted.iter()) {
            let error = a - p;
            abs_sum += error.abs();
            sq_sum += error * error;

            // Zero actuals carry no percentage information
            if a.abs() > 1e-6 {
                percentage_errors.push((error.abs() / a.abs()) * 100.0);
            }
        }

        let mape = if percentage_errors.is_empty() {
            0.0
        } else {
            percentage_errors.iter().sum::<f64>() / percentage_errors.len() as f64
        };

        Ok(ForecastMetrics {
            mae: abs_sum / n as f64,
            rmse: (sq_sum / n as f64).sqrt(),
            mape,
            sample_count: n,
        })
    }

    /// Score in [0, 1], 1 being a perfect fit
    pub fn score(&self) -> f64 {
        (1.0 - self.mape / 100.0).clamp(0.0, 1.0)
    }

    pub fn into_accuracy(self, method: AccuracyMethod) -> ForecastAccuracy {
        let score = self.score();
        ForecastAccuracy {
            mae: round(self.mae),
            rmse: round(self.rmse),
            mape: round(self.mape),
            score: round(score),
            method,
        }
    }
}

fn round(v: f64) -> f64 {
    super::profile::round2(v)
}

impl fmt::Display for ForecastMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MAE={:.3}, RMSE={:.3}, MAPE={:.2}% over {} samples",
            self.mae, self.rmse, self.mape, self.sample_count
        )
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ForecastMetricsError {
    #[error("Dimension mismatch: actual={actual}, predicted={predicted}")]
    DimensionMismatch { actual: usize, predicted: usize },

    #[error("Empty data provided")]
    EmptyData,
}
