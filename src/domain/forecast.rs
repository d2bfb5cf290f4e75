use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::PeakAnalysis;

/// Forecast processing status
///
/// `COMPLETED` and `FAILED` are terminal: a forecast reaches exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ForecastStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ForecastStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// What a forecast is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ForecastType {
    /// Hourly consumption forecast
    Consumption,
    /// Consumption forecast with peak-period analysis attached
    PeakLoad,
}

/// Which generation strategy produced the predictions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PredictionTier {
    Ml,
    Statistical,
    Synthetic,
}

/// How the accuracy figures of a forecast were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AccuracyMethod {
    /// Reported by the ML provider
    ModelReported,
    /// Replayed against held-out historical data
    Backtest,
    /// Fixed placeholder constants, not measured
    Heuristic,
}

/// A single hourly prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionPoint {
    pub timestamp: DateTime<Utc>,
    pub predicted_value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub confidence_level: f64,
    pub unit: String,
}

impl PredictionPoint {
    pub fn is_bounded(&self) -> bool {
        self.lower_bound <= self.predicted_value && self.predicted_value <= self.upper_bound
    }
}

/// Forecast accuracy descriptors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastAccuracy {
    pub mae: f64,
    pub rmse: f64,
    pub mape: f64,
    pub score: f64,
    pub method: AccuracyMethod,
}

impl ForecastAccuracy {
    pub fn heuristic(mae: f64, rmse: f64, mape: f64, score: f64) -> Self {
        Self {
            mae,
            rmse,
            mape,
            score,
            method: AccuracyMethod::Heuristic,
        }
    }
}

/// A demand forecast for one building (optionally one device)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    pub id: Uuid,
    pub building_id: String,
    pub device_id: Option<String>,
    pub forecast_type: ForecastType,
    pub status: ForecastStatus,
    pub horizon_hours: u32,
    pub predictions: Vec<PredictionPoint>,
    pub accuracy: Option<ForecastAccuracy>,
    pub tier: Option<PredictionTier>,
    pub model_used: Option<String>,
    /// Enrichment sources that were unavailable when this forecast was generated
    pub degraded_sources: Vec<String>,
    pub peak_analysis: Option<PeakAnalysis>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Forecast {
    /// A fresh record in `PROCESSING`, the only state a forecast is created in.
    pub fn processing(
        building_id: impl Into<String>,
        device_id: Option<String>,
        forecast_type: ForecastType,
        horizon_hours: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            building_id: building_id.into(),
            device_id,
            forecast_type,
            status: ForecastStatus::Processing,
            horizon_hours,
            predictions: Vec::new(),
            accuracy: None,
            tier: None,
            model_used: None,
            degraded_sources: Vec::new(),
            peak_analysis: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Average predicted load over the horizon (kW)
    pub fn average_load(&self) -> f64 {
        if self.predictions.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.predictions.iter().map(|p| p.predicted_value).sum();
        sum / self.predictions.len() as f64
    }

    /// Highest predicted load over the horizon (kW)
    pub fn peak_load(&self) -> Option<f64> {
        self.predictions
            .iter()
            .map(|p| p.predicted_value)
            .max_by(|a, b| a.total_cmp(b))
    }
}

/// Check the series invariants: `horizon` points, one per hour, strictly
/// ascending, each with `lower <= predicted <= upper`.
pub fn validate_series(points: &[PredictionPoint], horizon_hours: u32) -> Result<(), String> {
    if points.len() != horizon_hours as usize {
        return Err(format!(
            "expected {} predictions, got {}",
            horizon_hours,
            points.len()
        ));
    }

    for pair in points.windows(2) {
        if pair[1].timestamp - pair[0].timestamp != Duration::hours(1) {
            return Err(format!(
                "predictions not hourly ascending at {}",
                pair[1].timestamp
            ));
        }
    }

    if let Some(p) = points.iter().find(|p| !p.is_bounded()) {
        return Err(format!("prediction at {} is outside its bounds", p.timestamp));
    }

    Ok(())
}
